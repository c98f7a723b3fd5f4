use anyhow::{Context, Result};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Attribute, Cell, Table};

use crate::cloudformation::{DeployOutcome, StackDeployer};

pub async fn handle_deploy(no_wait: bool) -> Result<()> {
    let (settings, stack) = super::load_stack()?;
    let template = stack.synth().context("Failed to synthesize template")?;
    let deployer = StackDeployer::new(&settings.aws).await?;

    let outcome = deployer.deploy(stack.name(), &template).await?;
    match outcome {
        DeployOutcome::Created => println!("Creating stack '{}'", stack.name()),
        DeployOutcome::Updated => println!("Updating stack '{}'", stack.name()),
        DeployOutcome::Unchanged => {
            println!("Stack '{}' is up to date", stack.name());
            return Ok(());
        }
    }
    if no_wait {
        return Ok(());
    }

    if let Some(status) = deployer.wait(stack.name()).await? {
        println!("✓ Stack '{}' is {}", stack.name(), status);
    }

    let outputs = deployer.outputs(stack.name()).await?;
    if !outputs.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                Cell::new("OUTPUT").add_attribute(Attribute::Bold),
                Cell::new("VALUE").add_attribute(Attribute::Bold),
            ]);
        for (key, value) in outputs {
            table.add_row(vec![Cell::new(key), Cell::new(value)]);
        }
        println!("{}", table);
    }
    Ok(())
}

pub async fn handle_destroy(no_wait: bool) -> Result<()> {
    let (settings, stack) = super::load_stack()?;
    let deployer = StackDeployer::new(&settings.aws).await?;

    if !deployer.destroy(stack.name()).await? {
        println!("Stack '{}' does not exist", stack.name());
        return Ok(());
    }
    println!("Deleting stack '{}'", stack.name());
    if no_wait {
        return Ok(());
    }

    match deployer.wait(stack.name()).await? {
        None => println!("✓ Stack '{}' deleted", stack.name()),
        Some(status) => println!("Stack '{}' is {}", stack.name(), status),
    }
    Ok(())
}
