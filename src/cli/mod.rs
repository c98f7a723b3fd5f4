pub mod check;
#[cfg(feature = "aws")]
pub mod deploy;
pub mod echo;
pub mod resources;
pub mod synth;

use anyhow::{Context, Result};

use crate::settings::Settings;
use crate::stack::EcsPipelineStack;

/// Load settings and assemble the stack they describe
pub fn load_stack() -> Result<(Settings, EcsPipelineStack)> {
    let settings = Settings::new().context("Failed to load settings")?;
    let stack = EcsPipelineStack::new(&settings).context("Failed to assemble stack")?;
    Ok((settings, stack))
}

pub fn handle_check_config() -> Result<()> {
    println!("Checking configuration...");
    match Settings::new() {
        Ok(settings) => {
            println!("✓ Configuration is valid (stack '{}')", settings.stack.name);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
