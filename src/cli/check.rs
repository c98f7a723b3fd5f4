use anyhow::{Context, Result};

use crate::conformance;

pub fn handle_check() -> Result<()> {
    let (_, stack) = super::load_stack()?;
    let template = stack.synth().context("Failed to synthesize template")?;
    let report = conformance::run(&template);

    for result in &report.results {
        match &result.outcome {
            Ok(()) => println!("✓ {}", result.name),
            Err(reason) => println!("✗ {}: {}", result.name, reason),
        }
    }

    if !report.passed() {
        let failed = report.failures().count();
        eprintln!("{} of {} checks failed", failed, report.results.len());
        std::process::exit(1);
    }
    println!("All {} checks passed", report.results.len());
    Ok(())
}
