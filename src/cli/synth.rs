use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::template::TemplateFormat;

/// Render the template to stdout or to `output`
pub fn handle_synth(format: TemplateFormat, output: Option<&Path>) -> Result<()> {
    let (_, stack) = super::load_stack()?;
    let template = stack.synth().context("Failed to synthesize template")?;
    let rendered = template.render(format)?;

    match output {
        Some(path) => {
            std::fs::write(path, &rendered)
                .with_context(|| format!("Failed to write template to {}", path.display()))?;
            info!(
                stack = %stack.name(),
                path = %path.display(),
                resources = template.len(),
                "Wrote template"
            );
        }
        None => println!("{}", rendered),
    }
    Ok(())
}
