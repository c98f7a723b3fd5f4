use anyhow::{Context, Result};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Attribute, Cell, Table};

use crate::template::graph::DependencyGraph;

/// Print every resource with its direct dependencies, then the order the
/// provisioning engine can create them in
pub fn handle_resources() -> Result<()> {
    let (_, stack) = super::load_stack()?;
    let template = stack.synth().context("Failed to synthesize template")?;
    let graph = DependencyGraph::from_template(&template)?;
    let order = graph.creation_order()?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("LOGICAL ID").add_attribute(Attribute::Bold),
            Cell::new("TYPE").add_attribute(Attribute::Bold),
            Cell::new("DEPENDS ON").add_attribute(Attribute::Bold),
        ]);

    for (id, resource) in template.resources() {
        let deps = graph.dependencies_of(id);
        let deps = if deps.is_empty() {
            "-".to_string()
        } else {
            deps.join("\n")
        };
        table.add_row(vec![
            Cell::new(id),
            Cell::new(resource.resource_type()),
            Cell::new(deps),
        ]);
    }

    println!("{}", table);
    println!(
        "\n{} resources, {} dependencies. Creation order:",
        graph.node_count(),
        graph.edge_count()
    );
    for (i, id) in order.iter().enumerate() {
        println!("{:>3}. {}", i + 1, id);
    }
    Ok(())
}
