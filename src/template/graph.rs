use std::collections::{BTreeSet, HashMap};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use super::intrinsic::referenced_ids;
use super::Template;
use crate::error::StackError;

/// Dependency graph between the template's resources.
///
/// Edges point from a dependency to its dependent, so a topological sort
/// yields an order in which the provisioning engine could create them.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    nodes: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph from every `Ref`, `Fn::GetAtt` and `DependsOn` in the
    /// template. Fails if anything points at a logical ID that does not exist.
    pub fn from_template(template: &Template) -> Result<Self, StackError> {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();

        for (id, _) in template.resources() {
            let idx = graph.add_node(id.to_string());
            nodes.insert(id.to_string(), idx);
        }

        for (id, resource) in template.resources() {
            let mut deps: BTreeSet<String> = resource
                .properties()
                .values()
                .flat_map(referenced_ids)
                .collect();
            deps.extend(resource.explicit_dependencies().iter().cloned());

            let to = nodes[id];
            for dep in deps {
                let from = *nodes.get(&dep).ok_or_else(|| StackError::UnknownReference {
                    from: id.to_string(),
                    to: dep.clone(),
                })?;
                graph.update_edge(from, to, ());
            }
        }

        for (id, output) in template.outputs() {
            for dep in referenced_ids(&output.value) {
                if !nodes.contains_key(&dep) {
                    return Err(StackError::UnknownReference {
                        from: id.to_string(),
                        to: dep,
                    });
                }
            }
        }

        Ok(Self { graph, nodes })
    }

    /// Resources in an order that respects every dependency
    pub fn creation_order(&self) -> Result<Vec<String>, StackError> {
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|idx| self.graph[idx].clone()).collect())
            .map_err(|cycle| StackError::DependencyCycle(self.graph[cycle.node_id()].clone()))
    }

    /// Direct dependencies of `id`, sorted
    pub fn dependencies_of(&self, id: &str) -> Vec<String> {
        let Some(&idx) = self.nodes.get(id) else {
            return Vec::new();
        };
        let mut deps: Vec<String> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .map(|n| self.graph[n].clone())
            .collect();
        deps.sort();
        deps
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{LogicalId, Output, Resource};
    use serde_json::json;

    fn template_with(resources: Vec<(&str, Resource)>) -> Template {
        let mut template = Template::new(None);
        for (id, resource) in resources {
            template.add_resource(LogicalId::new(id), resource).unwrap();
        }
        template
    }

    #[test]
    fn test_creation_order_respects_references() {
        let template = template_with(vec![
            (
                "Subnet",
                Resource::new("AWS::EC2::Subnet").property("VpcId", json!({ "Ref": "VPC" })),
            ),
            ("VPC", Resource::new("AWS::EC2::VPC")),
            (
                "Service",
                Resource::new("AWS::ECS::Service")
                    .property("Subnets", json!([{ "Ref": "Subnet" }]))
                    .depends_on(&LogicalId::new("Listener")),
            ),
            ("Listener", Resource::new("AWS::ElasticLoadBalancingV2::Listener")),
        ]);

        let graph = DependencyGraph::from_template(&template).unwrap();
        let order = graph.creation_order().unwrap();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();

        assert!(pos("VPC") < pos("Subnet"));
        assert!(pos("Subnet") < pos("Service"));
        assert!(pos("Listener") < pos("Service"));
        assert_eq!(graph.dependencies_of("Service"), vec!["Listener", "Subnet"]);
        assert_eq!(graph.edge_count(), 3);
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let template = template_with(vec![(
            "Subnet",
            Resource::new("AWS::EC2::Subnet").property("VpcId", json!({ "Ref": "Missing" })),
        )]);

        let err = DependencyGraph::from_template(&template).unwrap_err();
        assert_eq!(
            err,
            StackError::UnknownReference {
                from: "Subnet".to_string(),
                to: "Missing".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_reference_in_output_rejected() {
        let mut template = template_with(vec![("VPC", Resource::new("AWS::EC2::VPC"))]);
        template
            .add_output(
                "LoadBalancerDNS",
                Output {
                    value: json!({ "Fn::GetAtt": ["LB", "DNSName"] }),
                    description: None,
                },
            )
            .unwrap();

        assert!(matches!(
            DependencyGraph::from_template(&template),
            Err(StackError::UnknownReference { .. })
        ));
    }

    #[test]
    fn test_cycle_detected() {
        let template = template_with(vec![
            (
                "A",
                Resource::new("AWS::IAM::Role").property("PermissionsBoundary", json!({ "Ref": "B" })),
            ),
            (
                "B",
                Resource::new("AWS::IAM::Policy").property("Roles", json!([{ "Ref": "A" }])),
            ),
        ]);

        let graph = DependencyGraph::from_template(&template).unwrap();
        assert!(matches!(
            graph.creation_order(),
            Err(StackError::DependencyCycle(_))
        ));
    }
}
