//! CloudFormation document model.
//!
//! Constructs add [`Resource`]s to a [`Template`] under a [`LogicalId`];
//! every cross-resource wiring is expressed with the intrinsic helpers so the
//! provisioning engine can derive creation order from the references alone.

pub mod graph;
pub mod iam;
pub mod intrinsic;

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::StackError;
pub use intrinsic::LogicalId;

pub const TEMPLATE_FORMAT_VERSION: &str = "2010-09-09";

/// What the provisioning engine does with a stateful resource when it is
/// removed from the stack or replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RemovalPolicy {
    Delete,
    Retain,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    #[serde(rename = "Type")]
    resource_type: String,
    #[serde(rename = "Properties", skip_serializing_if = "Map::is_empty")]
    properties: Map<String, Value>,
    #[serde(rename = "DependsOn", skip_serializing_if = "Vec::is_empty")]
    depends_on: Vec<String>,
    #[serde(rename = "UpdateReplacePolicy", skip_serializing_if = "Option::is_none")]
    update_replace_policy: Option<RemovalPolicy>,
    #[serde(rename = "DeletionPolicy", skip_serializing_if = "Option::is_none")]
    deletion_policy: Option<RemovalPolicy>,
}

impl Resource {
    pub fn new(resource_type: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            properties: Map::new(),
            depends_on: Vec::new(),
            update_replace_policy: None,
            deletion_policy: None,
        }
    }

    pub fn property(mut self, key: &str, value: Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }

    pub fn depends_on(mut self, id: &LogicalId) -> Self {
        if !self.depends_on.iter().any(|d| d == id.as_str()) {
            self.depends_on.push(id.as_str().to_string());
        }
        self
    }

    /// Same policy for deletion and replacement
    pub fn removal_policy(mut self, policy: RemovalPolicy) -> Self {
        self.update_replace_policy = Some(policy);
        self.deletion_policy = Some(policy);
        self
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Look up a nested property by path, e.g. `["Environment", "ComputeType"]`
    pub fn get_path(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        rest.iter()
            .try_fold(self.properties.get(*first)?, |value, key| value.get(*key))
    }

    pub fn explicit_dependencies(&self) -> &[String] {
        &self.depends_on
    }

    pub fn deletion_policy(&self) -> Option<RemovalPolicy> {
        self.deletion_policy
    }

    pub fn update_replace_policy(&self) -> Option<RemovalPolicy> {
        self.update_replace_policy
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Output {
    #[serde(rename = "Value")]
    pub value: Value,
    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Output encodings accepted by the provisioning engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TemplateFormat {
    Json,
    Yaml,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    format_version: &'static str,
    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(rename = "Resources")]
    resources: BTreeMap<String, Resource>,
    #[serde(rename = "Outputs", skip_serializing_if = "BTreeMap::is_empty")]
    outputs: BTreeMap<String, Output>,
}

impl Template {
    pub fn new(description: Option<String>) -> Self {
        Self {
            format_version: TEMPLATE_FORMAT_VERSION,
            description,
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn add_resource(&mut self, id: LogicalId, resource: Resource) -> Result<(), StackError> {
        let key = id.as_str().to_string();
        if self.resources.contains_key(&key) {
            return Err(StackError::DuplicateLogicalId(key));
        }
        tracing::debug!(logical_id = %key, resource_type = %resource.resource_type, "Adding resource");
        self.resources.insert(key, resource);
        Ok(())
    }

    pub fn add_output(&mut self, id: &str, output: Output) -> Result<(), StackError> {
        if self.outputs.contains_key(id) {
            return Err(StackError::DuplicateLogicalId(id.to_string()));
        }
        self.outputs.insert(id.to_string(), output);
        Ok(())
    }

    pub fn resource(&self, id: &str) -> Option<&Resource> {
        self.resources.get(id)
    }

    pub fn resources(&self) -> impl Iterator<Item = (&str, &Resource)> {
        self.resources.iter().map(|(id, r)| (id.as_str(), r))
    }

    pub fn resources_of_type<'a>(
        &'a self,
        resource_type: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a Resource)> + 'a {
        self.resources()
            .filter(move |(_, r)| r.resource_type == resource_type)
    }

    pub fn outputs(&self) -> impl Iterator<Item = (&str, &Output)> {
        self.outputs.iter().map(|(id, o)| (id.as_str(), o))
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn render(&self, format: TemplateFormat) -> Result<String> {
        match format {
            TemplateFormat::Json => {
                serde_json::to_string_pretty(self).context("Failed to render template as JSON")
            }
            TemplateFormat::Yaml => {
                serde_yaml::to_string(self).context("Failed to render template as YAML")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_duplicate_logical_id_rejected() {
        let mut template = Template::new(None);
        template
            .add_resource(LogicalId::new("Repo"), Resource::new("AWS::ECR::Repository"))
            .unwrap();
        let err = template
            .add_resource(LogicalId::new("Repo"), Resource::new("AWS::ECR::Repository"))
            .unwrap_err();
        assert_eq!(err, StackError::DuplicateLogicalId("Repo".to_string()));
    }

    #[test]
    fn test_resource_serialization_omits_empty_sections() {
        let resource = Resource::new("AWS::ECS::Cluster");
        assert_eq!(
            serde_json::to_value(&resource).unwrap(),
            json!({ "Type": "AWS::ECS::Cluster" })
        );
    }

    #[test]
    fn test_removal_policy_serialization() {
        let resource = Resource::new("AWS::Logs::LogGroup")
            .property("RetentionInDays", json!(30))
            .removal_policy(RemovalPolicy::Delete);
        assert_eq!(
            serde_json::to_value(&resource).unwrap(),
            json!({
                "Type": "AWS::Logs::LogGroup",
                "Properties": { "RetentionInDays": 30 },
                "UpdateReplacePolicy": "Delete",
                "DeletionPolicy": "Delete"
            })
        );
    }

    #[test]
    fn test_get_path() {
        let resource = Resource::new("AWS::CodeBuild::Project").property(
            "Environment",
            json!({ "ComputeType": "BUILD_GENERAL1_SMALL" }),
        );
        assert_eq!(
            resource.get_path(&["Environment", "ComputeType"]),
            Some(&json!("BUILD_GENERAL1_SMALL"))
        );
        assert_eq!(resource.get_path(&["Environment", "Image"]), None);
        assert_eq!(resource.get_path(&[]), None);
    }

    #[test]
    fn test_render_formats() {
        let mut template = Template::new(Some("test stack".to_string()));
        template
            .add_resource(LogicalId::new("Cluster"), Resource::new("AWS::ECS::Cluster"))
            .unwrap();

        let rendered = template.render(TemplateFormat::Json).unwrap();
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["AWSTemplateFormatVersion"], "2010-09-09");
        assert_eq!(parsed["Resources"]["Cluster"]["Type"], "AWS::ECS::Cluster");
        assert!(parsed.get("Outputs").is_none());

        let yaml = template.render(TemplateFormat::Yaml).unwrap();
        let parsed_yaml: Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed_yaml, parsed);
    }
}
