// CloudFormation intrinsic functions and pseudo parameters

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::{json, Value};

pub const AWS_PARTITION: &str = "AWS::Partition";
pub const AWS_REGION: &str = "AWS::Region";
pub const AWS_ACCOUNT_ID: &str = "AWS::AccountId";

/// Logical ID of a resource in the template, used to build references to it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LogicalId(String);

impl LogicalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive a child ID, e.g. `VPC` + `IGW` = `VPCIGW`
    pub fn child(&self, suffix: &str) -> Self {
        Self(format!("{}{}", self.0, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `{ "Ref": id }`
    pub fn reference(&self) -> Value {
        reference(&self.0)
    }

    /// `{ "Fn::GetAtt": [id, attribute] }`
    pub fn attr(&self, attribute: &str) -> Value {
        json!({ "Fn::GetAtt": [self.0, attribute] })
    }

    pub fn arn(&self) -> Value {
        self.attr("Arn")
    }
}

impl std::fmt::Display for LogicalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn reference(id: &str) -> Value {
    json!({ "Ref": id })
}

pub fn join(delimiter: &str, parts: Vec<Value>) -> Value {
    json!({ "Fn::Join": [delimiter, parts] })
}

pub fn select(index: usize, list: Value) -> Value {
    json!({ "Fn::Select": [index, list] })
}

/// Availability zones of the deployment region
pub fn get_azs() -> Value {
    json!({ "Fn::GetAZs": "" })
}

/// `arn:{partition}:{service}:{region}:{account}:{resource...}`
pub fn arn(service: &str, resource: Vec<Value>) -> Value {
    let mut parts = vec![
        Value::from("arn:"),
        reference(AWS_PARTITION),
        Value::from(format!(":{}:", service)),
        reference(AWS_REGION),
        Value::from(":"),
        reference(AWS_ACCOUNT_ID),
        Value::from(":"),
    ];
    parts.extend(resource);
    join("", parts)
}

/// ARN of the deploying account's root principal
pub fn account_root_arn() -> Value {
    join(
        "",
        vec![
            Value::from("arn:"),
            reference(AWS_PARTITION),
            Value::from(":iam::"),
            reference(AWS_ACCOUNT_ID),
            Value::from(":root"),
        ],
    )
}

fn is_pseudo_parameter(id: &str) -> bool {
    id.starts_with("AWS::")
}

/// Collect every logical ID referenced through `Ref` or `Fn::GetAtt`
/// anywhere inside `value`. Pseudo parameters are skipped.
pub fn referenced_ids(value: &Value) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    collect_references(value, &mut ids);
    ids
}

fn collect_references(value: &Value, ids: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(id)) = map.get("Ref") {
                    if !is_pseudo_parameter(id) {
                        ids.insert(id.clone());
                    }
                    return;
                }
                if let Some(Value::Array(args)) = map.get("Fn::GetAtt") {
                    if let Some(Value::String(id)) = args.first() {
                        ids.insert(id.clone());
                    }
                    return;
                }
            }
            for v in map.values() {
                collect_references(v, ids);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_references(v, ids);
            }
        }
        _ => {}
    }
}

/// If `value` is a bare `Ref` or `Fn::GetAtt`, return the logical ID it targets
pub fn target_of(value: &Value) -> Option<&str> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    if let Some(id) = map.get("Ref").and_then(Value::as_str) {
        return Some(id);
    }
    map.get("Fn::GetAtt")
        .and_then(Value::as_array)
        .and_then(|args| args.first())
        .and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_id_helpers() {
        let vpc = LogicalId::new("VPC");
        assert_eq!(vpc.child("IGW").as_str(), "VPCIGW");
        assert_eq!(vpc.reference(), json!({ "Ref": "VPC" }));
        assert_eq!(vpc.arn(), json!({ "Fn::GetAtt": ["VPC", "Arn"] }));
    }

    #[test]
    fn test_referenced_ids_walks_nested_values() {
        let value = json!({
            "Subnets": [{ "Ref": "SubnetA" }, { "Ref": "SubnetB" }],
            "Role": { "Fn::GetAtt": ["Role", "Arn"] },
            "Arn": arn("codepipeline", vec![reference("Pipeline")]),
            "Plain": "Ref",
        });
        let ids: Vec<String> = referenced_ids(&value).into_iter().collect();
        assert_eq!(ids, vec!["Pipeline", "Role", "SubnetA", "SubnetB"]);
    }

    #[test]
    fn test_pseudo_parameters_are_not_references() {
        let ids = referenced_ids(&account_root_arn());
        assert!(ids.is_empty());
    }

    #[test]
    fn test_target_of() {
        assert_eq!(target_of(&reference("Bucket")), Some("Bucket"));
        assert_eq!(target_of(&LogicalId::new("Repo").arn()), Some("Repo"));
        assert_eq!(target_of(&json!("*")), None);
        assert_eq!(target_of(&join("", vec![reference("X")])), None);
    }
}
