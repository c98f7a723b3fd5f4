// IAM policy grammar and the role construct shared by every component

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};

use super::{LogicalId, Resource, Template};
use crate::error::StackError;

pub const POLICY_VERSION: &str = "2012-10-17";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Effect {
    Allow,
    Deny,
}

/// Principal block of a statement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Principal {
    #[serde(rename = "Service")]
    Service(String),
    #[serde(rename = "AWS")]
    Aws(Value),
}

impl Principal {
    pub fn service(name: &str) -> Self {
        Self::Service(name.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyStatement {
    pub effect: Effect,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,
    pub action: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resource: Vec<Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub condition: BTreeMap<String, BTreeMap<String, Value>>,
}

impl PolicyStatement {
    pub fn allow() -> Self {
        Self::with_effect(Effect::Allow)
    }

    pub fn deny() -> Self {
        Self::with_effect(Effect::Deny)
    }

    fn with_effect(effect: Effect) -> Self {
        Self {
            effect,
            principal: None,
            action: Vec::new(),
            resource: Vec::new(),
            condition: BTreeMap::new(),
        }
    }

    pub fn actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.action.extend(actions.into_iter().map(Into::into));
        self
    }

    pub fn resource(mut self, resource: Value) -> Self {
        self.resource.push(resource);
        self
    }

    pub fn all_resources(self) -> Self {
        self.resource(Value::from("*"))
    }

    pub fn principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn condition(mut self, operator: &str, key: &str, value: Value) -> Self {
        self.condition
            .entry(operator.to_string())
            .or_default()
            .insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyDocument {
    #[serde(rename = "Version")]
    pub version: &'static str,
    #[serde(rename = "Statement")]
    pub statements: Vec<PolicyStatement>,
}

impl PolicyDocument {
    pub fn new(statements: Vec<PolicyStatement>) -> Self {
        Self {
            version: POLICY_VERSION,
            statements,
        }
    }

    pub fn to_value(&self) -> Value {
        // Serializing plain enums, strings and json values cannot fail
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// An IAM role plus the inline "default policy" that accumulates grants.
///
/// Statements are collected while the stack is assembled and rendered as a
/// separate `AWS::IAM::Policy` named `{role}DefaultPolicy`, which keeps the
/// role itself free of references to the resources it is granted on.
#[derive(Debug, Clone)]
pub struct Role {
    id: LogicalId,
    assumed_by: Principal,
    statements: Vec<PolicyStatement>,
}

impl Role {
    pub fn new(id: LogicalId, assumed_by: Principal) -> Self {
        Self {
            id,
            assumed_by,
            statements: Vec::new(),
        }
    }

    pub fn id(&self) -> &LogicalId {
        &self.id
    }

    pub fn arn(&self) -> Value {
        self.id.arn()
    }

    pub fn policy_id(&self) -> LogicalId {
        self.id.child("DefaultPolicy")
    }

    #[cfg(test)]
    pub fn statements(&self) -> &[PolicyStatement] {
        &self.statements
    }

    pub fn add_to_policy(&mut self, statement: PolicyStatement) {
        self.statements.push(statement);
    }

    pub fn render(&self, template: &mut Template) -> Result<(), StackError> {
        let trust = PolicyDocument::new(vec![PolicyStatement::allow()
            .principal(self.assumed_by.clone())
            .actions(["sts:AssumeRole"])]);

        template.add_resource(
            self.id.clone(),
            Resource::new("AWS::IAM::Role")
                .property("AssumeRolePolicyDocument", trust.to_value()),
        )?;

        if !self.statements.is_empty() {
            let policy_id = self.policy_id();
            template.add_resource(
                policy_id.clone(),
                Resource::new("AWS::IAM::Policy")
                    .property(
                        "PolicyDocument",
                        PolicyDocument::new(self.statements.clone()).to_value(),
                    )
                    .property("PolicyName", json!(policy_id.as_str()))
                    .property("Roles", json!([self.id.reference()])),
            )?;
        }

        Ok(())
    }
}
