use serde_json::{json, Value};

use super::Construct;
use crate::error::StackError;
use crate::template::{LogicalId, RemovalPolicy, Resource, Template};

/// Registry actions a build needs to push an image, scoped to one repository
pub const PUSH_ACTIONS: [&str; 5] = [
    "ecr:BatchCheckLayerAvailability",
    "ecr:CompleteLayerUpload",
    "ecr:InitiateLayerUpload",
    "ecr:PutImage",
    "ecr:UploadLayerPart",
];

/// Login action; ECR only accepts it on `*`
pub const AUTH_TOKEN_ACTION: &str = "ecr:GetAuthorizationToken";

/// Image registry: immutable tags, AES-256 encryption at rest, destroyed
/// together with the stack.
#[derive(Debug)]
pub struct Repository {
    id: LogicalId,
    name: String,
}

impl Repository {
    pub fn new(id: LogicalId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
        }
    }

    /// `Ref` of an ECR repository resolves to its name
    pub fn name_ref(&self) -> Value {
        self.id.reference()
    }

    pub fn arn(&self) -> Value {
        self.id.arn()
    }
}

impl Construct for Repository {
    fn render(&self, template: &mut Template) -> Result<(), StackError> {
        template.add_resource(
            self.id.clone(),
            Resource::new("AWS::ECR::Repository")
                .property("EncryptionConfiguration", json!({ "EncryptionType": "AES256" }))
                .property("ImageTagMutability", json!("IMMUTABLE"))
                .property("RepositoryName", json!(self.name))
                .removal_policy(RemovalPolicy::Delete),
        )
    }
}
