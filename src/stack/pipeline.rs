//! Release pipeline: artifact store, stage model and the IAM wiring between
//! the pipeline and the roles its actions run under.
//!
//! Stages run strictly in declaration order. Only `Source` and `Build` are
//! declared; promotion to the service is not part of the pipeline.

use serde::Serialize;
use serde_json::{json, Map, Value};

use super::build::BuildProject;
use super::service::ECS_TASKS_PRINCIPAL;
use super::source::{SourceRepository, SOURCE_ACTIONS};
use super::Construct;
use crate::error::StackError;
use crate::template::iam::{PolicyDocument, PolicyStatement, Principal, Role};
use crate::template::intrinsic::{account_root_arn, arn, join};
use crate::template::{LogicalId, RemovalPolicy, Resource, Template};

pub const CODEPIPELINE_PRINCIPAL: &str = "codepipeline.amazonaws.com";

pub const SOURCE_ARTIFACT: &str = "SourceArtifact";
pub const BUILD_ARTIFACT: &str = "BuildArtifact";

/// Deployment controller permissions held by the pipeline role
pub const DEPLOY_ACTIONS: [&str; 7] = [
    "codedeploy:CreateDeployment",
    "codedeploy:GetDeployment",
    "codedeploy:GetApplication",
    "codedeploy:GetApplicationRevision",
    "codedeploy:RegisterApplicationRevision",
    "codedeploy:GetDeploymentConfig",
    "ecs:RegisterTaskDefinition",
];

const BUCKET_READ_ACTIONS: [&str; 3] = ["s3:GetObject*", "s3:GetBucket*", "s3:List*"];

const BUCKET_WRITE_ACTIONS: [&str; 7] = [
    "s3:DeleteObject*",
    "s3:PutObject",
    "s3:PutObjectLegalHold",
    "s3:PutObjectRetention",
    "s3:PutObjectTagging",
    "s3:PutObjectVersionTagging",
    "s3:Abort*",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActionCategory {
    Source,
    Build,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActionProvider {
    CodeCommit,
    CodeBuild,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActionTypeId {
    pub category: ActionCategory,
    pub owner: &'static str,
    pub provider: ActionProvider,
    pub version: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Artifact {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Action {
    pub action_type_id: ActionTypeId,
    pub configuration: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub input_artifacts: Vec<Artifact>,
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub output_artifacts: Vec<Artifact>,
    pub role_arn: Value,
    pub run_order: u32,
}

impl Action {
    fn new(name: &str, category: ActionCategory, provider: ActionProvider, role: &Role) -> Self {
        Self {
            action_type_id: ActionTypeId {
                category,
                owner: "AWS",
                provider,
                version: "1",
            },
            configuration: Map::new(),
            input_artifacts: Vec::new(),
            name: name.to_string(),
            output_artifacts: Vec::new(),
            role_arn: role.arn(),
            run_order: 1,
        }
    }

    fn config(mut self, key: &str, value: Value) -> Self {
        self.configuration.insert(key.to_string(), value);
        self
    }

    fn input(mut self, artifact: &str) -> Self {
        self.input_artifacts.push(Artifact {
            name: artifact.to_string(),
        });
        self
    }

    fn output(mut self, artifact: &str) -> Self {
        self.output_artifacts.push(Artifact {
            name: artifact.to_string(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Stage {
    pub name: String,
    pub actions: Vec<Action>,
}

/// S3 artifact store: S3-managed encryption, no public access, TLS only
#[derive(Debug)]
pub struct ArtifactBucket {
    id: LogicalId,
}

impl ArtifactBucket {
    pub fn new(id: LogicalId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> &LogicalId {
        &self.id
    }

    pub fn policy_id(&self) -> LogicalId {
        self.id.child("Policy")
    }

    fn resources(&self) -> [Value; 2] {
        let bucket_arn = self.id.arn();
        [bucket_arn.clone(), join("", vec![bucket_arn, json!("/*")])]
    }

    pub fn grant_read_write(&self) -> PolicyStatement {
        self.resources().into_iter().fold(
            PolicyStatement::allow()
                .actions(BUCKET_READ_ACTIONS)
                .actions(BUCKET_WRITE_ACTIONS),
            PolicyStatement::resource,
        )
    }
}

impl Construct for ArtifactBucket {
    fn render(&self, template: &mut Template) -> Result<(), StackError> {
        template.add_resource(
            self.id.clone(),
            Resource::new("AWS::S3::Bucket")
                .property(
                    "BucketEncryption",
                    json!({
                        "ServerSideEncryptionConfiguration": [{
                            "ServerSideEncryptionByDefault": { "SSEAlgorithm": "AES256" }
                        }]
                    }),
                )
                .property(
                    "PublicAccessBlockConfiguration",
                    json!({
                        "BlockPublicAcls": true,
                        "BlockPublicPolicy": true,
                        "IgnorePublicAcls": true,
                        "RestrictPublicBuckets": true
                    }),
                )
                .removal_policy(RemovalPolicy::Retain),
        )?;

        let tls_only = self.resources().into_iter().fold(
            PolicyStatement::deny()
                .principal(Principal::Aws(json!("*")))
                .actions(["s3:*"])
                .condition("Bool", "aws:SecureTransport", json!("false")),
            PolicyStatement::resource,
        );

        template.add_resource(
            self.policy_id(),
            Resource::new("AWS::S3::BucketPolicy")
                .property("Bucket", self.id.reference())
                .property("PolicyDocument", PolicyDocument::new(vec![tls_only]).to_value()),
        )
    }
}

/// Two-stage pipeline: check out the tracked branch, then build and push
/// the image.
#[derive(Debug)]
pub struct Pipeline {
    id: LogicalId,
    bucket: ArtifactBucket,
    role: Role,
    action_roles: Vec<Role>,
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Wire the pipeline to its source and build project. The build's
    /// service role is granted access to the artifact store.
    pub fn new(id: LogicalId, source: &SourceRepository, build: &mut BuildProject) -> Self {
        let bucket = ArtifactBucket::new(id.child("ArtifactsBucket"));
        let mut role = Role::new(id.child("Role"), Principal::service(CODEPIPELINE_PRINCIPAL));

        let mut source_role = Role::new(
            id.child("SourceActionRole"),
            Principal::Aws(account_root_arn()),
        );
        source_role.add_to_policy(bucket.grant_read_write());
        source_role.add_to_policy(
            PolicyStatement::allow()
                .actions(SOURCE_ACTIONS)
                .resource(source.arn()),
        );

        let mut build_role = Role::new(
            id.child("BuildActionRole"),
            Principal::Aws(account_root_arn()),
        );
        build_role.add_to_policy(
            PolicyStatement::allow()
                .actions([
                    "codebuild:BatchGetBuilds",
                    "codebuild:StartBuild",
                    "codebuild:StopBuild",
                ])
                .resource(build.arn()),
        );

        build.grant(bucket.grant_read_write());

        role.add_to_policy(bucket.grant_read_write());
        role.add_to_policy(
            PolicyStatement::allow()
                .actions(["sts:AssumeRole"])
                .resource(source_role.arn())
                .resource(build_role.arn()),
        );
        role.add_to_policy(
            PolicyStatement::allow()
                .actions(DEPLOY_ACTIONS)
                .all_resources(),
        );
        role.add_to_policy(
            PolicyStatement::allow()
                .actions(["iam:PassRole"])
                .all_resources()
                .condition(
                    "StringEqualsIfExists",
                    "iam:PassedToService",
                    json!([ECS_TASKS_PRINCIPAL]),
                ),
        );

        let stages = vec![
            Stage {
                name: "Source".to_string(),
                actions: vec![Action::new(
                    "Source",
                    ActionCategory::Source,
                    ActionProvider::CodeCommit,
                    &source_role,
                )
                .config("RepositoryName", source.name_attr())
                .config("BranchName", json!(source.branch()))
                .config("PollForSourceChanges", json!(false))
                .output(SOURCE_ARTIFACT)],
            },
            Stage {
                name: "Build".to_string(),
                actions: vec![Action::new(
                    "DockerBuild",
                    ActionCategory::Build,
                    ActionProvider::CodeBuild,
                    &build_role,
                )
                .config("ProjectName", build.id().reference())
                .input(SOURCE_ARTIFACT)
                .output(BUILD_ARTIFACT)],
            },
        ];

        Self {
            id,
            bucket,
            role,
            action_roles: vec![source_role, build_role],
            stages,
        }
    }

    pub fn id(&self) -> &LogicalId {
        &self.id
    }

    pub fn arn(&self) -> Value {
        pipeline_arn(&self.id)
    }

    #[cfg(test)]
    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }
}

/// Pipelines expose no `Arn` attribute, so the ARN is assembled from the name
pub fn pipeline_arn(id: &LogicalId) -> Value {
    arn("codepipeline", vec![id.reference()])
}

impl Construct for Pipeline {
    fn render(&self, template: &mut Template) -> Result<(), StackError> {
        self.bucket.render(template)?;
        self.role.render(template)?;
        for role in &self.action_roles {
            role.render(template)?;
        }

        let stages = serde_json::to_value(&self.stages).unwrap_or(Value::Null);

        template.add_resource(
            self.id.clone(),
            Resource::new("AWS::CodePipeline::Pipeline")
                .property(
                    "ArtifactStore",
                    json!({
                        "Location": self.bucket.id().reference(),
                        "Type": "S3"
                    }),
                )
                .property("RestartExecutionOnUpdate", json!(false))
                .property("RoleArn", self.role.arn())
                .property("Stages", stages)
                .depends_on(self.role.id())
                .depends_on(&self.role.policy_id()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{BuildSettings, SourceSettings};
    use crate::stack::registry::Repository;

    fn pipeline() -> (Pipeline, BuildProject) {
        let source = SourceRepository::new(LogicalId::new("CodeCommit"), &SourceSettings::default());
        let repo = Repository::new(LogicalId::new("ecrRepository"), "echo-server");
        let mut build = BuildProject::new(LogicalId::new("CodeBuild"), &repo, &BuildSettings::default());
        let pipeline = Pipeline::new(LogicalId::new("codePipeline"), &source, &mut build);
        (pipeline, build)
    }

    #[test]
    fn test_two_linear_stages() {
        let (pipeline, _) = pipeline();
        let names: Vec<&str> = pipeline.stages().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Source", "Build"]);

        let source = &pipeline.stages()[0].actions[0];
        assert_eq!(source.name, "Source");
        assert_eq!(source.output_artifacts[0].name, SOURCE_ARTIFACT);
        assert_eq!(
            source.configuration.get("PollForSourceChanges"),
            Some(&json!(false))
        );

        let build = &pipeline.stages()[1].actions[0];
        assert_eq!(build.name, "DockerBuild");
        assert_eq!(build.input_artifacts[0].name, SOURCE_ARTIFACT);
        assert_eq!(build.output_artifacts[0].name, BUILD_ARTIFACT);
    }

    #[test]
    fn test_stage_serialization() {
        let (pipeline, _) = pipeline();
        let build = serde_json::to_value(&pipeline.stages()[1]).unwrap();
        assert_eq!(
            build,
            json!({
                "Name": "Build",
                "Actions": [{
                    "ActionTypeId": {
                        "Category": "Build",
                        "Owner": "AWS",
                        "Provider": "CodeBuild",
                        "Version": "1"
                    },
                    "Configuration": { "ProjectName": { "Ref": "CodeBuild" } },
                    "InputArtifacts": [{ "Name": "SourceArtifact" }],
                    "Name": "DockerBuild",
                    "OutputArtifacts": [{ "Name": "BuildArtifact" }],
                    "RoleArn": { "Fn::GetAtt": ["codePipelineBuildActionRole", "Arn"] },
                    "RunOrder": 1
                }]
            })
        );
    }

    #[test]
    fn test_pass_role_restricted_to_ecs_tasks() {
        let (pipeline, _) = pipeline();
        let pass_role = pipeline
            .role()
            .statements()
            .iter()
            .find(|s| s.action == vec!["iam:PassRole"])
            .unwrap();

        assert_eq!(pass_role.resource, vec![json!("*")]);
        assert_eq!(
            pass_role.condition["StringEqualsIfExists"]["iam:PassedToService"],
            json!(["ecs-tasks.amazonaws.com"])
        );
    }

    #[test]
    fn test_deploy_permissions_unscoped() {
        let (pipeline, _) = pipeline();
        let deploy = pipeline
            .role()
            .statements()
            .iter()
            .find(|s| s.action.iter().any(|a| a == "codedeploy:CreateDeployment"))
            .unwrap();
        assert_eq!(deploy.action, DEPLOY_ACTIONS.to_vec());
        assert_eq!(deploy.resource, vec![json!("*")]);
    }

    #[test]
    fn test_build_role_granted_artifact_access() {
        let (_, build) = pipeline();
        assert!(build
            .role()
            .statements()
            .iter()
            .any(|s| s.action.iter().any(|a| a == "s3:PutObject")));
    }

    #[test]
    fn test_artifact_bucket_enforces_tls() {
        let (pipeline, _) = pipeline();
        let mut template = Template::new(None);
        pipeline.render(&mut template).unwrap();

        let policy = template.resource("codePipelineArtifactsBucketPolicy").unwrap();
        let statement = &policy.get_path(&["PolicyDocument", "Statement"]).unwrap()[0];
        assert_eq!(statement["Effect"], "Deny");
        assert_eq!(statement["Condition"]["Bool"]["aws:SecureTransport"], "false");

        let bucket = template.resource("codePipelineArtifactsBucket").unwrap();
        assert_eq!(
            bucket.get_path(&["PublicAccessBlockConfiguration", "BlockPublicAcls"]),
            Some(&json!(true))
        );

        let resource = template.resource("codePipeline").unwrap();
        assert_eq!(
            resource.explicit_dependencies(),
            &["codePipelineRole".to_string(), "codePipelineRoleDefaultPolicy".to_string()]
        );
    }
}
