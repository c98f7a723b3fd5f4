use serde_json::{json, Value};

use super::registry::{Repository, AUTH_TOKEN_ACTION, PUSH_ACTIONS};
use super::Construct;
use crate::error::StackError;
use crate::settings::BuildSettings;
use crate::template::iam::{PolicyStatement, Principal, Role};
use crate::template::intrinsic::arn;
use crate::template::{LogicalId, RemovalPolicy, Resource, Template};

pub const CODEBUILD_PRINCIPAL: &str = "codebuild.amazonaws.com";

/// Build-time variable carrying the registry name into the build spec
pub const IMAGE_REPO_NAME_VAR: &str = "IMAGE_REPO_NAME";

/// Privileged Docker build whose image is pushed to the registry.
///
/// Source and artifacts are handed over by the pipeline, logs go to a
/// dedicated log group that is removed with the stack.
#[derive(Debug)]
pub struct BuildProject {
    id: LogicalId,
    settings: BuildSettings,
    repository_name: Value,
    role: Role,
}

impl BuildProject {
    pub fn new(id: LogicalId, repository: &Repository, settings: &BuildSettings) -> Self {
        let mut role = Role::new(id.child("Role"), Principal::service(CODEBUILD_PRINCIPAL));
        let log_group = Self::log_group_id_for(&id);

        role.add_to_policy(
            PolicyStatement::allow()
                .actions(["logs:CreateLogStream", "logs:PutLogEvents"])
                .resource(log_group.arn()),
        );
        role.add_to_policy(
            PolicyStatement::allow()
                .actions([
                    "codebuild:CreateReportGroup",
                    "codebuild:CreateReport",
                    "codebuild:UpdateReport",
                    "codebuild:BatchPutTestCases",
                    "codebuild:BatchPutCodeCoverages",
                ])
                .resource(arn(
                    "codebuild",
                    vec![json!("report-group/"), id.reference(), json!("-*")],
                )),
        );
        role.add_to_policy(
            PolicyStatement::allow()
                .actions(PUSH_ACTIONS)
                .resource(repository.arn()),
        );
        role.add_to_policy(
            PolicyStatement::allow()
                .actions([AUTH_TOKEN_ACTION])
                .all_resources(),
        );

        Self {
            id,
            settings: settings.clone(),
            repository_name: repository.name_ref(),
            role,
        }
    }

    fn log_group_id_for(id: &LogicalId) -> LogicalId {
        id.child("Logs")
    }

    pub fn id(&self) -> &LogicalId {
        &self.id
    }

    pub fn log_group_id(&self) -> LogicalId {
        Self::log_group_id_for(&self.id)
    }

    #[cfg(test)]
    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn arn(&self) -> Value {
        self.id.arn()
    }

    /// Grant the build's service role an extra permission
    pub fn grant(&mut self, statement: PolicyStatement) {
        self.role.add_to_policy(statement);
    }
}

impl Construct for BuildProject {
    fn render(&self, template: &mut Template) -> Result<(), StackError> {
        let log_group = self.log_group_id();

        template.add_resource(
            log_group.clone(),
            Resource::new("AWS::Logs::LogGroup")
                .property("RetentionInDays", json!(self.settings.log_retention_days))
                .removal_policy(RemovalPolicy::Delete),
        )?;

        self.role.render(template)?;

        // No DependsOn on the role policy: the policy references the project
        template.add_resource(
            self.id.clone(),
            Resource::new("AWS::CodeBuild::Project")
                .property("Artifacts", json!({ "Type": "CODEPIPELINE" }))
                .property("Cache", json!({ "Type": "NO_CACHE" }))
                .property("ConcurrentBuildLimit", json!(self.settings.concurrent_build_limit))
                .property("EncryptionKey", json!("alias/aws/s3"))
                .property(
                    "Environment",
                    json!({
                        "ComputeType": self.settings.compute_type.as_cfn(),
                        "EnvironmentVariables": [{
                            "Name": IMAGE_REPO_NAME_VAR,
                            "Type": "PLAINTEXT",
                            "Value": self.repository_name
                        }],
                        "Image": self.settings.build_image,
                        "ImagePullCredentialsType": "CODEBUILD",
                        "PrivilegedMode": self.settings.privileged,
                        "Type": "LINUX_CONTAINER"
                    }),
                )
                .property(
                    "LogsConfig",
                    json!({
                        "CloudWatchLogs": {
                            "GroupName": log_group.reference(),
                            "Status": "ENABLED"
                        }
                    }),
                )
                .property("ServiceRole", self.role.arn())
                .property("Source", json!({ "Type": "CODEPIPELINE" }))
                .property("TimeoutInMinutes", json!(self.settings.timeout_minutes)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::graph::DependencyGraph;

    fn project() -> BuildProject {
        let repo = Repository::new(LogicalId::new("ecrRepository"), "echo-server");
        BuildProject::new(LogicalId::new("CodeBuild"), &repo, &BuildSettings::default())
    }

    fn rendered() -> Template {
        let mut template = Template::new(None);
        Repository::new(LogicalId::new("ecrRepository"), "echo-server")
            .render(&mut template)
            .unwrap();
        project().render(&mut template).unwrap();
        template
    }

    #[test]
    fn test_project_environment() {
        let template = rendered();
        let project = template.resource("CodeBuild").unwrap();

        assert_eq!(
            project.get_path(&["Environment", "ComputeType"]),
            Some(&json!("BUILD_GENERAL1_SMALL"))
        );
        assert_eq!(
            project.get_path(&["Environment", "Image"]),
            Some(&json!("aws/codebuild/standard:6.0"))
        );
        assert_eq!(
            project.get_path(&["Environment", "PrivilegedMode"]),
            Some(&json!(true))
        );
        assert_eq!(
            project.get_path(&["Environment", "EnvironmentVariables"]),
            Some(&json!([{
                "Name": "IMAGE_REPO_NAME",
                "Type": "PLAINTEXT",
                "Value": { "Ref": "ecrRepository" }
            }]))
        );
        assert_eq!(project.get("TimeoutInMinutes"), Some(&json!(60)));
        assert_eq!(project.get("ConcurrentBuildLimit"), Some(&json!(8)));
        assert_eq!(
            project.get_path(&["LogsConfig", "CloudWatchLogs", "GroupName"]),
            Some(&json!({ "Ref": "CodeBuildLogs" }))
        );
    }

    #[test]
    fn test_log_group_destroyed_with_stack() {
        let template = rendered();
        let logs = template.resource("CodeBuildLogs").unwrap();
        assert_eq!(logs.get("RetentionInDays"), Some(&json!(30)));
        assert_eq!(logs.deletion_policy(), Some(RemovalPolicy::Delete));
    }

    #[test]
    fn test_registry_grants() {
        let project = project();
        let ecr: Vec<&PolicyStatement> = project
            .role()
            .statements()
            .iter()
            .filter(|s| s.action.iter().any(|a| a.starts_with("ecr:")))
            .collect();

        assert_eq!(ecr.len(), 2);
        assert_eq!(ecr[0].action, PUSH_ACTIONS.to_vec());
        assert_eq!(ecr[0].resource, vec![json!({ "Fn::GetAtt": ["ecrRepository", "Arn"] })]);
        assert_eq!(ecr[1].action, vec![AUTH_TOKEN_ACTION]);
        assert_eq!(ecr[1].resource, vec![json!("*")]);
    }

    #[test]
    fn test_project_and_policy_form_no_cycle() {
        let template = rendered();
        let graph = DependencyGraph::from_template(&template).unwrap();
        let order = graph.creation_order().unwrap();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();

        assert!(pos("CodeBuildRole") < pos("CodeBuild"));
        assert!(pos("CodeBuild") < pos("CodeBuildRoleDefaultPolicy"));
    }
}
