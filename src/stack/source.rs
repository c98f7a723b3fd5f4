use serde_json::{json, Value};

use super::Construct;
use crate::error::StackError;
use crate::settings::SourceSettings;
use crate::template::iam::{PolicyStatement, Principal, Role};
use crate::template::{LogicalId, Resource, Template};

pub const EVENTS_PRINCIPAL: &str = "events.amazonaws.com";

/// Read and archive actions a pipeline source action needs on the repository
pub const SOURCE_ACTIONS: [&str; 5] = [
    "codecommit:GetBranch",
    "codecommit:GetCommit",
    "codecommit:UploadArchive",
    "codecommit:GetUploadArchiveStatus",
    "codecommit:CancelUploadArchive",
];

/// Managed git repository holding the image sources
#[derive(Debug)]
pub struct SourceRepository {
    id: LogicalId,
    name: String,
    branch: String,
}

impl SourceRepository {
    pub fn new(id: LogicalId, settings: &SourceSettings) -> Self {
        Self {
            id,
            name: settings.repository_name.clone(),
            branch: settings.branch.clone(),
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn arn(&self) -> Value {
        self.id.arn()
    }

    pub fn name_attr(&self) -> Value {
        self.id.attr("Name")
    }

    /// Event rule that starts `pipeline` whenever the tracked branch moves
    pub fn on_branch_change(&self, pipeline: &LogicalId, pipeline_arn: Value) -> ChangeTrigger {
        let mut role = Role::new(
            pipeline.child("EventsRole"),
            Principal::service(EVENTS_PRINCIPAL),
        );
        role.add_to_policy(
            PolicyStatement::allow()
                .actions(["codepipeline:StartPipelineExecution"])
                .resource(pipeline_arn.clone()),
        );

        ChangeTrigger {
            id: self.id.child(&format!("{}EventRule", pipeline)),
            repository_arn: self.arn(),
            branch: self.branch.clone(),
            pipeline_arn,
            role,
        }
    }
}

impl Construct for SourceRepository {
    fn render(&self, template: &mut Template) -> Result<(), StackError> {
        template.add_resource(
            self.id.clone(),
            Resource::new("AWS::CodeCommit::Repository")
                .property("RepositoryName", json!(self.name)),
        )
    }
}

/// Repository state change rule targeting a pipeline
#[derive(Debug)]
pub struct ChangeTrigger {
    id: LogicalId,
    repository_arn: Value,
    branch: String,
    pipeline_arn: Value,
    role: Role,
}

impl ChangeTrigger {
    #[cfg(test)]
    pub fn role(&self) -> &Role {
        &self.role
    }
}

impl Construct for ChangeTrigger {
    fn render(&self, template: &mut Template) -> Result<(), StackError> {
        self.role.render(template)?;

        template.add_resource(
            self.id.clone(),
            Resource::new("AWS::Events::Rule")
                .property(
                    "EventPattern",
                    json!({
                        "source": ["aws.codecommit"],
                        "resources": [self.repository_arn],
                        "detail-type": ["CodeCommit Repository State Change"],
                        "detail": {
                            "event": ["referenceCreated", "referenceUpdated"],
                            "referenceName": [self.branch],
                            "referenceType": ["branch"]
                        }
                    }),
                )
                .property("State", json!("ENABLED"))
                .property(
                    "Targets",
                    json!([{
                        "Arn": self.pipeline_arn,
                        "Id": "Target0",
                        "RoleArn": self.role.arn()
                    }]),
                ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::intrinsic::{arn, reference};

    fn repository() -> SourceRepository {
        let settings = SourceSettings {
            repository_name: "echo-server".to_string(),
            branch: "main".to_string(),
        };
        SourceRepository::new(LogicalId::new("CodeCommit"), &settings)
    }

    #[test]
    fn test_repository_rendering() {
        let mut template = Template::new(None);
        repository().render(&mut template).unwrap();

        let resource = template.resource("CodeCommit").unwrap();
        assert_eq!(resource.resource_type(), "AWS::CodeCommit::Repository");
        assert_eq!(resource.get("RepositoryName"), Some(&json!("echo-server")));
    }

    #[test]
    fn test_trigger_matches_tracked_branch() {
        let repo = repository();
        let pipeline = LogicalId::new("codePipeline");
        let trigger = repo.on_branch_change(&pipeline, arn("codepipeline", vec![reference("codePipeline")]));

        let mut template = Template::new(None);
        trigger.render(&mut template).unwrap();

        let rule = template.resource("CodeCommitcodePipelineEventRule").unwrap();
        assert_eq!(rule.resource_type(), "AWS::Events::Rule");
        assert_eq!(
            rule.get_path(&["EventPattern", "detail", "referenceName"]),
            Some(&json!(["main"]))
        );
        assert_eq!(
            rule.get_path(&["EventPattern", "resources"]),
            Some(&json!([{ "Fn::GetAtt": ["CodeCommit", "Arn"] }]))
        );
        assert_eq!(
            rule.get("Targets").and_then(|t| t[0].get("RoleArn")),
            Some(&json!({ "Fn::GetAtt": ["codePipelineEventsRole", "Arn"] }))
        );
    }

    #[test]
    fn test_events_role_may_only_start_the_pipeline() {
        let repo = repository();
        let trigger = repo.on_branch_change(
            &LogicalId::new("codePipeline"),
            arn("codepipeline", vec![reference("codePipeline")]),
        );

        let statements = trigger.role().statements();
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].action, vec!["codepipeline:StartPipelineExecution"]);
    }
}
