use std::time::Duration;

use anyhow::{bail, Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_cloudformation::types::Capability;
use aws_sdk_cloudformation::Client as CloudFormationClient;
use tracing::{debug, info, warn};

use crate::settings::AwsSettings;
use crate::template::Template;

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const MAX_ERROR_LEN: usize = 200;

/// Extract a clean error message from an AWS SDK error's Debug output
fn format_sdk_error<E: std::fmt::Debug>(err: &E) -> String {
    let debug_str = format!("{:?}", err);

    // Pattern: message: Some("actual error message")
    if let Some(start) = debug_str.find("message: Some(\"") {
        let start = start + 15;
        if let Some(end) = debug_str[start..].find("\")") {
            return debug_str[start..start + end].to_string();
        }
    }

    if debug_str.len() > MAX_ERROR_LEN {
        let mut end = MAX_ERROR_LEN;
        while !debug_str.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &debug_str[..end])
    } else {
        debug_str
    }
}

/// Where a stack is in its lifecycle, reduced from the provider's status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackPhase {
    InProgress,
    Succeeded,
    /// Settled, but the last operation was rolled back or failed
    Failed,
}

impl StackPhase {
    pub fn from_status(status: &str) -> Self {
        if status.ends_with("_IN_PROGRESS") {
            StackPhase::InProgress
        } else if status.ends_with("_FAILED") || status.contains("ROLLBACK") {
            StackPhase::Failed
        } else {
            StackPhase::Succeeded
        }
    }
}

/// What `deploy` ended up doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Submits rendered templates to the provisioning engine
pub struct StackDeployer {
    client: CloudFormationClient,
}

impl StackDeployer {
    pub async fn new(settings: &AwsSettings) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let (Some(access_key), Some(secret_key)) =
            (&settings.access_key_id, &settings.secret_access_key)
        {
            let creds = aws_sdk_cloudformation::config::Credentials::new(
                access_key, secret_key, None, None, "static",
            );
            loader = loader.credentials_provider(creds);
        }
        let aws_config = loader.load().await;

        Ok(Self {
            client: CloudFormationClient::new(&aws_config),
        })
    }

    /// Current status of `stack_name`, or `None` if no such stack exists
    pub async fn stack_status(&self, stack_name: &str) -> Result<Option<String>> {
        match self
            .client
            .describe_stacks()
            .stack_name(stack_name)
            .send()
            .await
        {
            Ok(response) => Ok(response
                .stacks()
                .first()
                .and_then(|s| s.stack_status())
                .map(|s| s.as_str().to_string())),
            Err(err) => {
                let message = format_sdk_error(&err);
                // Missing stacks surface as a generic validation error
                if message.contains("does not exist") {
                    return Ok(None);
                }
                Err(anyhow::anyhow!(
                    "Failed to describe stack '{}': {}",
                    stack_name,
                    message
                ))
            }
        }
    }

    /// Create the stack, or update it if it already exists
    pub async fn deploy(&self, stack_name: &str, template: &Template) -> Result<DeployOutcome> {
        let body = serde_json::to_string(template).context("Failed to serialize template")?;
        let exists = match self.stack_status(stack_name).await? {
            Some(status) if status == "REVIEW_IN_PROGRESS" => false,
            Some(status) if status == "ROLLBACK_COMPLETE" => {
                bail!(
                    "Stack '{}' is in ROLLBACK_COMPLETE and must be destroyed before redeploying",
                    stack_name
                );
            }
            Some(_) => true,
            None => false,
        };

        if !exists {
            let response = self
                .client
                .create_stack()
                .stack_name(stack_name)
                .template_body(body)
                .capabilities(Capability::CapabilityIam)
                .capabilities(Capability::CapabilityNamedIam)
                .send()
                .await
                .map_err(|e| {
                    anyhow::anyhow!(
                        "Failed to create stack '{}': {}",
                        stack_name,
                        format_sdk_error(&e)
                    )
                })?;
            info!(
                stack = %stack_name,
                stack_id = response.stack_id().unwrap_or_default(),
                "Stack creation started"
            );
            return Ok(DeployOutcome::Created);
        }

        match self
            .client
            .update_stack()
            .stack_name(stack_name)
            .template_body(body)
            .capabilities(Capability::CapabilityIam)
            .capabilities(Capability::CapabilityNamedIam)
            .send()
            .await
        {
            Ok(_) => {
                info!(stack = %stack_name, "Stack update started");
                Ok(DeployOutcome::Updated)
            }
            Err(err) => {
                let message = format_sdk_error(&err);
                if message.contains("No updates are to be performed") {
                    info!(stack = %stack_name, "Stack is up to date");
                    return Ok(DeployOutcome::Unchanged);
                }
                Err(anyhow::anyhow!(
                    "Failed to update stack '{}': {}",
                    stack_name,
                    message
                ))
            }
        }
    }

    /// Delete the stack. Returns false if it did not exist.
    pub async fn destroy(&self, stack_name: &str) -> Result<bool> {
        if self.stack_status(stack_name).await?.is_none() {
            warn!(stack = %stack_name, "Stack does not exist, nothing to destroy");
            return Ok(false);
        }

        self.client
            .delete_stack()
            .stack_name(stack_name)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to delete stack '{}': {}",
                    stack_name,
                    format_sdk_error(&e)
                )
            })?;
        info!(stack = %stack_name, "Stack deletion started");
        Ok(true)
    }

    /// Poll until the stack settles. A stack that disappears counts as
    /// deleted and is reported as `None`.
    pub async fn wait(&self, stack_name: &str) -> Result<Option<String>> {
        loop {
            let Some(status) = self.stack_status(stack_name).await? else {
                return Ok(None);
            };
            match StackPhase::from_status(&status) {
                StackPhase::InProgress => {
                    debug!(stack = %stack_name, %status, "Waiting for stack");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                StackPhase::Succeeded => return Ok(Some(status)),
                StackPhase::Failed => {
                    bail!("Stack '{}' settled in {}", stack_name, status)
                }
            }
        }
    }

    /// Stack outputs as key/value pairs
    pub async fn outputs(&self, stack_name: &str) -> Result<Vec<(String, String)>> {
        let response = self
            .client
            .describe_stacks()
            .stack_name(stack_name)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to describe stack '{}': {}",
                    stack_name,
                    format_sdk_error(&e)
                )
            })?;

        Ok(response
            .stacks()
            .iter()
            .flat_map(|s| s.outputs())
            .filter_map(|o| Some((o.output_key()?.to_string(), o.output_value()?.to_string())))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_phase() {
        assert_eq!(StackPhase::from_status("CREATE_IN_PROGRESS"), StackPhase::InProgress);
        assert_eq!(
            StackPhase::from_status("UPDATE_COMPLETE_CLEANUP_IN_PROGRESS"),
            StackPhase::InProgress
        );
        assert_eq!(StackPhase::from_status("CREATE_COMPLETE"), StackPhase::Succeeded);
        assert_eq!(StackPhase::from_status("UPDATE_COMPLETE"), StackPhase::Succeeded);
        assert_eq!(StackPhase::from_status("ROLLBACK_COMPLETE"), StackPhase::Failed);
        assert_eq!(StackPhase::from_status("UPDATE_ROLLBACK_COMPLETE"), StackPhase::Failed);
        assert_eq!(StackPhase::from_status("DELETE_FAILED"), StackPhase::Failed);
    }

    #[test]
    fn test_format_sdk_error_extracts_message() {
        #[derive(Debug)]
        #[allow(dead_code)]
        struct FakeError {
            message: Option<String>,
        }
        let err = FakeError {
            message: Some("No updates are to be performed.".to_string()),
        };
        assert_eq!(format_sdk_error(&err), "No updates are to be performed.");
    }

    #[test]
    fn test_format_sdk_error_truncates_on_char_boundary() {
        #[derive(Debug)]
        #[allow(dead_code)]
        struct FakeError {
            detail: String,
        }
        // `FakeError { detail: "` is 21 bytes, so the 'é' spans bytes 199 and 200
        let err = FakeError {
            detail: format!("{}é{}", "x".repeat(178), "y".repeat(40)),
        };
        let formatted = format_sdk_error(&err);
        assert!(formatted.ends_with("x..."));
        assert_eq!(formatted.len(), 199 + 3);
    }
}
