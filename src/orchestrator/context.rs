//! Identity of the job being brokered.

use secrecy::SecretString;
use serde::Deserialize;
use url::Url;
use uuid::Uuid;

use crate::error::BrokerError;

/// Job description as delivered by the orchestrator (JSON).
///
/// Deliberately not `Debug`/`Serialize`: it carries the raw auth token.
/// Convert into a [`JobContext`] as soon as it is parsed.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub job_id: Uuid,
    pub plan_id: Uuid,
    pub timeline_id: Uuid,
    pub project_id: Uuid,
    pub hub_name: String,
    pub plan_uri: String,
    pub auth_token: String,
    /// Timeline record of the task instance; defaults to the job id.
    #[serde(default)]
    pub task_instance_id: Option<Uuid>,
    #[serde(default)]
    pub task_instance_name: Option<String>,
    #[serde(default)]
    pub skip_raise_plan_events: bool,
}

/// Validated, read-only identity of one job.
///
/// Owned by the broker for the lifetime of the job; clients only borrow it.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub plan_id: Uuid,
    pub timeline_id: Uuid,
    pub project_id: Uuid,
    pub hub_name: String,
    pub plan_uri: Url,
    pub auth_token: SecretString,
    pub task_instance_id: Uuid,
    pub task_instance_name: String,
    pub skip_raise_plan_events: bool,
}

impl JobContext {
    /// Parse and validate a JSON job message.
    pub fn from_json(raw: &str) -> Result<Self, BrokerError> {
        let message: JobMessage = serde_json::from_str(raw)
            .map_err(|e| BrokerError::InvalidJob(format!("malformed job message: {e}")))?;
        Self::try_from(message)
    }
}

impl TryFrom<JobMessage> for JobContext {
    type Error = BrokerError;

    fn try_from(message: JobMessage) -> Result<Self, Self::Error> {
        let hub_name = message.hub_name.trim().to_string();
        if hub_name.is_empty() {
            return Err(BrokerError::InvalidJob("hubName must not be empty".into()));
        }

        let plan_uri = Url::parse(&message.plan_uri)
            .map_err(|e| BrokerError::InvalidJob(format!("invalid planUri: {e}")))?;
        if !matches!(plan_uri.scheme(), "http" | "https") {
            return Err(BrokerError::InvalidJob(format!(
                "planUri must be http or https, got '{}'",
                plan_uri.scheme()
            )));
        }

        Ok(Self {
            job_id: message.job_id,
            plan_id: message.plan_id,
            timeline_id: message.timeline_id,
            project_id: message.project_id,
            hub_name,
            plan_uri,
            auth_token: SecretString::from(message.auth_token),
            task_instance_id: message.task_instance_id.unwrap_or(message.job_id),
            task_instance_name: message
                .task_instance_name
                .unwrap_or_else(|| "taskbroker".to_string()),
            skip_raise_plan_events: message.skip_raise_plan_events,
        })
    }
}
