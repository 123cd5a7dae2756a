//! Job status reporting to the orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::ReportingError;
use crate::orchestrator::context::JobContext;
use crate::orchestrator::task_client::{PlanEvent, TaskClient, TaskResult};

/// Reports job lifecycle transitions to the orchestrator.
///
/// Callers must issue calls in lifecycle order: one started, any number of
/// progress, exactly one completed. Implementations do not check the order
/// but must neither reorder nor drop calls, and must return promptly with
/// [`ReportingError::Cancelled`] when `cancel` fires.
#[async_trait]
pub trait ReportingClient: Send + Sync {
    async fn report_job_started(
        &self,
        timestamp: DateTime<Utc>,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ReportingError>;

    async fn report_job_progress(
        &self,
        timestamp: DateTime<Utc>,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ReportingError>;

    async fn report_job_completed(
        &self,
        timestamp: DateTime<Utc>,
        message: &str,
        is_passed: bool,
        cancel: &CancellationToken,
    ) -> Result<(), ReportingError>;
}

/// Reports status through the plan protocol of one job.
///
/// Start and completion raise plan events; every call also writes a
/// timestamped line to the task's timeline feed.
pub struct PlanReportingClient {
    task_client: Arc<dyn TaskClient>,
    context: JobContext,
}

impl PlanReportingClient {
    pub fn new(task_client: Arc<dyn TaskClient>, context: JobContext) -> Self {
        Self {
            task_client,
            context,
        }
    }

    async fn feed(
        &self,
        timestamp: DateTime<Utc>,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ReportingError> {
        let line = feed_line(timestamp, message);
        self.task_client
            .append_timeline_feed(&self.context, &[line], cancel)
            .await
    }
}

fn feed_line(timestamp: DateTime<Utc>, message: &str) -> String {
    format!(
        "{} {}",
        timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        message
    )
}

#[async_trait]
impl ReportingClient for PlanReportingClient {
    async fn report_job_started(
        &self,
        timestamp: DateTime<Utc>,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ReportingError> {
        self.task_client
            .raise_plan_event(&self.context, PlanEvent::TaskStarted, cancel)
            .await?;
        self.feed(timestamp, message, cancel).await
    }

    async fn report_job_progress(
        &self,
        timestamp: DateTime<Utc>,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ReportingError> {
        self.feed(timestamp, message, cancel).await
    }

    async fn report_job_completed(
        &self,
        timestamp: DateTime<Utc>,
        message: &str,
        is_passed: bool,
        cancel: &CancellationToken,
    ) -> Result<(), ReportingError> {
        self.feed(timestamp, message, cancel).await?;
        self.task_client
            .raise_plan_event(
                &self.context,
                PlanEvent::TaskCompleted {
                    result: TaskResult::from_passed(is_passed),
                },
                cancel,
            )
            .await
    }
}
