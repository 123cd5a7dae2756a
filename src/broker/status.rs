//! Job status state machine and the serialized reporter that enforces it.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::broker::retry::{RetryConfig, retry_report};
use crate::error::BrokerError;
use crate::observability::{Observer, ObserverEvent};
use crate::orchestrator::ReportingClient;

/// Lifecycle status of a job as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Started,
    InProgress,
    Completed { passed: bool },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Whether `next` may be reported after `current` (`None` when nothing
    /// has been reported yet).
    ///
    /// The only valid sequence is `Started`, any number of `InProgress`,
    /// then exactly one `Completed`.
    pub fn can_follow(current: Option<JobStatus>, next: JobStatus) -> bool {
        match (current, next) {
            (None, JobStatus::Started) => true,
            (Some(JobStatus::Started | JobStatus::InProgress), JobStatus::InProgress) => true,
            (Some(JobStatus::Started | JobStatus::InProgress), JobStatus::Completed { .. }) => true,
            _ => false,
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            Self::Started => "report_job_started",
            Self::InProgress => "report_job_progress",
            Self::Completed { .. } => "report_job_completed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed { passed: true } => write!(f, "completed(passed)"),
            Self::Completed { passed: false } => write!(f, "completed(failed)"),
        }
    }
}

/// Sends status reports for one job, strictly one at a time and in
/// lifecycle order.
///
/// The lock is held for the whole send (retries included), so a progress
/// report racing the completion report can never land after it. The status
/// only advances once the orchestrator accepted the report.
pub struct StatusReporter {
    client: Arc<dyn ReportingClient>,
    job_id: String,
    retry: RetryConfig,
    observer: Arc<dyn Observer>,
    current: Mutex<Option<JobStatus>>,
}

impl StatusReporter {
    pub fn new(
        client: Arc<dyn ReportingClient>,
        job_id: impl Into<String>,
        retry: RetryConfig,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            client,
            job_id: job_id.into(),
            retry,
            observer,
            current: Mutex::new(None),
        }
    }

    /// Last status the orchestrator accepted.
    pub async fn current(&self) -> Option<JobStatus> {
        *self.current.lock().await
    }

    pub async fn started(
        &self,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        self.transition(JobStatus::Started, message, cancel).await
    }

    pub async fn progress(
        &self,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        self.transition(JobStatus::InProgress, message, cancel).await
    }

    pub async fn completed(
        &self,
        message: &str,
        passed: bool,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        self.transition(JobStatus::Completed { passed }, message, cancel)
            .await
    }

    async fn transition(
        &self,
        next: JobStatus,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        let mut current = self.current.lock().await;
        if !JobStatus::can_follow(*current, next) {
            return Err(BrokerError::InvalidTransition {
                from: current.map_or_else(|| "none".to_string(), |s| s.to_string()),
                to: next.to_string(),
            });
        }

        let timestamp = Utc::now();
        let client = &self.client;
        retry_report(next.operation(), &self.retry, cancel, || async move {
            match next {
                JobStatus::Started => client.report_job_started(timestamp, message, cancel).await,
                JobStatus::InProgress => {
                    client.report_job_progress(timestamp, message, cancel).await
                }
                JobStatus::Completed { passed } => {
                    client
                        .report_job_completed(timestamp, message, passed, cancel)
                        .await
                }
            }
        })
        .await?;

        *current = Some(next);
        tracing::debug!(job_id = %self.job_id, status = %next, "Job status reported");
        self.observer.record_event(&ObserverEvent::StatusReported {
            job_id: self.job_id.clone(),
            status: next.to_string(),
        });
        Ok(())
    }
}

/// Handle an executor uses to post progress lines while the job runs.
#[derive(Clone)]
pub struct ProgressReporter {
    status: Arc<StatusReporter>,
    cancel: CancellationToken,
}

impl ProgressReporter {
    pub(crate) fn new(status: Arc<StatusReporter>, cancel: CancellationToken) -> Self {
        Self { status, cancel }
    }

    /// Report progress. Failures are logged and swallowed: a lost progress
    /// line never fails the job.
    pub async fn report(&self, message: &str) {
        if let Err(e) = self.status.progress(message, &self.cancel).await {
            tracing::warn!(job_id = %self.status.job_id, "Progress report dropped: {}", e);
            self.status.observer.record_event(&ObserverEvent::Error {
                component: "status_reporter".into(),
                message: e.to_string(),
            });
        }
    }
}
