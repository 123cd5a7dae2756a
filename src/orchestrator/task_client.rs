//! Clients for the orchestrator's plan protocol.
//!
//! A plan is the orchestrator's record of a running job. The broker raises
//! plan events ("task started", "task completed") and appends lines to the
//! task's timeline feed. Both are mutations of orchestrator-visible state.
//!
//! Two implementations sit behind [`TaskClient`]:
//!
//! - [`HttpTaskClient`] issues real calls and reports each one to the
//!   instrumentation hook.
//! - [`NoopTaskClient`] accepts the same calls and sends nothing, for dry
//!   runs and replays.
//!
//! [`create_task_client`] picks one from a flag; callers only ever see the
//! trait.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::error::ReportingError;
use crate::observability::{Observer, ObserverEvent, ObserverMetric};
use crate::orchestrator::context::JobContext;

const PLAN_EVENTS_API_VERSION: &str = "2.0-preview.1";
const TIMELINE_FEED_API_VERSION: &str = "4.1";

/// Default per-request timeout for orchestrator calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome attached to a `TaskCompleted` plan event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskResult {
    Succeeded,
    Failed,
}

impl TaskResult {
    pub fn from_passed(passed: bool) -> Self {
        if passed { Self::Succeeded } else { Self::Failed }
    }
}

/// Plan-level lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanEvent {
    TaskStarted,
    TaskCompleted { result: TaskResult },
}

impl PlanEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskStarted => "TaskStarted",
            Self::TaskCompleted { .. } => "TaskCompleted",
        }
    }
}

/// Operations against the orchestrator's plan for one job.
#[async_trait]
pub trait TaskClient: Send + Sync {
    /// Raise a plan event for the job's task instance.
    async fn raise_plan_event(
        &self,
        ctx: &JobContext,
        event: PlanEvent,
        cancel: &CancellationToken,
    ) -> Result<(), ReportingError>;

    /// Append lines to the task's timeline feed.
    async fn append_timeline_feed(
        &self,
        ctx: &JobContext,
        lines: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), ReportingError>;
}

/// Build the task client for a job.
///
/// With `skip_raise_plan_events` set the returned client performs no
/// orchestrator mutation at all.
pub fn create_task_client(
    endpoint: Url,
    auth_token: SecretString,
    observer: Arc<dyn Observer>,
    skip_raise_plan_events: bool,
    request_timeout: Duration,
) -> Arc<dyn TaskClient> {
    if skip_raise_plan_events {
        tracing::info!(%endpoint, "Plan events suppressed, using no-op task client");
        Arc::new(NoopTaskClient::new(endpoint, observer))
    } else {
        Arc::new(
            HttpTaskClient::new(endpoint, auth_token, observer)
                .with_request_timeout(request_timeout),
        )
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlanEventBody {
    name: &'static str,
    task_id: Uuid,
    job_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<TaskResult>,
}

#[derive(Serialize)]
struct TimelineFeedBody<'a> {
    value: &'a [String],
    count: usize,
}

/// Task client that talks to the orchestrator over HTTP.
///
/// Authenticates with basic auth: empty user name, the job token as the
/// password.
pub struct HttpTaskClient {
    client: reqwest::Client,
    endpoint: Url,
    auth_token: SecretString,
    observer: Arc<dyn Observer>,
    request_timeout: Duration,
}

impl HttpTaskClient {
    pub fn new(endpoint: Url, auth_token: SecretString, observer: Arc<dyn Observer>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            auth_token,
            observer,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// `{endpoint}/{project}/_apis/distributedtask/hubs/{hub}/plans/{plan}/...`
    fn plan_url(
        &self,
        operation: &str,
        ctx: &JobContext,
        tail: &[String],
        api_version: &str,
    ) -> Result<Url, ReportingError> {
        let mut url = self.endpoint.clone();
        {
            let mut segments =
                url.path_segments_mut()
                    .map_err(|_| ReportingError::InvalidRequest {
                        operation: operation.to_string(),
                        reason: format!("endpoint '{}' cannot be a base URL", self.endpoint),
                    })?;
            segments.pop_if_empty().extend([
                ctx.project_id.to_string(),
                "_apis".to_string(),
                "distributedtask".to_string(),
                "hubs".to_string(),
                ctx.hub_name.clone(),
                "plans".to_string(),
                ctx.plan_id.to_string(),
            ]);
            segments.extend(tail);
        }
        url.set_query(Some(&format!("api-version={api_version}")));
        Ok(url)
    }

    async fn post_json<T: Serialize + Sync>(
        &self,
        operation: &str,
        url: Url,
        body: &T,
        cancel: &CancellationToken,
    ) -> Result<(), ReportingError> {
        let started = Instant::now();
        let request = self
            .client
            .post(url.clone())
            .basic_auth("", Some(self.auth_token.expose_secret()))
            .timeout(self.request_timeout)
            .json(body)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.record_call(operation, started, None, Some("cancelled"));
                return Err(ReportingError::Cancelled { operation: operation.to_string() });
            }
            response = request => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                let reason = e.to_string();
                self.record_call(operation, started, None, Some(&reason));
                if e.is_timeout() {
                    return Err(ReportingError::Timeout {
                        operation: operation.to_string(),
                        timeout: self.request_timeout,
                    });
                }
                return Err(ReportingError::Transmission {
                    operation: operation.to_string(),
                    url: url.to_string(),
                    reason,
                });
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record_call(operation, started, Some(status.as_u16()), Some(&body));
            return Err(ReportingError::Rejected {
                operation: operation.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        self.record_call(operation, started, Some(status.as_u16()), None);
        Ok(())
    }

    fn record_call(
        &self,
        operation: &str,
        started: Instant,
        status: Option<u16>,
        error_message: Option<&str>,
    ) {
        let duration = started.elapsed();
        self.observer.record_event(&ObserverEvent::OrchestratorCall {
            operation: operation.to_string(),
            duration,
            success: error_message.is_none(),
            status,
            error_message: error_message.map(str::to_string),
        });
        self.observer
            .record_metric(&ObserverMetric::RequestLatency(duration));
    }
}

#[async_trait]
impl TaskClient for HttpTaskClient {
    async fn raise_plan_event(
        &self,
        ctx: &JobContext,
        event: PlanEvent,
        cancel: &CancellationToken,
    ) -> Result<(), ReportingError> {
        let operation = "raise_plan_event";
        let url = self.plan_url(
            operation,
            ctx,
            &["events".to_string()],
            PLAN_EVENTS_API_VERSION,
        )?;
        let body = PlanEventBody {
            name: event.name(),
            task_id: ctx.task_instance_id,
            job_id: ctx.job_id,
            result: match event {
                PlanEvent::TaskStarted => None,
                PlanEvent::TaskCompleted { result } => Some(result),
            },
        };

        tracing::debug!(job_id = %ctx.job_id, event = event.name(), "Raising plan event");
        self.post_json(operation, url, &body, cancel).await
    }

    async fn append_timeline_feed(
        &self,
        ctx: &JobContext,
        lines: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), ReportingError> {
        let operation = "append_timeline_feed";
        let url = self.plan_url(
            operation,
            ctx,
            &[
                "timelines".to_string(),
                ctx.timeline_id.to_string(),
                "records".to_string(),
                ctx.task_instance_id.to_string(),
                "feed".to_string(),
            ],
            TIMELINE_FEED_API_VERSION,
        )?;
        let body = TimelineFeedBody {
            value: lines,
            count: lines.len(),
        };
        self.post_json(operation, url, &body, cancel).await
    }
}

/// Task client that accepts every call and mutates nothing.
pub struct NoopTaskClient {
    endpoint: Url,
    observer: Arc<dyn Observer>,
}

impl NoopTaskClient {
    pub fn new(endpoint: Url, observer: Arc<dyn Observer>) -> Self {
        Self { endpoint, observer }
    }

    fn suppress(&self, operation: &str, cancel: &CancellationToken) -> Result<(), ReportingError> {
        if cancel.is_cancelled() {
            return Err(ReportingError::Cancelled {
                operation: operation.to_string(),
            });
        }
        tracing::debug!(endpoint = %self.endpoint, operation, "Suppressed orchestrator call");
        self.observer
            .record_event(&ObserverEvent::OrchestratorCallSuppressed {
                operation: operation.to_string(),
            });
        Ok(())
    }
}

#[async_trait]
impl TaskClient for NoopTaskClient {
    async fn raise_plan_event(
        &self,
        _ctx: &JobContext,
        _event: PlanEvent,
        cancel: &CancellationToken,
    ) -> Result<(), ReportingError> {
        self.suppress("raise_plan_event", cancel)
    }

    async fn append_timeline_feed(
        &self,
        _ctx: &JobContext,
        _lines: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), ReportingError> {
        self.suppress("append_timeline_feed", cancel)
    }
}
