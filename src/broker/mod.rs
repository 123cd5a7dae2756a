//! Drives one job through its lifecycle.
//!
//! ```text
//!   report Started ──► stage inputs ──► execute ──► publish outputs ──► report Completed
//!        │                  │              │               │
//!        └─ fatal           └──────────────┴───────────────┴─► report Completed(false)
//! ```
//!
//! Every status report goes through one [`StatusReporter`], which enforces
//! the `Started → InProgress* → Completed` order and keeps sends serialized.

mod executor;
mod retry;
mod status;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use executor::{CommandExecutor, JobExecutor, JobOutcome};
pub use retry::{RetryConfig, retry_report};
pub use status::{JobStatus, ProgressReporter, StatusReporter};

use crate::artifacts::{ArtifactEngine, ArtifactProvider, TransferOptions, TransferSummary};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, ExecutionError, ReportingError};
use crate::observability::{Observer, ObserverEvent};
use crate::orchestrator::{JobContext, PlanReportingClient, ReportingClient, create_task_client};

/// One tree to copy: everything under `source`'s root lands under
/// `destination`'s root.
#[derive(Clone)]
pub struct ArtifactBinding {
    pub name: String,
    pub source: Arc<dyn ArtifactProvider>,
    pub destination: Arc<dyn ArtifactProvider>,
}

impl ArtifactBinding {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn ArtifactProvider>,
        destination: Arc<dyn ArtifactProvider>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            destination,
        }
    }
}

/// Where a job's artifacts come from, where it runs, and where its results go.
#[derive(Clone)]
pub struct JobPlan {
    /// Staged into the workspace before execution.
    pub inputs: Vec<ArtifactBinding>,
    /// Published after execution, whether the payload passed or not.
    pub outputs: Vec<ArtifactBinding>,
    pub workspace: PathBuf,
}

/// Final record of a brokered job.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: Uuid,
    pub passed: bool,
    pub message: String,
    pub inputs: TransferSummary,
    pub outputs: TransferSummary,
    pub duration: Duration,
}

/// What the job phases produced before the terminal report.
struct PhaseResult {
    passed: bool,
    message: String,
    inputs: TransferSummary,
    outputs: TransferSummary,
    cancelled: bool,
}

pub struct Broker {
    reporting: Arc<dyn ReportingClient>,
    observer: Arc<dyn Observer>,
    engine: ArtifactEngine,
    transfer: TransferOptions,
    retry: RetryConfig,
    report_timeout: Duration,
}

impl Broker {
    pub fn new(reporting: Arc<dyn ReportingClient>, observer: Arc<dyn Observer>) -> Self {
        Self {
            reporting,
            engine: ArtifactEngine::new(Arc::clone(&observer)),
            observer,
            transfer: TransferOptions::default(),
            retry: RetryConfig::default(),
            report_timeout: Duration::from_secs(60),
        }
    }

    /// Build a broker that reports to the orchestrator named by `ctx`.
    ///
    /// Plan calls are suppressed when the configuration, the job message or
    /// `dry_run` asks for it.
    pub fn connect(
        ctx: &JobContext,
        config: &BrokerConfig,
        observer: Arc<dyn Observer>,
        dry_run: bool,
    ) -> Self {
        let skip = config.orchestrator.skip_raise_plan_events
            || ctx.skip_raise_plan_events
            || dry_run;
        let task_client = create_task_client(
            ctx.plan_uri.clone(),
            ctx.auth_token.clone(),
            Arc::clone(&observer),
            skip,
            config.orchestrator.request_timeout,
        );
        let reporting = Arc::new(PlanReportingClient::new(task_client, ctx.clone()));

        Self::new(reporting, observer)
            .with_transfer_options(config.artifacts.transfer.clone())
            .with_report_retry(config.orchestrator.report_retry.clone())
            .with_report_timeout(config.orchestrator.report_timeout)
    }

    pub fn with_transfer_options(mut self, transfer: TransferOptions) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn with_report_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_report_timeout(mut self, timeout: Duration) -> Self {
        self.report_timeout = timeout;
        self
    }

    /// Run the job to a terminal status.
    ///
    /// Returns `Ok` once `Completed` was delivered, with `passed` telling
    /// how the job went. Returns `Err` when `Started` could not be
    /// delivered (nothing else is attempted), when the terminal report
    /// failed, or when the job was cancelled (after `Completed(false)` was
    /// delivered on a best-effort basis).
    pub async fn run(
        &self,
        ctx: &JobContext,
        plan: &JobPlan,
        executor: &dyn JobExecutor,
        cancel: &CancellationToken,
    ) -> Result<JobReport, BrokerError> {
        let started = Instant::now();
        let job_id = ctx.job_id.to_string();
        self.observer.record_event(&ObserverEvent::JobStart {
            job_id: job_id.clone(),
            plan_id: ctx.plan_id.to_string(),
        });
        tracing::info!(job_id = %job_id, hub = %ctx.hub_name, "Brokering job");

        let status = Arc::new(StatusReporter::new(
            Arc::clone(&self.reporting),
            job_id.clone(),
            self.retry.clone(),
            Arc::clone(&self.observer),
        ));

        if let Err(e) = status
            .started(&format!("Job {} accepted", ctx.task_instance_name), cancel)
            .await
        {
            tracing::error!(job_id = %job_id, "Could not report job start, aborting: {}", e);
            self.observer.record_event(&ObserverEvent::Error {
                component: "broker".into(),
                message: e.to_string(),
            });
            return Err(e);
        }

        let progress = ProgressReporter::new(Arc::clone(&status), cancel.clone());
        let phases = self.run_phases(ctx, plan, executor, &progress, cancel).await;

        let completion = self
            .report_completion(&status, &phases, cancel)
            .await;

        let duration = started.elapsed();
        self.observer.record_event(&ObserverEvent::JobEnd {
            job_id: job_id.clone(),
            duration,
            passed: phases.passed && completion.is_ok(),
        });
        completion?;

        if phases.cancelled {
            return Err(BrokerError::Cancelled { job_id });
        }

        tracing::info!(
            job_id = %job_id,
            passed = phases.passed,
            elapsed_ms = duration.as_millis() as u64,
            "Job finished"
        );
        Ok(JobReport {
            job_id: ctx.job_id,
            passed: phases.passed,
            message: phases.message,
            inputs: phases.inputs,
            outputs: phases.outputs,
            duration,
        })
    }

    async fn run_phases(
        &self,
        ctx: &JobContext,
        plan: &JobPlan,
        executor: &dyn JobExecutor,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> PhaseResult {
        let mut result = PhaseResult {
            passed: false,
            message: String::new(),
            inputs: TransferSummary::default(),
            outputs: TransferSummary::default(),
            cancelled: false,
        };

        if let Err(e) = tokio::fs::create_dir_all(&plan.workspace).await {
            return self.fail(result, BrokerError::Execution(ExecutionError::Io(e)));
        }

        match self.stage(&plan.inputs, "input", progress, cancel).await {
            Ok(summary) => result.inputs = summary,
            Err(e) => return self.fail(result, e),
        }

        let outcome = match executor
            .execute(ctx, &plan.workspace, progress, cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return self.fail(result, e.into()),
        };
        tracing::info!(passed = outcome.passed, "Job payload finished");

        // Outputs are published for failed runs too so their logs reach
        // the orchestrator.
        match self.stage(&plan.outputs, "output", progress, cancel).await {
            Ok(summary) => result.outputs = summary,
            Err(e) => return self.fail(result, e),
        }

        result.passed = outcome.passed;
        result.message = outcome.message;
        result
    }

    async fn stage(
        &self,
        bindings: &[ArtifactBinding],
        direction: &str,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<TransferSummary, BrokerError> {
        let mut total = TransferSummary::default();
        for binding in bindings {
            tracing::info!(binding = %binding.name, direction, "Transferring artifacts");
            let summary = self
                .engine
                .transfer(
                    Arc::clone(&binding.source),
                    Arc::clone(&binding.destination),
                    &self.transfer,
                    cancel,
                )
                .await?;
            progress
                .report(&format!(
                    "Transferred {} {} file(s) for '{}' ({} bytes)",
                    summary.files, direction, binding.name, summary.bytes
                ))
                .await;
            total.merge(summary);
        }
        Ok(total)
    }

    fn fail(&self, mut result: PhaseResult, error: BrokerError) -> PhaseResult {
        result.cancelled = is_cancellation(&error);
        if result.cancelled {
            tracing::info!("Job cancelled: {}", error);
            result.message = "Job was cancelled".to_string();
        } else {
            tracing::error!("Job failed: {}", error);
            self.observer.record_event(&ObserverEvent::Error {
                component: "broker".into(),
                message: error.to_string(),
            });
            result.message = error.to_string();
        }
        result.passed = false;
        result
    }

    async fn report_completion(
        &self,
        status: &StatusReporter,
        phases: &PhaseResult,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        // A cancelled job token would abort the terminal report itself, so
        // it goes out under a fresh token bounded by the report timeout.
        let report_cancel = if cancel.is_cancelled() {
            CancellationToken::new()
        } else {
            cancel.clone()
        };

        let send = status.completed(&phases.message, phases.passed, &report_cancel);
        let result = match tokio::time::timeout(self.report_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Reporting(ReportingError::Timeout {
                operation: "report_job_completed".into(),
                timeout: self.report_timeout,
            })),
        };
        if let Err(e) = &result {
            tracing::error!("Could not report job completion: {}", e);
            self.observer.record_event(&ObserverEvent::Error {
                component: "broker".into(),
                message: e.to_string(),
            });
        }
        result
    }
}

fn is_cancellation(error: &BrokerError) -> bool {
    match error {
        BrokerError::Cancelled { .. } => true,
        BrokerError::Artifact(e) => e.is_cancelled(),
        BrokerError::Reporting(e) => e.is_cancelled(),
        BrokerError::Execution(ExecutionError::Cancelled) => true,
        _ => false,
    }
}
