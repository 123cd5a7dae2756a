//! Integration tests for the job lifecycle.
//!
//! Verifies end-to-end that:
//! - Status reports form `Started, InProgress*, Completed` with nothing after
//! - Concurrent progress reports never land after completion
//! - A refused start aborts the job before anything runs
//! - Failures and cancellation still end in `Completed(false)`
//! - Inputs are staged before execution and outputs published after

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use taskbroker::artifacts::{ArtifactProvider, FilesystemProvider};
use taskbroker::broker::{
    ArtifactBinding, Broker, JobExecutor, JobOutcome, JobPlan, JobStatus, ProgressReporter,
    RetryConfig,
};
use taskbroker::error::{BrokerError, ExecutionError, ReportingError};
use taskbroker::observability::NoopObserver;
use taskbroker::orchestrator::{JobContext, ReportingClient};

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockReportingClient {
    statuses: Mutex<Vec<(JobStatus, String)>>,
    refuse_start: bool,
    /// Transient failures to return before accepting the completion report.
    completion_failures: Mutex<u32>,
}

impl MockReportingClient {
    fn statuses(&self) -> Vec<JobStatus> {
        self.statuses.lock().unwrap().iter().map(|(s, _)| *s).collect()
    }

    fn messages(&self) -> Vec<String> {
        self.statuses.lock().unwrap().iter().map(|(_, m)| m.clone()).collect()
    }
}

#[async_trait]
impl ReportingClient for MockReportingClient {
    async fn report_job_started(
        &self,
        _timestamp: DateTime<Utc>,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ReportingError> {
        if cancel.is_cancelled() {
            return Err(ReportingError::Cancelled {
                operation: "report_job_started".into(),
            });
        }
        if self.refuse_start {
            return Err(ReportingError::Rejected {
                operation: "report_job_started".into(),
                status: 401,
                body: "token expired".into(),
            });
        }
        self.statuses
            .lock()
            .unwrap()
            .push((JobStatus::Started, message.to_string()));
        Ok(())
    }

    async fn report_job_progress(
        &self,
        _timestamp: DateTime<Utc>,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ReportingError> {
        if cancel.is_cancelled() {
            return Err(ReportingError::Cancelled {
                operation: "report_job_progress".into(),
            });
        }
        // Widen the window in which a concurrent completion could overtake.
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.statuses
            .lock()
            .unwrap()
            .push((JobStatus::InProgress, message.to_string()));
        Ok(())
    }

    async fn report_job_completed(
        &self,
        _timestamp: DateTime<Utc>,
        message: &str,
        is_passed: bool,
        cancel: &CancellationToken,
    ) -> Result<(), ReportingError> {
        if cancel.is_cancelled() {
            return Err(ReportingError::Cancelled {
                operation: "report_job_completed".into(),
            });
        }
        {
            let mut left = self.completion_failures.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(ReportingError::Rejected {
                    operation: "report_job_completed".into(),
                    status: 503,
                    body: "unavailable".into(),
                });
            }
        }
        self.statuses
            .lock()
            .unwrap()
            .push((JobStatus::Completed { passed: is_passed }, message.to_string()));
        Ok(())
    }
}

/// Executor that fires a burst of concurrent progress reports.
struct ChattyExecutor {
    reports: usize,
    passed: bool,
    ran: AtomicBool,
}

impl ChattyExecutor {
    fn new(reports: usize, passed: bool) -> Self {
        Self {
            reports,
            passed,
            ran: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl JobExecutor for ChattyExecutor {
    async fn execute(
        &self,
        _ctx: &JobContext,
        workspace: &Path,
        progress: &ProgressReporter,
        _cancel: &CancellationToken,
    ) -> Result<JobOutcome, ExecutionError> {
        self.ran.store(true, Ordering::SeqCst);
        let messages: Vec<String> = (0..self.reports).map(|i| format!("step {i}")).collect();
        futures::future::join_all(messages.iter().map(|m| progress.report(m))).await;

        tokio::fs::write(workspace.join("result.txt"), b"built").await?;
        Ok(if self.passed {
            JobOutcome::passed("all good")
        } else {
            JobOutcome::failed("tests failed")
        })
    }
}

/// Executor that blocks until cancelled.
struct HangingExecutor;

#[async_trait]
impl JobExecutor for HangingExecutor {
    async fn execute(
        &self,
        _ctx: &JobContext,
        _workspace: &Path,
        _progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, ExecutionError> {
        cancel.cancelled().await;
        Err(ExecutionError::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn context() -> JobContext {
    JobContext::from_json(
        &serde_json::json!({
            "jobId": "0f0e0d0c-0000-4000-8000-000000000001",
            "planId": "0f0e0d0c-0000-4000-8000-000000000002",
            "timelineId": "0f0e0d0c-0000-4000-8000-000000000003",
            "projectId": "0f0e0d0c-0000-4000-8000-000000000004",
            "hubName": "Build",
            "planUri": "https://orchestrator.invalid/collection",
            "authToken": "token"
        })
        .to_string(),
    )
    .unwrap()
}

fn broker(client: Arc<MockReportingClient>) -> Broker {
    Broker::new(client, Arc::new(NoopObserver))
        .with_report_retry(RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        })
        .with_report_timeout(Duration::from_secs(5))
}

struct Dirs {
    inputs: tempfile::TempDir,
    workspace: tempfile::TempDir,
    outputs: tempfile::TempDir,
}

fn dirs() -> Dirs {
    let dirs = Dirs {
        inputs: tempfile::tempdir().unwrap(),
        workspace: tempfile::tempdir().unwrap(),
        outputs: tempfile::tempdir().unwrap(),
    };
    std::fs::create_dir(dirs.inputs.path().join("src")).unwrap();
    std::fs::write(dirs.inputs.path().join("src/main.c"), b"int main(){}").unwrap();
    dirs
}

fn plan(dirs: &Dirs) -> JobPlan {
    let provider = |p: &Path| -> Arc<dyn ArtifactProvider> { Arc::new(FilesystemProvider::new(p)) };
    let workspace = provider(dirs.workspace.path());
    JobPlan {
        inputs: vec![ArtifactBinding::new(
            "inputs",
            provider(dirs.inputs.path()),
            Arc::clone(&workspace),
        )],
        outputs: vec![ArtifactBinding::new(
            "outputs",
            workspace,
            provider(dirs.outputs.path()),
        )],
        workspace: dirs.workspace.path().to_path_buf(),
    }
}

/// `Started, InProgress*, Completed` and nothing after.
fn assert_lifecycle(statuses: &[JobStatus]) {
    assert!(statuses.len() >= 2, "too few reports: {statuses:?}");
    assert_eq!(statuses[0], JobStatus::Started);
    assert!(statuses.last().is_some_and(JobStatus::is_terminal));
    assert!(
        statuses[1..statuses.len() - 1]
            .iter()
            .all(|s| *s == JobStatus::InProgress),
        "unexpected order: {statuses:?}"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn passing_job_stages_runs_and_publishes() {
    let dirs = dirs();
    let client = Arc::new(MockReportingClient::default());
    let executor = ChattyExecutor::new(8, true);

    let report = broker(client.clone())
        .run(&context(), &plan(&dirs), &executor, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.passed);
    assert_eq!(report.message, "all good");
    assert_eq!(report.inputs.files, 1);
    assert_eq!(report.outputs.files, 2);

    assert!(dirs.workspace.path().join("src/main.c").exists());
    assert_eq!(
        std::fs::read_to_string(dirs.outputs.path().join("result.txt")).unwrap(),
        "built"
    );
    assert!(dirs.outputs.path().join("src/main.c").exists());

    let statuses = client.statuses();
    assert_lifecycle(&statuses);
    // 8 executor lines plus one per staged binding.
    assert_eq!(statuses.len(), 1 + 8 + 2 + 1);
    assert_eq!(statuses.last(), Some(&JobStatus::Completed { passed: true }));
}

#[tokio::test]
async fn failed_payload_completes_as_failed() {
    let dirs = dirs();
    let client = Arc::new(MockReportingClient::default());
    let executor = ChattyExecutor::new(2, false);

    let report = broker(client.clone())
        .run(&context(), &plan(&dirs), &executor, &CancellationToken::new())
        .await
        .unwrap();

    assert!(!report.passed);
    let statuses = client.statuses();
    assert_lifecycle(&statuses);
    assert_eq!(statuses.last(), Some(&JobStatus::Completed { passed: false }));
    assert_eq!(client.messages().last().map(String::as_str), Some("tests failed"));
    // Outputs of failed runs are still published.
    assert!(dirs.outputs.path().join("result.txt").exists());
}

#[tokio::test]
async fn refused_start_aborts_before_anything_runs() {
    let dirs = dirs();
    let client = Arc::new(MockReportingClient {
        refuse_start: true,
        ..Default::default()
    });
    let executor = ChattyExecutor::new(1, true);

    let err = broker(client.clone())
        .run(&context(), &plan(&dirs), &executor, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BrokerError::Reporting(ReportingError::Rejected { status: 401, .. })
    ));
    assert!(client.statuses().is_empty());
    assert!(!executor.ran.load(Ordering::SeqCst));
    assert!(!dirs.workspace.path().join("src").exists());
}

#[tokio::test]
async fn staging_failure_completes_as_failed() {
    let dirs = dirs();
    let client = Arc::new(MockReportingClient::default());
    let executor = ChattyExecutor::new(1, true);
    let mut plan = plan(&dirs);
    plan.inputs[0].source = Arc::new(FilesystemProvider::new(dirs.inputs.path().join("missing")));

    let report = broker(client.clone())
        .run(&context(), &plan, &executor, &CancellationToken::new())
        .await
        .unwrap();

    assert!(!report.passed);
    assert!(!executor.ran.load(Ordering::SeqCst));
    assert_eq!(
        client.statuses(),
        vec![JobStatus::Started, JobStatus::Completed { passed: false }]
    );
}

#[tokio::test]
async fn cancelled_job_still_reports_completion() {
    let dirs = dirs();
    let client = Arc::new(MockReportingClient::default());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = broker(client.clone())
        .run(&context(), &plan(&dirs), &HangingExecutor, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, BrokerError::Cancelled { .. }));
    let statuses = client.statuses();
    assert_lifecycle(&statuses);
    assert_eq!(statuses.last(), Some(&JobStatus::Completed { passed: false }));
}

#[tokio::test]
async fn transient_completion_failures_are_retried() {
    let dirs = dirs();
    let client = Arc::new(MockReportingClient {
        completion_failures: Mutex::new(2),
        ..Default::default()
    });
    let executor = ChattyExecutor::new(0, true);

    let report = broker(client.clone())
        .run(&context(), &plan(&dirs), &executor, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.passed);
    assert_eq!(client.statuses().last(), Some(&JobStatus::Completed { passed: true }));
}

#[tokio::test]
async fn undeliverable_completion_fails_the_run() {
    let dirs = dirs();
    let client = Arc::new(MockReportingClient {
        completion_failures: Mutex::new(100),
        ..Default::default()
    });
    let executor = ChattyExecutor::new(0, true);

    let err = broker(client.clone())
        .run(&context(), &plan(&dirs), &executor, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BrokerError::Reporting(ReportingError::Rejected { status: 503, .. })
    ));
    assert!(!client.statuses().iter().any(JobStatus::is_terminal));
}

#[cfg(unix)]
#[tokio::test]
async fn command_executor_runs_in_workspace_and_streams_output() {
    use taskbroker::broker::CommandExecutor;

    let dirs = dirs();
    let client = Arc::new(MockReportingClient::default());
    let executor = CommandExecutor::new(vec![
        "sh".into(),
        "-c".into(),
        "echo compiling; wc -c < src/main.c > size.txt; echo done".into(),
    ])
    .unwrap();

    let report = broker(client.clone())
        .run(&context(), &plan(&dirs), &executor, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.passed);
    let size = std::fs::read_to_string(dirs.outputs.path().join("size.txt")).unwrap();
    assert_eq!(size.trim(), "12");
    let messages = client.messages();
    assert!(messages.iter().any(|m| m == "compiling"));
    assert!(messages.iter().any(|m| m == "done"));
    assert_lifecycle(&client.statuses());
}

#[cfg(unix)]
#[tokio::test]
async fn failing_command_reports_exit_code() {
    use taskbroker::broker::CommandExecutor;

    let dirs = dirs();
    let client = Arc::new(MockReportingClient::default());
    let executor =
        CommandExecutor::new(vec!["sh".into(), "-c".into(), "echo oops >&2; exit 3".into()])
            .unwrap();

    let report = broker(client.clone())
        .run(&context(), &plan(&dirs), &executor, &CancellationToken::new())
        .await
        .unwrap();

    assert!(!report.passed);
    assert!(report.message.contains("exited with 3"));
    assert!(report.message.contains("oops"));
}

#[cfg(unix)]
#[tokio::test]
async fn cancel_is_honoured_while_background_process_holds_output_open() {
    use taskbroker::broker::CommandExecutor;

    let dirs = dirs();
    let client = Arc::new(MockReportingClient::default());
    let executor = CommandExecutor::new(vec![
        "sh".into(),
        "-c".into(),
        "sleep 8 & echo hi; exit 0".into(),
    ])
    .unwrap();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = broker(client.clone())
        .run(&context(), &plan(&dirs), &executor, &cancel)
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(matches!(err, BrokerError::Cancelled { .. }));
    let statuses = client.statuses();
    assert_lifecycle(&statuses);
    assert_eq!(statuses.last(), Some(&JobStatus::Completed { passed: false }));
    assert!(!statuses.contains(&JobStatus::Completed { passed: true }));
}

#[cfg(unix)]
#[tokio::test]
async fn exited_command_does_not_wait_for_background_output() {
    use taskbroker::broker::CommandExecutor;

    let dirs = dirs();
    let client = Arc::new(MockReportingClient::default());
    let executor = CommandExecutor::new(vec![
        "sh".into(),
        "-c".into(),
        "sleep 8 & echo hi; exit 0".into(),
    ])
    .unwrap();

    let started = std::time::Instant::now();
    let report = broker(client.clone())
        .run(&context(), &plan(&dirs), &executor, &CancellationToken::new())
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(6));
    assert!(report.passed);
    assert!(client.messages().iter().any(|m| m == "hi"));
}

#[cfg(unix)]
#[tokio::test]
async fn failure_message_keeps_only_the_stderr_tail() {
    use taskbroker::broker::CommandExecutor;

    let dirs = dirs();
    let client = Arc::new(MockReportingClient::default());
    let executor = CommandExecutor::new(vec![
        "sh".into(),
        "-c".into(),
        "i=1; while [ $i -le 30 ]; do echo line$i >&2; i=$((i+1)); done; exit 1".into(),
    ])
    .unwrap();

    let report = broker(client.clone())
        .run(&context(), &plan(&dirs), &executor, &CancellationToken::new())
        .await
        .unwrap();

    assert!(!report.passed);
    let lines: Vec<&str> = report.message.lines().collect();
    assert_eq!(lines.len(), 21);
    assert_eq!(lines[0], "sh exited with 1");
    assert_eq!(lines[1], "line11");
    assert_eq!(lines[20], "line30");
}
