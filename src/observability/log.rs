//! Tracing-based observer that emits structured log events.
//!
//! Events appear alongside normal application logs, with no extra
//! dependencies. Good for local runs and debugging.

use crate::observability::traits::{Observer, ObserverEvent, ObserverMetric};

/// Observer that logs events and metrics via `tracing`.
pub struct LogObserver;

impl Observer for LogObserver {
    fn record_event(&self, event: &ObserverEvent) {
        match event {
            ObserverEvent::JobStart { job_id, plan_id } => {
                tracing::info!(job_id, plan_id, "observer: job.start");
            }
            ObserverEvent::OrchestratorCall {
                operation,
                duration,
                success,
                status,
                error_message,
            } => {
                tracing::info!(
                    operation,
                    duration_ms = duration.as_millis() as u64,
                    success,
                    status = status.unwrap_or(0),
                    error = error_message.as_deref().unwrap_or(""),
                    "observer: orchestrator.call"
                );
            }
            ObserverEvent::OrchestratorCallSuppressed { operation } => {
                tracing::info!(operation, "observer: orchestrator.suppressed");
            }
            ObserverEvent::StatusReported { job_id, status } => {
                tracing::info!(job_id, status, "observer: status.reported");
            }
            ObserverEvent::ArtifactTransferred {
                path,
                bytes,
                duration,
            } => {
                tracing::info!(
                    path,
                    bytes,
                    duration_ms = duration.as_millis() as u64,
                    "observer: artifact.transferred"
                );
            }
            ObserverEvent::JobEnd {
                job_id,
                duration,
                passed,
            } => {
                tracing::info!(
                    job_id,
                    duration_secs = duration.as_secs_f64(),
                    passed,
                    "observer: job.end"
                );
            }
            ObserverEvent::Error { component, message } => {
                tracing::warn!(component, error = message.as_str(), "observer: error");
            }
        }
    }

    fn record_metric(&self, metric: &ObserverMetric) {
        match metric {
            ObserverMetric::RequestLatency(d) => {
                tracing::debug!(
                    latency_ms = d.as_millis() as u64,
                    "observer: metric.request_latency"
                );
            }
            ObserverMetric::BytesTransferred(n) => {
                tracing::debug!(bytes = n, "observer: metric.bytes_transferred");
            }
            ObserverMetric::ActiveTransfers(n) => {
                tracing::debug!(active = n, "observer: metric.active_transfers");
            }
        }
    }

    fn name(&self) -> &str {
        "log"
    }
}
