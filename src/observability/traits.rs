//! Core observer trait and event/metric types.

use std::time::Duration;

/// Provider-agnostic observer for broker lifecycle events and metrics.
///
/// This is the instrumentation hook handed to task clients and the broker.
/// Every real orchestrator call is reported through it, so a test can count
/// what actually went over the wire.
///
/// Thread-safe and shared behind `Arc<dyn Observer>`.
pub trait Observer: Send + Sync {
    /// Record a discrete lifecycle event.
    fn record_event(&self, event: &ObserverEvent);

    /// Record a numeric metric sample.
    fn record_metric(&self, metric: &ObserverMetric);

    /// Flush any buffered data. No-op by default.
    fn flush(&self) {}

    /// Human-readable backend name (e.g. "noop", "log").
    fn name(&self) -> &str;
}

/// Discrete lifecycle events the broker can emit.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    /// A job was accepted by the broker.
    JobStart { job_id: String, plan_id: String },

    /// A real call was issued to the orchestrator.
    OrchestratorCall {
        operation: String,
        duration: Duration,
        success: bool,
        /// HTTP status when a response was received.
        status: Option<u16>,
        error_message: Option<String>,
    },

    /// A mutating orchestrator call was skipped by the no-op task client.
    OrchestratorCallSuppressed { operation: String },

    /// A job status transition was delivered.
    StatusReported { job_id: String, status: String },

    /// One artifact file was written to its destination.
    ArtifactTransferred {
        path: String,
        bytes: u64,
        duration: Duration,
    },

    /// The job reached a terminal state.
    JobEnd {
        job_id: String,
        duration: Duration,
        passed: bool,
    },

    /// An error occurred in a component.
    Error { component: String, message: String },
}

/// Numeric metric samples.
#[derive(Debug, Clone)]
pub enum ObserverMetric {
    /// Latency of a single orchestrator request.
    RequestLatency(Duration),
    /// Bytes written by one artifact transfer.
    BytesTransferred(u64),
    /// Current number of in-flight artifact transfers (gauge).
    ActiveTransfers(u64),
}

#[cfg(test)]
mod tests {
    use crate::observability::traits::*;

    #[test]
    fn event_variants_are_constructible() {
        let _ = ObserverEvent::JobStart {
            job_id: "job".into(),
            plan_id: "plan".into(),
        };
        let _ = ObserverEvent::OrchestratorCall {
            operation: "raise_plan_event".into(),
            duration: Duration::from_millis(12),
            success: false,
            status: Some(503),
            error_message: Some("unavailable".into()),
        };
        let _ = ObserverEvent::OrchestratorCallSuppressed {
            operation: "append_timeline_feed".into(),
        };
        let _ = ObserverEvent::StatusReported {
            job_id: "job".into(),
            status: "started".into(),
        };
        let _ = ObserverEvent::ArtifactTransferred {
            path: "a/b.txt".into(),
            bytes: 10,
            duration: Duration::from_millis(3),
        };
        let _ = ObserverEvent::JobEnd {
            job_id: "job".into(),
            duration: Duration::from_secs(2),
            passed: true,
        };
        let _ = ObserverEvent::Error {
            component: "broker".into(),
            message: "boom".into(),
        };
    }

    #[test]
    fn metric_variants_are_constructible() {
        let _ = ObserverMetric::RequestLatency(Duration::from_millis(200));
        let _ = ObserverMetric::BytesTransferred(500);
        let _ = ObserverMetric::ActiveTransfers(3);
    }
}
