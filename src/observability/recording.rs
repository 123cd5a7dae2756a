//! Test-only observer that captures all events into a shared vector.
//!
//! Used to verify which orchestrator calls were really issued without
//! standing up an orchestrator.

use std::sync::{Arc, Mutex};

use crate::observability::traits::{Observer, ObserverEvent, ObserverMetric};

/// Observer that records all events for test assertions.
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<ObserverEvent>>>,
    metrics: Arc<Mutex<Vec<ObserverMetric>>>,
}

impl RecordingObserver {
    /// Create a new recording observer and return handles to the captured data.
    #[allow(clippy::type_complexity)]
    pub fn new() -> (
        Self,
        Arc<Mutex<Vec<ObserverEvent>>>,
        Arc<Mutex<Vec<ObserverMetric>>>,
    ) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let metrics = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                events: Arc::clone(&events),
                metrics: Arc::clone(&metrics),
            },
            events,
            metrics,
        )
    }
}

/// Count the real orchestrator calls in a captured event list.
pub fn real_call_count(events: &[ObserverEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ObserverEvent::OrchestratorCall { .. }))
        .count()
}

impl Observer for RecordingObserver {
    fn record_event(&self, event: &ObserverEvent) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn record_metric(&self, metric: &ObserverMetric) {
        self.metrics.lock().unwrap().push(metric.clone());
    }

    fn name(&self) -> &str {
        "recording"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn captures_events_and_counts_real_calls() {
        let (obs, events, _) = RecordingObserver::new();

        obs.record_event(&ObserverEvent::OrchestratorCallSuppressed {
            operation: "raise_plan_event".into(),
        });
        obs.record_event(&ObserverEvent::OrchestratorCall {
            operation: "append_timeline_feed".into(),
            duration: Duration::from_millis(1),
            success: true,
            status: Some(200),
            error_message: None,
        });

        let captured = events.lock().unwrap();
        assert_eq!(captured.len(), 2);
        assert_eq!(real_call_count(&captured), 1);
    }

    #[test]
    fn captures_metrics() {
        let (obs, _, metrics) = RecordingObserver::new();
        obs.record_metric(&ObserverMetric::BytesTransferred(500));
        obs.record_metric(&ObserverMetric::RequestLatency(Duration::from_millis(100)));
        assert_eq!(metrics.lock().unwrap().len(), 2);
    }

    #[test]
    fn name_is_recording() {
        let (obs, _, _) = RecordingObserver::new();
        assert_eq!(obs.name(), "recording");
    }
}
