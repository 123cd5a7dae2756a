//! Observability subsystem: trait-based event and metric recording.
//!
//! Provides a pluggable [`Observer`] trait with these backends:
//!
//! | Backend | Description |
//! |---------|-------------|
//! | `noop`  | Zero overhead, discards everything (default) |
//! | `log`   | Emits structured events via `tracing` |
//!
//! The [`create_observer`] factory builds the right backend from
//! [`ObservabilityConfig`].

mod log;
mod noop;
pub mod traits;

#[cfg(test)]
pub mod recording;

pub use self::log::LogObserver;
pub use self::noop::NoopObserver;
pub use self::traits::{Observer, ObserverEvent, ObserverMetric};

/// Configuration for the observability backend.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Backend name: "none", "noop" or "log".
    pub backend: String,
}

impl ObservabilityConfig {
    pub(crate) fn resolve() -> Result<Self, crate::error::ConfigError> {
        let backend = crate::config::optional_env("OBSERVABILITY_BACKEND")?
            .unwrap_or_else(|| "none".to_string());
        Ok(Self { backend })
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            backend: "none".into(),
        }
    }
}

/// Create an observer from configuration.
///
/// Returns a [`LogObserver`] for "log" and a [`NoopObserver`] for
/// "none"/"noop" or anything unrecognised.
pub fn create_observer(config: &ObservabilityConfig) -> Box<dyn Observer> {
    match config.backend.as_str() {
        "log" => Box::new(LogObserver),
        "none" | "noop" => Box::new(NoopObserver),
        other => {
            tracing::warn!("Unknown observability backend '{}', using noop", other);
            Box::new(NoopObserver)
        }
    }
}
