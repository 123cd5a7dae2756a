//! Error types for the task broker.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Errors raised by artifact providers and the transfer engine.
///
/// Enumeration failures, stream failures and cancellation are kept apart so
/// callers can retry a transfer without retrying a listing, and can tell an
/// abort from a fault.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Unable to read directory {path}: {source}")]
    Enumeration {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact item '{path}' does not exist")]
    NotFound { path: String },

    #[error("Artifact item '{path}' cannot be transferred: {reason}")]
    Unsupported { path: String, reason: String },

    #[error("Artifact item '{path}' is not a folder")]
    NotAFolder { path: String },

    #[error("Artifact item '{path}' has no '{key}' metadata")]
    MissingMetadata { path: String, key: String },

    #[error("Invalid artifact path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Failed to create directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stream error for '{path}': {source}")]
    Stream {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transfer of '{path}' was cancelled")]
    Cancelled { path: String },

    #[error("Invalid item pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Transfer task failed: {0}")]
    TaskFailed(String),
}

impl ArtifactError {
    /// Whether this error is a cancellation rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether retrying the transfer of the same item may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Stream { .. })
    }
}

/// Failures of a status report or plan-event call to the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum ReportingError {
    #[error("{operation} could not reach the orchestrator at {url}: {reason}")]
    Transmission {
        operation: String,
        url: String,
        reason: String,
    },

    #[error("{operation} was rejected by the orchestrator with status {status}: {body}")]
    Rejected {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("{operation} was cancelled")]
    Cancelled { operation: String },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Invalid orchestrator request for {operation}: {reason}")]
    InvalidRequest { operation: String, reason: String },
}

impl ReportingError {
    /// Whether the call may succeed if sent again.
    ///
    /// Network failures, timeouts and server-side (5xx) rejections are
    /// transient. Client-side rejections and cancellation are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transmission { .. } | Self::Timeout { .. } => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 429,
            Self::Cancelled { .. } | Self::InvalidRequest { .. } => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Errors from driving a job through its lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Invalid job status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Status report failed: {0}")]
    Reporting(#[from] ReportingError),

    #[error("Artifact transfer failed: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Job execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Invalid job message: {0}")]
    InvalidJob(String),

    #[error("Job {job_id} was cancelled")]
    Cancelled { job_id: String },
}

/// Errors from the execution target itself.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Execution was cancelled")]
    Cancelled,

    #[error("No command configured for the job")]
    EmptyCommand,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
