//! Everything that talks to the orchestration service: the job identity,
//! the plan-protocol task clients and the status reporter built on them.

mod context;
mod reporting;
mod task_client;

pub use context::{JobContext, JobMessage};
pub use reporting::{PlanReportingClient, ReportingClient};
pub use task_client::{
    DEFAULT_REQUEST_TIMEOUT, HttpTaskClient, NoopTaskClient, PlanEvent, TaskClient, TaskResult,
    create_task_client,
};
