//! Executable steps
//!
//! Every action variant compiles to one step. A step exposes exactly three
//! operations: `perform` blocks until terminal, `cancel` unblocks an
//! in-flight perform promptly, and `cleanup` releases side resources.
//! Cancel and cleanup are idempotent; cleanup may run before or after
//! perform.

mod download;
mod emit_progress;
mod fetch_result;
mod monitor;
mod parallel;
mod run;
mod serial;
mod try_step;
mod upload;

pub use download::DownloadStep;
pub use emit_progress::EmitProgressStep;
pub use fetch_result::FetchResultStep;
pub use monitor::MonitorStep;
pub use parallel::ParallelStep;
pub use run::RunStep;
pub use serial::SerialStep;
pub use try_step::TryStep;
pub use upload::UploadStep;

use gantry_backend::BackendError;
use std::sync::Arc;
use thiserror::Error;

/// Why a step's perform ended without success
#[derive(Debug, Error)]
pub enum StepError {
    #[error("cancelled")]
    Cancelled,

    #[error("timed out")]
    Timeout,

    #[error("process exited with status {0}")]
    Process(i32),

    #[error("downloading failed: {0}")]
    DownloadFailed(String),

    #[error("copying into the container failed: {0}")]
    StreamInFailed(String),

    #[error("copying out of the container failed: {0}")]
    StreamOutFailed(String),

    #[error("uploading failed: {0}")]
    UploadFailed(String),

    #[error("privileged action denied")]
    PrivilegedActionDenied,

    #[error("health check never passed")]
    HealthCheckFailed,

    #[error("fetching result failed: {0}")]
    FetchResultFailed(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl StepError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StepError::Cancelled)
    }
}

pub type Result<T, E = StepError> = std::result::Result<T, E>;

/// The single polymorphic surface of the action runner
#[async_trait::async_trait]
pub trait Step: Send + Sync {
    /// Run the step to a terminal outcome
    async fn perform(&self) -> Result<()>;

    /// Unblock an in-flight perform; it reports `Cancelled` promptly.
    /// Idempotent, callable from any task.
    fn cancel(&self);

    /// Release side resources. Idempotent; may run before or after perform.
    async fn cleanup(&self);
}

/// Steps are shared so composites can drive children from their own tasks
pub type SharedStep = Arc<dyn Step>;
