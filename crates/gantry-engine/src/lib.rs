//! Gantry engine - the node-local container execution core
//!
//! Owns the two-phase container registry with capacity accounting, the
//! action runner (steps, sequences, transformer), the run dispatcher with
//! completion callbacks, per-container log streaming, the drain state
//! machine, and boot-time reconciliation against the backend.

pub mod actions;
pub mod cache;
pub mod cancel;
pub mod capacity;
pub mod dispatcher;
pub mod drain;
pub mod executor;
pub mod log_streamer;
pub mod reconciler;
pub mod registry;
pub mod steps;
pub mod transformer;

pub use actions::Action;
pub use cache::{CacheError, DownloadCache};
pub use cancel::CancelToken;
pub use capacity::{Capacity, CapacityTracker};
pub use dispatcher::{DispatcherConfig, RunDispatcher, RunRequest, RunResult};
pub use drain::{DrainController, DrainState};
pub use executor::{Executor, ExecutorError, InitializeRequest, ReserveRequest};
pub use log_streamer::{LogConfig, LogMessage, LogStreamer, MessageKind};
pub use reconciler::reconcile;
pub use registry::{
    start_pruner, ContainerRecord, ContainerState, PortMapping, Registry, RegistryError,
};
pub use steps::{SharedStep, Step, StepError};
pub use transformer::{TransformError, Transformer};

pub use gantry_backend::BackendError;

/// Property key every container this executor creates is tagged with
pub const OWNER_PROPERTY: &str = "owner";
