//! Abstract container backend interface
//!
//! Defines the [`Backend`] trait the executor drives containers through.
//! The backend is an opaque capability: it knows how to create, limit,
//! network, and destroy sandboxes and how to run processes and move file
//! trees in and out of them. The engine never assumes anything beyond this
//! surface.

pub mod memory;

pub use memory::{InMemoryBackend, ScriptedProcess};

use std::collections::HashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Backend operation errors
#[derive(Debug, Error)]
pub enum BackendError {
    /// Container not found
    #[error("container '{handle}' not found")]
    NotFound { handle: String },

    /// Failed to create a container
    #[error("failed to create container: {reason}")]
    CreateFailed { reason: String },

    /// A per-container operation failed
    #[error("{operation} failed for container '{handle}': {reason}")]
    OperationFailed {
        handle: String,
        operation: &'static str,
        reason: String,
    },

    /// Backend cannot be reached at all
    #[error("backend unreachable: {0}")]
    Unreachable(String),
}

pub type Result<T, E = BackendError> = std::result::Result<T, E>;

/// Total resources the backend can host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapacity {
    pub memory_in_bytes: u64,
    pub disk_in_bytes: u64,
    pub max_containers: u64,
}

/// Creation-time container description
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Opaque key/value properties; queryable via
    /// [`Backend::containers_by_property`]
    pub properties: HashMap<String, String>,
}

impl ContainerSpec {
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Kernel resource limits applied to a spawned process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Open-file-descriptor ceiling
    pub nofile: Option<u64>,
}

/// A process to launch inside a container
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub user: String,
    pub limits: ResourceLimits,
}

/// Where a process's output goes. The writers are owned by the backend for
/// the lifetime of the process and shut down when the streams close.
pub struct ProcessIo {
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
}

/// Handle to a process running inside a container
#[async_trait::async_trait]
pub trait Process: Send {
    /// Block until the process exits; returns its exit status
    async fn wait(&mut self) -> Result<i32>;

    /// Ask the backend to terminate the process
    async fn terminate(&mut self) -> Result<()>;
}

/// Abstract container backend
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Liveness probe
    async fn ping(&self) -> Result<()>;

    /// Total resources this backend can host
    async fn capacity(&self) -> Result<BackendCapacity>;

    /// Create a sandbox; returns its handle
    async fn create(&self, spec: ContainerSpec) -> Result<String>;

    /// Verify a handle refers to a live container
    async fn lookup(&self, handle: &str) -> Result<()>;

    /// Destroy a container and everything in it
    async fn destroy(&self, handle: &str) -> Result<()>;

    /// Handles of all containers whose property `key` equals `value`
    async fn containers_by_property(&self, key: &str, value: &str) -> Result<Vec<String>>;

    /// Cap the container's memory
    async fn limit_memory(&self, handle: &str, limit_in_bytes: u64) -> Result<()>;

    /// Cap the container's disk
    async fn limit_disk(&self, handle: &str, byte_hard: u64) -> Result<()>;

    /// Cap the container's CPU shares
    async fn limit_cpu(&self, handle: &str, limit_in_shares: u64) -> Result<()>;

    /// Map a host port to a container port. A zero host port asks the
    /// backend to pick one. Returns the effective (host, container) pair.
    async fn net_in(&self, handle: &str, host_port: u16, container_port: u16)
        -> Result<(u16, u16)>;

    /// Spawn a process inside the container with its output attached to `io`
    async fn run(&self, handle: &str, spec: ProcessSpec, io: ProcessIo)
        -> Result<Box<dyn Process>>;

    /// Stream a tar archive into the container, extracted at `dest_path`
    /// with ownership `user`
    async fn stream_in(
        &self,
        handle: &str,
        dest_path: &str,
        user: &str,
        tar: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<()>;

    /// Stream a path out of the container as a tar archive
    async fn stream_out(
        &self,
        handle: &str,
        source_path: &str,
        user: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>>;
}
