//! Executor facade
//!
//! The in-process client the control plane drives. Ties together the
//! registry, backend, transformer, and run dispatcher into the operations
//! the HTTP handlers expose: reserve, initialize, run, delete, list, and
//! ping.

use crate::actions::Action;
use crate::dispatcher::{RunDispatcher, RunRequest};
use crate::log_streamer::{LogConfig, LogMessage, LogStreamer};
use crate::registry::{ContainerRecord, PortMapping, Registry, RegistryError};
use crate::transformer::{TransformError, Transformer};
use crate::{Capacity, OWNER_PROPERTY};
use gantry_backend::{Backend, BackendError, ContainerSpec};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

/// Capacity claim for a new container
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReserveRequest {
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub disk_mb: u64,
}

/// Everything needed to turn a reservation into a live container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitializeRequest {
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("container limits invalid: cpu_percent {0}")]
    LimitsInvalid(f64),

    #[error("steps invalid: {0}")]
    StepsInvalid(#[from] TransformError),

    #[error("container '{guid}' has no active backend container")]
    NotInitialized { guid: String },

    #[error("container '{guid}' already has a run in flight")]
    AlreadyBound { guid: String },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type Result<T, E = ExecutorError> = std::result::Result<T, E>;

pub struct Executor {
    registry: Arc<Registry>,
    backend: Arc<dyn Backend>,
    transformer: Transformer,
    dispatcher: Arc<RunDispatcher>,
    owner_name: String,
    max_cpu_shares: u64,
    log_tx: mpsc::UnboundedSender<LogMessage>,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        backend: Arc<dyn Backend>,
        transformer: Transformer,
        dispatcher: Arc<RunDispatcher>,
        owner_name: String,
        max_cpu_shares: u64,
        log_tx: mpsc::UnboundedSender<LogMessage>,
    ) -> Self {
        Self {
            registry,
            backend,
            transformer,
            dispatcher,
            owner_name,
            max_cpu_shares,
            log_tx,
        }
    }

    pub fn reserve(&self, guid: &str, request: &ReserveRequest) -> Result<ContainerRecord> {
        let record = self
            .registry
            .reserve(guid, request.memory_mb, request.disk_mb)?;
        tracing::info!(
            guid = %guid,
            memory_mb = request.memory_mb,
            disk_mb = request.disk_mb,
            "Reserved container"
        );
        Ok(record)
    }

    /// Create and configure the backend container for a reservation
    pub async fn initialize(
        &self,
        guid: &str,
        request: &InitializeRequest,
    ) -> Result<ContainerRecord> {
        if !(0.0..=100.0).contains(&request.cpu_percent) {
            return Err(ExecutorError::LimitsInvalid(request.cpu_percent));
        }

        let record = self.registry.begin_initialize(guid)?;

        let handle = self
            .backend
            .create(ContainerSpec::default().with_property(OWNER_PROPERTY, &self.owner_name))
            .await
            .inspect_err(
                |e| tracing::error!(guid = %guid, error = %e, "Container creation failed"),
            )?;

        if record.memory_mb != 0 {
            self.backend
                .limit_memory(&handle, record.memory_mb * 1024 * 1024)
                .await?;
        }
        if record.disk_mb != 0 {
            self.backend
                .limit_disk(&handle, record.disk_mb * 1024 * 1024)
                .await?;
        }
        if request.cpu_percent != 0.0 {
            let shares = (self.max_cpu_shares as f64 * request.cpu_percent / 100.0) as u64;
            self.backend.limit_cpu(&handle, shares).await?;
        }

        let mut ports = Vec::with_capacity(request.ports.len());
        for mapping in &request.ports {
            let (host_port, container_port) = self
                .backend
                .net_in(&handle, mapping.host_port, mapping.container_port)
                .await?;
            ports.push(PortMapping {
                host_port,
                container_port,
            });
        }

        let record = self.registry.complete_initialize(
            guid,
            &handle,
            request.cpu_percent,
            request.log.clone(),
            ports,
        )?;
        tracing::info!(guid = %guid, handle = %handle, "Initialized container");
        Ok(record)
    }

    /// Compile the actions and hand the sequence to the dispatcher
    pub async fn run(
        &self,
        guid: &str,
        actions: &[Action],
        complete_url: Option<String>,
    ) -> Result<()> {
        let record = self.registry.find(guid)?;
        if record.backend_handle.is_empty() {
            return Err(ExecutorError::NotInitialized {
                guid: guid.to_string(),
            });
        }
        if self.dispatcher.has_binding(guid) {
            return Err(ExecutorError::AlreadyBound {
                guid: guid.to_string(),
            });
        }
        self.backend.lookup(&record.backend_handle).await?;

        let result = Arc::new(Mutex::new(String::new()));
        let streamer = Arc::new(LogStreamer::new(record.log.clone(), self.log_tx.clone()));
        let sequence = self.transformer.sequence_for(
            actions,
            &record.backend_handle,
            streamer,
            result.clone(),
        )?;

        self.dispatcher
            .enqueue(RunRequest {
                guid: guid.to_string(),
                sequence,
                complete_url,
                result,
            })
            .await;
        tracing::info!(guid = %guid, "Enqueued run request");
        Ok(())
    }

    /// Destroy the backend container (when one exists) and drop the record
    pub async fn delete(&self, guid: &str) -> Result<ContainerRecord> {
        let record = self.registry.find(guid)?;
        let _ = self.registry.mark_deleting(guid);

        // A bound sequence must not outlive its record
        self.dispatcher.cancel(guid);

        if !record.backend_handle.is_empty() {
            match self.backend.destroy(&record.backend_handle).await {
                Ok(()) | Err(BackendError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let record = self.registry.delete(guid)?;
        tracing::info!(guid = %guid, "Deleted container");
        Ok(record)
    }

    pub fn find(&self, guid: &str) -> Result<ContainerRecord> {
        Ok(self.registry.find(guid)?)
    }

    pub fn list(&self) -> Vec<ContainerRecord> {
        self.registry.list()
    }

    pub fn remaining_capacity(&self) -> Capacity {
        self.registry.remaining_capacity()
    }

    pub fn total_capacity(&self) -> Capacity {
        self.registry.total_capacity()
    }

    pub async fn ping(&self) -> Result<()> {
        Ok(self.backend.ping().await?)
    }
}
