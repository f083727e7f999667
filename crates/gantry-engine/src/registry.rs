//! Container registry
//!
//! Indexes container records by guid, enforces lifecycle transitions
//! against a static table, and carries the capacity tracker under the same
//! lock so accounting can never drift from the record set. All operations
//! are short and never touch I/O.

use crate::capacity::{Capacity, CapacityTracker};
use crate::log_streamer::LogConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Registry operation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("container '{guid}' already exists")]
    AlreadyExists { guid: String },

    #[error("insufficient capacity")]
    InsufficientCapacity,

    #[error("container '{guid}' not found")]
    NotFound { guid: String },

    #[error("container '{guid}' cannot move from {from:?} to {to:?}")]
    WrongState {
        guid: String,
        from: ContainerState,
        to: ContainerState,
    },
}

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

/// Container lifecycle states. Transitions only move forward; `Deleting`
/// is reachable from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Reserved,
    Initializing,
    Initialized,
    Running,
    Completed,
    Deleting,
}

impl ContainerState {
    /// The static transition table
    pub fn can_transition(self, to: ContainerState) -> bool {
        use ContainerState::*;
        matches!(
            (self, to),
            (Reserved, Initializing)
                | (Initializing, Initialized)
                | (Initialized, Running)
                | (Running, Completed)
                | (_, Deleting)
        )
    }
}

/// One host/container port pair. A zero host port in a request asks the
/// backend to pick one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    #[serde(default)]
    pub host_port: u16,
    pub container_port: u16,
}

/// The registry entry for one container guid
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub guid: String,
    pub state: ContainerState,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub cpu_percent: f64,
    /// Empty until the backend container exists
    pub backend_handle: String,
    pub log: LogConfig,
    pub ports: Vec<PortMapping>,
    pub reserved_at: DateTime<Utc>,
    pub initialized_at: Option<DateTime<Utc>>,

    #[serde(skip, default = "Instant::now")]
    reserved_instant: Instant,
    /// Set once this record's share of capacity has been returned
    #[serde(skip)]
    capacity_released: bool,
}

impl ContainerRecord {
    fn new(guid: String, memory_mb: u64, disk_mb: u64) -> Self {
        Self {
            guid,
            state: ContainerState::Reserved,
            memory_mb,
            disk_mb,
            cpu_percent: 0.0,
            backend_handle: String::new(),
            log: LogConfig::default(),
            ports: Vec::new(),
            reserved_at: Utc::now(),
            initialized_at: None,
            reserved_instant: Instant::now(),
            capacity_released: false,
        }
    }
}

struct Inner {
    capacity: CapacityTracker,
    records: HashMap<String, ContainerRecord>,
}

/// The container registry. Clone the `Arc` freely; all state sits behind
/// one mutex.
pub struct Registry {
    inner: Mutex<Inner>,
    pruning_interval: Duration,
}

impl Registry {
    pub fn new(total: Capacity, pruning_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capacity: CapacityTracker::new(total),
                records: HashMap::new(),
            }),
            pruning_interval,
        }
    }

    /// Insert a record in `Reserved` state, claiming capacity
    pub fn reserve(&self, guid: &str, memory_mb: u64, disk_mb: u64) -> Result<ContainerRecord> {
        let mut inner = self.inner.lock().unwrap();
        if inner.records.contains_key(guid) {
            return Err(RegistryError::AlreadyExists {
                guid: guid.to_string(),
            });
        }
        if !inner.capacity.reserve(memory_mb, disk_mb) {
            return Err(RegistryError::InsufficientCapacity);
        }
        let record = ContainerRecord::new(guid.to_string(), memory_mb, disk_mb);
        inner.records.insert(guid.to_string(), record.clone());
        Ok(record)
    }

    pub fn find(&self, guid: &str) -> Result<ContainerRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .get(guid)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                guid: guid.to_string(),
            })
    }

    /// Claim a reservation for initialization (`Reserved` -> `Initializing`)
    pub fn begin_initialize(&self, guid: &str) -> Result<ContainerRecord> {
        self.transition(guid, ContainerState::Initializing)
    }

    /// Attach the backend container and advance to `Initialized`
    pub fn complete_initialize(
        &self,
        guid: &str,
        backend_handle: &str,
        cpu_percent: f64,
        log: LogConfig,
        ports: Vec<PortMapping>,
    ) -> Result<ContainerRecord> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .records
            .get_mut(guid)
            .ok_or_else(|| RegistryError::NotFound {
                guid: guid.to_string(),
            })?;
        if !record.state.can_transition(ContainerState::Initialized) {
            return Err(RegistryError::WrongState {
                guid: guid.to_string(),
                from: record.state,
                to: ContainerState::Initialized,
            });
        }
        record.state = ContainerState::Initialized;
        record.backend_handle = backend_handle.to_string();
        record.cpu_percent = cpu_percent;
        record.log = log;
        record.ports = ports;
        record.initialized_at = Some(Utc::now());
        Ok(record.clone())
    }

    pub fn mark_running(&self, guid: &str) -> Result<ContainerRecord> {
        self.transition(guid, ContainerState::Running)
    }

    /// Advance to `Completed` and return the record's capacity. The work is
    /// done; only teardown holds the guid after this.
    pub fn mark_completed(&self, guid: &str) -> Result<ContainerRecord> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .records
            .get_mut(guid)
            .ok_or_else(|| RegistryError::NotFound {
                guid: guid.to_string(),
            })?;
        if !record.state.can_transition(ContainerState::Completed) {
            return Err(RegistryError::WrongState {
                guid: guid.to_string(),
                from: record.state,
                to: ContainerState::Completed,
            });
        }
        record.state = ContainerState::Completed;
        record.capacity_released = true;
        let (memory_mb, disk_mb) = (record.memory_mb, record.disk_mb);
        let snapshot = record.clone();
        inner.capacity.release(memory_mb, disk_mb);
        Ok(snapshot)
    }

    pub fn mark_deleting(&self, guid: &str) -> Result<ContainerRecord> {
        self.transition(guid, ContainerState::Deleting)
    }

    /// Remove the record, releasing capacity if it still holds any.
    /// A second delete of the same guid reports `NotFound`.
    pub fn delete(&self, guid: &str) -> Result<ContainerRecord> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .records
            .remove(guid)
            .ok_or_else(|| RegistryError::NotFound {
                guid: guid.to_string(),
            })?;
        if !record.capacity_released {
            inner.capacity.release(record.memory_mb, record.disk_mb);
        }
        Ok(record)
    }

    pub fn list(&self) -> Vec<ContainerRecord> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<_> = inner.records.values().cloned().collect();
        records.sort_by(|a, b| a.guid.cmp(&b.guid));
        records
    }

    pub fn list_by_state(&self, state: ContainerState) -> Vec<ContainerRecord> {
        self.list()
            .into_iter()
            .filter(|r| r.state == state)
            .collect()
    }

    pub fn remaining_capacity(&self) -> Capacity {
        self.inner.lock().unwrap().capacity.remaining()
    }

    pub fn total_capacity(&self) -> Capacity {
        self.inner.lock().unwrap().capacity.total()
    }

    /// Drop reservations nobody claimed within the pruning interval.
    /// Returns the pruned guids.
    pub fn prune(&self, now: Instant) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        let stale: Vec<String> = inner
            .records
            .values()
            .filter(|r| {
                r.state == ContainerState::Reserved
                    && now.duration_since(r.reserved_instant) > self.pruning_interval
            })
            .map(|r| r.guid.clone())
            .collect();
        for guid in &stale {
            if let Some(record) = inner.records.remove(guid) {
                inner.capacity.release(record.memory_mb, record.disk_mb);
                tracing::info!(guid = %guid, "Pruned abandoned reservation");
            }
        }
        stale
    }

    fn transition(&self, guid: &str, to: ContainerState) -> Result<ContainerRecord> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .records
            .get_mut(guid)
            .ok_or_else(|| RegistryError::NotFound {
                guid: guid.to_string(),
            })?;
        if !record.state.can_transition(to) {
            return Err(RegistryError::WrongState {
                guid: guid.to_string(),
                from: record.state,
                to,
            });
        }
        record.state = to;
        Ok(record.clone())
    }
}

/// Spawn the background pruner for a shared registry
pub fn start_pruner(
    registry: Arc<Registry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick
        loop {
            ticker.tick().await;
            registry.prune(Instant::now());
        }
    })
}
