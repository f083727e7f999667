//! In-memory backend for development and tests
//!
//! Containers are plain map entries, processes are scripted, and every call
//! is recorded so tests can assert on the exact operation sequence the
//! engine drove.

use crate::{
    Backend, BackendCapacity, BackendError, ContainerSpec, Process, ProcessIo, ProcessSpec, Result,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

/// One recorded backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Created { handle: String },
    Destroyed { handle: String },
    LimitedMemory { handle: String, limit_in_bytes: u64 },
    LimitedDisk { handle: String, byte_hard: u64 },
    LimitedCpu { handle: String, limit_in_shares: u64 },
    NetIn { handle: String, host_port: u16, container_port: u16 },
    Ran { handle: String, path: String },
    StreamedIn { handle: String, dest_path: String, user: String },
    StreamedOut { handle: String, source_path: String },
}

/// Script for the next spawned process
#[derive(Debug, Clone)]
pub struct ScriptedProcess {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Never exit until terminated
    pub hold: bool,
}

impl Default for ScriptedProcess {
    fn default() -> Self {
        Self {
            exit_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
            hold: false,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryContainer {
    properties: HashMap<String, String>,
    streamed_in: Vec<(String, String, Vec<u8>)>,
}

/// An in-memory [`Backend`]
pub struct InMemoryBackend {
    capacity: BackendCapacity,
    containers: Mutex<HashMap<String, MemoryContainer>>,
    events: Mutex<Vec<BackendEvent>>,
    scripted_processes: Mutex<VecDeque<ScriptedProcess>>,
    net_in_responses: Mutex<VecDeque<(u16, u16)>>,
    stream_out_contents: Mutex<HashMap<String, Vec<u8>>>,
    failing_destroys: Mutex<Vec<String>>,
    stream_in_failure: Mutex<Option<String>>,
    reachable: AtomicBool,
    next_host_port: AtomicU16,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_capacity(BackendCapacity {
            memory_in_bytes: 4 * 1024 * 1024 * 1024,
            disk_in_bytes: 16 * 1024 * 1024 * 1024,
            max_containers: 256,
        })
    }

    pub fn with_capacity(capacity: BackendCapacity) -> Self {
        Self {
            capacity,
            containers: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            scripted_processes: Mutex::new(VecDeque::new()),
            net_in_responses: Mutex::new(VecDeque::new()),
            stream_out_contents: Mutex::new(HashMap::new()),
            failing_destroys: Mutex::new(Vec::new()),
            stream_in_failure: Mutex::new(None),
            reachable: AtomicBool::new(true),
            next_host_port: AtomicU16::new(61000),
        }
    }

    /// Everything the engine asked this backend to do, in order
    pub fn events(&self) -> Vec<BackendEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Queue the script for the next spawned process
    pub fn script_process(&self, process: ScriptedProcess) {
        self.scripted_processes.lock().unwrap().push_back(process);
    }

    /// Queue the (host, container) pair the next `net_in` call reports
    pub fn script_net_in(&self, host_port: u16, container_port: u16) {
        self.net_in_responses
            .lock()
            .unwrap()
            .push_back((host_port, container_port));
    }

    /// Set the bytes `stream_out` returns for a source path
    pub fn script_stream_out(&self, source_path: impl Into<String>, contents: Vec<u8>) {
        self.stream_out_contents
            .lock()
            .unwrap()
            .insert(source_path.into(), contents);
    }

    /// Make `destroy` fail for the given handle
    pub fn fail_destroy(&self, handle: impl Into<String>) {
        self.failing_destroys.lock().unwrap().push(handle.into());
    }

    /// Make every `stream_in` fail with the given reason
    pub fn fail_stream_in(&self, reason: impl Into<String>) {
        *self.stream_in_failure.lock().unwrap() = Some(reason.into());
    }

    /// Simulate the backend going away
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Plant a pre-existing container, as a previous incarnation would have
    pub fn seed_container(&self, handle: impl Into<String>, properties: HashMap<String, String>) {
        self.containers.lock().unwrap().insert(
            handle.into(),
            MemoryContainer {
                properties,
                streamed_in: Vec::new(),
            },
        );
    }

    /// Tar archives streamed into a container: (dest_path, user, bytes)
    pub fn streamed_in(&self, handle: &str) -> Vec<(String, String, Vec<u8>)> {
        self.containers
            .lock()
            .unwrap()
            .get(handle)
            .map(|c| c.streamed_in.clone())
            .unwrap_or_default()
    }

    fn record(&self, event: BackendEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unreachable("backend is offline".into()))
        }
    }

    fn check_exists(&self, handle: &str) -> Result<()> {
        if self.containers.lock().unwrap().contains_key(handle) {
            Ok(())
        } else {
            Err(BackendError::NotFound {
                handle: handle.to_string(),
            })
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryProcess {
    exit_code: i32,
    hold: bool,
    terminated_tx: watch::Sender<bool>,
    terminated_rx: watch::Receiver<bool>,
}

impl MemoryProcess {
    fn new(script: &ScriptedProcess) -> Self {
        let (terminated_tx, terminated_rx) = watch::channel(false);
        Self {
            exit_code: script.exit_code,
            hold: script.hold,
            terminated_tx,
            terminated_rx,
        }
    }
}

#[async_trait::async_trait]
impl Process for MemoryProcess {
    async fn wait(&mut self) -> Result<i32> {
        if self.hold {
            // Held processes only exit when terminated
            let _ = self.terminated_rx.wait_for(|stopped| *stopped).await;
            return Ok(143);
        }
        Ok(self.exit_code)
    }

    async fn terminate(&mut self) -> Result<()> {
        let _ = self.terminated_tx.send(true);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Backend for InMemoryBackend {
    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn capacity(&self) -> Result<BackendCapacity> {
        self.check_reachable()?;
        Ok(self.capacity)
    }

    async fn create(&self, spec: ContainerSpec) -> Result<String> {
        self.check_reachable()?;
        let handle = uuid::Uuid::new_v4().to_string();
        self.containers.lock().unwrap().insert(
            handle.clone(),
            MemoryContainer {
                properties: spec.properties,
                streamed_in: Vec::new(),
            },
        );
        self.record(BackendEvent::Created {
            handle: handle.clone(),
        });
        tracing::debug!(handle = %handle, "Created in-memory container");
        Ok(handle)
    }

    async fn lookup(&self, handle: &str) -> Result<()> {
        self.check_reachable()?;
        self.check_exists(handle)
    }

    async fn destroy(&self, handle: &str) -> Result<()> {
        self.check_reachable()?;
        if self
            .failing_destroys
            .lock()
            .unwrap()
            .iter()
            .any(|h| h == handle)
        {
            return Err(BackendError::OperationFailed {
                handle: handle.to_string(),
                operation: "destroy",
                reason: "scripted failure".into(),
            });
        }
        self.check_exists(handle)?;
        self.containers.lock().unwrap().remove(handle);
        self.record(BackendEvent::Destroyed {
            handle: handle.to_string(),
        });
        Ok(())
    }

    async fn containers_by_property(&self, key: &str, value: &str) -> Result<Vec<String>> {
        self.check_reachable()?;
        let containers = self.containers.lock().unwrap();
        let mut handles: Vec<String> = containers
            .iter()
            .filter(|(_, c)| c.properties.get(key).map(String::as_str) == Some(value))
            .map(|(h, _)| h.clone())
            .collect();
        handles.sort();
        Ok(handles)
    }

    async fn limit_memory(&self, handle: &str, limit_in_bytes: u64) -> Result<()> {
        self.check_reachable()?;
        self.check_exists(handle)?;
        self.record(BackendEvent::LimitedMemory {
            handle: handle.to_string(),
            limit_in_bytes,
        });
        Ok(())
    }

    async fn limit_disk(&self, handle: &str, byte_hard: u64) -> Result<()> {
        self.check_reachable()?;
        self.check_exists(handle)?;
        self.record(BackendEvent::LimitedDisk {
            handle: handle.to_string(),
            byte_hard,
        });
        Ok(())
    }

    async fn limit_cpu(&self, handle: &str, limit_in_shares: u64) -> Result<()> {
        self.check_reachable()?;
        self.check_exists(handle)?;
        self.record(BackendEvent::LimitedCpu {
            handle: handle.to_string(),
            limit_in_shares,
        });
        Ok(())
    }

    async fn net_in(
        &self,
        handle: &str,
        host_port: u16,
        container_port: u16,
    ) -> Result<(u16, u16)> {
        self.check_reachable()?;
        self.check_exists(handle)?;
        self.record(BackendEvent::NetIn {
            handle: handle.to_string(),
            host_port,
            container_port,
        });
        if let Some(scripted) = self.net_in_responses.lock().unwrap().pop_front() {
            return Ok(scripted);
        }
        let effective_host = if host_port == 0 {
            self.next_host_port.fetch_add(1, Ordering::SeqCst)
        } else {
            host_port
        };
        Ok((effective_host, container_port))
    }

    async fn run(
        &self,
        handle: &str,
        spec: ProcessSpec,
        mut io: ProcessIo,
    ) -> Result<Box<dyn Process>> {
        self.check_reachable()?;
        self.check_exists(handle)?;
        self.record(BackendEvent::Ran {
            handle: handle.to_string(),
            path: spec.path.clone(),
        });

        let script = self
            .scripted_processes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();

        io.stdout
            .write_all(&script.stdout)
            .await
            .map_err(|e| BackendError::OperationFailed {
                handle: handle.to_string(),
                operation: "run",
                reason: e.to_string(),
            })?;
        io.stderr
            .write_all(&script.stderr)
            .await
            .map_err(|e| BackendError::OperationFailed {
                handle: handle.to_string(),
                operation: "run",
                reason: e.to_string(),
            })?;
        let _ = io.stdout.shutdown().await;
        let _ = io.stderr.shutdown().await;

        Ok(Box::new(MemoryProcess::new(&script)))
    }

    async fn stream_in(
        &self,
        handle: &str,
        dest_path: &str,
        user: &str,
        mut tar: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<()> {
        self.check_reachable()?;
        self.check_exists(handle)?;
        if let Some(reason) = self.stream_in_failure.lock().unwrap().clone() {
            return Err(BackendError::OperationFailed {
                handle: handle.to_string(),
                operation: "stream_in",
                reason,
            });
        }

        let mut contents = Vec::new();
        tar.read_to_end(&mut contents)
            .await
            .map_err(|e| BackendError::OperationFailed {
                handle: handle.to_string(),
                operation: "stream_in",
                reason: e.to_string(),
            })?;

        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(handle)
            .ok_or_else(|| BackendError::NotFound {
                handle: handle.to_string(),
            })?;
        container
            .streamed_in
            .push((dest_path.to_string(), user.to_string(), contents));
        drop(containers);

        self.record(BackendEvent::StreamedIn {
            handle: handle.to_string(),
            dest_path: dest_path.to_string(),
            user: user.to_string(),
        });
        Ok(())
    }

    async fn stream_out(
        &self,
        handle: &str,
        source_path: &str,
        _user: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        self.check_reachable()?;
        self.check_exists(handle)?;
        let contents = self
            .stream_out_contents
            .lock()
            .unwrap()
            .get(source_path)
            .cloned()
            .ok_or_else(|| BackendError::OperationFailed {
                handle: handle.to_string(),
                operation: "stream_out",
                reason: format!("no such path: {source_path}"),
            })?;
        self.record(BackendEvent::StreamedOut {
            handle: handle.to_string(),
            source_path: source_path.to_string(),
        });
        Ok(Box::new(std::io::Cursor::new(contents)))
    }
}
