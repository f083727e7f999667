//! Run dispatcher
//!
//! A queue of run requests drained by a fixed pool of worker tasks. Each
//! request marks its record running, performs the sequence, reports the
//! outcome through the completion callback (with bounded exponential
//! backoff), and tears the container down. The dispatcher also holds every
//! live sequence so drain can cancel them all.

use crate::registry::Registry;
use crate::steps::SharedStep;
use dashmap::DashMap;
use gantry_backend::Backend;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};

/// Depth of the run queue before enqueue applies backpressure
const QUEUE_DEPTH: usize = 64;

/// One unit of queued work
pub struct RunRequest {
    pub guid: String,
    pub sequence: SharedStep,
    pub complete_url: Option<String>,
    pub result: Arc<std::sync::Mutex<String>>,
}

/// The callback body reporting a finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub guid: String,
    pub failed: bool,
    pub failure_reason: String,
    pub result: String,
}

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub worker_count: usize,
    pub callback_retries: u32,
    pub callback_backoff_base: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            callback_retries: 3,
            callback_backoff_base: Duration::from_millis(500),
        }
    }
}

pub struct RunDispatcher {
    tx: mpsc::Sender<RunRequest>,
    shared: Arc<Shared>,
}

struct Shared {
    registry: Arc<Registry>,
    backend: Arc<dyn Backend>,
    client: reqwest::Client,
    sequences: DashMap<String, SharedStep>,
    outstanding: AtomicUsize,
    idle: Notify,
    callback_retries: u32,
    callback_backoff_base: Duration,
}

impl RunDispatcher {
    pub fn new(
        registry: Arc<Registry>,
        backend: Arc<dyn Backend>,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let shared = Arc::new(Shared {
            registry,
            backend,
            client: reqwest::Client::new(),
            sequences: DashMap::new(),
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
            callback_retries: config.callback_retries.max(1),
            callback_backoff_base: config.callback_backoff_base,
        });

        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..config.worker_count.max(1) {
            let rx = rx.clone();
            let shared = shared.clone();
            tokio::spawn(async move {
                tracing::debug!(worker, "Run worker started");
                loop {
                    let request = { rx.lock().await.recv().await };
                    match request {
                        Some(request) => shared.execute(request).await,
                        None => break,
                    }
                }
                tracing::debug!(worker, "Run worker stopped");
            });
        }

        Arc::new(Self { tx, shared })
    }

    /// Queue a run. The sequence becomes cancelable immediately, even
    /// while it waits for a worker.
    pub async fn enqueue(&self, request: RunRequest) {
        self.shared
            .sequences
            .insert(request.guid.clone(), request.sequence.clone());
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(request).await.is_err() {
            // Workers only vanish at process teardown
            tracing::error!("Run queue is closed; dropping request");
            self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Cancel every queued and running sequence
    pub fn cancel_all(&self) {
        for entry in self.shared.sequences.iter() {
            tracing::info!(guid = %entry.key(), "Cancelling sequence");
            entry.value().cancel();
        }
    }

    /// Whether a sequence is currently bound to this container
    pub fn has_binding(&self, guid: &str) -> bool {
        self.shared.sequences.contains_key(guid)
    }

    /// Cancel the sequence bound to one container, if any
    pub fn cancel(&self, guid: &str) {
        if let Some(entry) = self.shared.sequences.get(guid) {
            entry.value().cancel();
        }
    }

    /// Resolve once no work is queued or in flight
    pub async fn wait_idle(&self) {
        loop {
            if self.shared.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.shared.idle.notified();
            if self.shared.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Shared {
    async fn execute(&self, request: RunRequest) {
        let guid = request.guid.clone();

        let outcome = match self.registry.mark_running(&guid) {
            Ok(_) => {
                tracing::info!(guid = %guid, "Running sequence");
                Some(request.sequence.perform().await)
            }
            Err(e) => {
                tracing::warn!(guid = %guid, error = %e, "Skipping run; container unavailable");
                None
            }
        };

        request.sequence.cleanup().await;

        if let Some(result) = outcome {
            let _ = self.registry.mark_completed(&guid);

            let payload = RunResult {
                guid: guid.clone(),
                failed: result.is_err(),
                failure_reason: result
                    .as_ref()
                    .err()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
                result: request.result.lock().unwrap().clone(),
            };
            tracing::info!(
                guid = %guid,
                failed = payload.failed,
                reason = %payload.failure_reason,
                "Sequence finished"
            );

            if let Some(url) = &request.complete_url {
                self.deliver_callback(url, &payload).await;
            }
        }

        // Teardown releases the backend container and the reservation
        if let Ok(record) = self.registry.find(&guid) {
            if !record.backend_handle.is_empty() {
                if let Err(e) = self.backend.destroy(&record.backend_handle).await {
                    tracing::error!(
                        guid = %guid,
                        handle = %record.backend_handle,
                        error = %e,
                        "Failed to destroy container"
                    );
                }
            }
        }
        let _ = self.registry.delete(&guid);

        self.sequences.remove(&guid);
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn deliver_callback(&self, url: &str, payload: &RunResult) {
        let mut backoff = self.callback_backoff_base;
        for attempt in 1..=self.callback_retries {
            match self.client.put(url).json(payload).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        tracing::info!(guid = %payload.guid, url, attempt, "Callback delivered");
                        return;
                    }
                    if status.is_client_error() {
                        // The receiver understood us and said no; stop
                        tracing::warn!(guid = %payload.guid, url, %status, "Callback rejected");
                        return;
                    }
                    tracing::warn!(guid = %payload.guid, url, %status, attempt, "Callback attempt failed");
                }
                Err(e) => {
                    tracing::warn!(guid = %payload.guid, url, error = %e, attempt, "Callback attempt failed");
                }
            }
            if attempt < self.callback_retries {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        tracing::warn!(guid = %payload.guid, url, "Giving up on completion callback");
    }
}
