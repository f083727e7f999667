//! Process execution step
//!
//! Launches a process inside the container with its output attached to the
//! container's log streamer and waits for it to exit. A non-zero exit is a
//! failure. Cancel terminates the backend process; an optional timeout
//! synthesizes a cancel and reports `Timeout` instead.

use super::{Result, Step, StepError};
use crate::actions::RunAction;
use crate::cancel::CancelToken;
use crate::log_streamer::LogStreamer;
use gantry_backend::{Backend, ProcessIo, ProcessSpec, ResourceLimits};
use std::sync::Arc;
use std::time::Duration;

pub struct RunStep {
    backend: Arc<dyn Backend>,
    handle: String,
    action: RunAction,
    streamer: Arc<LogStreamer>,
    cancel: CancelToken,
}

impl RunStep {
    pub fn new(
        backend: Arc<dyn Backend>,
        handle: String,
        action: RunAction,
        streamer: Arc<LogStreamer>,
    ) -> Self {
        Self {
            backend,
            handle,
            action,
            streamer,
            cancel: CancelToken::new(),
        }
    }
}

enum Outcome {
    Exited(gantry_backend::Result<i32>),
    Cancelled,
    TimedOut,
}

async fn maybe_timeout(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

#[async_trait::async_trait]
impl Step for RunStep {
    async fn perform(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        let spec = ProcessSpec {
            path: self.action.path.clone(),
            args: self.action.args.clone(),
            env: self
                .action
                .env
                .iter()
                .map(|var| (var.name.clone(), var.value.clone()))
                .collect(),
            user: String::new(),
            limits: ResourceLimits {
                nofile: self.action.resource_limits.nofile,
            },
        };
        let io = ProcessIo {
            stdout: Box::new(self.streamer.stdout()),
            stderr: Box::new(self.streamer.stderr()),
        };

        tracing::debug!(handle = %self.handle, path = %self.action.path, "Spawning process");
        let mut process = self.backend.run(&self.handle, spec, io).await?;

        let timeout = self.action.timeout_ms.map(Duration::from_millis);
        let outcome = tokio::select! {
            result = process.wait() => Outcome::Exited(result),
            _ = self.cancel.cancelled() => Outcome::Cancelled,
            _ = maybe_timeout(timeout) => Outcome::TimedOut,
        };

        match outcome {
            Outcome::Exited(Ok(0)) => Ok(()),
            Outcome::Exited(Ok(code)) => Err(StepError::Process(code)),
            Outcome::Exited(Err(error)) => Err(StepError::Backend(error)),
            Outcome::Cancelled => {
                let _ = process.terminate().await;
                Err(StepError::Cancelled)
            }
            Outcome::TimedOut => {
                tracing::info!(handle = %self.handle, path = %self.action.path, "Process timed out");
                self.cancel.cancel();
                let _ = process.terminate().await;
                Err(StepError::Timeout)
            }
        }
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn cleanup(&self) {}
}
