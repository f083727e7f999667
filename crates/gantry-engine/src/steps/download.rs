//! Artifact download step
//!
//! Waits for a download slot, fetches the payload through the shared
//! cache, wraps it in a tar archive, and streams it into the container.
//! Root-owned downloads are refused outright unless the runtime allows
//! privileged actions.

use super::{Result, Step, StepError};
use crate::actions::DownloadAction;
use crate::cache::{CacheError, DownloadCache};
use crate::cancel::CancelToken;
use crate::log_streamer::LogStreamer;
use gantry_backend::Backend;
use std::sync::Arc;
use tokio::sync::Semaphore;

pub struct DownloadStep {
    backend: Arc<dyn Backend>,
    handle: String,
    action: DownloadAction,
    cache: Arc<DownloadCache>,
    limiter: Arc<Semaphore>,
    allow_privileged: bool,
    streamer: Arc<LogStreamer>,
    cancel: CancelToken,
}

impl DownloadStep {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn Backend>,
        handle: String,
        action: DownloadAction,
        cache: Arc<DownloadCache>,
        limiter: Arc<Semaphore>,
        allow_privileged: bool,
        streamer: Arc<LogStreamer>,
    ) -> Self {
        Self {
            backend,
            handle,
            action,
            cache,
            limiter,
            allow_privileged,
            streamer,
            cancel: CancelToken::new(),
        }
    }

    fn artifact_entry_name(&self) -> String {
        if let Some(name) = &self.action.artifact_name {
            return name.clone();
        }
        self.action
            .from
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .unwrap_or("artifact")
            .to_string()
    }
}

#[async_trait::async_trait]
impl Step for DownloadStep {
    async fn perform(&self) -> Result<()> {
        if self.action.user == "root" && !self.allow_privileged {
            tracing::info!(
                handle = %self.handle,
                from = %self.action.from,
                "Privileged download denied"
            );
            return Err(StepError::PrivilegedActionDenied);
        }

        // A cancel while queued must not consume a download slot
        let _permit = tokio::select! {
            permit = self.limiter.acquire() => {
                permit.map_err(|_| StepError::Cancelled)?
            }
            _ = self.cancel.cancelled() => return Err(StepError::Cancelled),
        };

        tracing::debug!(handle = %self.handle, from = %self.action.from, "Fetching download");
        let (payload, downloaded) = self
            .cache
            .fetch(
                &self.action.from,
                self.action.cache_key.as_deref(),
                &self.cancel,
            )
            .await
            .map_err(|error| match error {
                CacheError::Cancelled => StepError::Cancelled,
                other => StepError::DownloadFailed(other.to_string()),
            })?;
        drop(_permit);

        let archive = tar_single_entry(&self.artifact_entry_name(), &payload)
            .map_err(|e| StepError::DownloadFailed(format!("packing failed: {e}")))?;

        tracing::debug!(handle = %self.handle, to = %self.action.to, "Streaming download in");
        let reader = Box::new(std::io::Cursor::new(archive));
        let stream_in = self
            .backend
            .stream_in(&self.handle, &self.action.to, &self.action.user, reader);
        tokio::select! {
            result = stream_in => {
                result.map_err(|e| StepError::StreamInFailed(e.to_string()))?
            }
            _ = self.cancel.cancelled() => return Err(StepError::Cancelled),
        }

        if let Some(artifact) = &self.action.artifact_name {
            let line = if downloaded > 0 {
                format!("Downloaded {artifact} ({downloaded}B)")
            } else {
                format!("Downloaded {artifact}")
            };
            self.streamer.emit_stdout(&line);
        }

        Ok(())
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn cleanup(&self) {}
}

/// Wrap a payload as a one-entry tar archive
fn tar_single_entry(name: &str, contents: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, contents)?;
    builder.into_inner()
}
