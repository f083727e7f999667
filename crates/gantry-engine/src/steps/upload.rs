//! Artifact upload step
//!
//! Streams a path out of the container as a tar archive and POSTs it to
//! the destination URL.

use super::{Result, Step, StepError};
use crate::actions::UploadAction;
use crate::cancel::CancelToken;
use gantry_backend::Backend;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

pub struct UploadStep {
    backend: Arc<dyn Backend>,
    handle: String,
    action: UploadAction,
    client: reqwest::Client,
    cancel: CancelToken,
}

impl UploadStep {
    pub fn new(backend: Arc<dyn Backend>, handle: String, action: UploadAction) -> Self {
        Self {
            backend,
            handle,
            action,
            client: reqwest::Client::new(),
            cancel: CancelToken::new(),
        }
    }
}

#[async_trait::async_trait]
impl Step for UploadStep {
    async fn perform(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        tracing::debug!(handle = %self.handle, from = %self.action.from, "Streaming upload out");
        let mut reader = self
            .backend
            .stream_out(&self.handle, &self.action.from, &self.action.user)
            .await
            .map_err(|e| StepError::StreamOutFailed(e.to_string()))?;

        let mut payload = Vec::new();
        tokio::select! {
            read = reader.read_to_end(&mut payload) => {
                read.map_err(|e| StepError::StreamOutFailed(e.to_string()))?;
            }
            _ = self.cancel.cancelled() => return Err(StepError::Cancelled),
        }

        tracing::debug!(handle = %self.handle, to = %self.action.to, bytes = payload.len(), "Uploading");
        let send = self.client.post(&self.action.to).body(payload).send();
        let response = tokio::select! {
            response = send => {
                response.map_err(|e| StepError::UploadFailed(e.to_string()))?
            }
            _ = self.cancel.cancelled() => return Err(StepError::Cancelled),
        };
        response
            .error_for_status()
            .map_err(|e| StepError::UploadFailed(e.to_string()))?;
        Ok(())
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn cleanup(&self) {}
}
