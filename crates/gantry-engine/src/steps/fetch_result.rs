//! Result capture step
//!
//! Streams a file out of the container and stores its contents in the run's
//! result slot, where the completion callback picks it up. Results are
//! capped so a misbehaving task cannot flood the callback body.

use super::{Result, Step, StepError};
use crate::cancel::CancelToken;
use gantry_backend::Backend;
use std::io::Read;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;

/// Largest result payload the callback will carry
pub const MAX_RESULT_SIZE: u64 = 10 * 1024;

pub struct FetchResultStep {
    backend: Arc<dyn Backend>,
    handle: String,
    file: String,
    result: Arc<Mutex<String>>,
    cancel: CancelToken,
}

impl FetchResultStep {
    pub fn new(
        backend: Arc<dyn Backend>,
        handle: String,
        file: String,
        result: Arc<Mutex<String>>,
    ) -> Self {
        Self {
            backend,
            handle,
            file,
            result,
            cancel: CancelToken::new(),
        }
    }
}

#[async_trait::async_trait]
impl Step for FetchResultStep {
    async fn perform(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        let mut reader = self
            .backend
            .stream_out(&self.handle, &self.file, "")
            .await
            .map_err(|e| StepError::FetchResultFailed(e.to_string()))?;

        let mut archive_bytes = Vec::new();
        tokio::select! {
            read = reader.read_to_end(&mut archive_bytes) => {
                read.map_err(|e| StepError::FetchResultFailed(e.to_string()))?;
            }
            _ = self.cancel.cancelled() => return Err(StepError::Cancelled),
        }

        let mut archive = tar::Archive::new(std::io::Cursor::new(archive_bytes));
        let mut entries = archive
            .entries()
            .map_err(|e| StepError::FetchResultFailed(e.to_string()))?;
        let entry = entries
            .next()
            .ok_or_else(|| StepError::FetchResultFailed("empty archive".into()))?
            .map_err(|e| StepError::FetchResultFailed(e.to_string()))?;

        if entry.header().size().unwrap_or(u64::MAX) > MAX_RESULT_SIZE {
            return Err(StepError::FetchResultFailed(format!(
                "result file size exceeds allowed limit of {MAX_RESULT_SIZE} bytes"
            )));
        }

        let mut contents = String::new();
        entry
            .take(MAX_RESULT_SIZE)
            .read_to_string(&mut contents)
            .map_err(|e| StepError::FetchResultFailed(e.to_string()))?;

        *self.result.lock().unwrap() = contents;
        Ok(())
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn cleanup(&self) {}
}
