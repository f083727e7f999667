//! Try composite
//!
//! Swallows child failures so optional work cannot sink a sequence.
//! Cancellation still propagates, otherwise a cancelled sequence would
//! look successful.

use super::{Result, SharedStep, Step, StepError};

pub struct TryStep {
    child: SharedStep,
}

impl TryStep {
    pub fn new(child: SharedStep) -> Self {
        Self { child }
    }
}

#[async_trait::async_trait]
impl Step for TryStep {
    async fn perform(&self) -> Result<()> {
        match self.child.perform().await {
            Ok(()) => Ok(()),
            Err(StepError::Cancelled) => Err(StepError::Cancelled),
            Err(error) => {
                tracing::debug!(error = %error, "Ignoring failure of optional action");
                Ok(())
            }
        }
    }

    fn cancel(&self) {
        self.child.cancel();
    }

    async fn cleanup(&self) {
        self.child.cleanup().await;
    }
}
