//! Progress bracketing
//!
//! Surrounds a child step with user-facing log lines: an optional start
//! message before, and a success message or a prefixed failure message
//! after. The child's result passes through untouched.

use super::{Result, SharedStep, Step};
use crate::log_streamer::LogStreamer;
use std::sync::Arc;

pub struct EmitProgressStep {
    child: SharedStep,
    streamer: Arc<LogStreamer>,
    start_message: String,
    success_message: String,
    failure_message_prefix: String,
}

impl EmitProgressStep {
    pub fn new(
        child: SharedStep,
        streamer: Arc<LogStreamer>,
        start_message: String,
        success_message: String,
        failure_message_prefix: String,
    ) -> Self {
        Self {
            child,
            streamer,
            start_message,
            success_message,
            failure_message_prefix,
        }
    }
}

#[async_trait::async_trait]
impl Step for EmitProgressStep {
    async fn perform(&self) -> Result<()> {
        if !self.start_message.is_empty() {
            self.streamer.emit_stdout(&self.start_message);
        }

        let result = self.child.perform().await;

        match &result {
            Ok(()) => {
                if !self.success_message.is_empty() {
                    self.streamer.emit_stdout(&self.success_message);
                }
            }
            Err(error) => {
                if !self.failure_message_prefix.is_empty() {
                    self.streamer
                        .emit_stderr(&format!("{}: {error}", self.failure_message_prefix));
                }
            }
        }

        result
    }

    fn cancel(&self) {
        self.child.cancel();
    }

    async fn cleanup(&self) {
        self.child.cleanup().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_streamer::{LogConfig, MessageKind};
    use crate::steps::fake::FakeStep;
    use crate::steps::StepError;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn streamer() -> (Arc<LogStreamer>, mpsc::UnboundedReceiver<crate::LogMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(LogStreamer::new(LogConfig::default(), tx)), rx)
    }

    fn journal() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn brackets_success_with_messages() {
        let (streamer, mut rx) = streamer();
        let step = EmitProgressStep::new(
            FakeStep::succeeding("work", journal()),
            streamer,
            "Staging...".into(),
            "Staging complete".into(),
            "Staging failed".into(),
        );

        step.perform().await.unwrap();

        assert_eq!(rx.try_recv().unwrap().message, "Staging...");
        assert_eq!(rx.try_recv().unwrap().message, "Staging complete");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failure_goes_to_stderr_with_prefix() {
        let (streamer, mut rx) = streamer();
        let step = EmitProgressStep::new(
            FakeStep::failing("work", journal(), StepError::Process(1)),
            streamer,
            String::new(),
            "done".into(),
            "Staging failed".into(),
        );

        let err = step.perform().await.unwrap_err();
        assert!(matches!(err, StepError::Process(1)));

        let message = rx.try_recv().unwrap();
        assert_eq!(message.kind, MessageKind::Err);
        assert_eq!(message.message, "Staging failed: process exited with status 1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_messages_are_not_emitted() {
        let (streamer, mut rx) = streamer();
        let step = EmitProgressStep::new(
            FakeStep::succeeding("work", journal()),
            streamer,
            String::new(),
            String::new(),
            String::new(),
        );

        step.perform().await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
