//! Serial composite
//!
//! Runs children left to right, stopping at the first failure. Cancel
//! forwards to whichever child is running and skips the rest. Cleanup
//! covers every started child, in reverse order of start.

use super::{Result, SharedStep, Step, StepError};
use crate::cancel::CancelToken;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub struct SerialStep {
    children: Vec<SharedStep>,
    cancel: CancelToken,
    started: AtomicUsize,
    cleaned: AtomicBool,
}

impl SerialStep {
    pub fn new(children: Vec<SharedStep>) -> Self {
        Self {
            children,
            cancel: CancelToken::new(),
            started: AtomicUsize::new(0),
            cleaned: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl Step for SerialStep {
    async fn perform(&self) -> Result<()> {
        for (index, child) in self.children.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }
            self.started.store(index + 1, Ordering::SeqCst);

            let perform = child.perform();
            tokio::pin!(perform);
            let result = tokio::select! {
                result = &mut perform => result,
                _ = self.cancel.cancelled() => {
                    // Forward the cancel and wait for the child to honour it
                    child.cancel();
                    perform.await
                }
            };
            result?;
        }
        Ok(())
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        let started = self.started.load(Ordering::SeqCst);
        for child in self.children[..started].iter().rev() {
            child.cleanup().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::fake::FakeStep;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn journal() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn runs_children_in_order() {
        let journal = journal();
        let first = FakeStep::succeeding("first", journal.clone());
        let second = FakeStep::succeeding("second", journal.clone());

        let serial = SerialStep::new(vec![first, second]);
        serial.perform().await.unwrap();
        serial.cleanup().await;

        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                "perform:first",
                "perform:second",
                "cleanup:second",
                "cleanup:first"
            ]
        );
    }

    #[tokio::test]
    async fn short_circuits_on_first_failure() {
        let journal = journal();
        let failing = FakeStep::failing("bad", journal.clone(), StepError::Process(1));
        let never = FakeStep::succeeding("never", journal.clone());

        let serial = SerialStep::new(vec![failing, never.clone()]);
        let err = serial.perform().await.unwrap_err();
        assert!(matches!(err, StepError::Process(1)));
        assert_eq!(never.performs(), 0);

        // Cleanup only touches the started child
        serial.cleanup().await;
        assert_eq!(*journal.lock().unwrap(), vec!["perform:bad", "cleanup:bad"]);
    }

    #[tokio::test]
    async fn cancel_reaches_the_running_child_and_skips_the_rest() {
        let journal = journal();
        let holding = FakeStep::holding("held", journal.clone());
        let skipped = FakeStep::succeeding("skipped", journal.clone());

        let serial = Arc::new(SerialStep::new(vec![holding.clone(), skipped.clone()]));
        let runner = {
            let serial = serial.clone();
            tokio::spawn(async move { serial.perform().await })
        };

        // Let the first child start, then cancel
        tokio::time::sleep(Duration::from_millis(20)).await;
        serial.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .expect("perform returned promptly after cancel")
            .unwrap();
        assert!(matches!(result, Err(StepError::Cancelled)));
        assert!(holding.was_cancelled());
        assert_eq!(skipped.performs(), 0);
    }

    #[tokio::test]
    async fn cleanup_runs_each_started_child_exactly_once() {
        let journal = journal();
        let only = FakeStep::succeeding("only", journal.clone());
        let serial = SerialStep::new(vec![only.clone()]);

        serial.perform().await.unwrap();
        serial.cleanup().await;
        serial.cleanup().await;
        assert_eq!(only.cleanups(), 1);
    }

    #[tokio::test]
    async fn cleanup_before_perform_is_a_no_op() {
        let journal = journal();
        let child = FakeStep::succeeding("child", journal.clone());
        let serial = SerialStep::new(vec![child.clone()]);

        serial.cleanup().await;
        assert_eq!(child.cleanups(), 0);
    }
}
