//! Parallel composite
//!
//! Starts every child on its own task and waits for all of them. The first
//! error observed wins; later results are discarded. Cancel broadcasts to
//! all children.

use super::{Result, SharedStep, Step, StepError};
use crate::cancel::CancelToken;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};

pub struct ParallelStep {
    children: Vec<SharedStep>,
    cancel: CancelToken,
    cleaned: AtomicBool,
}

impl ParallelStep {
    pub fn new(children: Vec<SharedStep>) -> Self {
        Self {
            children,
            cancel: CancelToken::new(),
            cleaned: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl Step for ParallelStep {
    async fn perform(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        let mut performs: FuturesUnordered<_> =
            self.children.iter().map(|child| child.perform()).collect();

        let mut first_error = None;
        while let Some(result) = performs.next().await {
            if let Err(error) = result {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn cancel(&self) {
        self.cancel.cancel();
        for child in &self.children {
            child.cancel();
        }
    }

    async fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        for child in &self.children {
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
    async fn waits_for_every_child() {
        let journal = journal();
        let a = FakeStep::succeeding("a", journal.clone());
        let b = FakeStep::succeeding("b", journal.clone());
        let c = FakeStep::succeeding("c", journal.clone());

        let parallel = ParallelStep::new(vec![a.clone(), b.clone(), c.clone()]);
        parallel.perform().await.unwrap();

        assert_eq!(a.performs(), 1);
        assert_eq!(b.performs(), 1);
        assert_eq!(c.performs(), 1);
    }

    #[tokio::test]
    async fn reports_an_error_after_all_children_finish() {
        let journal = journal();
        let good = FakeStep::succeeding("good", journal.clone());
        let bad = FakeStep::failing("bad", journal.clone(), StepError::Process(7));

        let parallel = ParallelStep::new(vec![good.clone(), bad]);
        let err = parallel.perform().await.unwrap_err();
        assert!(matches!(err, StepError::Process(7)));
        assert_eq!(good.performs(), 1);
    }

    #[tokio::test]
    async fn cancel_broadcasts_to_all_children() {
        let journal = journal();
        let held_a = FakeStep::holding("a", journal.clone());
        let held_b = FakeStep::holding("b", journal.clone());

        let parallel = Arc::new(ParallelStep::new(vec![held_a.clone(), held_b.clone()]));
        let runner = {
            let parallel = parallel.clone();
            tokio::spawn(async move { parallel.perform().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        parallel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .expect("perform unblocked by cancel")
            .unwrap();
        assert!(matches!(result, Err(StepError::Cancelled)));
        assert!(held_a.was_cancelled());
        assert!(held_b.was_cancelled());
    }

    #[tokio::test]
    async fn cleanup_covers_all_children_once() {
        let journal = journal();
        let a = FakeStep::succeeding("a", journal.clone());
        let b = FakeStep::succeeding("b", journal.clone());

        let parallel = ParallelStep::new(vec![a.clone(), b.clone()]);
        parallel.perform().await.unwrap();
        parallel.cleanup().await;
        parallel.cleanup().await;

        assert_eq!(a.cleanups(), 1);
        assert_eq!(b.cleanups(), 1);
    }
}
