//! Action-to-step compilation
//!
//! Pattern-matches the action tree exactly once, handing each step the
//! container handle, log streamer, shared cache, download limiter, and the
//! run's result slot. Structurally invalid trees are rejected before
//! anything executes.

use crate::actions::Action;
use crate::cache::DownloadCache;
use crate::log_streamer::LogStreamer;
use crate::steps::{
    DownloadStep, EmitProgressStep, FetchResultStep, MonitorStep, ParallelStep, RunStep,
    SerialStep, SharedStep, TryStep, UploadStep,
};
use gantry_backend::Backend;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Why an action tree cannot be compiled
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("no actions supplied")]
    Empty,

    #[error("{composite} composite has no children")]
    EmptyComposite { composite: &'static str },

    #[error("run action has no path")]
    MissingPath,

    #[error("monitor action is invalid: {0}")]
    InvalidMonitor(String),
}

/// Compiles action trees into executable sequences
pub struct Transformer {
    backend: Arc<dyn Backend>,
    cache: Arc<DownloadCache>,
    limiter: Arc<tokio::sync::Semaphore>,
    allow_privileged: bool,
}

impl Transformer {
    pub fn new(
        backend: Arc<dyn Backend>,
        cache: Arc<DownloadCache>,
        limiter: Arc<tokio::sync::Semaphore>,
        allow_privileged: bool,
    ) -> Self {
        Self {
            backend,
            cache,
            limiter,
            allow_privileged,
        }
    }

    /// Compile a run request's actions into one sequence bound to the
    /// container identified by `handle`
    pub fn sequence_for(
        &self,
        actions: &[Action],
        handle: &str,
        streamer: Arc<LogStreamer>,
        result: Arc<Mutex<String>>,
    ) -> Result<SharedStep, TransformError> {
        if actions.is_empty() {
            return Err(TransformError::Empty);
        }
        let children = actions
            .iter()
            .map(|action| self.step_for(action, handle, &streamer, &result))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Arc::new(SerialStep::new(children)))
    }

    fn step_for(
        &self,
        action: &Action,
        handle: &str,
        streamer: &Arc<LogStreamer>,
        result: &Arc<Mutex<String>>,
    ) -> Result<SharedStep, TransformError> {
        Ok(match action {
            Action::Run(run) => {
                if run.path.is_empty() {
                    return Err(TransformError::MissingPath);
                }
                Arc::new(RunStep::new(
                    self.backend.clone(),
                    handle.to_string(),
                    run.clone(),
                    streamer.clone(),
                ))
            }

            Action::Monitor(monitor) => {
                if monitor.interval_ms == 0 {
                    return Err(TransformError::InvalidMonitor(
                        "interval must be positive".into(),
                    ));
                }
                if monitor.healthy_threshold == 0 || monitor.unhealthy_threshold == 0 {
                    return Err(TransformError::InvalidMonitor(
                        "thresholds must be positive".into(),
                    ));
                }
                let child = self.step_for(&monitor.action, handle, streamer, result)?;
                Arc::new(MonitorStep::new(
                    child,
                    monitor.healthy_url.clone(),
                    monitor.unhealthy_url.clone(),
                    monitor.healthy_threshold,
                    monitor.unhealthy_threshold,
                    Duration::from_millis(monitor.interval_ms),
                ))
            }

            Action::Try { action } => {
                let child = self.step_for(action, handle, streamer, result)?;
                Arc::new(TryStep::new(child))
            }

            Action::Parallel { actions } => {
                if actions.is_empty() {
                    return Err(TransformError::EmptyComposite {
                        composite: "parallel",
                    });
                }
                let children = actions
                    .iter()
                    .map(|action| self.step_for(action, handle, streamer, result))
                    .collect::<Result<Vec<_>, _>>()?;
                Arc::new(ParallelStep::new(children))
            }

            Action::Serial { actions } => {
                if actions.is_empty() {
                    return Err(TransformError::EmptyComposite { composite: "serial" });
                }
                let children = actions
                    .iter()
                    .map(|action| self.step_for(action, handle, streamer, result))
                    .collect::<Result<Vec<_>, _>>()?;
                Arc::new(SerialStep::new(children))
            }

            Action::EmitProgress(emit) => {
                let child = self.step_for(&emit.action, handle, streamer, result)?;
                Arc::new(EmitProgressStep::new(
                    child,
                    streamer.clone(),
                    emit.start_message.clone(),
                    emit.success_message.clone(),
                    emit.failure_message_prefix.clone(),
                ))
            }

            Action::Download(download) => Arc::new(DownloadStep::new(
                self.backend.clone(),
                handle.to_string(),
                download.clone(),
                self.cache.clone(),
                self.limiter.clone(),
                self.allow_privileged,
                streamer.clone(),
            )),

            Action::Upload(upload) => Arc::new(UploadStep::new(
                self.backend.clone(),
                handle.to_string(),
                upload.clone(),
            )),

            Action::FetchResult { file } => Arc::new(FetchResultStep::new(
                self.backend.clone(),
                handle.to_string(),
                file.clone(),
                result.clone(),
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{MonitorAction, RunAction};
    use crate::log_streamer::LogConfig;
    use gantry_backend::InMemoryBackend;
    use tokio::sync::mpsc;

    fn transformer() -> Transformer {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DownloadCache::new(dir.keep(), 1024).unwrap());
        Transformer::new(
            Arc::new(InMemoryBackend::new()),
            cache,
            Arc::new(tokio::sync::Semaphore::new(1)),
            false,
        )
    }

    fn streamer() -> Arc<LogStreamer> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(LogStreamer::new(LogConfig::default(), tx))
    }

    fn run(path: &str) -> Action {
        Action::Run(RunAction {
            path: path.into(),
            args: vec![],
            env: vec![],
            resource_limits: Default::default(),
            timeout_ms: None,
        })
    }

    fn result_slot() -> Arc<Mutex<String>> {
        Arc::new(Mutex::new(String::new()))
    }

    #[test]
    fn compiles_a_nested_tree() {
        let transformer = transformer();
        let actions = vec![Action::Serial {
            actions: vec![
                Action::Try {
                    action: Box::new(run("setup")),
                },
                Action::Parallel {
                    actions: vec![run("a"), run("b")],
                },
                Action::FetchResult {
                    file: "/tmp/out".into(),
                },
            ],
        }];

        transformer
            .sequence_for(&actions, "handle", streamer(), result_slot())
            .unwrap();
    }

    #[test]
    fn empty_request_is_invalid() {
        let transformer = transformer();
        assert_eq!(
            transformer
                .sequence_for(&[], "handle", streamer(), result_slot())
                .err(),
            Some(TransformError::Empty)
        );
    }

    #[test]
    fn empty_composites_are_invalid() {
        let transformer = transformer();
        let actions = vec![Action::Parallel { actions: vec![] }];
        assert!(matches!(
            transformer
                .sequence_for(&actions, "handle", streamer(), result_slot())
                .err(),
            Some(TransformError::EmptyComposite { .. })
        ));
    }

    #[test]
    fn monitor_requires_positive_thresholds() {
        let transformer = transformer();
        let actions = vec![Action::Monitor(MonitorAction {
            action: Box::new(run("app")),
            healthy_url: None,
            unhealthy_url: None,
            healthy_threshold: 0,
            unhealthy_threshold: 1,
            interval_ms: 1000,
        })];
        assert!(matches!(
            transformer
                .sequence_for(&actions, "handle", streamer(), result_slot())
                .err(),
            Some(TransformError::InvalidMonitor(_))
        ));
    }

    #[test]
    fn run_requires_a_path() {
        let transformer = transformer();
        assert_eq!(
            transformer
                .sequence_for(&[run("")], "handle", streamer(), result_slot())
                .err(),
            Some(TransformError::MissingPath)
        );
    }
}
