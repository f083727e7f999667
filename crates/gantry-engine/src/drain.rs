//! Drain state machine
//!
//! Accepting -> Draining -> Stopped, driven by signals. Terminate stops
//! immediately after cancelling all work. The first drain signal refuses
//! new work and gives running sequences a bounded grace window; later
//! drain signals are ignored. The server's graceful shutdown awaits
//! `stopped`.

use crate::dispatcher::RunDispatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Accepting,
    Draining,
    Stopped,
}

#[derive(Clone)]
pub struct DrainController {
    state: Arc<watch::Sender<DrainState>>,
    drain_timeout: Duration,
}

impl DrainController {
    pub fn new(drain_timeout: Duration) -> Self {
        let (state, _rx) = watch::channel(DrainState::Accepting);
        Self {
            state: Arc::new(state),
            drain_timeout,
        }
    }

    pub fn state(&self) -> DrainState {
        *self.state.borrow()
    }

    /// Whether mutating control-plane requests may proceed
    pub fn is_accepting(&self) -> bool {
        self.state() == DrainState::Accepting
    }

    /// Resolves once the controller reaches `Stopped`
    pub async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == DrainState::Stopped).await;
    }

    /// Terminate/interrupt handling: cancel everything and stop now
    pub fn shutdown(&self, dispatcher: &RunDispatcher) {
        tracing::info!("Shutdown requested; cancelling outstanding work");
        dispatcher.cancel_all();
        self.state.send_replace(DrainState::Stopped);
    }

    /// Drain-signal handling. Only the first occurrence does anything.
    pub fn drain(&self, dispatcher: Arc<RunDispatcher>) {
        match self.state() {
            DrainState::Accepting => {
                self.state.send_replace(DrainState::Draining);
                tracing::info!("draining");

                let controller = self.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = dispatcher.wait_idle() => {
                            tracing::info!("All work finished before the drain timeout");
                        }
                        _ = tokio::time::sleep(controller.drain_timeout) => {
                            tracing::info!("Drain timeout expired; cancelling outstanding work");
                            dispatcher.cancel_all();
                            dispatcher.wait_idle().await;
                        }
                    }
                    controller.state.send_replace(DrainState::Stopped);
                });
            }
            DrainState::Draining | DrainState::Stopped => {
                tracing::info!("signal.ignored");
            }
        }
    }
}
