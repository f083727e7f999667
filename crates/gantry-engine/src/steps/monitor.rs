//! Health-monitored execution
//!
//! Runs the wrapped step while polling a health endpoint on a fixed
//! interval. Consecutive successes past the healthy threshold mark the
//! workload healthy; consecutive failures past the unhealthy threshold
//! notify the unhealthy URL, cancel the wrapped step, and fail the
//! monitor. Polling stops the moment the wrapped step returns.

use super::{Result, SharedStep, Step, StepError};
use crate::cancel::CancelToken;
use std::time::Duration;

/// Transport budget for a single health poll
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

pub struct MonitorStep {
    child: SharedStep,
    healthy_url: Option<String>,
    unhealthy_url: Option<String>,
    healthy_threshold: u32,
    unhealthy_threshold: u32,
    interval: Duration,
    client: reqwest::Client,
    cancel: CancelToken,
}

impl MonitorStep {
    pub fn new(
        child: SharedStep,
        healthy_url: Option<String>,
        unhealthy_url: Option<String>,
        healthy_threshold: u32,
        unhealthy_threshold: u32,
        interval: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(POLL_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            child,
            healthy_url,
            unhealthy_url,
            healthy_threshold,
            unhealthy_threshold,
            interval,
            client,
            cancel: CancelToken::new(),
        }
    }

    async fn poll_health(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn notify_unhealthy(&self) {
        if let Some(url) = &self.unhealthy_url {
            if let Err(e) = self.client.put(url).send().await {
                tracing::debug!(url = %url, error = %e, "Unhealthy notification failed");
            }
        }
    }
}

#[async_trait::async_trait]
impl Step for MonitorStep {
    async fn perform(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        let child = self.child.clone();
        let mut workload = tokio::spawn(async move { child.perform().await });

        let mut consecutive_successes = 0u32;
        let mut consecutive_failures = 0u32;
        let mut reported_healthy = false;

        loop {
            tokio::select! {
                joined = &mut workload => {
                    return match joined {
                        Ok(result) => result,
                        Err(_) => Err(StepError::Cancelled),
                    };
                }
                _ = self.cancel.cancelled() => {
                    self.child.cancel();
                    return match workload.await {
                        Ok(Err(error)) => Err(error),
                        _ => Err(StepError::Cancelled),
                    };
                }
                _ = tokio::time::sleep(self.interval) => {
                    let Some(url) = &self.healthy_url else { continue };

                    if self.poll_health(url).await {
                        consecutive_failures = 0;
                        consecutive_successes += 1;
                        if consecutive_successes >= self.healthy_threshold && !reported_healthy {
                            tracing::info!(url = %url, "Workload became healthy");
                            reported_healthy = true;
                        }
                    } else {
                        consecutive_successes = 0;
                        consecutive_failures += 1;
                        if consecutive_failures >= self.unhealthy_threshold {
                            tracing::warn!(url = %url, failures = consecutive_failures, "Workload unhealthy");
                            self.notify_unhealthy().await;
                            self.child.cancel();
                            let _ = workload.await;
                            return Err(StepError::HealthCheckFailed);
                        }
                    }
                }
            }
        }
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn cleanup(&self) {
        self.child.cleanup().await;
    }
}
