use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use cloudhop_services::ServiceError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::WaitPolicy;

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("{resource} did not reach {desired} after {attempts} polls (last status {last_status})")]
    Exhausted {
        resource: String,
        desired: String,
        last_status: String,
        attempts: u32,
    },
    #[error("{resource} entered failure status {status}")]
    ResourceFailed { resource: String, status: String },
    #[error("wait cancelled")]
    Cancelled,
    #[error(transparent)]
    Status(#[from] ServiceError),
}

/// Polls a resource until it reports the desired status.
#[derive(Debug, Clone)]
pub struct StatusWaiter {
    policy: WaitPolicy,
}

impl StatusWaiter {
    pub fn new(policy: WaitPolicy) -> Self {
        Self { policy }
    }

    fn schedule(&self) -> ExponentialBackoff {
        let interval = Duration::from_millis(self.policy.interval_ms);
        ExponentialBackoff {
            current_interval: interval,
            initial_interval: interval,
            randomization_factor: 0.0,
            multiplier: self.policy.multiplier.max(1.0),
            max_interval: Duration::from_millis(self.policy.max_interval_ms).max(interval),
            max_elapsed_time: (self.policy.max_duration_secs > 0)
                .then(|| Duration::from_secs(self.policy.max_duration_secs)),
            ..ExponentialBackoff::default()
        }
    }

    /// Runs `fetch_status` until it returns `desired`. Failure statuses end the wait
    /// early; exhausting the attempt or duration budget is an error.
    pub async fn wait_for<F, Fut>(
        &self,
        resource: &str,
        desired: &str,
        cancel: &CancellationToken,
        mut fetch_status: F,
    ) -> Result<String, WaitError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<String, ServiceError>>,
    {
        let mut schedule = self.schedule();
        let mut attempts = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled);
            }
            let status = fetch_status().await?;
            attempts += 1;
            if status == desired {
                info!(resource = %resource, status = %status, attempts, "resource ready");
                return Ok(status);
            }
            if self.policy.failure_statuses.iter().any(|failed| *failed == status) {
                return Err(WaitError::ResourceFailed {
                    resource: resource.to_string(),
                    status,
                });
            }

            let exhausted = || WaitError::Exhausted {
                resource: resource.to_string(),
                desired: desired.to_string(),
                last_status: status.clone(),
                attempts,
            };
            if self.policy.max_attempts > 0 && attempts >= self.policy.max_attempts {
                return Err(exhausted());
            }
            let Some(delay) = schedule.next_backoff() else {
                return Err(exhausted());
            };
            debug!(resource = %resource, status = %status, desired = %desired, ?delay, "waiting");
            tokio::select! {
                _ = cancel.cancelled() => return Err(WaitError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use cloudhop_services::ServiceError;
    use tokio_util::sync::CancellationToken;

    use super::{StatusWaiter, WaitError};
    use crate::config::WaitPolicy;

    fn policy(max_attempts: u32) -> WaitPolicy {
        WaitPolicy {
            interval_ms: 1,
            max_attempts,
            ..WaitPolicy::default()
        }
    }

    async fn status_sequence(
        polls: &AtomicU32,
        ready_after: u32,
    ) -> Result<String, ServiceError> {
        let seen = polls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(if seen >= ready_after { "available" } else { "creating" }.to_string())
    }

    #[tokio::test]
    async fn returns_once_status_matches() {
        let polls = AtomicU32::new(0);
        let waiter = StatusWaiter::new(policy(0));

        let status = waiter
            .wait_for("volume vol-1", "available", &CancellationToken::new(), || {
                status_sequence(&polls, 3)
            })
            .await
            .expect("ready");

        assert_eq!(status, "available");
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let polls = AtomicU32::new(0);
        let waiter = StatusWaiter::new(policy(2));

        let err = waiter
            .wait_for("volume vol-1", "available", &CancellationToken::new(), || {
                status_sequence(&polls, 10)
            })
            .await
            .expect_err("exhausted");

        assert!(matches!(err, WaitError::Exhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn failure_status_ends_wait() {
        let waiter = StatusWaiter::new(policy(0));

        let err = waiter
            .wait_for("server srv-1", "ACTIVE", &CancellationToken::new(), || async {
                Ok::<_, ServiceError>("ERROR".to_string())
            })
            .await
            .expect_err("failed");

        assert!(matches!(err, WaitError::ResourceFailed { ref status, .. } if status == "ERROR"));
    }

    #[tokio::test]
    async fn cancelled_token_stops_polling() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let waiter = StatusWaiter::new(policy(0));

        let err = waiter
            .wait_for("server srv-1", "ACTIVE", &cancel, || async {
                Ok::<_, ServiceError>("BUILD".to_string())
            })
            .await
            .expect_err("cancelled");

        assert!(matches!(err, WaitError::Cancelled));
    }
}
