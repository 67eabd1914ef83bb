// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Status polling with bounded exponential backoff.
//!
//! A probe is an idempotent read. It is retried while the resource is still
//! converging or the read failed transiently; any other error ends polling
//! at once. Polling gives up with `PlatformError::Timeout` when the status
//! timeout has been spent.

use crate::domain::platform::{PlatformError, PollingPolicy};
use metrics::counter;
use std::future::Future;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    /// Not there yet; the string describes the observed state.
    Pending(String),
}

#[derive(Debug, Clone, Copy)]
pub struct StatusPoller {
    policy: PollingPolicy,
}

impl StatusPoller {
    pub fn new(policy: PollingPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PollingPolicy {
        &self.policy
    }

    pub async fn poll<T, F, Fut>(&self, what: &str, mut probe: F) -> Result<T, PlatformError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<PollOutcome<T>, PlatformError>>,
    {
        let deadline = Instant::now() + self.policy.status_timeout;
        let mut attempt = 0u32;

        loop {
            counter!("appbroker_status_polls_total").increment(1);
            let observed = match probe().await {
                Ok(PollOutcome::Ready(value)) => return Ok(value),
                Ok(PollOutcome::Pending(state)) => state,
                Err(e) if e.is_transient() => {
                    warn!(what, attempt, error = %e, "Transient error while polling status");
                    e.to_string()
                }
                Err(e) => return Err(e),
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PlatformError::Timeout(format!(
                    "{} did not settle within {:?} (last observed: {})",
                    what, self.policy.status_timeout, observed
                )));
            }

            let delay = self.policy.delay_for_attempt(attempt).min(remaining);
            debug!(what, attempt, ?delay, observed = %observed, "Status not settled, backing off");
            sleep(delay).await;
            attempt += 1;
        }
    }
}
