//! Scheduled token renewal
//!
//! Calls `ensure_token(false)` on a fixed period shorter than the token's
//! usable window, so foreground requests rarely have to wait on a refresh.
//! Failures are only logged. After a permanent failure the scheduler goes
//! dormant until the next interactive login.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use super::lifecycle::{RenewalSignal, TokenManager};

/// What a single renewal tick achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// A usable token is available.
    Renewed,
    /// Transient failure; the next tick tries again.
    RetryLater,
    /// Permanent failure; no more ticks until an interactive login.
    Stopped,
}

pub struct RenewalScheduler {
    manager: TokenManager,
    period: Duration,
}

impl RenewalScheduler {
    pub fn new(manager: TokenManager, period: Duration) -> Self {
        Self { manager, period }
    }

    /// Run the scheduler on the tokio runtime until the handle is dropped.
    pub fn spawn(self) -> RenewalHandle {
        tracing::info!("Scheduled renewal every {}s", self.period.as_secs());
        RenewalHandle {
            task: tokio::spawn(self.run()),
        }
    }

    pub async fn renew_once(&self) -> RenewalOutcome {
        match self.manager.ensure_token(false).await {
            Ok(_) => {
                tracing::debug!("Scheduled renewal: token is valid");
                RenewalOutcome::Renewed
            }
            Err(e) if e.is_permanent() => {
                tracing::warn!("Scheduled renewal stopped: {}. Waiting for a new login.", e);
                RenewalOutcome::Stopped
            }
            Err(e) if e.is_transient() => {
                tracing::warn!("Scheduled renewal failed: {}. Retrying next period.", e);
                RenewalOutcome::RetryLater
            }
            Err(e) => {
                tracing::warn!("Scheduled renewal refused by provider: {}. Retrying next period.", e);
                RenewalOutcome::RetryLater
            }
        }
    }

    async fn run(self) {
        let mut signals = self.manager.renewal_signals();
        let _ = signals.borrow_and_update();
        let mut active = self.manager.is_logged_in();

        loop {
            if !active {
                tracing::debug!("Scheduled renewal dormant");
                if signals.changed().await.is_err() {
                    return;
                }
                active = matches!(*signals.borrow_and_update(), RenewalSignal::Active(_));
                continue;
            }

            let mut ticker = time::interval_at(Instant::now() + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            active = loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.renew_once().await == RenewalOutcome::Stopped {
                            break false;
                        }
                    }
                    changed = signals.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if *signals.borrow_and_update() == RenewalSignal::Suspended {
                            tracing::info!("Scheduled renewal suspended");
                            break false;
                        }
                        // Fresh login: restart the period from now.
                        break true;
                    }
                }
            };
        }
    }
}

/// Owns the background renewal task; dropping it stops the task.
pub struct RenewalHandle {
    task: JoinHandle<()>,
}

impl RenewalHandle {
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for RenewalHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
