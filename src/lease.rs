//! Lease renewal.
//!
//! Every logged-in connection owns one [`LeaseRenewer`]: a tokio task that
//! sleeps for the current lease, renews it, and adopts the interval the
//! service returns. A renewal the service refuses ends the lease: the
//! renewer moves to [`RenewerState::Expired`] and fires its expiration
//! callback exactly once.
//!
//! # Stopping
//!
//! [`LeaseRenewer::stop`] is synchronous, idempotent and wakes a sleeping
//! renewer immediately. It may be called from any task, including from
//! inside the expiration callback. A renewal that completes concurrently
//! with `stop()` races through a single compare-and-set on the terminal
//! state; whichever side wins decides whether the callback runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::access_control::LeaseRenewal;
use crate::error::{BusError, BusResult};

/// Shortest interval the renewer will sleep between renewals.
pub const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(1);

/// Something whose lease can be renewed.
#[async_trait]
pub trait LeaseProvider: Send + Sync {
    async fn renew(&self) -> BusResult<LeaseRenewal>;
}

/// Why a lease ended.
#[derive(Debug)]
pub enum LeaseExpiry {
    NotRenewed,
    Rejected(BusError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewerState {
    Running,
    Stopped,
    Expired,
}

struct Shared {
    state: Mutex<RenewerState>,
    cancel: CancellationToken,
    attempts: AtomicU32,
}

impl Shared {
    /// Move from `Running` to `terminal`. Returns `false` if another
    /// terminal transition already happened.
    fn finish(&self, terminal: RenewerState) -> bool {
        let mut state = self.state.lock();
        if *state != RenewerState::Running {
            return false;
        }
        *state = terminal;
        drop(state);
        self.cancel.cancel();
        true
    }
}

/// Handle to a running renewal task.
pub struct LeaseRenewer {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaseRenewer {
    /// Spawn the renewal task on the current tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `provider` - Performs each renewal
    /// * `interval` - Initial lease (time until the first renewal)
    /// * `on_expired` - Runs at most once, on the renewer task, when the
    ///   lease ends because renewal was refused
    pub fn start<F>(provider: Arc<dyn LeaseProvider>, interval: Duration, on_expired: F) -> Self
    where
        F: FnOnce(LeaseExpiry) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(RenewerState::Running),
            cancel: CancellationToken::new(),
            attempts: AtomicU32::new(0),
        });
        let task = tokio::spawn(Self::run(
            Arc::clone(&shared),
            provider,
            interval.max(MIN_RENEW_INTERVAL),
            on_expired,
        ));
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run<F>(shared: Arc<Shared>, provider: Arc<dyn LeaseProvider>, mut interval: Duration, on_expired: F)
    where
        F: FnOnce(LeaseExpiry) + Send + 'static,
    {
        debug!(interval_secs = interval.as_secs(), "lease renewer started");
        let expiry = loop {
            tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let outcome = tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => return,
                outcome = provider.renew() => outcome,
            };
            let attempt = shared.attempts.fetch_add(1, Ordering::AcqRel) + 1;

            match outcome {
                Ok(LeaseRenewal::Renewed(secs)) => {
                    interval = Duration::from_secs(u64::from(secs)).max(MIN_RENEW_INTERVAL);
                    debug!(attempt, interval_secs = interval.as_secs(), "lease renewed");
                }
                Ok(LeaseRenewal::NotRenewed) => break LeaseExpiry::NotRenewed,
                Err(e) if e.is_login_failure() => break LeaseExpiry::Rejected(e),
                Err(e) if e.is_unavailable() => {
                    warn!(attempt, error = %e, "access control unreachable, retrying next interval");
                }
                Err(e) => {
                    error!(attempt, error = %e, "lease renewal failed, retrying next interval");
                }
            }
        };

        if shared.finish(RenewerState::Expired) {
            info!(?expiry, "lease expired");
            on_expired(expiry);
        }
    }

    /// Stop renewing. Idempotent; never blocks on the renewal task.
    pub fn stop(&self) {
        if self.shared.finish(RenewerState::Stopped) {
            debug!("lease renewer stopped");
        }
        // Detach; the task observes the cancellation on its own.
        self.task.lock().take();
    }

    pub fn state(&self) -> RenewerState {
        *self.shared.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == RenewerState::Running
    }

    /// Number of completed renewal attempts.
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::Acquire)
    }
}

impl Drop for LeaseRenewer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for LeaseRenewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseRenewer")
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish()
    }
}
