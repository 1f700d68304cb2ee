//! Bounded polling for eventually consistent backends.
//!
//! Both workflows wait on state they do not control: snapshots that are not
//! yet visible, backups still uploading, volumes still rebuilding. Every wait
//! goes through [`poll_until`], which sleeps a fixed interval between probes,
//! gives up at a deadline, and stops early when the run is cancelled.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tracing::debug;

/// Interval and deadline applied to one kind of wait.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Delay between consecutive probes.
    pub interval: Duration,
    /// Total time allowed before the wait fails with [`WaitError::Timeout`].
    pub timeout: Duration,
}

impl PollPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Errors raised when a wait ends without its condition being met.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum WaitError {
    /// The deadline passed while the condition was still pending.
    #[error("timed out after {}s waiting for {action}: {last_state}", .waited.as_secs())]
    Timeout {
        /// What was being waited on.
        action: String,
        /// Time spent waiting.
        waited: Duration,
        /// Last pending reason reported by the probe.
        last_state: String,
    },
    /// The run was cancelled while waiting.
    #[error("cancelled while waiting for {action}")]
    Cancelled {
        /// What was being waited on.
        action: String,
    },
}

/// Result of a single probe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Probe<T> {
    /// The condition holds; the wait returns this value.
    Ready(T),
    /// The condition does not hold yet, for the given reason.
    Pending(String),
}

/// Owner side of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    /// Creates a handle that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(false);
        Self { sender }
    }

    /// Returns a token observing this handle.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            receiver: self.sender.subscribe(),
        }
    }

    /// Cancels every wait observing this handle, now and in the future.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a cancellation signal.
#[derive(Clone, Debug)]
pub struct CancelToken {
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    /// Returns a token that can never be cancelled.
    #[must_use]
    pub fn never() -> Self {
        let (_sender, receiver) = watch::channel(false);
        Self { receiver }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves when the
    /// owning handle is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Fails with [`WaitError::Cancelled`] when cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Cancelled`] naming `action`.
    pub fn check(&self, action: &str) -> Result<(), WaitError> {
        if self.is_cancelled() {
            return Err(WaitError::Cancelled {
                action: action.to_owned(),
            });
        }
        Ok(())
    }
}

/// Probes until the condition holds, the policy deadline passes, or `cancel`
/// fires.
///
/// The probe runs at least once. Probe errors are returned immediately; a
/// probe that wants a condition retried reports [`Probe::Pending`] instead.
///
/// # Errors
///
/// Returns the probe's error, or [`WaitError::Timeout`] /
/// [`WaitError::Cancelled`] converted into `E`.
pub async fn poll_until<T, E, F, Fut>(
    policy: &PollPolicy,
    cancel: &CancelToken,
    action: &str,
    mut probe: F,
) -> Result<T, E>
where
    E: From<WaitError>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T>, E>>,
{
    let started = Instant::now();
    // A timeout too large to represent as an instant never expires.
    let deadline = started.checked_add(policy.timeout);

    loop {
        cancel.check(action)?;

        let reason = match probe().await? {
            Probe::Ready(value) => return Ok(value),
            Probe::Pending(reason) => reason,
        };
        debug!(action, %reason, "condition pending");

        let now = Instant::now();
        let remaining = deadline.map(|limit| limit.saturating_duration_since(now));
        if remaining.is_some_and(|left| left.is_zero()) {
            return Err(WaitError::Timeout {
                action: action.to_owned(),
                waited: now.duration_since(started),
                last_state: reason,
            }
            .into());
        }

        let pause = remaining.map_or(policy.interval, |left| policy.interval.min(left));
        tokio::select! {
            () = sleep(pause) => {}
            () = cancel.cancelled() => {
                return Err(WaitError::Cancelled {
                    action: action.to_owned(),
                }
                .into());
            }
        }
    }
}
