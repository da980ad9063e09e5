//! Backoff-driven retry timer.
//!
//! A [`RetryTimer`] runs a callback once after a delay that depends on how
//! many times it has already fired. It drives both socket reconnects and
//! channel rejoins, each with its own timer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Maps an attempt number (starting at 1) to the delay before that attempt.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Default stepped backoff: 1s, 2s, 5s, 10s, then 10s forever.
#[must_use]
pub fn stepped_backoff(attempt: u32) -> Duration {
    let secs = match attempt {
        0 | 1 => 1,
        2 => 2,
        3 => 5,
        _ => 10,
    };
    Duration::from_secs(secs)
}

/// The default [`BackoffFn`].
#[must_use]
pub fn default_backoff() -> BackoffFn {
    Arc::new(stepped_backoff)
}

/// One-shot timer with backoff.
///
/// [`schedule`](Self::schedule) replaces any pending run; the attempt counter
/// is bumped right before the callback runs. [`reset`](Self::reset) cancels
/// and starts over from the first attempt.
pub struct RetryTimer {
    callback: Arc<dyn Fn() + Send + Sync>,
    delay: BackoffFn,
    attempts: Arc<AtomicU32>,
    pending: Option<JoinHandle<()>>,
}

impl RetryTimer {
    /// Create a timer. Nothing runs until [`schedule`](Self::schedule).
    #[must_use]
    pub fn new(callback: impl Fn() + Send + Sync + 'static, delay: BackoffFn) -> Self {
        Self {
            callback: Arc::new(callback),
            delay,
            attempts: Arc::new(AtomicU32::new(0)),
            pending: None,
        }
    }

    /// Arm the timer for the next attempt, cancelling any pending one.
    pub fn schedule(&mut self) {
        self.cancel();

        let attempts = Arc::clone(&self.attempts);
        let callback = Arc::clone(&self.callback);
        let delay = (self.delay)(attempts.load(Ordering::SeqCst).saturating_add(1));
        let deadline = Instant::now() + delay;

        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            attempts.fetch_add(1, Ordering::SeqCst);
            callback();
        }));
    }

    /// Cancel pending work and zero the attempt counter.
    pub fn reset(&mut self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.cancel();
    }

    /// Number of times the callback has fired since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Whether a run is armed and has not fired yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn cancel(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }
}

impl Drop for RetryTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
