//! Timer service shared by the reassembly cache and SCCP management
//!
//! Callbacks run on their own task. A cancelled timer may still fire if it
//! was already running, so owners re-check their own state (generation,
//! entity lock) inside the callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Work executed when a timer expires
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Schedules one-shot callbacks
pub trait TimerService: Send + Sync {
    /// Run `callback` at `deadline`
    fn schedule_at(&self, deadline: Instant, callback: TimerCallback) -> TimerHandle;

    /// Run `callback` after `delay`
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        self.schedule_at(Instant::now() + delay, callback)
    }
}

/// Handle to a scheduled timer
#[derive(Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl TimerHandle {
    /// Cancel the timer. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Timer service backed by tokio tasks
#[derive(Clone)]
pub struct TokioTimerService {
    handle: Handle,
}

impl TokioTimerService {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl TimerService for TokioTimerService {
    fn schedule_at(&self, deadline: Instant, callback: TimerCallback) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();

        let task = self.handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if !flag.load(Ordering::Acquire) {
                callback();
            }
        });

        TimerHandle {
            cancelled,
            abort: Some(task.abort_handle()),
        }
    }
}
