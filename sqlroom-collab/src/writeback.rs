//! Coalescing write-back timer.
//!
//! ```text
//! arm(500ms)  arm(500ms)  arm(500ms)
//!     │           │           │
//!     ▼           ▼           ▼
//! ────●───────────●───────────●─────────────────● fire (once)
//!                             └──── 500ms ──────┘
//! ```
//!
//! One background task serves a whole burst: every `arm` moves the deadline
//! forward and the task keeps sleeping until the latest deadline has passed.
//! A re-arm that lands while the flush is running starts another cycle once
//! the flush completes, so no write is ever lost to a concurrent fire.

use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// The action performed when the timer fires.
pub type FlushFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct TimerState {
    deadline: Option<Instant>,
    task_running: bool,
}

pub struct CoalescingWriteBack {
    state: Arc<Mutex<TimerState>>,
    flush: FlushFn,
    fires: Arc<AtomicU64>,
}

impl CoalescingWriteBack {
    pub fn new(flush: FlushFn) -> Self {
        Self {
            state: Arc::new(Mutex::new(TimerState::default())),
            flush,
            fires: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Schedule a fire `delay` from now, superseding any earlier deadline.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm(&self, delay: Duration) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.deadline = Some(Instant::now() + delay);
        if state.task_running {
            return;
        }
        state.task_running = true;
        drop(state);

        let state = self.state.clone();
        let flush = self.flush.clone();
        let fires = self.fires.clone();
        tokio::spawn(run_timer(state, flush, fires));
    }

    /// Drop the pending deadline, if any. A flush already in progress is not
    /// interrupted.
    pub fn cancel(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .deadline = None;
    }

    pub fn is_pending(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .deadline
            .is_some()
    }

    /// How many times the flush action has run.
    pub fn fire_count(&self) -> u64 {
        self.fires.load(Ordering::SeqCst)
    }
}

async fn run_timer(state: Arc<Mutex<TimerState>>, flush: FlushFn, fires: Arc<AtomicU64>) {
    loop {
        let deadline = {
            let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
            match st.deadline {
                Some(deadline) => deadline,
                None => {
                    st.task_running = false;
                    return;
                }
            }
        };

        tokio::time::sleep_until(deadline).await;

        {
            let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
            match st.deadline {
                // Re-armed while sleeping.
                Some(latest) if latest > Instant::now() => continue,
                Some(_) => st.deadline = None,
                None => {
                    st.task_running = false;
                    return;
                }
            }
        }

        fires.fetch_add(1, Ordering::SeqCst);
        (flush)().await;
    }
}
