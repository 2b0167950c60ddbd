use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Timer capability used by the typing debounce/expiry logic. Abstracted so
/// tests can drive expiries with paused tokio time instead of wall-clock
/// waits.
pub trait Scheduler: Send + Sync {
    fn after(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle;
}

/// Cancellation handle for a scheduled task. Dropping the handle cancels the
/// timer; a fired timer ignores later cancellation.
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn after(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                task();
            }
        });
        TimerHandle {
            cancelled,
            task: handle,
        }
    }
}
