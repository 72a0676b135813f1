use std::{
    fmt, thread,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use log::debug;

use crate::error::TimerError;

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One-shot timers. The callback runs once, on a context of the service's
/// choosing, after `delay` has elapsed. Callbacks must never run inside
/// `start_one_shot` itself.
pub trait TimerService: Send + Sync {
    fn start_one_shot(
        &self,
        label: &'static str,
        delay: Duration,
        callback: TimerCallback,
    ) -> Result<TimerHandle, TimerError>;
}

/// Runs every armed timer on its own named thread. On ESP-IDF these are
/// pthread-backed FreeRTOS tasks, so the stack size matters.
#[derive(Debug)]
pub struct ThreadTimerService {
    stack_size: usize,
    next_id: AtomicU64,
}

impl ThreadTimerService {
    pub fn new(stack_size: usize) -> Self {
        Self {
            stack_size,
            next_id: AtomicU64::new(1),
        }
    }
}

impl TimerService for ThreadTimerService {
    fn start_one_shot(
        &self,
        label: &'static str,
        delay: Duration,
        callback: TimerCallback,
    ) -> Result<TimerHandle, TimerError> {
        let handle = TimerHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));

        thread::Builder::new()
            .name(label.into())
            .stack_size(self.stack_size)
            .spawn(move || {
                thread::sleep(delay);
                debug!("timer {label} {handle} expired after {delay:?}");
                callback();
            })?;

        Ok(handle)
    }
}
