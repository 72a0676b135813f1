//! Deterministic doubles for the collaborator traits.

use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::{
    button::PressSource,
    error::{PlatformError, PublishError, TimerError},
    lifecycle::Lifecycle,
    platform::{AckPublisher, Clock, DevicePlatform},
    timer::{TimerCallback, TimerHandle, TimerService},
};

/// Panic payload standing in for a device restart.
#[derive(Debug)]
pub struct Restarted;

/// Runs `f` and reports whether it ended in a simulated restart. Any other
/// panic is propagated.
pub fn expect_restart<F: FnOnce()>(f: F) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => false,
        Err(payload) if payload.is::<Restarted>() => true,
        Err(payload) => panic::resume_unwind(payload),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformCall {
    RestoreNetwork,
    DeinitStorage,
    EraseStorage,
    Restart,
}

#[derive(Debug, Default)]
pub struct MockPlatform {
    calls: Mutex<Vec<PlatformCall>>,
    storage_fails: AtomicBool,
}

impl MockPlatform {
    pub fn calls(&self) -> Vec<PlatformCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_storage(&self) {
        self.storage_fails.store(true, Ordering::SeqCst);
    }

    fn record(&self, call: PlatformCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn storage_result(&self) -> Result<(), PlatformError> {
        if self.storage_fails.load(Ordering::SeqCst) {
            Err(PlatformError::Storage("flash write protected".into()))
        } else {
            Ok(())
        }
    }
}

impl DevicePlatform for MockPlatform {
    fn restore_network_defaults(&self) -> Result<(), PlatformError> {
        self.record(PlatformCall::RestoreNetwork);
        Ok(())
    }

    fn deinit_storage(&self) -> Result<(), PlatformError> {
        self.record(PlatformCall::DeinitStorage);
        self.storage_result()
    }

    fn erase_storage(&self) -> Result<(), PlatformError> {
        self.record(PlatformCall::EraseStorage);
        self.storage_result()
    }

    fn restart(&self) -> ! {
        self.record(PlatformCall::Restart);
        panic::panic_any(Restarted)
    }
}

struct ArmedTimer {
    delay: Duration,
    callback: TimerCallback,
}

/// Timer service whose timers only fire when a test says so.
#[derive(Default)]
pub struct ManualTimers {
    armed: Mutex<VecDeque<ArmedTimer>>,
    next_id: AtomicU64,
    fail_next: AtomicBool,
}

impl ManualTimers {
    pub fn fail_next_start(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn armed_count(&self) -> usize {
        self.armed.lock().unwrap().len()
    }

    pub fn armed_delays(&self) -> Vec<Duration> {
        self.armed.lock().unwrap().iter().map(|t| t.delay).collect()
    }

    /// Fires the oldest armed timer on the calling thread.
    pub fn fire_next(&self) -> bool {
        // Released before the callback runs; callbacks may arm new timers.
        let next = self.armed.lock().unwrap().pop_front();
        match next {
            Some(timer) => {
                (timer.callback)();
                true
            }
            None => false,
        }
    }
}

impl TimerService for ManualTimers {
    fn start_one_shot(
        &self,
        _label: &'static str,
        delay: Duration,
        callback: TimerCallback,
    ) -> Result<TimerHandle, TimerError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(TimerError::Exhausted);
        }
        let handle = TimerHandle::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.armed.lock().unwrap().push_back(ArmedTimer {
            delay,
            callback,
        });
        Ok(handle)
    }
}

pub fn lifecycle_with_mocks() -> (Lifecycle, Arc<MockPlatform>, Arc<ManualTimers>) {
    let platform = Arc::new(MockPlatform::default());
    let timers = Arc::new(ManualTimers::default());
    let lifecycle = Lifecycle::new(platform.clone(), timers.clone());
    (lifecycle, platform, timers)
}

#[derive(Debug, Clone, Default)]
pub struct FakeClock(Arc<Mutex<Duration>>);

impl FakeClock {
    pub fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Duration {
        *self.0.lock().unwrap()
    }
}

/// Replays presses of fixed lengths. Every poll of an asserted input moves
/// the shared clock forward by one millisecond.
pub struct ScriptedPresses {
    presses: VecDeque<Duration>,
    remaining: Mutex<Duration>,
    clock: FakeClock,
}

impl ScriptedPresses {
    pub fn new(clock: FakeClock, presses: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            presses: presses.into_iter().collect(),
            remaining: Mutex::new(Duration::ZERO),
            clock,
        }
    }
}

impl PressSource for ScriptedPresses {
    fn wait_for_edge(&mut self) -> bool {
        match self.presses.pop_front() {
            Some(held) => {
                *self.remaining.lock().unwrap() = held;
                true
            }
            None => false,
        }
    }

    fn is_asserted(&self) -> bool {
        let mut remaining = self.remaining.lock().unwrap();
        if remaining.is_zero() {
            return false;
        }
        let step = (*remaining).min(Duration::from_millis(1));
        *remaining -= step;
        self.clock.advance(step);
        true
    }
}

#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(String, String)>>,
    fails: AtomicBool,
}

impl RecordingPublisher {
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }

    pub fn fail(&self) {
        self.fails.store(true, Ordering::SeqCst);
    }
}

impl AckPublisher for RecordingPublisher {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        if self.fails.load(Ordering::SeqCst) {
            return Err(PublishError {
                topic: topic.to_string(),
                reason: "not connected".into(),
            });
        }
        self.published.lock().unwrap().push((
            topic.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
        ));
        Ok(())
    }
}
