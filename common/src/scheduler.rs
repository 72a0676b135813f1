//! Single-flight deferred actions.
//!
//! Two slots exist: one for reboots and one shared by both reset kinds. A
//! slot holds at most one armed [`DeferredTimer`]; asking for another while it
//! is occupied fails with [`LifecycleError::Busy`]. The slot is cleared by the
//! timer's own fire path, after the action ran, even when the action unwinds.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::{info, warn};

use crate::{
    error::LifecycleError,
    timer::{TimerHandle, TimerService},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Reboot,
    WifiReset,
    FactoryReset,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reboot => "reboot",
            Self::WifiReset => "wifi_reset",
            Self::FactoryReset => "factory_reset",
        }
    }

    pub fn slot(self) -> TimerSlot {
        match self {
            Self::Reboot => TimerSlot::Reboot,
            Self::WifiReset | Self::FactoryReset => TimerSlot::Reset,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerSlot {
    Reboot,
    Reset,
}

impl TimerSlot {
    pub fn timer_label(self) -> &'static str {
        match self {
            Self::Reboot => "reboot-tm",
            Self::Reset => "reset-tm",
        }
    }
}

impl fmt::Display for TimerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reboot => f.write_str("reboot"),
            Self::Reset => f.write_str("reset"),
        }
    }
}

/// An armed, not yet fired, deferred action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredTimer {
    pub action_kind: ActionKind,
    pub fire_delay: Duration,
    /// `None` means the action does not end in a reboot.
    pub chained_reboot_delay: Option<Duration>,
    pub handle: TimerHandle,
}

#[derive(Debug, Default)]
struct Slots {
    reboot: Option<DeferredTimer>,
    reset: Option<DeferredTimer>,
}

impl Slots {
    fn get(&self, slot: TimerSlot) -> Option<DeferredTimer> {
        match slot {
            TimerSlot::Reboot => self.reboot,
            TimerSlot::Reset => self.reset,
        }
    }

    fn get_mut(&mut self, slot: TimerSlot) -> &mut Option<DeferredTimer> {
        match slot {
            TimerSlot::Reboot => &mut self.reboot,
            TimerSlot::Reset => &mut self.reset,
        }
    }
}

#[derive(Clone)]
pub struct Scheduler {
    slots: Arc<Mutex<Slots>>,
    timers: Arc<dyn TimerService>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("slots", &*self.lock_slots())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(timers: Arc<dyn TimerService>) -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots::default())),
            timers,
        }
    }

    pub fn pending(&self, slot: TimerSlot) -> Option<DeferredTimer> {
        self.lock_slots().get(slot)
    }

    /// Arms a one-shot timer for `action_kind`. `on_fire` receives the carried
    /// chained reboot delay and runs on the timer's context.
    ///
    /// The slot lock is held from the occupancy check until the handle is
    /// stored, so two racing callers can never both see a free slot.
    pub fn arm<F>(
        &self,
        action_kind: ActionKind,
        fire_delay: Duration,
        chained_reboot_delay: Option<Duration>,
        on_fire: F,
    ) -> Result<DeferredTimer, LifecycleError>
    where
        F: FnOnce(Option<Duration>) + Send + 'static,
    {
        let slot = action_kind.slot();
        let mut slots = self.lock_slots();

        if let Some(pending) = slots.get(slot) {
            warn!(
                "{action_kind} rejected: {} already pending on timer {}",
                pending.action_kind, pending.handle
            );
            return Err(LifecycleError::Busy(slot));
        }

        let scheduler = self.clone();
        let callback = Box::new(move || {
            let fired = scheduler.pending(slot);
            let _release = SlotRelease {
                slots: scheduler.slots.clone(),
                slot,
                handle: fired.map(|timer| timer.handle),
            };
            info!("{action_kind} timer fired");
            on_fire(chained_reboot_delay);
        });

        let handle = self
            .timers
            .start_one_shot(slot.timer_label(), fire_delay, callback)
            .map_err(|err| {
                warn!("failed to arm {action_kind} timer: {err}");
                LifecycleError::OutOfResources(err)
            })?;

        let timer = DeferredTimer {
            action_kind,
            fire_delay,
            chained_reboot_delay,
            handle,
        };
        *slots.get_mut(slot) = Some(timer);

        info!(
            "{action_kind} scheduled in {}s on timer {handle} (chained reboot: {})",
            fire_delay.as_secs_f32(),
            describe_chained(chained_reboot_delay)
        );
        Ok(timer)
    }

    fn lock_slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the slot when the fire path ends, however it ends.
struct SlotRelease {
    slots: Arc<Mutex<Slots>>,
    slot: TimerSlot,
    handle: Option<TimerHandle>,
}

impl Drop for SlotRelease {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = slots.get_mut(self.slot);
        if let Some(handle) = self.handle {
            if entry.is_some_and(|timer| timer.handle == handle) {
                *entry = None;
            }
        }
    }
}

pub(crate) fn describe_chained(delay: Option<Duration>) -> String {
    match delay {
        Some(delay) => format!("after {}s", delay.as_secs_f32()),
        None => "none".to_string(),
    }
}
