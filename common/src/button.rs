//! Long-press classifier for the boot button.
//!
//! The edge interrupt only posts a wake notification. The classifier task
//! then busy-polls the input level until release and maps the held duration
//! onto an action tier:
//!
//! | Held            | Tier          | Action                               |
//! |-----------------|---------------|--------------------------------------|
//! | `>= 10s`        | FactoryReset  | factory reset now, reboot now        |
//! | `3s ..< 10s`    | WifiReset     | Wi-Fi reset now, reboot now          |
//! | `1s ..< 3s`     | Reserved      | logged only                          |
//! | `< 1s`          | Click         | none                                 |

use std::{
    hint,
    sync::mpsc::{self, Receiver, SyncSender, TrySendError},
    time::Duration,
};

use log::{debug, info, warn};

use crate::{config::ButtonConfig, lifecycle::Lifecycle, platform::Clock};

pub trait PressSource {
    /// Blocks until an edge is signalled. Returns `false` once the source is
    /// gone and no further presses can arrive.
    fn wait_for_edge(&mut self) -> bool;

    fn is_asserted(&self) -> bool;
}

/// Sending half of the single-slot wake channel. Safe to call from contexts
/// that must not block: a signal that finds the slot full is dropped.
#[derive(Debug, Clone)]
pub struct WakeNotifier(SyncSender<()>);

impl WakeNotifier {
    pub fn notify(&self) -> bool {
        match self.0.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) | Err(TrySendError::Disconnected(())) => false,
        }
    }
}

#[derive(Debug)]
pub struct WakeReceiver(Receiver<()>);

impl WakeReceiver {
    pub fn wait(&self) -> bool {
        self.0.recv().is_ok()
    }
}

pub fn wake_channel() -> (WakeNotifier, WakeReceiver) {
    let (tx, rx) = mpsc::sync_channel(1);
    (WakeNotifier(tx), WakeReceiver(rx))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressTier {
    Click,
    Reserved,
    WifiReset,
    FactoryReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressThresholds {
    pub reserved: Duration,
    pub wifi_reset: Duration,
    pub factory_reset: Duration,
}

impl Default for PressThresholds {
    fn default() -> Self {
        Self::from(&ButtonConfig::default())
    }
}

impl From<&ButtonConfig> for PressThresholds {
    fn from(config: &ButtonConfig) -> Self {
        Self {
            reserved: Duration::from_millis(config.reserved_ms),
            wifi_reset: Duration::from_millis(config.wifi_reset_ms),
            factory_reset: Duration::from_millis(config.factory_reset_ms),
        }
    }
}

impl PressThresholds {
    pub fn classify(&self, held: Duration) -> PressTier {
        if held >= self.factory_reset {
            PressTier::FactoryReset
        } else if held >= self.wifi_reset {
            PressTier::WifiReset
        } else if held >= self.reserved {
            PressTier::Reserved
        } else {
            PressTier::Click
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierState {
    Idle,
    Timing { start: Duration },
    Dispatched(PressTier),
}

pub struct LongPressClassifier<S, C> {
    source: S,
    clock: C,
    thresholds: PressThresholds,
    lifecycle: Lifecycle,
    state: ClassifierState,
}

impl<S: PressSource, C: Clock> LongPressClassifier<S, C> {
    pub fn new(source: S, clock: C, thresholds: PressThresholds, lifecycle: Lifecycle) -> Self {
        Self {
            source,
            clock,
            thresholds,
            lifecycle,
            state: ClassifierState::Idle,
        }
    }

    pub fn state(&self) -> ClassifierState {
        self.state
    }

    /// Supervises the button for the life of the firmware. Returns only if the
    /// press source disappears.
    pub fn run(&mut self) {
        while self.process_next_press().is_some() {}
        warn!("button press source closed; long-press classifier stopped");
    }

    pub fn process_next_press(&mut self) -> Option<PressTier> {
        self.state = ClassifierState::Idle;
        if !self.source.wait_for_edge() {
            return None;
        }

        let start = self.clock.now();
        self.state = ClassifierState::Timing { start };
        info!("button press started at {}s", start.as_secs());

        while self.source.is_asserted() {
            hint::spin_loop();
        }

        let held = self.clock.now().saturating_sub(start);
        info!("button held for {}s", held.as_secs());

        let tier = self.thresholds.classify(held);
        self.state = ClassifierState::Dispatched(tier);
        self.dispatch(tier);
        Some(tier)
    }

    fn dispatch(&self, tier: PressTier) {
        let result = match tier {
            PressTier::FactoryReset => {
                warn!("~~~~~~~~~~~~ FACTORY RESETTING ~~~~~~~~~~~~");
                self.lifecycle
                    .factory_reset(Duration::ZERO, Some(Duration::ZERO))
            }
            PressTier::WifiReset => {
                warn!("~~~~~~~~~~~~ RESETTING WIFI ~~~~~~~~~~~~");
                self.lifecycle.wifi_reset(Duration::ZERO, Some(Duration::ZERO))
            }
            PressTier::Reserved => {
                info!("~~~~~~~~~~~~ POWER CHANGE ~~~~~~~~~~~~");
                return;
            }
            PressTier::Click => {
                debug!("short click ignored");
                return;
            }
        };

        if let Err(err) = result {
            warn!("button action {tier:?} not performed: {err}");
        }
    }
}
