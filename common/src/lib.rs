pub mod button;
pub mod command;
pub mod config;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod platform;
pub mod scheduler;
pub mod timer;

#[cfg(test)]
mod testing;

pub use button::{
    wake_channel, ClassifierState, LongPressClassifier, PressSource, PressThresholds, PressTier,
    WakeNotifier, WakeReceiver,
};
pub use command::{decode_command, Command, CommandDispatcher, CommandName, DispatchOutcome};
pub use config::{
    ButtonConfig, CommandConfig, NetworkConfig, RuntimeConfig, TimerConfig, TransportConfig,
};
pub use error::{IdentityError, LifecycleError, PlatformError, PublishError, TimerError};
pub use identity::DeviceIdentity;
pub use lifecycle::{chained_reboot_from_secs, Lifecycle, Scheduled};
pub use platform::{AckPublisher, Clock, DevicePlatform, MonotonicClock};
pub use scheduler::{ActionKind, DeferredTimer, TimerSlot};
pub use timer::{ThreadTimerService, TimerCallback, TimerHandle, TimerService};
