use std::{
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use crate::error::{PlatformError, PublishError};

/// Destructive device primitives the lifecycle operations are built from.
pub trait DevicePlatform: Send + Sync {
    /// Forget stored network credentials and return the radio to defaults.
    fn restore_network_defaults(&self) -> Result<(), PlatformError>;

    fn deinit_storage(&self) -> Result<(), PlatformError>;

    /// Must tolerate being called on already-erased storage.
    fn erase_storage(&self) -> Result<(), PlatformError>;

    /// Terminate and restart the running firmware.
    fn restart(&self) -> !;
}

pub trait AckPublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;
}

impl<T: AckPublisher + ?Sized> AckPublisher for Arc<T> {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        (**self).publish(topic, payload)
    }
}

pub trait Clock: Send {
    /// Monotonic time since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        static START: OnceLock<Instant> = OnceLock::new();
        START.get_or_init(Instant::now).elapsed()
    }
}
