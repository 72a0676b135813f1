use thiserror::Error;

use crate::scheduler::TimerSlot;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("a {0} action is already pending")]
    Busy(TimerSlot),
    #[error("failed to arm deferred action: {0}")]
    OutOfResources(#[from] TimerError),
    #[error("malformed command payload: {0}")]
    MalformedInput(String),
    #[error("transport failure: {0}")]
    TransportFatal(String),
}

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("timer task could not be spawned: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("timer service exhausted")]
    Exhausted,
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("network credential reset failed: {0}")]
    Credentials(String),
    #[error("persistent storage operation failed: {0}")]
    Storage(String),
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("device document is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("device document has no usable `name`")]
    MissingName,
}

#[derive(Debug, Error)]
#[error("acknowledgement publish to `{topic}` failed: {reason}")]
pub struct PublishError {
    pub topic: String,
    pub reason: String,
}
