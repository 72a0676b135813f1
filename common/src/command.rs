//! Cloud command dispatch.
//!
//! Each inbound message carries one command as the first field of a JSON
//! object, e.g. `{"wifi_reset": 1}`. Every recognised command is echoed back
//! on the device's publish topic; only a value of `1` triggers the action.

use std::{fmt, sync::Arc, time::Duration};

use log::{debug, info, warn};
use serde::{
    de::{IgnoredAny, MapAccess, Visitor},
    Deserialize, Deserializer,
};
use serde_json::Value;

use crate::{
    config::CommandConfig,
    error::LifecycleError,
    identity::DeviceIdentity,
    lifecycle::{chained_reboot_from_secs, Lifecycle},
    platform::AckPublisher,
};

pub const MAX_COMMAND_PAYLOAD_BYTES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandName {
    Reboot,
    WifiReset,
    FactoryReset,
}

impl CommandName {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "reboot" => Some(Self::Reboot),
            "wifi_reset" => Some(Self::WifiReset),
            "factory_reset" => Some(Self::FactoryReset),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reboot => "reboot",
            Self::WifiReset => "wifi_reset",
            Self::FactoryReset => "factory_reset",
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub key: String,
    pub value: i64,
}

impl Command {
    pub fn name(&self) -> Option<CommandName> {
        CommandName::from_key(&self.key)
    }

    pub fn is_set(&self) -> bool {
        self.value == 1
    }
}

/// The first entry of a JSON object; the remaining entries are skipped
/// without being materialised.
struct FirstField(Option<(String, Value)>);

impl<'de> Deserialize<'de> for FirstField {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FirstFieldVisitor;

        impl<'de> Visitor<'de> for FirstFieldVisitor {
            type Value = FirstField;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<FirstField, A::Error> {
                let first = map.next_entry::<String, Value>()?;
                while map.next_entry::<IgnoredAny, IgnoredAny>()?.is_some() {}
                Ok(FirstField(first))
            }
        }

        deserializer.deserialize_map(FirstFieldVisitor)
    }
}

fn command_value(value: &Value) -> i64 {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64))
            .unwrap_or(0),
        _ => 0,
    }
}

pub fn decode_command(payload: &[u8]) -> Result<Command, LifecycleError> {
    if payload.len() > MAX_COMMAND_PAYLOAD_BYTES {
        return Err(LifecycleError::MalformedInput(format!(
            "payload of {} bytes exceeds {MAX_COMMAND_PAYLOAD_BYTES}",
            payload.len()
        )));
    }

    let FirstField(first) = serde_json::from_slice(payload)
        .map_err(|err| LifecycleError::MalformedInput(err.to_string()))?;
    let (key, value) =
        first.ok_or_else(|| LifecycleError::MalformedInput("object has no fields".into()))?;

    Ok(Command {
        value: command_value(&value),
        key,
    })
}

pub fn acknowledgement(name: CommandName, value: i64) -> Vec<u8> {
    let mut body = serde_json::Map::new();
    body.insert(name.as_str().to_string(), Value::from(value));
    Value::Object(body).to_string().into_bytes()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Acknowledged and the lifecycle action was accepted.
    Acted(CommandName),
    /// Acknowledged; the value did not ask for the action.
    Acknowledged(CommandName),
    /// Acknowledged, but the scheduler refused the action.
    Rejected(CommandName),
    /// First field is not a known command; nothing published.
    Unrecognized(String),
}

pub struct CommandDispatcher<P> {
    identity: Arc<DeviceIdentity>,
    lifecycle: Lifecycle,
    publisher: P,
    delays: CommandConfig,
}

impl<P: AckPublisher> CommandDispatcher<P> {
    pub fn new(
        identity: Arc<DeviceIdentity>,
        lifecycle: Lifecycle,
        publisher: P,
        mut delays: CommandConfig,
    ) -> Self {
        delays.sanitize();
        Self {
            identity,
            lifecycle,
            publisher,
            delays,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Transport entry point. Never fails; problems end up in the log.
    pub fn on_message(&self, payload: &[u8]) {
        match self.handle(payload) {
            Ok(outcome) => debug!("command handled: {outcome:?}"),
            Err(err) => warn!("discarding inbound message: {err}"),
        }
    }

    pub fn handle(&self, payload: &[u8]) -> Result<DispatchOutcome, LifecycleError> {
        let command = decode_command(payload)?;
        let Some(name) = command.name() else {
            warn!("ignoring unrecognized command `{}`", command.key);
            return Ok(DispatchOutcome::Unrecognized(command.key));
        };

        self.acknowledge(name, command.value);
        if !command.is_set() {
            return Ok(DispatchOutcome::Acknowledged(name));
        }

        let fire_delay = Duration::from_secs(self.delays.fire_delay_secs);
        let result = match name {
            CommandName::Reboot => {
                info!("received reboot request");
                self.lifecycle.reboot(fire_delay)
            }
            CommandName::WifiReset => {
                info!("received wifi-reset request");
                self.lifecycle.wifi_reset(
                    fire_delay,
                    chained_reboot_from_secs(self.delays.wifi_reset_reboot_secs),
                )
            }
            CommandName::FactoryReset => {
                info!("received factory-reset request");
                self.lifecycle.factory_reset(
                    fire_delay,
                    chained_reboot_from_secs(self.delays.factory_reset_reboot_secs),
                )
            }
        };

        match result {
            Ok(_) => Ok(DispatchOutcome::Acted(name)),
            Err(err) => {
                warn!("{name} request not scheduled: {err}");
                Ok(DispatchOutcome::Rejected(name))
            }
        }
    }

    fn acknowledge(&self, name: CommandName, value: i64) {
        let payload = acknowledgement(name, value);
        if let Err(err) = self.publisher.publish(&self.identity.publish_topic, &payload) {
            warn!("{err}");
        }
    }
}
