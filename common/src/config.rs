use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub use_tls: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 8883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            use_tls: true,
        }
    }
}

impl NetworkConfig {
    pub fn has_station_credentials(&self) -> bool {
        !self.wifi_ssid.trim().is_empty()
    }

    pub fn broker_url(&self) -> String {
        let scheme = if self.use_tls { "mqtts" } else { "mqtt" };
        format!("{scheme}://{}:{}", self.mqtt_host, self.mqtt_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransportConfig {
    pub command_timeout_ms: u64,
    pub keep_alive_secs: u64,
    pub yield_interval_ms: u64,
    pub connect_retry_ms: u64,
    /// Consecutive failed connection attempts tolerated; 0 retries forever.
    pub max_connect_attempts: u32,
    pub clean_session: bool,
    pub auto_reconnect: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 20_000,
            keep_alive_secs: 10,
            yield_interval_ms: 250,
            connect_retry_ms: 1_000,
            max_connect_attempts: 0,
            clean_session: true,
            auto_reconnect: true,
        }
    }
}

impl TransportConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }

    pub fn yield_interval(&self) -> Duration {
        Duration::from_millis(self.yield_interval_ms)
    }

    pub fn connect_attempts_exhausted(&self, failures: u32) -> bool {
        self.max_connect_attempts != 0 && failures >= self.max_connect_attempts
    }
}

/// Fixed delays applied to cloud commands. A negative chained reboot delay
/// leaves the device running after the reset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandConfig {
    pub fire_delay_secs: u64,
    pub wifi_reset_reboot_secs: i64,
    pub factory_reset_reboot_secs: i64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            fire_delay_secs: 2,
            wifi_reset_reboot_secs: 5,
            factory_reset_reboot_secs: 2,
        }
    }
}

/// Both the button task and the timer tasks run resets inline, which opens
/// NVS and round-trips the stored config through serde_json.
pub const MIN_TASK_STACK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ButtonConfig {
    pub gpio: i32,
    pub reserved_ms: u64,
    pub wifi_reset_ms: u64,
    pub factory_reset_ms: u64,
    pub task_stack_size: usize,
}

impl Default for ButtonConfig {
    fn default() -> Self {
        Self {
            gpio: 0,
            reserved_ms: 1_000,
            wifi_reset_ms: 3_000,
            factory_reset_ms: 10_000,
            task_stack_size: 12 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimerConfig {
    pub task_stack_size: usize,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            task_stack_size: 12 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub commands: CommandConfig,
    #[serde(default)]
    pub button: ButtonConfig,
    #[serde(default)]
    pub timers: TimerConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.button.sanitize();
        self.transport.sanitize();
        self.commands.sanitize();
        if self.timers.task_stack_size < MIN_TASK_STACK_SIZE {
            self.timers.task_stack_size = TimerConfig::default().task_stack_size;
        }
    }
}

impl ButtonConfig {
    /// Tiers must stay strictly ordered, otherwise the classifier would skip one.
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.reserved_ms == 0
            || self.reserved_ms >= self.wifi_reset_ms
            || self.wifi_reset_ms >= self.factory_reset_ms
        {
            self.reserved_ms = defaults.reserved_ms;
            self.wifi_reset_ms = defaults.wifi_reset_ms;
            self.factory_reset_ms = defaults.factory_reset_ms;
        }
        if self.task_stack_size < MIN_TASK_STACK_SIZE {
            self.task_stack_size = defaults.task_stack_size;
        }
    }
}

impl CommandConfig {
    /// Remote commands must always be deferred; a zero fire delay would run
    /// the action on the transport receive loop.
    pub fn sanitize(&mut self) {
        if self.fire_delay_secs == 0 {
            self.fire_delay_secs = Self::default().fire_delay_secs;
        }
    }
}

impl TransportConfig {
    pub fn sanitize(&mut self) {
        self.keep_alive_secs = self.keep_alive_secs.clamp(5, 1_200);
        self.yield_interval_ms = self.yield_interval_ms.clamp(10, 5_000);
        if self.connect_retry_ms == 0 {
            self.connect_retry_ms = Self::default().connect_retry_ms;
        }
    }
}
