use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use anyhow::Context;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

use lifecycle_common::{
    button::{
        wake_channel, LongPressClassifier, PressSource, PressThresholds, WakeNotifier,
        WakeReceiver,
    },
    config::{ButtonConfig, NetworkConfig, TransportConfig},
    AckPublisher, CommandDispatcher, DeviceIdentity, DevicePlatform, Lifecycle, LifecycleError,
    MonotonicClock, PlatformError, PublishError, RuntimeConfig, ThreadTimerService,
};

type Dispatcher = CommandDispatcher<MqttAckPublisher>;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = StateStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    apply_env_overrides(&mut runtime.network);

    let identity = Arc::new(load_identity().await?);
    info!(
        "device `{}` (model: {}) listening on `{}`",
        identity.name,
        identity.model.as_deref().unwrap_or("unknown"),
        identity.subscribe_topic
    );

    let platform = Arc::new(HostPlatform {
        store: store.clone(),
    });
    let timers = Arc::new(ThreadTimerService::new(runtime.timers.task_stack_size));
    let lifecycle = Lifecycle::new(platform, timers);

    let (mqtt, eventloop) =
        AsyncClient::new(mqtt_options(&identity, &runtime.network, &runtime.transport), 16);
    let dispatcher = Arc::new(CommandDispatcher::new(
        identity.clone(),
        lifecycle.clone(),
        MqttAckPublisher(mqtt.clone()),
        runtime.commands.clone(),
    ));

    let pressed = Arc::new(AtomicBool::new(false));
    let notifier = spawn_button_task(lifecycle, &runtime.button, pressed.clone())?;
    spawn_console_button(pressed, notifier);

    tokio::select! {
        result = run_transport(mqtt, eventloop, dispatcher, runtime.transport.clone()) => {
            result.context("mqtt transport stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
        }
    }
    Ok(())
}

fn apply_env_overrides(network: &mut NetworkConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
}

async fn load_identity() -> anyhow::Result<DeviceIdentity> {
    let path = std::env::var("DEVICE_DATA")
        .map(PathBuf::from)
        .unwrap_or_else(|_| Path::new(env!("CARGO_MANIFEST_DIR")).join("data.json"));
    let document = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read device data from {}", path.display()))?;
    DeviceIdentity::from_document(&document)
        .with_context(|| format!("invalid device data in {}", path.display()))
}

fn mqtt_options(
    identity: &DeviceIdentity,
    network: &NetworkConfig,
    transport: &TransportConfig,
) -> MqttOptions {
    if network.use_tls {
        warn!(
            "TLS is not available in the host build; connecting to {}:{} without it",
            network.mqtt_host, network.mqtt_port
        );
    }

    let mut options =
        MqttOptions::new(identity.name.as_str(), network.mqtt_host.as_str(), network.mqtt_port);
    options.set_keep_alive(transport.keep_alive());
    options.set_clean_session(transport.clean_session);
    if !network.mqtt_user.is_empty() {
        options.set_credentials(network.mqtt_user.as_str(), network.mqtt_pass.as_str());
    }
    options
}

async fn run_transport(
    mqtt: AsyncClient,
    mut eventloop: EventLoop,
    dispatcher: Arc<Dispatcher>,
    transport: TransportConfig,
) -> Result<(), LifecycleError> {
    let topic = dispatcher.identity().subscribe_topic.clone();
    let mut failures = 0_u32;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                failures = 0;
                info!("mqtt connected, subscribing to `{topic}`");
                if let Err(err) = mqtt.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                    return Err(LifecycleError::TransportFatal(format!(
                        "subscribe to `{topic}` failed: {err}"
                    )));
                }
            }
            Ok(Event::Incoming(Incoming::Publish(message))) if message.topic == topic => {
                dispatcher.on_message(&message.payload);
            }
            Ok(Event::Incoming(Incoming::Publish(message))) => {
                debug!("ignoring message on unexpected topic `{}`", message.topic);
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                warn!(
                    "mqtt disconnected by broker (auto reconnect: {})",
                    transport.auto_reconnect
                );
            }
            Ok(_) => {}
            Err(err) => {
                failures += 1;
                warn!(
                    "mqtt connection error ({failures} in a row, auto reconnect: {}): {err}",
                    transport.auto_reconnect
                );
                if !transport.auto_reconnect || transport.connect_attempts_exhausted(failures) {
                    error!("giving up on the mqtt connection");
                    return Err(LifecycleError::TransportFatal(format!(
                        "connection lost after {failures} attempt(s): {err}"
                    )));
                }
                tokio::time::sleep(transport.connect_retry()).await;
            }
        }
    }
}

struct MqttAckPublisher(AsyncClient);

impl AckPublisher for MqttAckPublisher {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        self.0
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|err| PublishError {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }
}

/// Boot button stand-in. The level is driven from the console; only the
/// press edge posts a wake.
struct SimulatedButton {
    pressed: Arc<AtomicBool>,
    wake: WakeReceiver,
}

impl PressSource for SimulatedButton {
    fn wait_for_edge(&mut self) -> bool {
        self.wake.wait()
    }

    fn is_asserted(&self) -> bool {
        self.pressed.load(Ordering::Acquire)
    }
}

fn spawn_button_task(
    lifecycle: Lifecycle,
    config: &ButtonConfig,
    pressed: Arc<AtomicBool>,
) -> anyhow::Result<WakeNotifier> {
    let (notifier, wake) = wake_channel();
    let source = SimulatedButton { pressed, wake };
    let thresholds = PressThresholds::from(config);

    thread::Builder::new()
        .name("boot-button".into())
        .stack_size(config.task_stack_size)
        .spawn(move || {
            LongPressClassifier::new(source, MonotonicClock, thresholds, lifecycle).run();
        })
        .context("failed to spawn boot-button task")?;
    Ok(notifier)
}

/// `down` presses the button, `up` releases it.
fn spawn_console_button(pressed: Arc<AtomicBool>, notifier: WakeNotifier) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match line.trim() {
                    "down" => {
                        if !pressed.swap(true, Ordering::AcqRel) {
                            notifier.notify();
                        }
                    }
                    "up" => pressed.store(false, Ordering::Release),
                    "" => {}
                    other => warn!("unknown console input `{other}` (expected `down` or `up`)"),
                },
                Ok(None) => break,
                Err(err) => {
                    warn!("console read failed: {err}");
                    break;
                }
            }
        }
        debug!("console closed; button input disabled");
    });
}

#[derive(Debug, Clone)]
struct StateStore {
    state_dir: Arc<PathBuf>,
    runtime_path: Arc<PathBuf>,
}

impl StateStore {
    fn new() -> Self {
        let state_dir = std::env::var("DEVICE_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./device-state"));
        let runtime_path = std::env::var("DEVICE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| state_dir.join("runtime.json"));

        Self {
            state_dir: Arc::new(state_dir),
            runtime_path: Arc::new(runtime_path),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Filesystem-backed platform. Runs on timer threads, so everything here is
/// blocking I/O.
struct HostPlatform {
    store: StateStore,
}

impl HostPlatform {
    fn clear_network_credentials(&self) -> anyhow::Result<()> {
        let path = self.store.runtime_path.as_ref();
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let mut runtime = serde_json::from_slice::<RuntimeConfig>(&raw)?;
        runtime.network = NetworkConfig::default();
        std::fs::write(path, serde_json::to_vec_pretty(&runtime)?)?;
        Ok(())
    }
}

impl DevicePlatform for HostPlatform {
    fn restore_network_defaults(&self) -> Result<(), PlatformError> {
        self.clear_network_credentials()
            .map_err(|err| PlatformError::Credentials(format!("{err:#}")))?;
        info!("network configuration restored to defaults");
        Ok(())
    }

    fn deinit_storage(&self) -> Result<(), PlatformError> {
        debug!("host store has no open handles to release");
        Ok(())
    }

    /// The runtime config may live outside the state directory when
    /// `DEVICE_CONFIG` points elsewhere, so it is removed on its own.
    fn erase_storage(&self) -> Result<(), PlatformError> {
        let dir = self.store.state_dir.as_ref();
        match std::fs::remove_dir_all(dir) {
            Ok(()) => info!("erased state directory {}", dir.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(PlatformError::Storage(format!("{}: {err}", dir.display()))),
        }

        let runtime = self.store.runtime_path.as_ref();
        match std::fs::remove_file(runtime) {
            Ok(()) => {
                info!("erased runtime config {}", runtime.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(PlatformError::Storage(format!("{}: {err}", runtime.display()))),
        }
    }

    fn restart(&self) -> ! {
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;

            match std::env::current_exe() {
                Ok(exe) => {
                    let err = std::process::Command::new(exe)
                        .args(std::env::args_os().skip(1))
                        .exec();
                    error!("re-exec failed: {err}");
                }
                Err(err) => error!("cannot locate current executable: {err}"),
            }
        }
        std::process::exit(0)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use pretty_assertions::assert_eq;

    use super::*;

    fn scratch_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        let dir = std::env::temp_dir().join(format!(
            "lifecycle-host-{label}-{}-{nanos}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn factory_erase_removes_external_runtime_config() {
        let root = scratch_dir("erase");
        let state_dir = root.join("state");
        let runtime_path = root.join("elsewhere").join("runtime.json");
        std::fs::create_dir_all(&state_dir).unwrap();
        std::fs::create_dir_all(runtime_path.parent().unwrap()).unwrap();
        std::fs::write(state_dir.join("marker"), b"1").unwrap();
        std::fs::write(&runtime_path, br#"{"network":{"wifi_ssid":"lab"}}"#).unwrap();

        let platform = HostPlatform {
            store: StateStore {
                state_dir: Arc::new(state_dir.clone()),
                runtime_path: Arc::new(runtime_path.clone()),
            },
        };

        platform.erase_storage().unwrap();
        assert!(!state_dir.exists());
        assert!(!runtime_path.exists());

        platform.erase_storage().unwrap();

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn wifi_reset_keeps_everything_but_network() {
        let root = scratch_dir("wifi");
        let runtime_path = root.join("runtime.json");
        let mut runtime = RuntimeConfig::default();
        runtime.network.wifi_ssid = "lab".into();
        runtime.button.gpio = 9;
        std::fs::write(&runtime_path, serde_json::to_vec(&runtime).unwrap()).unwrap();

        let platform = HostPlatform {
            store: StateStore {
                state_dir: Arc::new(root.clone()),
                runtime_path: Arc::new(runtime_path.clone()),
            },
        };
        platform.restore_network_defaults().unwrap();

        let stored: RuntimeConfig =
            serde_json::from_slice(&std::fs::read(&runtime_path).unwrap()).unwrap();
        assert_eq!(stored.network, NetworkConfig::default());
        assert_eq!(stored.button.gpio, 9);

        std::fs::remove_dir_all(&root).unwrap();
    }
}
