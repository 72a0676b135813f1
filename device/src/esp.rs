use core::{convert::TryInto, num::NonZeroU32};
use std::{
    sync::{Arc, Mutex},
    thread,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::BLOCK,
    gpio::{AnyIOPin, Input, InterruptType, PinDriver, Pull},
    task::notification::Notification,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, error, info, warn};

use lifecycle_common::{
    config::{ButtonConfig, NetworkConfig, TransportConfig},
    AckPublisher, CommandDispatcher, DeviceIdentity, DevicePlatform, Lifecycle, LifecycleError,
    LongPressClassifier, MonotonicClock, PlatformError, PressSource, PressThresholds,
    PublishError, RuntimeConfig, ThreadTimerService,
};

const NVS_NAMESPACE: &str = "lifecycle";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const DEVICE_DATA: &str = include_str!("../data.json");

type SharedClient = Arc<Mutex<EspMqttClient<'static>>>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    let identity = Arc::new(
        DeviceIdentity::from_document(DEVICE_DATA).context("embedded device data is invalid")?,
    );
    info!(
        "device `{}` (model: {}), broker {}",
        identity.name,
        identity.model.as_deref().unwrap_or("unknown"),
        runtime.network.broker_url()
    );

    let platform = Arc::new(EspPlatform {
        nvs_store: nvs_store.clone(),
    });
    let timers = Arc::new(ThreadTimerService::new(runtime.timers.task_stack_size));
    let lifecycle = Lifecycle::new(platform, timers);

    spawn_button_task(lifecycle.clone(), runtime.button.clone())?;

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = match connect_wifi(modem, sys_loop, nvs_partition, &runtime.network) {
        Ok(wifi) => wifi,
        Err(err) => {
            warn!("staying offline, button control only: {err:#}");
            loop {
                thread::sleep(runtime.transport.yield_interval());
            }
        }
    };

    let (client, conn) = create_mqtt_client(&identity, &runtime.network, &runtime.transport)
        .map_err(|err| LifecycleError::TransportFatal(format!("{err:#}")))?;
    let client = Arc::new(Mutex::new(client));
    let dispatcher = CommandDispatcher::new(
        identity,
        lifecycle,
        MqttAckPublisher(client.clone()),
        runtime.commands.clone(),
    );

    let receiver = spawn_mqtt_receiver(dispatcher, conn, client, runtime.transport.clone())?;

    // Keep the station up for the program lifetime.
    let _wifi = wifi;

    while !receiver.is_finished() {
        thread::sleep(runtime.transport.yield_interval());
    }
    match receiver.join() {
        Ok(result) => Ok(result?),
        Err(_) => Err(anyhow!("mqtt receiver thread panicked")),
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if !network.has_station_credentials() {
        return Err(anyhow!("wifi credentials missing"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);
    wifi.connect().context("wifi connect failed")?;
    wifi.wait_netif_up().context("wifi netif did not come up")?;
    info!("wifi connected");

    Ok(esp_wifi)
}

fn create_mqtt_client(
    identity: &DeviceIdentity,
    network: &NetworkConfig,
    transport: &TransportConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = network.broker_url();

    let conf = MqttClientConfiguration {
        client_id: Some(identity.name.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        keep_alive_interval: Some(transport.keep_alive()),
        network_timeout: transport.command_timeout(),
        reconnect_timeout: Some(transport.connect_retry()),
        disable_clean_session: !transport.clean_session,
        crt_bundle_attach: if network.use_tls {
            Some(esp_idf_svc::sys::esp_crt_bundle_attach)
        } else {
            None
        },
        ..Default::default()
    };

    EspMqttClient::new(url.as_str(), &conf)
        .with_context(|| format!("failed to create mqtt client for {url}"))
}

fn subscribe(client: &SharedClient, topic: &str) -> Result<(), LifecycleError> {
    let mut client = client
        .lock()
        .map_err(|_| LifecycleError::TransportFatal("mqtt client lock poisoned".into()))?;
    client
        .subscribe(topic, QoS::AtMostOnce)
        .map(|_| ())
        .map_err(|err| {
            LifecycleError::TransportFatal(format!("subscribe to `{topic}` failed: {err}"))
        })
}

fn spawn_mqtt_receiver(
    dispatcher: CommandDispatcher<MqttAckPublisher>,
    mut conn: EspMqttConnection,
    client: SharedClient,
    transport: TransportConfig,
) -> anyhow::Result<thread::JoinHandle<Result<(), LifecycleError>>> {
    let handle = thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            let topic = dispatcher.identity().subscribe_topic.clone();
            let mut failures = 0_u32;

            loop {
                let event = match conn.next() {
                    Ok(event) => event,
                    Err(err) => {
                        return Err(LifecycleError::TransportFatal(format!(
                            "mqtt connection closed: {err:?}"
                        )));
                    }
                };

                match event.payload() {
                    EventPayload::Connected(_) => {
                        failures = 0;
                        info!("mqtt connected, subscribing to `{topic}`");
                        subscribe(&client, &topic)?;
                    }
                    EventPayload::Received {
                        topic: Some(received),
                        data,
                        details,
                        ..
                    } if received == topic => {
                        // Only full payloads are dispatched.
                        if matches!(details, Details::Complete) {
                            dispatcher.on_message(data);
                        } else {
                            warn!("dropping fragmented message on `{received}`");
                        }
                    }
                    EventPayload::Disconnected => {
                        failures += 1;
                        warn!(
                            "mqtt disconnected ({failures} in a row, auto reconnect: {})",
                            transport.auto_reconnect
                        );
                        if !transport.auto_reconnect
                            || transport.connect_attempts_exhausted(failures)
                        {
                            error!("giving up on the mqtt connection");
                            return Err(LifecycleError::TransportFatal(format!(
                                "disconnected {failures} time(s) without recovering"
                            )));
                        }
                    }
                    EventPayload::Error(err) => warn!("mqtt error: {err:?}"),
                    other => debug!("mqtt event: {other:?}"),
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(handle)
}

struct MqttAckPublisher(SharedClient);

impl AckPublisher for MqttAckPublisher {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        let failed = |reason: String| PublishError {
            topic: topic.to_string(),
            reason,
        };
        let mut client = self
            .0
            .lock()
            .map_err(|_| failed("mqtt client lock poisoned".into()))?;
        client
            .enqueue(topic, QoS::AtMostOnce, false, payload)
            .map(|_| ())
            .map_err(|err| failed(err.to_string()))
    }
}

/// Active-low boot button. The edge interrupt only posts a task notification;
/// it is re-armed every time the classifier waits.
struct EspButton {
    pin: PinDriver<'static, AnyIOPin, Input>,
    notification: Notification,
}

impl EspButton {
    fn new(gpio: i32) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input(unsafe { AnyIOPin::new(gpio) })?;
        pin.set_pull(Pull::Down)?;
        pin.set_interrupt_type(InterruptType::AnyEdge)?;

        let notification = Notification::new();
        let notifier = notification.notifier();
        unsafe {
            pin.subscribe(move || {
                notifier.notify_and_yield(NonZeroU32::MIN);
            })?;
        }

        Ok(Self { pin, notification })
    }
}

impl PressSource for EspButton {
    fn wait_for_edge(&mut self) -> bool {
        if let Err(err) = self.pin.enable_interrupt() {
            error!("failed to arm button interrupt: {err}");
            return false;
        }
        self.notification.wait(BLOCK).is_some()
    }

    fn is_asserted(&self) -> bool {
        self.pin.is_low()
    }
}

fn spawn_button_task(lifecycle: Lifecycle, config: ButtonConfig) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("boot-button".into())
        .stack_size(config.task_stack_size)
        .spawn(move || {
            let button = match EspButton::new(config.gpio) {
                Ok(button) => button,
                Err(err) => {
                    error!("button on GPIO{} unavailable: {err:#}", config.gpio);
                    return;
                }
            };
            info!("watching boot button on GPIO{}", config.gpio);
            let thresholds = PressThresholds::from(&config);
            LongPressClassifier::new(button, MonotonicClock, thresholds, lifecycle).run();
        })
        .context("failed to spawn boot-button task")?;
    Ok(())
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
}

struct EspPlatform {
    nvs_store: NvsStore,
}

fn check(rc: esp_idf_svc::sys::esp_err_t, what: &str) -> Result<(), String> {
    if rc == esp_idf_svc::sys::ESP_OK {
        Ok(())
    } else {
        Err(format!("{what} failed with esp_err_t={rc}"))
    }
}

impl DevicePlatform for EspPlatform {
    fn restore_network_defaults(&self) -> Result<(), PlatformError> {
        check(
            unsafe { esp_idf_svc::sys::esp_wifi_restore() },
            "esp_wifi_restore",
        )
        .map_err(PlatformError::Credentials)?;

        let mut runtime = self
            .nvs_store
            .load_runtime_config()
            .map_err(|err| PlatformError::Credentials(format!("{err:#}")))?;
        runtime.network = NetworkConfig::default();
        self.nvs_store
            .save_runtime_config(&runtime)
            .map_err(|err| PlatformError::Credentials(format!("{err:#}")))
    }

    fn deinit_storage(&self) -> Result<(), PlatformError> {
        let rc = unsafe { esp_idf_svc::sys::nvs_flash_deinit() };
        // Not initialised counts as already released.
        if rc == esp_idf_svc::sys::ESP_ERR_NVS_NOT_INITIALIZED as esp_idf_svc::sys::esp_err_t {
            return Ok(());
        }
        check(rc, "nvs_flash_deinit").map_err(PlatformError::Storage)
    }

    fn erase_storage(&self) -> Result<(), PlatformError> {
        check(
            unsafe { esp_idf_svc::sys::nvs_flash_erase() },
            "nvs_flash_erase",
        )
        .map_err(PlatformError::Storage)
    }

    fn restart(&self) -> ! {
        esp_idf_hal::reset::restart()
    }
}
