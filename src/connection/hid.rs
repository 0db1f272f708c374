//! Raw HID transport and its connection supervisor.
//!
//! The deck's HID mode sends fixed 32-byte reports carrying relative volume
//! steps instead of absolute positions, so there is no debounce on this
//! path - the hardware already quantizes. Buttons are not deliverable over
//! HID; the button subscription exists but stays silent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hidapi::{HidApi, HidDevice};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::{
    ConnectionDescriptor, ConnectionError, ConnectionState, DeviceConnection, HidParams,
    RENEW_SETTLE,
};
use crate::config::AppConfig;
use crate::events::{ButtonEvent, EventBus, SliderMoveEvent};
use crate::protocol::{self, HidCommand, HID_FRAME_LEN};
use crate::targets::{TargetMapping, VolumeSource};

/// Poll interval for the blocking read, bounding `stop()` latency.
const READ_TIMEOUT_MS: i32 = 50;

/// Frames allowed to queue for dispatch. The deck emits at human speed;
/// hitting this means the dispatch side has stalled.
const FRAME_QUEUE: usize = 32;

/// A supervised connection to the deck over raw HID reports.
pub struct HidConnection {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<ConnectionState>,
    params: Mutex<HidParams>,
    slider_targets: Mutex<TargetMapping>,
    volumes: Arc<dyn VolumeSource>,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    slider_bus: EventBus<SliderMoveEvent>,
    button_bus: EventBus<ButtonEvent>,
}

impl HidConnection {
    /// Create a supervisor from the current config snapshot.
    ///
    /// `volumes` answers "what is this slider at right now", which is what
    /// turns the deck's relative steps into absolute values. `reloads` is
    /// the config watcher's notification stream.
    pub fn new(
        config: &AppConfig,
        volumes: Arc<dyn VolumeSource>,
        reloads: broadcast::Receiver<Arc<AppConfig>>,
    ) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(ConnectionState::Disconnected),
            params: Mutex::new(HidParams::from_config(config)),
            slider_targets: Mutex::new(config.slider_mapping.clone()),
            volumes,
            stop_tx: Mutex::new(None),
            slider_bus: EventBus::new(),
            button_bus: EventBus::new(),
        });

        Inner::spawn_reload_handler(Arc::clone(&inner), reloads);
        debug!("Created hid connection instance");

        Self { inner }
    }
}

#[async_trait]
impl DeviceConnection for HidConnection {
    async fn start(&self) -> Result<(), ConnectionError> {
        Inner::start(Arc::clone(&self.inner)).await
    }

    async fn stop(&self) {
        Inner::stop(&self.inner).await;
    }

    fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor::Hid(*self.inner.params.lock())
    }

    fn subscribe_slider_moves(&self) -> mpsc::Receiver<SliderMoveEvent> {
        self.inner.slider_bus.subscribe()
    }

    fn subscribe_button_events(&self) -> mpsc::Receiver<ButtonEvent> {
        // Nothing ever publishes on this bus: the HID report format has no
        // button class. The subscription is honored, the channel is silent.
        self.inner.button_bus.subscribe()
    }
}

impl Inner {
    async fn start(inner: Arc<Inner>) -> Result<(), ConnectionError> {
        {
            let mut state = inner.state.lock();
            if *state != ConnectionState::Disconnected {
                warn!("Already connected, can't start another without closing first");
                return Err(ConnectionError::AlreadyConnected);
            }
            *state = ConnectionState::Connecting;
        }

        let params = *inner.params.lock();

        // One enumeration pass, no retries: a config reload is the retry
        // mechanism for this variant.
        let device = match open_device(&params) {
            Ok(device) => device,
            Err(e) => {
                *inner.state.lock() = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        info!("✅ HID device connected");
        *inner.state.lock() = ConnectionState::Connected;

        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        *inner.stop_tx.lock() = Some(stop_tx);

        let reader_stop = Arc::new(AtomicBool::new(false));
        let mut frames = spawn_reader(device, Arc::clone(&reader_stop));

        let dispatch = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        debug!("Stop requested, closing hid connection");
                        reader_stop.store(true, Ordering::Relaxed);
                        *dispatch.state.lock() = ConnectionState::Disconnected;
                        return;
                    }
                    frame = frames.recv() => match frame {
                        Some(frame) => dispatch.handle_frame(&frame).await,
                        None => {
                            // Reader hit a read error. Unlike serial there
                            // is no automatic restart on this path; the
                            // next config reload is the way back.
                            warn!("HID connection lost");
                            *dispatch.state.lock() = ConnectionState::Disconnected;
                            return;
                        }
                    }
                }
            }
        });

        Ok(())
    }

    async fn stop(inner: &Arc<Inner>) {
        let stop_tx = {
            let mut state = inner.state.lock();
            if *state != ConnectionState::Connected {
                debug!("Not currently connected, nothing to stop");
                return;
            }
            *state = ConnectionState::Closing;
            inner.stop_tx.lock().clone()
        };

        if let Some(tx) = stop_tx {
            if tx.send(()).await.is_err() {
                *inner.state.lock() = ConnectionState::Disconnected;
            }
        }
    }

    async fn handle_frame(&self, frame: &[u8]) {
        let Some(command) = protocol::decode_hid_frame(frame) else {
            return;
        };

        match command {
            HidCommand::Heartbeat => {
                debug!("Heartbeat frame");
            }
            HidCommand::Step { slider, down } => {
                let targets = self.slider_targets.lock().targets_for(slider);
                let current = self.volumes.slider_volume(slider, &targets);
                let value = protocol::apply_hid_step(current, down);

                debug!(slider, value, "Slider stepped");
                self.slider_bus
                    .publish(SliderMoveEvent { slider, value })
                    .await;
            }
        }
    }

    fn spawn_reload_handler(inner: Arc<Inner>, mut reloads: broadcast::Receiver<Arc<AppConfig>>) {
        tokio::spawn(async move {
            loop {
                let config = match reloads.recv().await {
                    Ok(config) => config,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Missed config reloads, catching up");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };

                *inner.slider_targets.lock() = config.slider_mapping.clone();

                let new_params = HidParams::from_config(&config);
                let changed = *inner.params.lock() != new_params;
                if changed {
                    info!("Detected change in connection parameters, attempting to renew connection");
                    *inner.params.lock() = new_params;

                    Inner::stop(&inner).await;

                    // Let the connection close.
                    tokio::time::sleep(RENEW_SETTLE).await;

                    if let Err(e) = Inner::start(Arc::clone(&inner)).await {
                        warn!("Failed to renew connection after parameter change: {}", e);
                    } else {
                        debug!("Renewed connection successfully");
                    }
                }
            }
        });
    }
}

/// Enumerate and open the configured device.
fn open_device(params: &HidParams) -> Result<HidDevice, ConnectionError> {
    let api = HidApi::new().map_err(|e| ConnectionError::Open(e.to_string()))?;

    let device_info = api.device_list().find(|info| {
        info.vendor_id() == params.vendor_id
            && info.product_id() == params.product_id
            && info.usage_page() == params.usage_page
            && info.usage() == params.usage
    });

    let Some(device_info) = device_info else {
        warn!(
            vendor_id = params.vendor_id,
            product_id = params.product_id,
            usage_page = params.usage_page,
            usage = params.usage,
            "Could not find hid device"
        );
        return Err(ConnectionError::DeviceNotFound {
            vendor_id: params.vendor_id,
            product_id: params.product_id,
            usage_page: params.usage_page,
            usage: params.usage,
        });
    };

    debug!(
        device = device_info.product_string().unwrap_or("?"),
        manufacturer = device_info.manufacturer_string().unwrap_or("?"),
        "Attempting to connect to hid device"
    );

    device_info.open_device(&api).map_err(|e| {
        warn!("Failed to open HID connection: {}", e);
        ConnectionError::Open(e.to_string())
    })
}

/// Read fixed-size reports off the device on a dedicated thread.
///
/// The thread exits, dropping (and closing) the device, when asked to stop
/// or when a read fails; timeouts just poll the stop flag.
fn spawn_reader(device: HidDevice, stop: Arc<AtomicBool>) -> mpsc::Receiver<[u8; HID_FRAME_LEN]> {
    let (tx, rx) = mpsc::channel(FRAME_QUEUE);

    std::thread::spawn(move || loop {
        if stop.load(Ordering::Relaxed) {
            debug!("HID reader stopping");
            return;
        }

        let mut frame = [0u8; HID_FRAME_LEN];
        match device.read_timeout(&mut frame, READ_TIMEOUT_MS) {
            // Zero bytes means the timeout elapsed.
            Ok(0) => {}
            Ok(_) => {
                if tx.blocking_send(frame).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("Failed to read HID frame: {}", e);
                return;
            }
        }
    });

    rx
}

/// Push the current resolved volume of every mapped slider down to the
/// deck as status frames.
///
/// This is the device-bound half of the HID protocol; the dispatch loop
/// does not drive it today, the deck just displays whatever it last heard.
pub fn write_status_frames(
    device: &HidDevice,
    mapping: &TargetMapping,
    volumes: &dyn VolumeSource,
) -> Result<(), hidapi::HidError> {
    for (slider, targets) in mapping.iter() {
        let volume = volumes.slider_volume(slider, &targets);
        let frame = protocol::encode_status_frame(slider as u8, volume);
        debug!(slider, volume, "Writing status frame to device");
        device.write(&frame)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::NullVolumeSource;

    struct FixedVolume(f32);

    impl VolumeSource for FixedVolume {
        fn slider_volume(&self, _slider: usize, _targets: &[String]) -> f32 {
            self.0
        }
    }

    fn test_connection(volumes: Arc<dyn VolumeSource>) -> HidConnection {
        let (_tx, rx) = broadcast::channel(4);
        HidConnection::new(&AppConfig::default(), volumes, rx)
    }

    fn step_frame(slider: u8, down: bool) -> [u8; HID_FRAME_LEN] {
        let mut frame = [0u8; HID_FRAME_LEN];
        frame[0] = protocol::HID_COMMAND_MARKER;
        frame[1] = slider;
        frame[2] = u8::from(!down);
        frame
    }

    #[tokio::test]
    async fn step_frames_emit_adjusted_volumes() {
        let connection = test_connection(Arc::new(FixedVolume(0.5)));
        let mut sliders = connection.subscribe_slider_moves();

        connection.inner.handle_frame(&step_frame(1, false)).await;
        let event = sliders.recv().await.unwrap();
        assert_eq!(event.slider, 1);
        assert!((event.value - 0.55).abs() < 1e-6);

        connection.inner.handle_frame(&step_frame(1, true)).await;
        let event = sliders.recv().await.unwrap();
        assert!((event.value - 0.45).abs() < 1e-6);
    }

    #[tokio::test]
    async fn steps_clamp_at_the_range_edges() {
        let connection = test_connection(Arc::new(FixedVolume(0.98)));
        let mut sliders = connection.subscribe_slider_moves();

        connection.inner.handle_frame(&step_frame(0, false)).await;
        assert_eq!(sliders.recv().await.unwrap().value, 1.0);
    }

    #[tokio::test]
    async fn heartbeat_and_foreign_frames_emit_nothing() {
        let connection = test_connection(Arc::new(NullVolumeSource));
        let mut sliders = connection.subscribe_slider_moves();

        let mut heartbeat = [0u8; HID_FRAME_LEN];
        heartbeat[0] = protocol::HID_COMMAND_MARKER;
        heartbeat[1] = protocol::HID_HEARTBEAT;
        connection.inner.handle_frame(&heartbeat).await;

        let foreign = [0u8; HID_FRAME_LEN];
        connection.inner.handle_frame(&foreign).await;

        // Follow with a real step so recv() returning proves the two
        // frames above produced nothing ahead of it.
        connection.inner.handle_frame(&step_frame(2, false)).await;
        let event = sliders.recv().await.unwrap();
        assert_eq!(event.slider, 2);
    }

    #[tokio::test]
    async fn stop_without_connection_is_a_noop() {
        let connection = test_connection(Arc::new(NullVolumeSource));
        connection.stop().await;
    }
}
