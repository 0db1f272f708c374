//! Line-oriented serial transport and its connection supervisor.
//!
//! The deck streams CRLF-terminated report lines over a serial port. A
//! blocking reader thread feeds complete lines into the dispatch task,
//! which is the only place protocol state mutates - parsing, debouncing
//! and fan-out all happen on that one serialized loop.

use std::future::Future;
use std::io::{BufRead, BufReader, ErrorKind};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serialport::{DataBits, SerialPort, StopBits};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::{
    ConnectionDescriptor, ConnectionError, ConnectionState, DeviceConnection, RetryBackoff,
    SerialParams, RENEW_SETTLE,
};
use crate::config::AppConfig;
use crate::events::{ButtonEvent, EventBus, SliderMoveEvent};
use crate::protocol::LineParser;

/// Read timeout on the port: keeps reads from batching up behind the
/// driver, and bounds how long `stop()` can trail behind a blocked read.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// A supervised connection to the deck over a serial port.
pub struct SerialConnection {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<ConnectionState>,
    params: Mutex<SerialParams>,
    parser: Mutex<LineParser>,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    slider_bus: EventBus<SliderMoveEvent>,
    button_bus: EventBus<ButtonEvent>,
}

impl SerialConnection {
    /// Create a supervisor from the current config snapshot. `reloads` is
    /// the config watcher's notification stream; connection parameters and
    /// parser settings follow it for the lifetime of this instance.
    pub fn new(config: &AppConfig, reloads: broadcast::Receiver<Arc<AppConfig>>) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(ConnectionState::Disconnected),
            params: Mutex::new(SerialParams::from_config(config)),
            parser: Mutex::new(LineParser::new(config.parser_settings())),
            stop_tx: Mutex::new(None),
            slider_bus: EventBus::new(),
            button_bus: EventBus::new(),
        });

        Inner::spawn_reload_handler(Arc::clone(&inner), reloads);
        debug!("Created serial connection instance");

        Self { inner }
    }
}

#[async_trait]
impl DeviceConnection for SerialConnection {
    async fn start(&self) -> Result<(), ConnectionError> {
        Inner::start(Arc::clone(&self.inner)).await
    }

    async fn stop(&self) {
        Inner::stop(&self.inner).await;
    }

    fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor::Serial(self.inner.params.lock().clone())
    }

    fn subscribe_slider_moves(&self) -> mpsc::Receiver<SliderMoveEvent> {
        self.inner.slider_bus.subscribe()
    }

    fn subscribe_button_events(&self) -> mpsc::Receiver<ButtonEvent> {
        self.inner.button_bus.subscribe()
    }
}

impl Inner {
    fn start(
        inner: Arc<Inner>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConnectionError>> + Send>> {
        Box::pin(async move {
        {
            let mut state = inner.state.lock();
            if *state != ConnectionState::Disconnected {
                warn!("Already connected, can't start another without closing first");
                return Err(ConnectionError::AlreadyConnected);
            }
            *state = ConnectionState::Connecting;
        }

        let params = inner.params.lock().clone();
        info!(
            port = %params.port,
            baud_rate = params.baud_rate,
            "Attempting serial connection"
        );

        // Open failures retry forever; a config change (which stops us) is
        // the only other way out of this loop.
        let mut backoff = RetryBackoff::new();
        let port = loop {
            match open_port(&params) {
                Ok(port) => break port,
                Err(e) => {
                    warn!("Failed to open serial connection: {}", e);
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        };

        info!(port = %params.port, "✅ Serial connected");
        *inner.state.lock() = ConnectionState::Connected;

        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        *inner.stop_tx.lock() = Some(stop_tx);

        let reader_stop = Arc::new(AtomicBool::new(false));
        let mut lines = spawn_reader(port, Arc::clone(&reader_stop));

        // Dispatch loop: the single serialized path for protocol state.
        let dispatch = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        debug!("Stop requested, closing serial connection");
                        reader_stop.store(true, Ordering::Relaxed);
                        *dispatch.state.lock() = ConnectionState::Disconnected;
                        return;
                    }
                    line = lines.recv() => match line {
                        Some(line) => dispatch.handle_line(&line).await,
                        None => {
                            // The reader died without being asked to: the
                            // port went away underneath us. Reconnect right
                            // away - this is distinct from open backoff.
                            warn!("Serial connection lost, reconnecting");
                            *dispatch.state.lock() = ConnectionState::Disconnected;
                            let restart = Arc::clone(&dispatch);
                            tokio::spawn(async move {
                                if let Err(e) = Inner::start(restart).await {
                                    warn!("Failed to re-establish serial connection: {}", e);
                                }
                            });
                            return;
                        }
                    }
                }
            }
        });

        Ok(())
        })
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
                // Dispatch loop already gone; close the books ourselves.
                *inner.state.lock() = ConnectionState::Disconnected;
            }
        }
    }

    async fn handle_line(&self, line: &str) {
        let events = self.parser.lock().parse_line(line);

        for event in events.sliders {
            debug!(slider = event.slider, value = event.value, "Slider moved");
            self.slider_bus.publish(event).await;
        }
        for event in events.buttons {
            debug!(button = event.button, value = event.value, "Button changed");
            self.button_bus.publish(event).await;
        }
    }

    /// React to config reloads: refresh parser settings immediately, and
    /// renew the connection when its addressing fields changed.
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

                inner.parser.lock().set_settings(config.parser_settings());

                // Re-emit every slider shortly after the reload, once the
                // session side has had a moment to re-acquire its targets.
                let refresh = Arc::clone(&inner);
                tokio::spawn(async move {
                    tokio::time::sleep(RENEW_SETTLE).await;
                    refresh.parser.lock().force_refresh();
                });

                let new_params = SerialParams::from_config(&config);
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

fn open_port(params: &SerialParams) -> Result<Box<dyn SerialPort>, serialport::Error> {
    serialport::new(params.port.as_str(), params.baud_rate)
        .data_bits(DataBits::Eight)
        .stop_bits(StopBits::One)
        .timeout(READ_TIMEOUT)
        .open()
}

/// Read CRLF-terminated lines off the port on a dedicated thread.
///
/// The line channel is unbounded: the dispatch loop paces consumption, and
/// the deck produces lines far slower than they are drained. The thread
/// exits - dropping, and thereby closing, the port - when asked to stop or
/// when a read fails outright; timeouts just poll the stop flag, keeping
/// any partially received line accumulated.
fn spawn_reader(
    port: Box<dyn SerialPort>,
    stop: Arc<AtomicBool>,
) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();

    std::thread::spawn(move || {
        let mut reader = BufReader::new(port);
        let mut pending: Vec<u8> = Vec::new();

        loop {
            if stop.load(Ordering::Relaxed) {
                debug!("Serial reader stopping");
                return;
            }

            match reader.read_until(b'\n', &mut pending) {
                Ok(0) => {
                    debug!("Serial port reported end of stream");
                    return;
                }
                Ok(_) => {
                    if pending.last() == Some(&b'\n') {
                        let line = String::from_utf8_lossy(&pending).into_owned();
                        pending.clear();
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => {
                    // Nothing arrived in time; loop around to check the
                    // stop flag. Partial bytes stay in `pending`.
                }
                Err(e) => {
                    debug!("Failed to read line from serial: {}", e);
                    return;
                }
            }
        }
    });

    rx
}
