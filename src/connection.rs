//! Device connection lifecycle: transports, supervision, reconnect policy.

pub mod hid;
pub mod serial;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::events::{ButtonEvent, SliderMoveEvent};

/// Settle delay after `stop()` during a reload-triggered renew, giving the
/// device handle time to actually close before reopening.
pub(crate) const RENEW_SETTLE: Duration = Duration::from_millis(50);

/// Ceiling for the open-failure retry delay.
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(100);

/// Errors surfaced by connection start/stop.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// `start()` was called while a connection is active.
    #[error("connection already active")]
    AlreadyConnected,

    /// No HID device matched the configured identifiers.
    #[error(
        "no HID device matches {vendor_id:04x}:{product_id:04x} usage {usage_page:04x}/{usage:04x}"
    )]
    DeviceNotFound {
        vendor_id: u16,
        product_id: u16,
        usage_page: u16,
        usage: u16,
    },

    /// Opening the underlying device failed.
    #[error("failed to open device: {0}")]
    Open(String),
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Serial endpoint addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialParams {
    pub port: String,
    pub baud_rate: u32,
}

impl SerialParams {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            port: config.com_port.clone(),
            baud_rate: config.baud_rate,
        }
    }
}

/// HID endpoint addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HidParams {
    pub vendor_id: u16,
    pub product_id: u16,
    pub usage_page: u16,
    pub usage: u16,
}

impl HidParams {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            vendor_id: config.vendor_id,
            product_id: config.product_id,
            usage_page: config.usage_page,
            usage: config.usage,
        }
    }
}

/// The device endpoint a connection was opened against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionDescriptor {
    Serial(SerialParams),
    Hid(HidParams),
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionDescriptor::Serial(params) => {
                write!(f, "serial {} @ {} baud", params.port, params.baud_rate)
            }
            ConnectionDescriptor::Hid(params) => write!(
                f,
                "hid {:04x}:{:04x} usage {:04x}/{:04x}",
                params.vendor_id, params.product_id, params.usage_page, params.usage
            ),
        }
    }
}

/// Retry delay growth for serial open failures.
///
/// The delay starts at one second and, while below the cap, is multiplied
/// by the attempt number after each failure: 1s, 1s, 2s, 6s, 24s, 120s.
/// This attempt-scaled growth is part of the observable reconnect timing;
/// keep the law as is.
#[derive(Debug)]
pub struct RetryBackoff {
    delay: Duration,
    attempt: u32,
}

impl RetryBackoff {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_secs(1),
            attempt: 0,
        }
    }

    /// Delay to sleep after the next failure, advancing the growth law.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let current = self.delay;
        if self.delay < MAX_RETRY_DELAY {
            self.delay = current * self.attempt;
        }
        current
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle contract shared by the serial and HID connection variants.
///
/// All methods take `&self`; implementations use interior mutability so a
/// connection can be shared as `Arc<dyn DeviceConnection>`. The connected
/// check in `start` is not a compare-and-swap: callers must serialize
/// `start`/`stop` per instance, e.g. from a single controlling task.
#[async_trait]
pub trait DeviceConnection: Send + Sync {
    /// Open the device and begin dispatching events.
    async fn start(&self) -> Result<(), ConnectionError>;

    /// Close the active connection. No-op when not connected.
    async fn stop(&self);

    /// The endpoint this connection opens.
    fn descriptor(&self) -> ConnectionDescriptor;

    /// Receive slider move events for the lifetime of this instance.
    ///
    /// Registration is permanent; there is no unsubscribe.
    fn subscribe_slider_moves(&self) -> mpsc::Receiver<SliderMoveEvent>;

    /// Receive button events.
    ///
    /// The HID variant never delivers any - buttons are not part of its
    /// report format - so its channel stays silent for the whole lifetime.
    fn subscribe_button_events(&self) -> mpsc::Receiver<ButtonEvent>;
}
