//! Contract for the bus driver this crate runs on top of.
//!
//! The driver that owns the bus controller lives outside this crate. It is consumed through the
//! blocking [`Transport`] trait; every call is bounded by the timeout passed in and returns a
//! definite outcome. [`sim::SimulatedBus`] implements the trait for tests and demos.

pub mod sim;

use std::time::Duration;

use crate::can::Frame;
use crate::protocol::BusConfig;
use crate::Result;

const DEFAULT_BITRATE: u32 = 500_000;
const DEFAULT_SAMPLE_POINT: f32 = 0.8; // SAE J2284-4 and SAE J2284-5
const DEFAULT_QUEUE_LEN: usize = 5;

/// Initialization sequence for K-line links, performed by the driver.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkInit {
    /// ISO 9141-2 / ISO 14230-4 slow init: the address byte is clocked out at 5 baud. The driver
    /// returns the sync byte and both keyword bytes (`[0x55, kb1, kb2]`), completing the
    /// inverted-byte handshake itself.
    FiveBaud { address: u8 },
    /// ISO 14230-4 fast init: 25 ms low / 25 ms high wake-up pattern. Returns no bytes.
    Fast,
}

/// One level period of a captured J1850 waveform.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Pulse {
    /// `true` for the dominant (active) bus state
    pub active: bool,
    pub duration_us: u32,
}

impl Pulse {
    pub fn active(duration_us: u32) -> Self {
        Self {
            active: true,
            duration_us,
        }
    }

    pub fn passive(duration_us: u32) -> Self {
        Self {
            active: false,
            duration_us,
        }
    }
}

/// Trait for a blocking bus transport.
///
/// `configure` must only be called between completed transmit/receive cycles. Implementations
/// return [`crate::Error::TransportUnavailable`] once the bus controller is gone and
/// [`crate::Error::Timeout`] when a transmit could not complete in time.
pub trait Transport {
    /// Apply electrical, timing and filter settings.
    fn configure(&mut self, config: &BusConfig) -> Result<()>;
    /// Send a single frame, waiting at most `timeout` for it to leave the controller.
    fn transmit(&mut self, frame: &Frame, timeout: Duration) -> Result<()>;
    /// Wait at most `timeout` for the next frame. `Ok(None)` means the timeout elapsed.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>>;
    fn is_ready(&self) -> bool;

    /// Run a K-line initialization sequence.
    fn initialize_link(&mut self, _init: LinkInit, _timeout: Duration) -> Result<Vec<u8>> {
        Err(crate::Error::Unsupported)
    }

    /// Passively capture bus levels for at most `window`.
    fn capture(&mut self, _window: Duration) -> Result<Vec<Pulse>> {
        Err(crate::Error::Unsupported)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn configure(&mut self, config: &BusConfig) -> Result<()> {
        (**self).configure(config)
    }
    fn transmit(&mut self, frame: &Frame, timeout: Duration) -> Result<()> {
        (**self).transmit(frame, timeout)
    }
    fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        (**self).receive(timeout)
    }
    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }
    fn initialize_link(&mut self, init: LinkInit, timeout: Duration) -> Result<Vec<u8>> {
        (**self).initialize_link(init, timeout)
    }
    fn capture(&mut self, window: Duration) -> Result<Vec<Pulse>> {
        (**self).capture(window)
    }
}

/// Construction-time settings for a transport driver.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransportConfig {
    pub tx_pin: u8,
    pub rx_pin: u8,
    pub tx_queue_len: usize,
    pub rx_queue_len: usize,
    /// Bitrate applied before the first detection pass
    pub bitrate: u32,
    pub sample_point: f32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            tx_pin: 5,
            rx_pin: 4,
            tx_queue_len: DEFAULT_QUEUE_LEN,
            rx_queue_len: DEFAULT_QUEUE_LEN,
            bitrate: DEFAULT_BITRATE,
            sample_point: DEFAULT_SAMPLE_POINT,
        }
    }
}
