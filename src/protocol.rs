//! Bus protocols and the physical configuration each one needs.

use strum_macros::{Display, EnumIter};

use crate::can::{Frame, Identifier};
use crate::decoder::{j1850, kline};
use crate::Result;

/// Functional OBD request ID for 11-bit ISO 15765-4
pub const OBD_FUNCTIONAL_STANDARD: u32 = 0x7df;
/// Functional OBD request ID for 29-bit ISO 15765-4
pub const OBD_FUNCTIONAL_EXTENDED: u32 = 0x18db_33f1;
/// Tester address used in legacy OBD headers
pub const TESTER_ADDRESS: u8 = 0xf1;

const KLINE_BITRATE: u32 = 10_400;
const VPW_BITRATE: u32 = 10_400;
const PWM_BITRATE: u32 = 41_600;
const ISO_TP_PADDING: u8 = 0x00;

/// Link-layer protocols that can be present on the diagnostic connector.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Display, EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Protocol {
    #[default]
    Unknown,
    #[strum(serialize = "CAN 11-bit")]
    Can11,
    #[strum(serialize = "CAN 29-bit")]
    Can29,
    #[strum(serialize = "ISO 9141-2")]
    Iso9141_2,
    #[strum(serialize = "ISO 14230-4 (KWP2000)")]
    Iso14230_4,
    #[strum(serialize = "ISO 15765-4 (CAN OBD)")]
    Iso15765_4,
    #[strum(serialize = "SAE J1850 PWM")]
    J1850Pwm,
    #[strum(serialize = "SAE J1850 VPW")]
    J1850Vpw,
}

/// Order in which candidates are probed: modern / most likely protocols first.
pub const DETECTION_ORDER: [Protocol; 7] = [
    Protocol::Can29,
    Protocol::Can11,
    Protocol::Iso15765_4,
    Protocol::Iso9141_2,
    Protocol::Iso14230_4,
    Protocol::J1850Pwm,
    Protocol::J1850Vpw,
];

impl Protocol {
    pub fn physical_layer(&self) -> Option<PhysicalLayer> {
        match self {
            Protocol::Unknown => None,
            Protocol::Can11 | Protocol::Can29 | Protocol::Iso15765_4 => Some(PhysicalLayer::Can),
            Protocol::Iso9141_2 | Protocol::Iso14230_4 => Some(PhysicalLayer::KLine),
            Protocol::J1850Pwm => Some(PhysicalLayer::J1850Pwm),
            Protocol::J1850Vpw => Some(PhysicalLayer::J1850Vpw),
        }
    }

    /// Whether data on this link has to be requested by the tester. Raw CAN protocols are
    /// listen-only.
    pub fn is_request_response(&self) -> bool {
        !matches!(self, Protocol::Unknown | Protocol::Can11 | Protocol::Can29)
    }

    /// Whether OBD DTC responses on this link carry a leading count byte.
    pub fn counts_dtcs(&self) -> bool {
        matches!(
            self,
            Protocol::Can11 | Protocol::Can29 | Protocol::Iso15765_4
        )
    }

    /// Bus configuration used while probing for and talking to this protocol.
    pub fn bus_config(&self, can_bitrate: u32, sample_point: f32) -> Option<BusConfig> {
        let layer = self.physical_layer()?;
        let bitrate = match layer {
            PhysicalLayer::Can => can_bitrate,
            PhysicalLayer::KLine => KLINE_BITRATE,
            PhysicalLayer::J1850Pwm => PWM_BITRATE,
            PhysicalLayer::J1850Vpw => VPW_BITRATE,
        };

        Some(BusConfig {
            layer,
            bitrate,
            sample_point,
            filter: AcceptanceFilter::accept_all(),
        })
    }

    /// Build an OBD request frame carrying `payload` (service byte first) for this protocol.
    /// Returns `None` for listen-only protocols.
    pub fn request(&self, addressing: Addressing, payload: &[u8]) -> Option<Result<Frame>> {
        let frame = match self {
            Protocol::Unknown | Protocol::Can11 | Protocol::Can29 => return None,
            Protocol::Iso15765_4 => {
                let id = match addressing {
                    Addressing::Standard => Identifier::Standard(OBD_FUNCTIONAL_STANDARD),
                    Addressing::Extended => Identifier::Extended(OBD_FUNCTIONAL_EXTENDED),
                };
                if payload.len() > 7 {
                    return Some(Err(crate::Error::MalformedFrame));
                }
                let mut buf = [ISO_TP_PADDING; 8];
                buf[0] = payload.len() as u8;
                buf[1..payload.len() + 1].copy_from_slice(payload);
                Frame::new(id, &buf)
            }
            Protocol::Iso9141_2 => {
                kline::message([0x68, 0x6a, TESTER_ADDRESS], payload)
            }
            Protocol::Iso14230_4 => {
                let format = kline::FORMAT_FUNCTIONAL | (payload.len() as u8 & 0x3f);
                kline::message([format, 0x33, TESTER_ADDRESS], payload)
            }
            Protocol::J1850Pwm => j1850::message([0x61, 0x6a, TESTER_ADDRESS], payload),
            Protocol::J1850Vpw => j1850::message([0x68, 0x6a, TESTER_ADDRESS], payload),
        };
        Some(frame)
    }
}

/// Electrical layer the transport must switch to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PhysicalLayer {
    Can,
    /// Single wire UART style link shared by ISO 9141-2 and ISO 14230-4
    KLine,
    J1850Pwm,
    J1850Vpw,
}

/// CAN addressing used by an ISO 15765-4 vehicle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Addressing {
    #[default]
    Standard,
    Extended,
}

/// Acceptance filter. Bits set in `mask` must match `code`; a zero mask accepts everything.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AcceptanceFilter {
    pub code: u32,
    pub mask: u32,
}

impl AcceptanceFilter {
    pub fn accept_all() -> Self {
        Self { code: 0, mask: 0 }
    }

    pub fn matches(&self, id: Identifier) -> bool {
        (u32::from(id) ^ self.code) & self.mask == 0
    }
}

impl Default for AcceptanceFilter {
    fn default() -> Self {
        Self::accept_all()
    }
}

/// Settings applied through [`crate::transport::Transport::configure`].
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BusConfig {
    pub layer: PhysicalLayer,
    /// The bitrate in bits per second
    pub bitrate: u32,
    /// Between 0 and 1, where 0 is 0% and 1 is 100% of the bit time.
    pub sample_point: f32,
    pub filter: AcceptanceFilter,
}
