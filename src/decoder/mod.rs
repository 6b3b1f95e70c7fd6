//! Per-protocol frame decoding.
//!
//! Every [`Protocol`] has one [`FrameDecoder`] in a [`DecoderTable`]. Decoders are pure: the
//! same frame always yields the same readings. Malformed frames are reported as
//! [`Error::DecodeMismatch`] to callers that count them, and collapse to an empty sequence
//! through [`DecoderTable::decode`].

mod can;
pub mod isotp;
pub mod j1850;
pub mod kline;
pub mod obd;

use std::borrow::Cow;

pub use can::{obd_response_source, CanDecoder, Iso15765Decoder, SignalLayout};
pub use j1850::J1850Decoder;
pub use kline::KLineDecoder;

use crate::can::Frame;
use crate::error::Error;
use crate::protocol::Protocol;
use crate::Result;

use tracing::debug;

/// Parameter names produced by the OBD decoders.
pub mod names {
    pub const ENGINE_RPM: &str = "EngineRPM";
    pub const BATTERY_VOLTAGE: &str = "BatteryVoltage";
    pub const OIL_LEVEL: &str = "OilLevel";
    pub const OIL_TEMPERATURE: &str = "OilTemperature";
    pub const COOLANT_TEMPERATURE: &str = "CoolantTemperature";
    pub const FUEL_LEVEL: &str = "FuelLevel";
    pub const VEHICLE_SPEED: &str = "VehicleSpeed";
    pub const THROTTLE_POSITION: &str = "ThrottlePosition";
    pub const ENGINE_LOAD: &str = "EngineLoad";
    pub const INTAKE_MANIFOLD_PRESSURE: &str = "IntakeManifoldPressure";
    pub const INTAKE_AIR_TEMPERATURE: &str = "IntakeAirTemperature";
    pub const MASS_AIR_FLOW: &str = "MassAirFlow";
    pub const AMBIENT_AIR_TEMPERATURE: &str = "AmbientAirTemperature";
    pub const MIL_STATUS: &str = "MilStatus";
    pub const STORED_DTC_COUNT: &str = "StoredDtcCount";
}

/// A named vehicle signal extracted from a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub name: Cow<'static, str>,
    pub value: f64,
    pub unit: Cow<'static, str>,
}

impl Signal {
    pub fn new(name: &'static str, value: f64, unit: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            value,
            unit: Cow::Borrowed(unit),
        }
    }
}

/// Everything a decoder can extract from a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Signal(Signal),
    /// Stored trouble codes as reported by the vehicle, in wire order
    TroubleCodes(Vec<u16>),
    /// The vehicle acknowledged a clear-codes request
    TroubleCodesCleared,
}

/// Decoding capability for the frames of one protocol.
pub trait FrameDecoder: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Decode a single received frame.
    fn decode(&self, frame: &Frame) -> Result<Vec<Reading>>;

    /// Decode a complete OBD service payload (service byte first), e.g. one reassembled from
    /// several transport frames.
    fn decode_message(&self, payload: &[u8]) -> Result<Vec<Reading>> {
        obd::decode_service(payload, self.protocol().counts_dtcs())
    }
}

/// Decoder for [`Protocol::Unknown`]: accepts nothing.
struct NullDecoder;

impl FrameDecoder for NullDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Unknown
    }

    fn decode(&self, _frame: &Frame) -> Result<Vec<Reading>> {
        Ok(vec![])
    }

    fn decode_message(&self, _payload: &[u8]) -> Result<Vec<Reading>> {
        Ok(vec![])
    }
}

/// Dispatch table holding one decoder per protocol.
pub struct DecoderTable {
    decoders: Vec<Box<dyn FrameDecoder>>,
    unknown: NullDecoder,
}

impl DecoderTable {
    pub fn new() -> Self {
        Self::with_layouts(vec![])
    }

    /// Table whose raw CAN decoders also extract the given broadcast signals.
    pub fn with_layouts(layouts: Vec<SignalLayout>) -> Self {
        let (standard, extended): (Vec<_>, Vec<_>) =
            layouts.into_iter().partition(|layout| layout.id.is_standard());

        let decoders: Vec<Box<dyn FrameDecoder>> = vec![
            Box::new(CanDecoder::new(Protocol::Can11, standard)),
            Box::new(CanDecoder::new(Protocol::Can29, extended)),
            Box::new(Iso15765Decoder),
            Box::new(KLineDecoder::new(Protocol::Iso9141_2)),
            Box::new(KLineDecoder::new(Protocol::Iso14230_4)),
            Box::new(J1850Decoder::new(Protocol::J1850Pwm)),
            Box::new(J1850Decoder::new(Protocol::J1850Vpw)),
        ];

        Self {
            decoders,
            unknown: NullDecoder,
        }
    }

    /// Decoder for `protocol`. Looked up once per detection cycle by the session.
    pub fn get(&self, protocol: Protocol) -> &dyn FrameDecoder {
        self.decoders
            .iter()
            .find(|decoder| decoder.protocol() == protocol)
            .map(|decoder| decoder.as_ref())
            .unwrap_or(&self.unknown)
    }

    /// Decode `frame` as `protocol`. Frames that do not fit the protocol yield nothing.
    pub fn decode(&self, frame: &Frame, protocol: Protocol) -> Vec<Reading> {
        match self.get(protocol).decode(frame) {
            Ok(readings) => readings,
            Err(e) => {
                debug!("Dropping {:?} as {}: {}", frame, protocol, e);
                vec![]
            }
        }
    }
}

impl Default for DecoderTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Shorthand used by the decoders for frames that do not match the protocol's layout.
pub(crate) fn mismatch<T>() -> Result<T> {
    Err(Error::DecodeMismatch)
}
