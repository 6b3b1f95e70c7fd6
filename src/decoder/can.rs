//! Decoders for CAN based protocols: raw 11/29-bit broadcast traffic and ISO 15765-4 OBD.

use std::borrow::Cow;

use super::isotp::single_frame_payload;
use super::{mismatch, obd, FrameDecoder, Reading, Signal};
use crate::can::{Frame, Identifier};
use crate::protocol::Protocol;
use crate::Result;

const OBD_RESPONSE_STANDARD_FIRST: u32 = 0x7e8;
const OBD_RESPONSE_STANDARD_LAST: u32 = 0x7ef;
const OBD_RESPONSE_EXTENDED_MASK: u32 = 0x1fff_ff00;
const OBD_RESPONSE_EXTENDED_BASE: u32 = 0x18da_f100;

/// Whether `id` is one of the ECU response identifiers of ISO 15765-4.
pub fn obd_response_source(id: Identifier) -> bool {
    match id {
        Identifier::Standard(id) => {
            (OBD_RESPONSE_STANDARD_FIRST..=OBD_RESPONSE_STANDARD_LAST).contains(&id)
        }
        Identifier::Extended(id) => id & OBD_RESPONSE_EXTENDED_MASK == OBD_RESPONSE_EXTENDED_BASE,
        Identifier::Header(_) => false,
    }
}

fn decode_obd_frame(frame: &Frame) -> Result<Vec<Reading>> {
    match single_frame_payload(frame.data())? {
        Some(payload) => obd::decode_service(payload, true),
        // Segments are handled by the session's reassembler
        None => Ok(vec![]),
    }
}

/// Position of a manufacturer signal inside a broadcast frame.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SignalLayout {
    pub id: Identifier,
    pub name: String,
    pub unit: String,
    pub start_byte: usize,
    /// Between 1 and 4 bytes
    pub length: usize,
    pub big_endian: bool,
    pub signed: bool,
    pub scale: f64,
    pub offset: f64,
}

impl SignalLayout {
    /// Unsigned big-endian layout with unit scale.
    pub fn new(id: Identifier, name: &str, unit: &str, start_byte: usize, length: usize) -> Self {
        Self {
            id,
            name: name.to_string(),
            unit: unit.to_string(),
            start_byte,
            length,
            big_endian: true,
            signed: false,
            scale: 1.0,
            offset: 0.0,
        }
    }

    pub fn little_endian(mut self) -> Self {
        self.big_endian = false;
        self
    }

    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    pub fn scaled(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    /// Physical value of this signal, `None` if the payload is too short.
    pub fn extract(&self, data: &[u8]) -> Option<f64> {
        if self.length == 0 || self.length > 4 {
            return None;
        }
        let end = self.start_byte.checked_add(self.length)?;
        let bytes = data.get(self.start_byte..end)?;

        let mut buf = [0u8; 4];
        let raw = if self.big_endian {
            buf[4 - self.length..].copy_from_slice(bytes);
            u32::from_be_bytes(buf)
        } else {
            buf[..self.length].copy_from_slice(bytes);
            u32::from_le_bytes(buf)
        };

        let raw = if self.signed {
            let shift = 32 - 8 * self.length as u32;
            ((raw << shift) as i32 >> shift) as f64
        } else {
            raw as f64
        };

        Some(raw * self.scale + self.offset)
    }
}

/// Listen-only decoder for raw CAN traffic of one identifier width. OBD responses seen on the
/// bus are decoded too.
pub struct CanDecoder {
    protocol: Protocol,
    layouts: Vec<SignalLayout>,
}

impl CanDecoder {
    pub fn new(protocol: Protocol, layouts: Vec<SignalLayout>) -> Self {
        Self { protocol, layouts }
    }

    fn width_matches(&self, id: Identifier) -> bool {
        match self.protocol {
            Protocol::Can11 => id.is_standard(),
            Protocol::Can29 => id.is_extended(),
            _ => false,
        }
    }
}

impl FrameDecoder for CanDecoder {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn decode(&self, frame: &Frame) -> Result<Vec<Reading>> {
        let id = frame.id();
        if !self.width_matches(id) {
            return mismatch();
        }

        if obd_response_source(id) {
            return decode_obd_frame(frame);
        }

        let mut readings = vec![];
        for layout in self.layouts.iter().filter(|layout| layout.id == id) {
            let Some(value) = layout.extract(frame.data()) else {
                return mismatch();
            };
            readings.push(Reading::Signal(Signal {
                name: Cow::Owned(layout.name.clone()),
                value,
                unit: Cow::Owned(layout.unit.clone()),
            }));
        }
        Ok(readings)
    }
}

/// Decoder for OBD responses on ISO 15765-4. Traffic from other nodes is ignored.
pub struct Iso15765Decoder;

impl FrameDecoder for Iso15765Decoder {
    fn protocol(&self) -> Protocol {
        Protocol::Iso15765_4
    }

    fn decode(&self, frame: &Frame) -> Result<Vec<Reading>> {
        match frame.id() {
            Identifier::Header(_) => mismatch(),
            id if obd_response_source(id) => decode_obd_frame(frame),
            _ => Ok(vec![]),
        }
    }
}
