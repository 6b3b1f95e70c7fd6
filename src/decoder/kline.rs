//! K-line framing shared by ISO 9141-2 and ISO 14230-4.
//!
//! Messages are carried as a [`Frame`] with an [`Identifier::Header`] holding the three header
//! bytes. The frame data is the message body followed by the checksum, the sum of all header
//! and body bytes modulo 256.

use super::{mismatch, obd, FrameDecoder, Reading};
use crate::can::{Frame, Identifier, MAX_PAYLOAD_LEN};
use crate::error::Error;
use crate::protocol::{Protocol, TESTER_ADDRESS};
use crate::Result;

/// ISO 14230 format byte, physical addressing. The low six bits hold the body length.
pub const FORMAT_PHYSICAL: u8 = 0x80;
/// ISO 14230 format byte, functional addressing.
pub const FORMAT_FUNCTIONAL: u8 = 0xc0;
const FORMAT_MODE_MASK: u8 = 0xc0;
const FORMAT_LENGTH_MASK: u8 = 0x3f;

/// ISO 9141-2 response header prefix (priority, target)
const ISO9141_RESPONSE: [u8; 2] = [0x48, 0x6b];

pub fn checksum(header: &[u8], body: &[u8]) -> u8 {
    header
        .iter()
        .chain(body)
        .fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Build a K-line message with its checksum appended.
pub fn message(header: [u8; 3], body: &[u8]) -> Result<Frame> {
    if body.len() >= MAX_PAYLOAD_LEN {
        return Err(Error::MalformedFrame);
    }

    let mut buf = [0u8; MAX_PAYLOAD_LEN];
    buf[..body.len()].copy_from_slice(body);
    buf[body.len()] = checksum(&header, body);
    Frame::new(Identifier::Header(header), &buf[..body.len() + 1])
}

/// Split a K-line frame into header and body, verifying the checksum.
pub fn body(frame: &Frame) -> Result<([u8; 3], &[u8])> {
    let Some(header) = frame.id().header() else {
        return mismatch();
    };
    let Some((&cs, body)) = frame.data().split_last() else {
        return mismatch();
    };
    if checksum(&header, body) != cs {
        return mismatch();
    }
    Ok((header, body))
}

/// Decoder for ECU responses on ISO 9141-2 or ISO 14230-4.
pub struct KLineDecoder {
    protocol: Protocol,
}

impl KLineDecoder {
    pub fn new(protocol: Protocol) -> Self {
        Self { protocol }
    }

    fn header_matches(&self, header: [u8; 3], body_len: usize) -> bool {
        match self.protocol {
            Protocol::Iso9141_2 => header[..2] == ISO9141_RESPONSE,
            Protocol::Iso14230_4 => {
                let len = (header[0] & FORMAT_LENGTH_MASK) as usize;
                header[0] & FORMAT_MODE_MASK == FORMAT_PHYSICAL
                    && header[1] == TESTER_ADDRESS
                    && (len == 0 || len == body_len)
            }
            _ => false,
        }
    }
}

impl FrameDecoder for KLineDecoder {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn decode(&self, frame: &Frame) -> Result<Vec<Reading>> {
        let (header, body) = body(frame)?;
        if !self.header_matches(header, body.len()) {
            return mismatch();
        }
        obd::decode_service(body, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{names, Signal};

    #[test]
    fn iso9141_response() {
        let frame = message([0x48, 0x6b, 0x10], &[0x41, 0x0d, 0x32]).unwrap();
        let decoder = KLineDecoder::new(Protocol::Iso9141_2);
        assert_eq!(
            decoder.decode(&frame).unwrap(),
            vec![Reading::Signal(Signal::new(names::VEHICLE_SPEED, 50.0, "km/h"))]
        );

        // Same message on the wrong K-line protocol
        let decoder = KLineDecoder::new(Protocol::Iso14230_4);
        assert_eq!(decoder.decode(&frame), Err(Error::DecodeMismatch));
    }

    #[test]
    fn kwp_response() {
        let frame = message([0x83, 0xf1, 0x10], &[0x41, 0x05, 0x73]).unwrap();
        let decoder = KLineDecoder::new(Protocol::Iso14230_4);
        assert_eq!(
            decoder.decode(&frame).unwrap(),
            vec![Reading::Signal(Signal::new(names::COOLANT_TEMPERATURE, 75.0, "°C"))]
        );

        // Format byte length disagrees with the body
        let frame = message([0x84, 0xf1, 0x10], &[0x41, 0x05, 0x73]).unwrap();
        assert_eq!(decoder.decode(&frame), Err(Error::DecodeMismatch));
    }

    #[test]
    fn bad_checksum() {
        let frame = Frame::new(Identifier::Header([0x48, 0x6b, 0x10]), &[0x41, 0x0d, 0x32, 0x00])
            .unwrap();
        assert_eq!(
            KLineDecoder::new(Protocol::Iso9141_2).decode(&frame),
            Err(Error::DecodeMismatch)
        );
    }

    #[test]
    fn dtcs_are_uncounted() {
        let frame = message([0x48, 0x6b, 0x10], &[0x43, 0x01, 0x43, 0x03, 0x00, 0x00, 0x00])
            .unwrap();
        assert_eq!(
            KLineDecoder::new(Protocol::Iso9141_2).decode(&frame).unwrap(),
            vec![Reading::TroubleCodes(vec![0x0143, 0x0300])]
        );
    }

    #[test]
    fn body_too_long() {
        assert_eq!(
            message([0x68, 0x6a, 0xf1], &[0u8; 8]),
            Err(Error::MalformedFrame)
        );
    }
}
