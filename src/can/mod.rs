//! Generic frame types shared by every bus protocol.

use std::fmt;
use std::time::Instant;

/// Maximum payload of a classic CAN frame, also the largest J1850 / K-line OBD message body
/// (7 data bytes + checksum).
pub const MAX_PAYLOAD_LEN: usize = 8;

const MAX_STANDARD_ID: u32 = 0x7ff;
const MAX_EXTENDED_ID: u32 = 0x1fff_ffff;

/// Identifier for a frame
#[derive(Copy, Clone, PartialOrd, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Identifier {
    /// 11-bit CAN identifier
    Standard(u32),
    /// 29-bit CAN identifier
    Extended(u32),
    /// 3-byte message header used by J1850 and K-line (priority/format, target, source)
    Header([u8; 3]),
}

impl Identifier {
    pub fn is_standard(&self) -> bool {
        matches!(self, Identifier::Standard(_))
    }
    pub fn is_extended(&self) -> bool {
        matches!(self, Identifier::Extended(_))
    }
    pub fn is_can(&self) -> bool {
        !matches!(self, Identifier::Header(_))
    }

    /// Header bytes of a J1850 / K-line message.
    pub fn header(&self) -> Option<[u8; 3]> {
        match self {
            Identifier::Header(header) => Some(*header),
            _ => None,
        }
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Extended(id) => write!(f, "0x{:08x}", id),
            Identifier::Standard(id) => write!(f, "0x{:03x}", id),
            Identifier::Header(header) => write!(f, "[{}]", hex::encode(header)),
        }
    }
}

impl From<u32> for Identifier {
    fn from(id: u32) -> Identifier {
        if id <= MAX_STANDARD_ID {
            Identifier::Standard(id)
        } else {
            Identifier::Extended(id)
        }
    }
}

impl From<[u8; 3]> for Identifier {
    fn from(header: [u8; 3]) -> Identifier {
        Identifier::Header(header)
    }
}

impl From<Identifier> for u32 {
    fn from(val: Identifier) -> u32 {
        match val {
            Identifier::Standard(id) => id,
            Identifier::Extended(id) => id,
            Identifier::Header([a, b, c]) => u32::from_be_bytes([0, a, b, c]),
        }
    }
}

/// A single bus frame. Immutable once created; payload is stored inline.
#[derive(Copy, Clone)]
pub struct Frame {
    id: Identifier,
    len: u8,
    data: [u8; MAX_PAYLOAD_LEN],
    timestamp: Instant,
}

impl Frame {
    /// Create a frame stamped with the current time.
    pub fn new(id: Identifier, data: &[u8]) -> Result<Frame, crate::error::Error> {
        Frame::with_timestamp(id, data, Instant::now())
    }

    pub fn with_timestamp(
        id: Identifier,
        data: &[u8],
        timestamp: Instant,
    ) -> Result<Frame, crate::error::Error> {
        if data.len() > MAX_PAYLOAD_LEN {
            return Err(crate::error::Error::MalformedFrame);
        }

        match id {
            Identifier::Standard(id) if id > MAX_STANDARD_ID => {
                return Err(crate::error::Error::MalformedFrame)
            }
            Identifier::Extended(id) if id > MAX_EXTENDED_ID => {
                return Err(crate::error::Error::MalformedFrame)
            }
            _ => {}
        };

        let mut buf = [0u8; MAX_PAYLOAD_LEN];
        buf[..data.len()].copy_from_slice(data);

        Ok(Frame {
            id,
            len: data.len() as u8,
            data: buf,
            timestamp,
        })
    }

    pub fn id(&self) -> Identifier {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Arrival time for received frames, creation time otherwise.
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }
}

/// Frames compare by content; arrival time is not part of identity.
impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.data() == other.data()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("data", &hex::encode(self.data()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_compare() {
        assert_eq!(true, Identifier::Standard(0x123) < Identifier::Standard(0x124));
        assert_eq!(true, Identifier::Standard(0x7ff) > Identifier::Standard(0x100));

        // Extended IDs always have lower priority than standard IDs
        assert_eq!(true, Identifier::Extended(0x1) > Identifier::Standard(0x100));
    }

    #[test]
    fn id_from_u32() {
        assert_eq!(Identifier::from(0x7e8), Identifier::Standard(0x7e8));
        assert_eq!(Identifier::from(0x18daf110), Identifier::Extended(0x18daf110));
        assert_eq!(u32::from(Identifier::Header([0x48, 0x6b, 0x10])), 0x486b10);
    }

    #[test]
    fn frame_rejects_oversize_payload() {
        let e = Frame::new(Identifier::Standard(0x7e8), &[0u8; 9]);
        assert_eq!(e.unwrap_err(), crate::Error::MalformedFrame);
    }

    #[test]
    fn frame_rejects_out_of_range_ids() {
        assert!(Frame::new(Identifier::Standard(0x800), &[]).is_err());
        assert!(Frame::new(Identifier::Extended(0x2000_0000), &[]).is_err());
        assert!(Frame::new(Identifier::Extended(0x1fff_ffff), &[]).is_ok());
    }

    #[test]
    fn frame_keeps_payload() {
        let frame = Frame::new(Identifier::Standard(0x7e8), &[0x03, 0x41, 0x0d, 0x32]).unwrap();
        assert_eq!(frame.data(), &[0x03, 0x41, 0x0d, 0x32]);
        assert_eq!(format!("{:?}", frame), "Frame { id: 0x7e8, data: \"03410d32\" }");
    }
}
