//! ISO Transport Protocol (ISO 15765-2) receive path for OBD responses longer than one frame.

use crate::can::{Frame, Identifier};
use crate::error::Error;
use crate::Result;

use tracing::debug;

const PADDING: u8 = 0x00;
const MAX_MESSAGE_LEN: usize = 4095;

#[derive(Debug, PartialEq, Copy, Clone)]
#[repr(u8)]
pub enum FrameType {
    Single = 0x00,
    First = 0x10,
    Consecutive = 0x20,
    FlowControl = 0x30,
    Unknown = 0xff,
}

pub static FRAME_TYPE_MASK: u8 = 0xf0;

impl From<u8> for FrameType {
    fn from(val: u8) -> FrameType {
        match val & FRAME_TYPE_MASK {
            0x00 => FrameType::Single,
            0x10 => FrameType::First,
            0x20 => FrameType::Consecutive,
            0x30 => FrameType::FlowControl,
            _ => FrameType::Unknown,
        }
    }
}

/// Payload of a single frame, or `None` for frames that belong to a segmented transfer.
pub fn single_frame_payload(data: &[u8]) -> Result<Option<&[u8]>> {
    let Some(&pci) = data.first() else {
        return Err(Error::DecodeMismatch);
    };

    match FrameType::from(pci) {
        FrameType::Single => {
            let len = (pci & 0xf) as usize;
            if len == 0 || len + 1 > data.len() {
                return Err(Error::DecodeMismatch);
            }
            Ok(Some(&data[1..len + 1]))
        }
        FrameType::First | FrameType::Consecutive | FrameType::FlowControl => Ok(None),
        FrameType::Unknown => Err(Error::DecodeMismatch),
    }
}

/// Physical request ID answering a response ID, used to address flow control.
pub fn request_id_for(response: Identifier) -> Identifier {
    match response {
        Identifier::Standard(id) => Identifier::Standard(id.saturating_sub(8)),
        Identifier::Extended(id) => {
            let bytes = id.to_be_bytes();
            let id = u32::from_be_bytes([bytes[0], bytes[1], bytes[3], bytes[2]]); // Swap last two bytes
            Identifier::Extended(id)
        }
        header => header,
    }
}

/// Flow control frame (ContinueToSend, no block size limit, no separation time).
pub fn flow_control(to: Identifier) -> Result<Frame> {
    let mut buf = [PADDING; 8];
    buf[0] = FrameType::FlowControl as u8;
    Frame::new(to, &buf)
}

/// Outcome of feeding one frame to the [`Reassembler`].
#[derive(Debug, PartialEq)]
pub enum Progress {
    /// Not part of a segmented transfer
    Ignored,
    /// A transfer started; the sender waits for flow control on the given ID
    Started { flow_control_to: Identifier },
    Pending,
    Complete { source: Identifier, payload: Vec<u8> },
}

/// Reassembles First Frame + Consecutive Frame sequences. One transfer at a time; a new First
/// Frame abandons the one in progress.
#[derive(Debug, Default)]
pub struct Reassembler {
    source: Option<Identifier>,
    len: usize,
    idx: u8,
    buf: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.source = None;
        self.len = 0;
        self.idx = 0;
        self.buf.clear();
    }

    pub fn push(&mut self, frame: &Frame) -> Result<Progress> {
        let data = frame.data();
        let Some(&pci) = data.first() else {
            return Ok(Progress::Ignored);
        };

        match FrameType::from(pci) {
            FrameType::First => self.first_frame(frame),
            FrameType::Consecutive => self.consecutive_frame(frame),
            _ => Ok(Progress::Ignored),
        }
    }

    fn first_frame(&mut self, frame: &Frame) -> Result<Progress> {
        let data = frame.data();
        if data.len() < 3 {
            self.reset();
            return Err(Error::DecodeMismatch);
        }

        let b0 = data[0] as u16;
        let b1 = data[1] as u16;
        let len = ((b0 << 8 | b1) & 0xfff) as usize;
        if len < data.len() - 1 || len > MAX_MESSAGE_LEN {
            self.reset();
            return Err(Error::DecodeMismatch);
        }

        debug!("RX FF, length: {}, data {}", len, hex::encode(data));

        self.reset();
        self.source = Some(frame.id());
        self.len = len;
        self.idx = 1;
        self.buf.extend_from_slice(&data[2..]);

        Ok(Progress::Started {
            flow_control_to: request_id_for(frame.id()),
        })
    }

    fn consecutive_frame(&mut self, frame: &Frame) -> Result<Progress> {
        if self.source != Some(frame.id()) {
            return Ok(Progress::Ignored);
        }

        let data = frame.data();
        let msg_idx = data[0] & 0xf;
        if msg_idx != self.idx {
            debug!("RX CF out of order, expected {} got {}", self.idx, msg_idx);
            self.reset();
            return Err(Error::DecodeMismatch);
        }

        let remaining_len = self.len - self.buf.len();
        let end_idx = std::cmp::min(remaining_len + 1, data.len());
        self.buf.extend_from_slice(&data[1..end_idx]);

        self.idx = if self.idx == 0xf { 0 } else { self.idx + 1 };

        if self.buf.len() < self.len {
            return Ok(Progress::Pending);
        }

        let source = frame.id();
        let payload = std::mem::take(&mut self.buf);
        self.reset();
        Ok(Progress::Complete { source, payload })
    }
}
