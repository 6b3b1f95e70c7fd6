//! SAE J1850 PWM and VPW framing.
//!
//! A message is a three byte header, up to seven data bytes and a CRC-8 over header and data.
//! It is carried as a [`Frame`] with an [`Identifier::Header`]; the CRC stays in the frame data.
//! The waveform helpers turn a captured level sequence back into message bytes and are used by
//! passive detection.

use crc::{Crc, CRC_8_SAE_J1850};

use super::{mismatch, obd, FrameDecoder, Reading};
use crate::can::{Frame, Identifier, MAX_PAYLOAD_LEN};
use crate::error::Error;
use crate::protocol::{PhysicalLayer, Protocol};
use crate::transport::Pulse;
use crate::Result;

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SAE_J1850);

const HEADER_LEN: usize = 3;
const PWM_RESPONSE: [u8; 2] = [0x41, 0x6b];
const VPW_RESPONSE: [u8; 2] = [0x48, 0x6b];

// VPW symbol timing, microseconds
const VPW_SHORT: u32 = 64;
const VPW_LONG: u32 = 128;
const VPW_SOF: u32 = 200;
const VPW_EOF: u32 = 280;
const VPW_SHORT_MAX: u32 = 96;
const VPW_LONG_MAX: u32 = 163;

// PWM symbol timing, microseconds
const PWM_ONE_ACTIVE: u32 = 8;
const PWM_ZERO_ACTIVE: u32 = 16;
const PWM_BIT: u32 = 24;
const PWM_SOF_ACTIVE: u32 = 32;
const PWM_SOF_PASSIVE: u32 = 16;
const PWM_EOF: u32 = 72;
const PWM_ONE_MAX: u32 = 12;
const PWM_BIT_ACTIVE_MAX: u32 = 28;
const PWM_PASSIVE_MAX: u32 = 28;

pub fn crc8(bytes: &[u8]) -> u8 {
    CRC8.checksum(bytes)
}

/// Build a J1850 message with its CRC appended.
pub fn message(header: [u8; 3], body: &[u8]) -> Result<Frame> {
    if body.len() >= MAX_PAYLOAD_LEN {
        return Err(Error::MalformedFrame);
    }

    let mut digest = CRC8.digest();
    digest.update(&header);
    digest.update(body);

    let mut buf = [0u8; MAX_PAYLOAD_LEN];
    buf[..body.len()].copy_from_slice(body);
    buf[body.len()] = digest.finalize();
    Frame::new(Identifier::Header(header), &buf[..body.len() + 1])
}

/// Whether raw message bytes (header, data, CRC) end in a valid CRC.
pub fn crc_valid(bytes: &[u8]) -> bool {
    match bytes.split_last() {
        Some((&crc, rest)) if rest.len() >= HEADER_LEN => crc8(rest) == crc,
        _ => false,
    }
}

/// Convert raw message bytes from the wire into a frame.
pub fn frame_from_bytes(bytes: &[u8]) -> Result<Frame> {
    if bytes.len() <= HEADER_LEN {
        return Err(Error::MalformedFrame);
    }
    let header = [bytes[0], bytes[1], bytes[2]];
    Frame::new(Identifier::Header(header), &bytes[HEADER_LEN..])
}

/// Split a J1850 frame into header and body, verifying the CRC.
pub fn body(frame: &Frame) -> Result<([u8; 3], &[u8])> {
    let Some(header) = frame.id().header() else {
        return mismatch();
    };
    let Some((&crc, body)) = frame.data().split_last() else {
        return mismatch();
    };

    let mut digest = CRC8.digest();
    digest.update(&header);
    digest.update(body);
    if digest.finalize() != crc {
        return mismatch();
    }
    Ok((header, body))
}

/// Decoder for OBD responses on J1850 PWM or VPW. Intact messages between other nodes decode
/// to nothing.
pub struct J1850Decoder {
    protocol: Protocol,
}

impl J1850Decoder {
    pub fn new(protocol: Protocol) -> Self {
        Self { protocol }
    }
}

impl FrameDecoder for J1850Decoder {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn decode(&self, frame: &Frame) -> Result<Vec<Reading>> {
        let (header, body) = body(frame)?;
        let expected = match self.protocol {
            Protocol::J1850Pwm => PWM_RESPONSE,
            Protocol::J1850Vpw => VPW_RESPONSE,
            _ => return mismatch(),
        };
        if header[..2] != expected {
            return Ok(vec![]);
        }
        obd::decode_service(body, false)
    }
}

#[derive(Default)]
struct BitCollector {
    in_message: bool,
    bits: Vec<bool>,
    messages: Vec<Vec<u8>>,
}

impl BitCollector {
    fn start(&mut self) {
        self.flush();
        self.in_message = true;
    }

    fn push(&mut self, bit: bool) {
        if self.in_message {
            self.bits.push(bit);
        }
    }

    fn flush(&mut self) {
        if self.in_message {
            // Trailing partial byte is noise
            let bytes: Vec<u8> = self
                .bits
                .chunks_exact(8)
                .map(|bits| bits.iter().fold(0u8, |b, bit| (b << 1) | *bit as u8))
                .collect();
            if !bytes.is_empty() {
                self.messages.push(bytes);
            }
        }
        self.in_message = false;
        self.bits.clear();
    }
}

/// Reconstruct raw message bytes from a captured waveform. Symbols that do not fit the layer's
/// timing end the current message.
pub fn reconstruct(layer: PhysicalLayer, pulses: &[Pulse]) -> Vec<Vec<u8>> {
    let mut collector = BitCollector::default();

    match layer {
        PhysicalLayer::J1850Vpw => {
            for pulse in pulses {
                let d = pulse.duration_us;
                match (pulse.active, d) {
                    (true, d) if d > VPW_LONG_MAX => collector.start(),
                    (false, d) if d > VPW_LONG_MAX => collector.flush(),
                    // Active short is a one, passive short is a zero
                    (active, d) if d <= VPW_SHORT_MAX => collector.push(active),
                    (active, _) => collector.push(!active),
                }
            }
        }
        PhysicalLayer::J1850Pwm => {
            for pulse in pulses {
                let d = pulse.duration_us;
                match (pulse.active, d) {
                    (true, d) if d > PWM_BIT_ACTIVE_MAX => collector.start(),
                    (true, d) => collector.push(d <= PWM_ONE_MAX),
                    (false, d) if d > PWM_PASSIVE_MAX => collector.flush(),
                    (false, _) => {}
                }
            }
        }
        _ => return vec![],
    }

    collector.flush();
    collector.messages
}

fn bits(bytes: &[u8]) -> impl Iterator<Item = bool> + '_ {
    bytes
        .iter()
        .flat_map(|b| (0..8).rev().map(move |i| (b >> i) & 1 == 1))
}

/// Waveform of the given raw messages, each followed by an end-of-frame gap.
pub fn encode_pulses(layer: PhysicalLayer, messages: &[Vec<u8>]) -> Vec<Pulse> {
    let mut pulses = vec![];

    for msg in messages {
        match layer {
            PhysicalLayer::J1850Vpw => {
                pulses.push(Pulse::active(VPW_SOF));
                // Symbols alternate, starting passive after SOF
                for (i, bit) in bits(msg).enumerate() {
                    let active = i % 2 == 1;
                    let short = bit == active;
                    let duration = if short { VPW_SHORT } else { VPW_LONG };
                    pulses.push(Pulse { active, duration_us: duration });
                }
                pulses.push(Pulse::passive(VPW_EOF));
            }
            PhysicalLayer::J1850Pwm => {
                pulses.push(Pulse::active(PWM_SOF_ACTIVE));
                pulses.push(Pulse::passive(PWM_SOF_PASSIVE));
                for bit in bits(msg) {
                    let active = if bit { PWM_ONE_ACTIVE } else { PWM_ZERO_ACTIVE };
                    pulses.push(Pulse::active(active));
                    pulses.push(Pulse::passive(PWM_BIT - active));
                }
                if let Some(last) = pulses.last_mut() {
                    last.duration_us += PWM_EOF;
                }
            }
            _ => {}
        }
    }

    pulses
}
