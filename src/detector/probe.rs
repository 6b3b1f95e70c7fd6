//! One bounded probe per candidate protocol.
//!
//! A probe runs after the transport was configured for the candidate's physical layer. It
//! returns `Ok(Some(addressing))` when the candidate accepts, `Ok(None)` when it rejects, and
//! propagates transport errors. Every step is bounded by the probe deadline, except the K-line
//! initialization handshake whose duration is fixed by the link itself.

use std::time::{Duration, Instant};

use tracing::debug;

use super::DetectorConfig;
use crate::can::{Frame, Identifier};
use crate::decoder::isotp::single_frame_payload;
use crate::decoder::obd::{service, POSITIVE_RESPONSE};
use crate::decoder::{j1850, kline, obd_response_source};
use crate::error::Error;
use crate::protocol::{Addressing, PhysicalLayer, Protocol, TESTER_ADDRESS};
use crate::transport::{LinkInit, Transport};
use crate::Result;

/// Mode 01 PID 00: supported PIDs, answered by every OBD-II ECU
const SUPPORTED_PIDS_REQUEST: [u8; 2] = [service::CURRENT_DATA, 0x00];
const SUPPORTED_PIDS_RESPONSE: [u8; 2] = [service::CURRENT_DATA | POSITIVE_RESPONSE, 0x00];

const KLINE_INIT_ADDRESS: u8 = 0x33;
const SYNC: u8 = 0x55;
const ISO9141_KEYWORDS: [[u8; 2]; 2] = [[0x08, 0x08], [0x94, 0x94]];
const KWP_KB2: u8 = 0x8f;
const KWP_START_COMMUNICATION: u8 = 0x81;
const KWP_START_COMMUNICATION_HEADER: [u8; 3] = [kline::FORMAT_FUNCTIONAL | 1, 0x33, TESTER_ADDRESS];
const ISO9141_RESPONSE: [u8; 2] = [0x48, 0x6b];
const PWM_RESPONSE: [u8; 2] = [0x41, 0x6b];
const VPW_RESPONSE: [u8; 2] = [0x48, 0x6b];
const J1850_MIN_CAPTURED: usize = 2;

pub(super) type Verdict = Option<Addressing>;

struct Deadline(Instant);

impl Deadline {
    fn after(timeout: Duration) -> Self {
        Deadline(Instant::now() + timeout)
    }

    fn remaining(&self) -> Option<Duration> {
        let remaining = self.0.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then_some(remaining)
    }
}

/// Receive until `accept` returns true or the deadline passes.
fn listen<F>(transport: &mut dyn Transport, deadline: &Deadline, mut accept: F) -> Result<bool>
where
    F: FnMut(&Frame) -> bool,
{
    while let Some(remaining) = deadline.remaining() {
        match transport.receive(remaining)? {
            Some(frame) if accept(&frame) => return Ok(true),
            Some(_) => continue,
            None => break,
        }
    }
    Ok(false)
}

pub(super) fn run(
    protocol: Protocol,
    transport: &mut dyn Transport,
    config: &DetectorConfig,
) -> Result<Verdict> {
    match protocol {
        Protocol::Unknown => Ok(None),
        Protocol::Can11 => passive_can(transport, config, false),
        Protocol::Can29 => passive_can(transport, config, true),
        Protocol::Iso15765_4 => iso15765(transport, config),
        Protocol::Iso9141_2 => iso9141(transport, config),
        Protocol::Iso14230_4 => iso14230(transport, config),
        Protocol::J1850Pwm | Protocol::J1850Vpw => j1850(protocol, transport, config),
    }
}

/// Listen for `min_consecutive_frames` frames in a row of the wanted ID width. Frames of the
/// other width reset the run, so a single ambiguous frame never decides.
fn passive_can(
    transport: &mut dyn Transport,
    config: &DetectorConfig,
    extended: bool,
) -> Result<Verdict> {
    let deadline = Deadline::after(config.probe_timeout);
    let mut run = 0;

    let accepted = listen(transport, &deadline, |frame| {
        match frame.id() {
            Identifier::Extended(_) if extended => run += 1,
            Identifier::Standard(_) if !extended => run += 1,
            Identifier::Header(_) => {}
            id => {
                debug!("Contrary frame {:?}, resetting run of {}", id, run);
                run = 0;
            }
        }
        run >= config.min_consecutive_frames
    })?;

    Ok(accepted.then_some(Addressing::Standard))
}

fn iso15765(transport: &mut dyn Transport, config: &DetectorConfig) -> Result<Verdict> {
    let per_addressing = config.probe_timeout / 2;

    for addressing in [Addressing::Standard, Addressing::Extended] {
        let deadline = Deadline::after(per_addressing);
        let Some(request) = Protocol::Iso15765_4.request(addressing, &SUPPORTED_PIDS_REQUEST)
        else {
            return Ok(None);
        };
        transport.transmit(&request?, per_addressing)?;

        let accepted = listen(transport, &deadline, |frame| {
            let id = frame.id();
            let width_matches = match addressing {
                Addressing::Standard => id.is_standard(),
                Addressing::Extended => id.is_extended(),
            };
            width_matches
                && obd_response_source(id)
                && matches!(
                    single_frame_payload(frame.data()),
                    Ok(Some(payload)) if payload.starts_with(&SUPPORTED_PIDS_RESPONSE)
                )
        })?;

        if accepted {
            return Ok(Some(addressing));
        }
    }
    Ok(None)
}

/// Send mode 01 PID 00 and wait for a positive answer accepted by `valid`, all before
/// `deadline`.
fn supported_pids_exchange<F>(
    protocol: Protocol,
    transport: &mut dyn Transport,
    deadline: &Deadline,
    valid: F,
) -> Result<bool>
where
    F: Fn(&Frame) -> Option<Vec<u8>>,
{
    let Some(request) = protocol.request(Addressing::Standard, &SUPPORTED_PIDS_REQUEST) else {
        return Ok(false);
    };
    let Some(remaining) = deadline.remaining() else {
        return Ok(false);
    };
    transport.transmit(&request?, remaining)?;

    listen(transport, &deadline, |frame| {
        valid(frame).is_some_and(|body| body.starts_with(&SUPPORTED_PIDS_RESPONSE))
    })
}

fn iso9141_body(frame: &Frame) -> Option<Vec<u8>> {
    let (header, body) = kline::body(frame).ok()?;
    (header[..2] == ISO9141_RESPONSE).then(|| body.to_vec())
}

fn kwp_body(frame: &Frame) -> Option<Vec<u8>> {
    let (header, body) = kline::body(frame).ok()?;
    let physical = header[0] & 0xc0 == kline::FORMAT_PHYSICAL;
    (physical && header[1] == TESTER_ADDRESS).then(|| body.to_vec())
}

fn iso9141(transport: &mut dyn Transport, config: &DetectorConfig) -> Result<Verdict> {
    let init = LinkInit::FiveBaud {
        address: KLINE_INIT_ADDRESS,
    };
    let keywords = transport.initialize_link(init, config.link_init_timeout)?;

    let valid_keywords = keywords.len() == 3
        && keywords[0] == SYNC
        && ISO9141_KEYWORDS.iter().any(|kw| keywords[1..] == kw[..]);
    if !valid_keywords {
        debug!("ISO 9141-2 keywords rejected: {}", hex::encode(&keywords));
        return Ok(None);
    }

    let deadline = Deadline::after(config.probe_timeout);
    let accepted =
        supported_pids_exchange(Protocol::Iso9141_2, transport, &deadline, iso9141_body)?;
    Ok(accepted.then_some(Addressing::Standard))
}

fn iso14230(transport: &mut dyn Transport, config: &DetectorConfig) -> Result<Verdict> {
    match transport.initialize_link(LinkInit::Fast, config.link_init_timeout) {
        Ok(_) => {
            let deadline = Deadline::after(config.probe_timeout);
            let request = kline::message(KWP_START_COMMUNICATION_HEADER, &[KWP_START_COMMUNICATION])?;
            let Some(remaining) = deadline.remaining() else {
                return Ok(None);
            };
            transport.transmit(&request, remaining)?;

            let accepted = listen(transport, &deadline, |frame| {
                kwp_body(frame).is_some_and(|body| {
                    body.first() == Some(&(KWP_START_COMMUNICATION | POSITIVE_RESPONSE))
                        && body.get(2) == Some(&KWP_KB2)
                })
            })?;
            Ok(accepted.then_some(Addressing::Standard))
        }
        Err(Error::Timeout) | Err(Error::Unsupported) => {
            // Slow init is allowed by ISO 14230-4 as well
            debug!("KWP fast init failed, trying 5-baud init");
            let init = LinkInit::FiveBaud {
                address: KLINE_INIT_ADDRESS,
            };
            let keywords = transport.initialize_link(init, config.link_init_timeout)?;
            if keywords.len() != 3 || keywords[0] != SYNC || keywords[2] != KWP_KB2 {
                debug!("ISO 14230-4 keywords rejected: {}", hex::encode(&keywords));
                return Ok(None);
            }

            let deadline = Deadline::after(config.probe_timeout);
            let accepted =
                supported_pids_exchange(Protocol::Iso14230_4, transport, &deadline, kwp_body)?;
            Ok(accepted.then_some(Addressing::Standard))
        }
        Err(e) => Err(e),
    }
}

fn j1850(
    protocol: Protocol,
    transport: &mut dyn Transport,
    config: &DetectorConfig,
) -> Result<Verdict> {
    let (layer, response) = match protocol {
        Protocol::J1850Pwm => (PhysicalLayer::J1850Pwm, PWM_RESPONSE),
        _ => (PhysicalLayer::J1850Vpw, VPW_RESPONSE),
    };

    // Capture and challenge share one deadline
    let deadline = Deadline::after(config.probe_timeout);

    // Passive first: a busy bus confirms the layer without sending anything
    let Some(window) = deadline.remaining() else {
        return Ok(None);
    };
    match transport.capture(window) {
        Ok(pulses) => {
            let valid = j1850::reconstruct(layer, &pulses)
                .iter()
                .filter_map(|raw| j1850::frame_from_bytes(raw).ok())
                .filter(|frame| j1850::body(frame).is_ok())
                .count();
            if valid >= J1850_MIN_CAPTURED {
                return Ok(Some(Addressing::Standard));
            }
            debug!("{}: {} valid messages captured", protocol, valid);
        }
        Err(Error::Unsupported) => {}
        Err(e) => return Err(e),
    }

    let accepted = supported_pids_exchange(protocol, transport, &deadline, |frame| {
        let (header, body) = j1850::body(frame).ok()?;
        (header[..2] == response).then(|| body.to_vec())
    })?;
    Ok(accepted.then_some(Addressing::Standard))
}
