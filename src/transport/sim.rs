//! Simulated vehicle bus.
//!
//! [`SimulatedBus`] implements [`Transport`] on top of an in-memory vehicle. The vehicle talks one
//! [`Protocol`] and is only heard when the bus is configured for that protocol's physical layer
//! and bitrate. It answers OBD service 01, 03 and 04 requests from its PID table and stored
//! trouble codes, performs K-line initialization, segments long CAN responses with ISO-TP and
//! renders J1850 broadcast traffic as a captured waveform.
//!
//! The handle is cheap to clone; clones share the vehicle, so a test can keep one handle while the
//! session owns another.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use super::{LinkInit, Pulse, Transport, TransportConfig};
use crate::can::{Frame, Identifier};
use crate::decoder::isotp::{single_frame_payload, FrameType};
use crate::decoder::obd::{service, NEGATIVE_RESPONSE, POSITIVE_RESPONSE};
use crate::decoder::{j1850, kline};
use crate::dtc;
use crate::error::Error;
use crate::protocol::{
    Addressing, BusConfig, PhysicalLayer, Protocol, OBD_FUNCTIONAL_EXTENDED,
    OBD_FUNCTIONAL_STANDARD, TESTER_ADDRESS,
};
use crate::Result;

const ECU_ADDRESS: u8 = 0x10;
const ECU_RESPONSE_STANDARD: u32 = 0x7e8;
const ECU_REQUEST_STANDARD: u32 = 0x7e0;
const ECU_RESPONSE_EXTENDED: u32 = 0x18da_f110;
const ECU_REQUEST_EXTENDED: u32 = 0x18da_10f1;
const ISO_TP_PADDING: u8 = 0xaa;
const LEGACY_MAX_BODY: usize = 7;
const LEGACY_DTCS_PER_MESSAGE: usize = 3;
const KWP_START_COMMUNICATION: u8 = 0x81;
const KWP_KEYWORDS: [u8; 2] = [0xef, 0x8f];
const ISO9141_KEYWORDS: [u8; 2] = [0x08, 0x08];
const SYNC: u8 = 0x55;
const SUBFUNCTION_NOT_SUPPORTED: u8 = 0x12;
const SERVICE_NOT_SUPPORTED: u8 = 0x11;

/// Supported PIDs 01-20 bitmap answered by default
const DEFAULT_SUPPORTED_PIDS: [u8; 4] = [0xbe, 0x1f, 0xa8, 0x13];

struct Vehicle {
    protocol: Protocol,
    addressing: Addressing,
    can_bitrate: u32,
    pids: HashMap<u8, Vec<u8>>,
    dtcs: Vec<u16>,
    broadcast: Vec<Frame>,
    broadcast_idx: usize,
}

struct State {
    ready: bool,
    config: BusConfig,
    vehicle: Vehicle,
    link_initialized: bool,
    rx: VecDeque<Frame>,
    /// Consecutive frames waiting for flow control
    segments: VecDeque<Frame>,
    transmitted: Vec<Frame>,
}

impl State {
    fn vehicle_config(&self) -> Option<BusConfig> {
        self.vehicle
            .protocol
            .bus_config(self.vehicle.can_bitrate, self.config.sample_point)
    }

    /// Whether the configured bus can hear the vehicle.
    fn linked(&self) -> bool {
        match self.vehicle_config() {
            Some(vehicle) => {
                vehicle.layer == self.config.layer && vehicle.bitrate == self.config.bitrate
            }
            None => false,
        }
    }

    fn deliverable(&self, frame: &Frame) -> bool {
        match self.config.layer {
            PhysicalLayer::Can => frame.id().is_can() && self.config.filter.matches(frame.id()),
            _ => !frame.id().is_can(),
        }
    }

    fn respond(&mut self, frame: Frame) {
        self.rx.push_back(frame);
    }

    fn handle_request(&mut self, frame: &Frame) -> Result<()> {
        if !self.linked() {
            return Ok(());
        }

        match self.vehicle.protocol {
            Protocol::Iso15765_4 => self.handle_iso15765(frame),
            Protocol::Iso9141_2 | Protocol::Iso14230_4 => self.handle_kline(frame),
            Protocol::J1850Pwm | Protocol::J1850Vpw => self.handle_j1850(frame),
            // Listen-only vehicles ignore the tester
            _ => Ok(()),
        }
    }

    fn handle_iso15765(&mut self, frame: &Frame) -> Result<()> {
        let (functional, physical, response) = match self.vehicle.addressing {
            Addressing::Standard => (
                Identifier::Standard(OBD_FUNCTIONAL_STANDARD),
                Identifier::Standard(ECU_REQUEST_STANDARD),
                Identifier::Standard(ECU_RESPONSE_STANDARD),
            ),
            Addressing::Extended => (
                Identifier::Extended(OBD_FUNCTIONAL_EXTENDED),
                Identifier::Extended(ECU_REQUEST_EXTENDED),
                Identifier::Extended(ECU_RESPONSE_EXTENDED),
            ),
        };

        let id = frame.id();
        if id != functional && id != physical {
            return Ok(());
        }

        let Some(&pci) = frame.data().first() else {
            return Ok(());
        };
        if FrameType::from(pci) == FrameType::FlowControl {
            if id == physical {
                self.rx.extend(self.segments.drain(..));
            }
            return Ok(());
        }

        let Ok(Some(request)) = single_frame_payload(frame.data()) else {
            return Ok(());
        };
        let request = request.to_vec();

        for body in self.answer(&request, true) {
            self.send_segmented(response, &body)?;
        }
        Ok(())
    }

    fn send_segmented(&mut self, id: Identifier, body: &[u8]) -> Result<()> {
        let mut buf = [ISO_TP_PADDING; 8];

        if body.len() <= 7 {
            buf[0] = body.len() as u8;
            buf[1..body.len() + 1].copy_from_slice(body);
            self.respond(Frame::new(id, &buf)?);
            return Ok(());
        }

        buf[0] = FrameType::First as u8 | (body.len() >> 8) as u8;
        buf[1] = (body.len() & 0xff) as u8;
        buf[2..].copy_from_slice(&body[..6]);
        self.respond(Frame::new(id, &buf)?);

        self.segments.clear();
        for (i, chunk) in body[6..].chunks(7).enumerate() {
            let mut buf = [ISO_TP_PADDING; 8];
            buf[0] = FrameType::Consecutive as u8 | ((i + 1) & 0xf) as u8;
            buf[1..chunk.len() + 1].copy_from_slice(chunk);
            self.segments.push_back(Frame::new(id, &buf)?);
        }
        Ok(())
    }

    fn handle_kline(&mut self, frame: &Frame) -> Result<()> {
        if !self.link_initialized {
            return Ok(());
        }
        let Ok((header, body)) = kline::body(frame) else {
            return Ok(());
        };
        let body = body.to_vec();

        if self.vehicle.protocol == Protocol::Iso9141_2 {
            if header != [0x68, 0x6a, TESTER_ADDRESS] {
                return Ok(());
            }
            for body in self.answer(&body, false) {
                self.respond(kline::message([0x48, 0x6b, ECU_ADDRESS], &body)?);
            }
            return Ok(());
        }

        if header[1] != 0x33 || header[2] != TESTER_ADDRESS {
            return Ok(());
        }
        let bodies = if body.first() == Some(&KWP_START_COMMUNICATION) {
            vec![vec![KWP_START_COMMUNICATION | POSITIVE_RESPONSE, KWP_KEYWORDS[0], KWP_KEYWORDS[1]]]
        } else {
            self.answer(&body, false)
        };
        for body in bodies {
            let format = kline::FORMAT_PHYSICAL | body.len() as u8;
            self.respond(kline::message([format, TESTER_ADDRESS, ECU_ADDRESS], &body)?);
        }
        Ok(())
    }

    fn handle_j1850(&mut self, frame: &Frame) -> Result<()> {
        let (request, response) = match self.vehicle.protocol {
            Protocol::J1850Pwm => ([0x61, 0x6a, TESTER_ADDRESS], [0x41, 0x6b, ECU_ADDRESS]),
            _ => ([0x68, 0x6a, TESTER_ADDRESS], [0x48, 0x6b, ECU_ADDRESS]),
        };
        if frame.id() != Identifier::Header(request) {
            return Ok(());
        }

        let mut raw = request.to_vec();
        raw.extend_from_slice(frame.data());
        if !j1850::crc_valid(&raw) {
            return Ok(());
        }
        let body = frame.data()[..frame.data().len() - 1].to_vec();

        for body in self.answer(&body, false) {
            self.respond(j1850::message(response, &body)?);
        }
        Ok(())
    }

    /// Response bodies for an OBD request, service byte first.
    fn answer(&mut self, request: &[u8], can: bool) -> Vec<Vec<u8>> {
        let Some((&sid, args)) = request.split_first() else {
            return vec![];
        };

        match sid {
            service::CURRENT_DATA => {
                let mut body = vec![sid | POSITIVE_RESPONSE];
                for pid in args {
                    let Some(value) = self.vehicle.pids.get(pid) else {
                        continue;
                    };
                    if !can && body.len() + 1 + value.len() > LEGACY_MAX_BODY {
                        break;
                    }
                    body.push(*pid);
                    body.extend_from_slice(value);
                }
                if body.len() == 1 {
                    // ECUs stay silent when no requested PID is supported
                    return vec![];
                }
                vec![body]
            }
            service::READ_DTC => {
                let codes = &self.vehicle.dtcs;
                if can {
                    let mut body = vec![sid | POSITIVE_RESPONSE, codes.len() as u8];
                    body.extend(dtc::encode(codes));
                    return vec![body];
                }

                let mut bodies = vec![];
                for chunk in codes.chunks(LEGACY_DTCS_PER_MESSAGE) {
                    let mut padded = chunk.to_vec();
                    padded.resize(LEGACY_DTCS_PER_MESSAGE, 0);
                    let mut body = vec![sid | POSITIVE_RESPONSE];
                    body.extend(dtc::encode(&padded));
                    bodies.push(body);
                }
                if bodies.is_empty() {
                    let mut body = vec![sid | POSITIVE_RESPONSE];
                    body.extend(dtc::encode(&[0; LEGACY_DTCS_PER_MESSAGE]));
                    bodies.push(body);
                }
                bodies
            }
            service::CLEAR_DTC => {
                self.vehicle.dtcs.clear();
                vec![vec![sid | POSITIVE_RESPONSE]]
            }
            sid if args.is_empty() => vec![vec![NEGATIVE_RESPONSE, sid, SUBFUNCTION_NOT_SUPPORTED]],
            sid => vec![vec![NEGATIVE_RESPONSE, sid, SERVICE_NOT_SUPPORTED]],
        }
    }

    fn next_broadcast(&mut self) -> Option<Frame> {
        if !self.linked() || self.vehicle.broadcast.is_empty() {
            return None;
        }

        let len = self.vehicle.broadcast.len();
        for _ in 0..len {
            let frame = self.vehicle.broadcast[self.vehicle.broadcast_idx % len];
            self.vehicle.broadcast_idx = (self.vehicle.broadcast_idx + 1) % len;
            if self.deliverable(&frame) {
                return Some(frame);
            }
        }
        None
    }
}

/// In-memory vehicle implementing [`Transport`].
#[derive(Clone)]
pub struct SimulatedBus {
    state: Arc<Mutex<State>>,
}

impl SimulatedBus {
    /// Bus with nothing attached, configured for CAN as described by `config`.
    pub fn new(config: &TransportConfig) -> Self {
        let mut pids = HashMap::new();
        pids.insert(0x00, DEFAULT_SUPPORTED_PIDS.to_vec());

        let state = State {
            ready: true,
            config: BusConfig {
                layer: PhysicalLayer::Can,
                bitrate: config.bitrate,
                sample_point: config.sample_point,
                filter: Default::default(),
            },
            vehicle: Vehicle {
                protocol: Protocol::Unknown,
                addressing: Addressing::Standard,
                can_bitrate: config.bitrate,
                pids,
                dtcs: vec![],
                broadcast: vec![],
                broadcast_idx: 0,
            },
            link_initialized: false,
            rx: VecDeque::new(),
            segments: VecDeque::new(),
            transmitted: vec![],
        };

        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Bus with a vehicle talking `protocol` at the configured CAN bitrate.
    pub fn with_vehicle(protocol: Protocol) -> Self {
        let bus = Self::new(&TransportConfig::default());
        bus.set_vehicle(protocol);
        bus
    }

    /// Swap the vehicle's protocol, e.g. to simulate plugging into another bike.
    pub fn set_vehicle(&self, protocol: Protocol) {
        let mut state = self.state.lock();
        state.vehicle.protocol = protocol;
        state.vehicle.broadcast_idx = 0;
        state.link_initialized = false;
        state.segments.clear();
    }

    pub fn set_addressing(&self, addressing: Addressing) {
        self.state.lock().vehicle.addressing = addressing;
    }

    pub fn set_can_bitrate(&self, bitrate: u32) {
        self.state.lock().vehicle.can_bitrate = bitrate;
    }

    /// Raw data bytes the vehicle answers for service 01 `pid`.
    pub fn set_pid(&self, pid: u8, value: &[u8]) {
        self.state.lock().vehicle.pids.insert(pid, value.to_vec());
    }

    pub fn set_dtcs(&self, codes: &[u16]) {
        self.state.lock().vehicle.dtcs = codes.to_vec();
    }

    pub fn dtcs(&self) -> Vec<u16> {
        self.state.lock().vehicle.dtcs.clone()
    }

    /// Add a frame the vehicle repeats on the bus. J1850 broadcasts are only visible through
    /// [`Transport::capture`] and `receive`.
    pub fn add_broadcast(&self, frame: Frame) {
        self.state.lock().vehicle.broadcast.push(frame);
    }

    /// Queue a one-off frame, delivered on the next `receive` on a matching layer.
    pub fn inject(&self, frame: Frame) {
        self.state.lock().rx.push_back(frame);
    }

    /// Mark the bus controller as failed or recovered.
    pub fn set_ready(&self, ready: bool) {
        self.state.lock().ready = ready;
    }

    pub fn config(&self) -> BusConfig {
        self.state.lock().config
    }

    /// Frames transmitted by the tester so far.
    pub fn transmitted(&self) -> Vec<Frame> {
        self.state.lock().transmitted.clone()
    }
}

impl Transport for SimulatedBus {
    fn configure(&mut self, config: &BusConfig) -> Result<()> {
        let mut state = self.state.lock();
        if !state.ready {
            return Err(Error::TransportUnavailable);
        }

        if state.config.layer != config.layer || state.config.bitrate != config.bitrate {
            state.link_initialized = false;
            state.segments.clear();
        }
        debug!(
            "Configured {:?} at {} bit/s, sample point {}",
            config.layer, config.bitrate, config.sample_point
        );
        state.config = *config;
        Ok(())
    }

    fn transmit(&mut self, frame: &Frame, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        if !state.ready {
            return Err(Error::TransportUnavailable);
        }
        state.transmitted.push(*frame);
        state.handle_request(frame)
    }

    fn receive(&mut self, _timeout: Duration) -> Result<Option<Frame>> {
        let mut state = self.state.lock();
        if !state.ready {
            return Err(Error::TransportUnavailable);
        }

        let frame = match state.rx.iter().position(|frame| state.deliverable(frame)) {
            Some(idx) => state.rx.remove(idx),
            None => state.next_broadcast(),
        };

        // Stamp with arrival time
        match frame {
            Some(frame) => Ok(Some(Frame::with_timestamp(
                frame.id(),
                frame.data(),
                Instant::now(),
            )?)),
            None => Ok(None),
        }
    }

    fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    fn initialize_link(&mut self, init: LinkInit, _timeout: Duration) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        if !state.ready {
            return Err(Error::TransportUnavailable);
        }
        if state.config.layer != PhysicalLayer::KLine || !state.linked() {
            return Err(Error::Timeout);
        }

        let response = match (init, state.vehicle.protocol) {
            (LinkInit::FiveBaud { address: 0x33 }, Protocol::Iso9141_2) => {
                vec![SYNC, ISO9141_KEYWORDS[0], ISO9141_KEYWORDS[1]]
            }
            (LinkInit::FiveBaud { address: 0x33 }, Protocol::Iso14230_4) => {
                vec![SYNC, KWP_KEYWORDS[0], KWP_KEYWORDS[1]]
            }
            (LinkInit::Fast, Protocol::Iso14230_4) => vec![],
            _ => return Err(Error::Timeout),
        };

        state.link_initialized = true;
        Ok(response)
    }

    fn capture(&mut self, _window: Duration) -> Result<Vec<Pulse>> {
        let state = self.state.lock();
        if !state.ready {
            return Err(Error::TransportUnavailable);
        }

        let layer = state.config.layer;
        if !matches!(layer, PhysicalLayer::J1850Pwm | PhysicalLayer::J1850Vpw) {
            return Err(Error::Unsupported);
        }
        if !state.linked() {
            return Ok(vec![]);
        }

        let messages: Vec<Vec<u8>> = state
            .vehicle
            .broadcast
            .iter()
            .filter_map(|frame| {
                let mut raw = frame.id().header()?.to_vec();
                raw.extend_from_slice(frame.data());
                Some(raw)
            })
            .collect();
        Ok(j1850::encode_pulses(layer, &messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn config(protocol: Protocol) -> BusConfig {
        protocol.bus_config(500_000, 0.8).unwrap()
    }

    #[test]
    fn answers_obd_request_on_matching_link() {
        let mut bus = SimulatedBus::with_vehicle(Protocol::Iso15765_4);
        bus.set_pid(0x0d, &[0x32]);
        bus.configure(&config(Protocol::Iso15765_4)).unwrap();

        let request = Protocol::Iso15765_4
            .request(Addressing::Standard, &[0x01, 0x0d])
            .unwrap()
            .unwrap();
        bus.transmit(&request, TIMEOUT).unwrap();

        let response = bus.receive(TIMEOUT).unwrap().unwrap();
        assert_eq!(response.id(), Identifier::Standard(0x7e8));
        assert_eq!(&response.data()[..4], &[0x03, 0x41, 0x0d, 0x32]);
        assert_eq!(bus.receive(TIMEOUT).unwrap(), None);
    }

    #[test]
    fn silent_on_other_bitrate() {
        let mut bus = SimulatedBus::with_vehicle(Protocol::Iso15765_4);
        bus.configure(&Protocol::Iso15765_4.bus_config(250_000, 0.8).unwrap())
            .unwrap();

        let request = Protocol::Iso15765_4
            .request(Addressing::Standard, &[0x01, 0x00])
            .unwrap()
            .unwrap();
        bus.transmit(&request, TIMEOUT).unwrap();
        assert_eq!(bus.receive(TIMEOUT).unwrap(), None);
    }

    #[test]
    fn long_dtc_response_waits_for_flow_control() {
        let mut bus = SimulatedBus::with_vehicle(Protocol::Iso15765_4);
        bus.set_dtcs(&[0x0300, 0x0171, 0x0420, 0x0128]);
        bus.configure(&config(Protocol::Iso15765_4)).unwrap();

        let request = Protocol::Iso15765_4
            .request(Addressing::Standard, &[0x03])
            .unwrap()
            .unwrap();
        bus.transmit(&request, TIMEOUT).unwrap();

        let first = bus.receive(TIMEOUT).unwrap().unwrap();
        assert_eq!(&first.data()[..3], &[0x10, 0x0a, 0x43]);
        assert_eq!(bus.receive(TIMEOUT).unwrap(), None);

        let fc = crate::decoder::isotp::flow_control(Identifier::Standard(0x7e0)).unwrap();
        bus.transmit(&fc, TIMEOUT).unwrap();
        let consecutive = bus.receive(TIMEOUT).unwrap().unwrap();
        assert_eq!(consecutive.data()[0], 0x21);
    }

    #[test]
    fn kline_requires_init() {
        let mut bus = SimulatedBus::with_vehicle(Protocol::Iso9141_2);
        bus.configure(&config(Protocol::Iso9141_2)).unwrap();

        let request = Protocol::Iso9141_2
            .request(Addressing::Standard, &[0x01, 0x00])
            .unwrap()
            .unwrap();
        bus.transmit(&request, TIMEOUT).unwrap();
        assert_eq!(bus.receive(TIMEOUT).unwrap(), None);

        assert_eq!(
            bus.initialize_link(LinkInit::Fast, TIMEOUT),
            Err(Error::Timeout)
        );
        assert_eq!(
            bus.initialize_link(LinkInit::FiveBaud { address: 0x33 }, TIMEOUT)
                .unwrap(),
            vec![0x55, 0x08, 0x08]
        );

        bus.transmit(&request, TIMEOUT).unwrap();
        let response = bus.receive(TIMEOUT).unwrap().unwrap();
        assert_eq!(response.id(), Identifier::Header([0x48, 0x6b, 0x10]));
    }

    #[test]
    fn not_ready() {
        let mut bus = SimulatedBus::with_vehicle(Protocol::Can11);
        bus.set_ready(false);
        assert!(!bus.is_ready());
        assert_eq!(bus.receive(TIMEOUT), Err(Error::TransportUnavailable));
        assert_eq!(
            bus.configure(&config(Protocol::Can11)),
            Err(Error::TransportUnavailable)
        );
    }

    #[test]
    fn capture_renders_j1850_broadcasts() {
        let mut bus = SimulatedBus::with_vehicle(Protocol::J1850Vpw);
        bus.add_broadcast(j1850::message([0x68, 0xff, 0x10], &[0x20, 0x01]).unwrap());
        bus.configure(&config(Protocol::J1850Vpw)).unwrap();

        let pulses = bus.capture(TIMEOUT).unwrap();
        let messages = j1850::reconstruct(PhysicalLayer::J1850Vpw, &pulses);
        assert_eq!(messages.len(), 1);
        assert!(j1850::crc_valid(&messages[0]));

        bus.configure(&config(Protocol::J1850Pwm)).unwrap();
        assert!(bus.capture(TIMEOUT).unwrap().is_empty());
    }
}
