//! Blocking diagnostic session: detection, requests, decoding and store updates.
//!
//! A [`Session`] owns the [`Transport`] and drives it from [`Session::poll`]. Each poll runs a
//! detection pass when one is due, sends the next scheduled OBD request on request/response
//! links and applies every received frame to the [`ParameterStore`] in arrival order.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::can::Frame;
use crate::decoder::isotp::{self, Progress, Reassembler};
use crate::decoder::obd::service;
use crate::decoder::{obd_response_source, DecoderTable, Reading, SignalLayout};
use crate::detector::{DetectorConfig, ProtocolDetector};
use crate::error::Error;
use crate::protocol::Protocol;
use crate::store::ParameterStore;
use crate::transport::Transport;
use crate::Result;

const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(50);
const DEFAULT_TRANSMIT_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_MAX_FRAMES_PER_POLL: usize = 32;
const DEFAULT_MISMATCH_THRESHOLD: usize = 5;
const DEFAULT_DTC_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// RPM, speed, coolant, control module voltage, fuel level, throttle, monitor status
const DEFAULT_PIDS: [u8; 7] = [0x0c, 0x0d, 0x05, 0x42, 0x2f, 0x11, 0x01];

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    pub detector: DetectorConfig,
    /// Wait for a single frame
    pub receive_timeout: Duration,
    pub transmit_timeout: Duration,
    /// Upper bound of frames handled by one poll
    pub max_frames_per_poll: usize,
    /// Mismatched frames within one detection window that force a new probe
    pub mismatch_threshold: usize,
    /// Service 01 PIDs requested round-robin, one per poll
    pub pids: Vec<u8>,
    /// Period of service 03 requests
    pub dtc_poll_interval: Duration,
    /// Manufacturer signals decoded from raw CAN broadcasts
    pub layouts: Vec<SignalLayout>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            transmit_timeout: DEFAULT_TRANSMIT_TIMEOUT,
            max_frames_per_poll: DEFAULT_MAX_FRAMES_PER_POLL,
            mismatch_threshold: DEFAULT_MISMATCH_THRESHOLD,
            pids: DEFAULT_PIDS.to_vec(),
            dtc_poll_interval: DEFAULT_DTC_POLL_INTERVAL,
            layouts: vec![],
        }
    }
}

/// What a single [`Session::poll`] did.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PollStats {
    pub protocol: Protocol,
    pub frames: usize,
    /// Signals written to the store
    pub readings: usize,
    pub mismatches: usize,
}

pub struct Session<T: Transport> {
    transport: T,
    config: SessionConfig,
    detector: ProtocolDetector,
    decoders: DecoderTable,
    store: ParameterStore,
    reassembler: Reassembler,
    protocol: Protocol,
    next_pid: usize,
    last_dtc_request: Option<Instant>,
    /// Codes collected since the last service 03 request
    dtc_batch: Vec<u16>,
    mismatches: usize,
    suspended: bool,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, store: ParameterStore, config: SessionConfig) -> Self {
        Self {
            transport,
            detector: ProtocolDetector::new(config.detector.clone()),
            decoders: DecoderTable::with_layouts(config.layouts.clone()),
            config,
            store,
            reassembler: Reassembler::new(),
            protocol: Protocol::Unknown,
            next_pid: 0,
            last_dtc_request: None,
            dtc_batch: vec![],
            mismatches: 0,
            suspended: false,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn store(&self) -> &ParameterStore {
        &self.store
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn detector(&self) -> &ProtocolDetector {
        &self.detector
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Direct access to the transport. Reconfiguring it behind the detector's back breaks the
    /// lock until the next detection pass.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Run one cycle. Returns [`Error::TransportUnavailable`] while suspended.
    pub fn poll(&mut self) -> Result<PollStats> {
        if self.suspended {
            return Err(Error::TransportUnavailable);
        }

        let now = Instant::now();
        let suspicious = self.mismatches >= self.config.mismatch_threshold;
        if suspicious || self.detector.is_due(now) {
            if suspicious {
                debug!("{} mismatched frames, re-probing {}", self.mismatches, self.protocol);
                self.detector.mark_suspect();
            }
            self.mismatches = 0;

            let detected = match self.detector.detect(&mut self.transport) {
                Ok(protocol) => protocol,
                Err(Error::TransportUnavailable) => return Err(self.suspend()),
                Err(e) => return Err(e),
            };
            self.switch_protocol(detected);
        }

        let mut stats = PollStats {
            protocol: self.protocol,
            ..Default::default()
        };
        if self.protocol == Protocol::Unknown {
            return Ok(stats);
        }

        if let Some(request) = self.next_request(now) {
            self.send_request(&request)?;
        }

        for _ in 0..self.config.max_frames_per_poll {
            let frame = match self.transport.receive(self.config.receive_timeout) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(Error::TransportUnavailable) => return Err(self.suspend()),
                Err(e) => {
                    debug!("Receive failed: {}", e);
                    break;
                }
            };
            stats.frames += 1;

            let readings = match self.decode(&frame) {
                Ok(readings) => readings,
                Err(Error::TransportUnavailable) => return Err(self.suspend()),
                Err(e) => {
                    debug!("Dropping {:?} as {}: {}", frame, self.protocol, e);
                    self.mismatches += 1;
                    stats.mismatches += 1;
                    continue;
                }
            };
            self.detector.record_valid_frame(frame.timestamp());
            stats.readings += self.apply(readings);
        }

        Ok(stats)
    }

    fn switch_protocol(&mut self, detected: Protocol) {
        if detected == self.protocol {
            return;
        }

        // A failed pass leaves the store alone, values age out instead
        if detected != Protocol::Unknown {
            info!("Switching from {} to {}", self.protocol, detected);
            self.store.invalidate_all();
        }
        self.protocol = detected;
        self.reassembler.reset();
        self.next_pid = 0;
        self.last_dtc_request = None;
        self.dtc_batch.clear();
    }

    fn next_request(&mut self, now: Instant) -> Option<Vec<u8>> {
        if !self.protocol.is_request_response() {
            return None;
        }

        let dtcs_due = self
            .last_dtc_request
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.dtc_poll_interval);
        if dtcs_due {
            self.last_dtc_request = Some(now);
            self.dtc_batch.clear();
            return Some(vec![service::READ_DTC]);
        }

        let pid = *self.config.pids.get(self.next_pid % self.config.pids.len().max(1))?;
        self.next_pid = (self.next_pid + 1) % self.config.pids.len();
        Some(vec![service::CURRENT_DATA, pid])
    }

    fn send_request(&mut self, payload: &[u8]) -> Result<()> {
        let Some(frame) = self.protocol.request(self.detector.addressing(), payload) else {
            return Err(Error::Unsupported);
        };
        self.transmit(&frame?)
    }

    fn transmit(&mut self, frame: &Frame) -> Result<()> {
        match self.transport.transmit(frame, self.config.transmit_timeout) {
            Ok(()) => Ok(()),
            Err(Error::TransportUnavailable) => Err(self.suspend()),
            // A lost request only costs one sample
            Err(Error::Timeout) => {
                debug!("Transmit of {:?} timed out", frame);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn decode(&mut self, frame: &Frame) -> Result<Vec<Reading>> {
        let mut readings = self.decoders.get(self.protocol).decode(frame)?;

        if self.protocol != Protocol::Iso15765_4 || !obd_response_source(frame.id()) {
            return Ok(readings);
        }

        match self.reassembler.push(frame)? {
            Progress::Started { flow_control_to } => {
                let fc = isotp::flow_control(flow_control_to)?;
                self.transmit(&fc)?;
            }
            Progress::Complete { payload, .. } => {
                readings.extend(self.decoders.get(self.protocol).decode_message(&payload)?);
            }
            Progress::Ignored | Progress::Pending => {}
        }
        Ok(readings)
    }

    /// Write readings to the store in order. Returns the number of signals written.
    fn apply(&mut self, readings: Vec<Reading>) -> usize {
        let mut written = 0;
        for reading in readings {
            match reading {
                Reading::Signal(signal) => {
                    if self.store.upsert(&signal.name, signal.value, &signal.unit) {
                        written += 1;
                    }
                }
                // Legacy links spread trouble codes over several messages, possibly
                // across polls
                Reading::TroubleCodes(codes) => {
                    self.dtc_batch.extend(codes);
                    self.store.set_dtcs(self.dtc_batch.clone());
                }
                Reading::TroubleCodesCleared => {
                    info!("Vehicle cleared its trouble codes");
                    self.dtc_batch.clear();
                    self.store.set_dtcs(vec![]);
                }
            }
        }
        written
    }

    fn suspend(&mut self) -> Error {
        if !self.suspended {
            warn!("Transport unavailable, suspending session");
        }
        self.suspended = true;
        self.store.invalidate_all();
        self.protocol = Protocol::Unknown;
        self.reassembler.reset();
        self.dtc_batch.clear();
        Error::TransportUnavailable
    }

    /// Leave suspension once the transport reports ready again. Detection starts from scratch.
    pub fn resume(&mut self) -> Result<()> {
        if !self.transport.is_ready() {
            return Err(Error::TransportUnavailable);
        }
        if self.suspended {
            info!("Transport ready, resuming session");
        }
        self.suspended = false;
        self.detector.reset();
        self.mismatches = 0;
        Ok(())
    }

    /// Drop every parameter and return to [`Protocol::Unknown`].
    pub fn reset(&mut self) {
        self.store.clear();
        self.detector.reset();
        self.reassembler.reset();
        self.protocol = Protocol::Unknown;
        self.next_pid = 0;
        self.last_dtc_request = None;
        self.dtc_batch.clear();
        self.mismatches = 0;
    }

    /// Ask the vehicle to clear its trouble codes (OBD service 04). The store is updated when
    /// the vehicle acknowledges.
    pub fn request_vehicle_dtc_clear(&mut self) -> Result<()> {
        if self.suspended {
            return Err(Error::TransportUnavailable);
        }
        self.send_request(&[service::CLEAR_DTC])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::names;
    use crate::transport::sim::SimulatedBus;

    fn session(bus: &SimulatedBus) -> Session<SimulatedBus> {
        Session::new(bus.clone(), ParameterStore::new(), SessionConfig::default())
    }

    #[test]
    fn first_request_reads_dtcs() {
        let bus = SimulatedBus::with_vehicle(Protocol::Iso15765_4);
        bus.set_dtcs(&[0x0300]);
        let mut session = session(&bus);

        let stats = session.poll().unwrap();
        assert_eq!(stats.protocol, Protocol::Iso15765_4);
        assert_eq!(session.store().dtcs().unwrap().codes, vec![0x0300]);
    }

    #[test]
    fn pids_round_robin() {
        let bus = SimulatedBus::with_vehicle(Protocol::Iso9141_2);
        bus.set_pid(0x0c, &[0x1a, 0xf8]);
        bus.set_pid(0x0d, &[0x32]);
        let mut session = Session::new(
            bus.clone(),
            ParameterStore::new(),
            SessionConfig {
                pids: vec![0x0c, 0x0d],
                ..Default::default()
            },
        );

        for _ in 0..3 {
            session.poll().unwrap();
        }
        assert_eq!(session.store().get(names::ENGINE_RPM).unwrap().value, 1726.0);
        assert_eq!(session.store().get(names::VEHICLE_SPEED).unwrap().value, 50.0);
    }

    #[test]
    fn legacy_dtcs_span_polls() {
        let bus = SimulatedBus::with_vehicle(Protocol::J1850Vpw);
        bus.set_dtcs(&[0x0300, 0x0171, 0x0420, 0x0128]);
        let mut session = Session::new(
            bus.clone(),
            ParameterStore::new(),
            SessionConfig {
                max_frames_per_poll: 1,
                ..Default::default()
            },
        );

        // First message of the answer carries three codes
        session.poll().unwrap();
        assert_eq!(session.store().dtcs().unwrap().codes.len(), 3);

        // The rest arrives with the next poll and is appended
        session.poll().unwrap();
        assert_eq!(
            session.store().dtcs().unwrap().codes,
            vec![0x0300, 0x0171, 0x0420, 0x0128]
        );
    }

    #[test]
    fn listen_only_sends_nothing() {
        let bus = SimulatedBus::with_vehicle(Protocol::Can11);
        for id in [0x100, 0x101, 0x102] {
            bus.add_broadcast(Frame::new(crate::can::Identifier::Standard(id), &[0; 8]).unwrap());
        }
        let mut session = session(&bus);
        assert_eq!(session.poll().unwrap().protocol, Protocol::Can11);
        assert!(bus.transmitted().is_empty());
    }

    #[test]
    fn clear_request_needs_request_response_link() {
        let bus = SimulatedBus::new(&Default::default());
        let mut session = session(&bus);
        assert_eq!(session.request_vehicle_dtc_clear(), Err(Error::Unsupported));
    }
}
