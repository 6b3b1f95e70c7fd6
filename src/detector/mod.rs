//! Protocol auto-detection.
//!
//! [`ProtocolDetector::detect`] runs one detection pass against a [`Transport`]. A protocol that
//! recently produced valid traffic is kept without touching the bus. Otherwise the active
//! protocol is probed first and the remaining candidates follow in [`DETECTION_ORDER`]. The
//! first probe that accepts wins; if none does the detector falls back to
//! [`Protocol::Unknown`], which is the normal state while no vehicle is attached.

mod probe;

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::Error;
use crate::protocol::{AcceptanceFilter, Addressing, Protocol, DETECTION_ORDER};
use crate::transport::Transport;
use crate::Result;

const DEFAULT_DETECTION_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_UNKNOWN_RETRY_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(100);
/// ISO 9141-2 W1..W4 timings add up to roughly 2.4 s for a 5-baud init
const DEFAULT_LINK_INIT_TIMEOUT: Duration = Duration::from_millis(2500);
const DEFAULT_MIN_CONSECUTIVE_FRAMES: usize = 3;
const DEFAULT_CAN_BITRATE: u32 = 500_000;
const DEFAULT_SAMPLE_POINT: f32 = 0.8;

const OBD_RESPONSE_FILTER_STANDARD: AcceptanceFilter = AcceptanceFilter {
    code: 0x7e8,
    mask: 0x7f8,
};
const OBD_RESPONSE_FILTER_EXTENDED: AcceptanceFilter = AcceptanceFilter {
    code: 0x18da_f100,
    mask: 0x1fff_ff00,
};

/// Detection settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DetectorConfig {
    /// Period between detection passes, also the window in which valid traffic keeps a lock
    pub detection_interval: Duration,
    /// Period between detection passes while no protocol is locked
    pub unknown_retry_interval: Duration,
    /// Upper bound for a single probe
    pub probe_timeout: Duration,
    /// Upper bound for a K-line initialization handshake
    pub link_init_timeout: Duration,
    /// Consecutive frames of one ID width needed to accept raw CAN
    pub min_consecutive_frames: usize,
    pub can_bitrate: u32,
    pub sample_point: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            detection_interval: DEFAULT_DETECTION_INTERVAL,
            unknown_retry_interval: DEFAULT_UNKNOWN_RETRY_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            link_init_timeout: DEFAULT_LINK_INIT_TIMEOUT,
            min_consecutive_frames: DEFAULT_MIN_CONSECUTIVE_FRAMES,
            can_bitrate: DEFAULT_CAN_BITRATE,
            sample_point: DEFAULT_SAMPLE_POINT,
        }
    }
}

/// Settles on the protocol spoken on the bus. The detector is the only component that
/// reconfigures the transport.
pub struct ProtocolDetector {
    config: DetectorConfig,
    active: Protocol,
    addressing: Addressing,
    last_valid: Option<Instant>,
    last_pass: Option<Instant>,
}

impl ProtocolDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            active: Protocol::Unknown,
            addressing: Addressing::Standard,
            last_valid: None,
            last_pass: None,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn active(&self) -> Protocol {
        self.active
    }

    /// CAN addressing of the locked ISO 15765-4 vehicle.
    pub fn addressing(&self) -> Addressing {
        self.addressing
    }

    /// Note that the active protocol just produced a valid frame.
    pub fn record_valid_frame(&mut self, at: Instant) {
        self.last_valid = Some(at);
    }

    /// Drop the evidence for the active protocol so the next pass probes again.
    pub fn mark_suspect(&mut self) {
        self.last_valid = None;
    }

    fn recently_valid(&self, now: Instant) -> bool {
        self.last_valid
            .is_some_and(|at| now.saturating_duration_since(at) < self.config.detection_interval)
    }

    /// Whether a detection pass is due. Without a lock passes repeat every
    /// `unknown_retry_interval` so a vehicle attached later is picked up quickly.
    pub fn is_due(&self, now: Instant) -> bool {
        let interval = if self.active == Protocol::Unknown {
            self.config
                .unknown_retry_interval
                .min(self.config.detection_interval)
        } else {
            self.config.detection_interval
        };
        match self.last_pass {
            Some(at) => now.saturating_duration_since(at) >= interval,
            None => true,
        }
    }

    pub fn reset(&mut self) {
        self.active = Protocol::Unknown;
        self.addressing = Addressing::Standard;
        self.last_valid = None;
        self.last_pass = None;
    }

    fn candidates(&self) -> Vec<Protocol> {
        let mut candidates = Vec::with_capacity(DETECTION_ORDER.len());
        if self.active != Protocol::Unknown {
            candidates.push(self.active);
        }
        candidates.extend(DETECTION_ORDER.iter().filter(|p| **p != self.active));
        candidates
    }

    /// Run one detection pass. A pass in which no candidate accepts is not an error; only a
    /// failed transport is.
    pub fn detect(&mut self, transport: &mut dyn Transport) -> Result<Protocol> {
        let now = Instant::now();
        self.last_pass = Some(now);

        if !transport.is_ready() {
            return self.transport_lost();
        }

        if self.active != Protocol::Unknown && self.recently_valid(now) {
            debug!("{} confirmed by recent traffic", self.active);
            return Ok(self.active);
        }

        for candidate in self.candidates() {
            let Some(bus) = candidate.bus_config(self.config.can_bitrate, self.config.sample_point)
            else {
                continue;
            };

            match transport.configure(&bus) {
                Ok(()) => {}
                Err(Error::TransportUnavailable) => return self.transport_lost(),
                Err(e) => {
                    debug!("Could not configure bus for {}: {}", candidate, e);
                    continue;
                }
            }

            match probe::run(candidate, transport, &self.config) {
                Ok(Some(addressing)) => return self.lock(candidate, addressing, transport),
                Ok(None) => debug!("{} probe rejected", candidate),
                Err(Error::TransportUnavailable) => return self.transport_lost(),
                Err(e) => debug!("{} probe failed: {}", candidate, e),
            }
        }

        if self.active != Protocol::Unknown {
            info!("Lost {}, no protocol detected", self.active);
        }
        self.active = Protocol::Unknown;
        self.last_valid = None;
        Ok(Protocol::Unknown)
    }

    fn lock(
        &mut self,
        protocol: Protocol,
        addressing: Addressing,
        transport: &mut dyn Transport,
    ) -> Result<Protocol> {
        if protocol == Protocol::Iso15765_4 {
            let bus = protocol.bus_config(self.config.can_bitrate, self.config.sample_point);
            if let Some(mut bus) = bus {
                bus.filter = match addressing {
                    Addressing::Standard => OBD_RESPONSE_FILTER_STANDARD,
                    Addressing::Extended => OBD_RESPONSE_FILTER_EXTENDED,
                };
                if let Err(e) = transport.configure(&bus) {
                    return match e {
                        Error::TransportUnavailable => self.transport_lost(),
                        e => Err(e),
                    };
                }
            }
        }

        if self.active != protocol {
            info!("Locked on {} ({:?} addressing)", protocol, addressing);
        }
        self.active = protocol;
        self.addressing = addressing;
        self.last_valid = Some(Instant::now());
        Ok(protocol)
    }

    fn transport_lost(&mut self) -> Result<Protocol> {
        warn!("Transport unavailable, detection suspended");
        self.active = Protocol::Unknown;
        self.last_valid = None;
        Err(Error::TransportUnavailable)
    }
}

impl Default for ProtocolDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::{Frame, Identifier};
    use crate::decoder::{j1850, kline};
    use crate::protocol::PhysicalLayer;
    use crate::transport::sim::SimulatedBus;

    fn detect(bus: &SimulatedBus) -> Result<Protocol> {
        let mut detector = ProtocolDetector::default();
        let mut transport = bus.clone();
        detector.detect(&mut transport)
    }

    #[test]
    fn no_vehicle_is_unknown() {
        let bus = SimulatedBus::new(&Default::default());
        assert_eq!(detect(&bus), Ok(Protocol::Unknown));
    }

    #[test]
    fn iso15765_standard() {
        let bus = SimulatedBus::with_vehicle(Protocol::Iso15765_4);
        let mut detector = ProtocolDetector::default();
        let mut transport = bus.clone();
        assert_eq!(detector.detect(&mut transport), Ok(Protocol::Iso15765_4));
        assert_eq!(detector.addressing(), Addressing::Standard);
        assert_eq!(bus.config().filter, OBD_RESPONSE_FILTER_STANDARD);
    }

    #[test]
    fn iso15765_extended() {
        let bus = SimulatedBus::with_vehicle(Protocol::Iso15765_4);
        bus.set_addressing(Addressing::Extended);
        let mut detector = ProtocolDetector::default();
        let mut transport = bus.clone();
        assert_eq!(detector.detect(&mut transport), Ok(Protocol::Iso15765_4));
        assert_eq!(detector.addressing(), Addressing::Extended);
    }

    #[test]
    fn iso15765_wrong_bitrate() {
        let bus = SimulatedBus::with_vehicle(Protocol::Iso15765_4);
        bus.set_can_bitrate(250_000);
        assert_eq!(detect(&bus), Ok(Protocol::Unknown));
    }

    #[test]
    fn kline_protocols() {
        let bus = SimulatedBus::with_vehicle(Protocol::Iso9141_2);
        assert_eq!(detect(&bus), Ok(Protocol::Iso9141_2));
        assert_eq!(bus.config().layer, PhysicalLayer::KLine);

        let bus = SimulatedBus::with_vehicle(Protocol::Iso14230_4);
        assert_eq!(detect(&bus), Ok(Protocol::Iso14230_4));
        assert!(bus
            .transmitted()
            .contains(&kline::message([0xc1, 0x33, 0xf1], &[0x81]).unwrap()));
    }

    #[test]
    fn j1850_by_challenge() {
        let bus = SimulatedBus::with_vehicle(Protocol::J1850Pwm);
        assert_eq!(detect(&bus), Ok(Protocol::J1850Pwm));

        let bus = SimulatedBus::with_vehicle(Protocol::J1850Vpw);
        assert_eq!(detect(&bus), Ok(Protocol::J1850Vpw));
    }

    #[test]
    fn j1850_by_capture() {
        let bus = SimulatedBus::with_vehicle(Protocol::J1850Vpw);
        bus.add_broadcast(j1850::message([0x68, 0xff, 0x10], &[0x20, 0x01]).unwrap());
        bus.add_broadcast(j1850::message([0x68, 0xff, 0x40], &[0x10, 0x32]).unwrap());
        assert_eq!(detect(&bus), Ok(Protocol::J1850Vpw));

        // Accepted without a challenge
        let challenge = j1850::message([0x68, 0x6a, 0xf1], &[0x01, 0x00]).unwrap();
        assert!(!bus.transmitted().contains(&challenge));
    }

    #[test]
    fn raw_can_needs_consecutive_frames() {
        let bus = SimulatedBus::with_vehicle(Protocol::Can11);
        bus.add_broadcast(Frame::new(Identifier::Extended(0x18fef100), &[0; 8]).unwrap());
        for id in [0x100, 0x101, 0x102] {
            bus.add_broadcast(Frame::new(Identifier::Standard(id), &[0; 8]).unwrap());
        }
        assert_eq!(detect(&bus), Ok(Protocol::Can11));
    }

    #[test]
    fn recent_traffic_keeps_lock_without_probing() {
        let bus = SimulatedBus::with_vehicle(Protocol::Iso15765_4);
        let mut detector = ProtocolDetector::default();
        let mut transport = bus.clone();
        detector.detect(&mut transport).unwrap();
        let sent = bus.transmitted().len();

        detector.record_valid_frame(Instant::now());
        assert_eq!(detector.detect(&mut transport), Ok(Protocol::Iso15765_4));
        assert_eq!(bus.transmitted().len(), sent);

        // Without evidence the active protocol is probed again, first
        detector.mark_suspect();
        assert_eq!(detector.detect(&mut transport), Ok(Protocol::Iso15765_4));
        assert!(bus.transmitted().len() > sent);
    }

    #[test]
    fn unknown_retries_sooner() {
        let bus = SimulatedBus::new(&Default::default());
        let mut detector = ProtocolDetector::default();
        let mut transport = bus.clone();
        assert_eq!(detector.detect(&mut transport), Ok(Protocol::Unknown));

        let now = Instant::now();
        assert!(!detector.is_due(now));
        assert!(detector.is_due(now + detector.config().unknown_retry_interval));

        bus.set_vehicle(Protocol::Iso15765_4);
        assert_eq!(detector.detect(&mut transport), Ok(Protocol::Iso15765_4));
        assert!(!detector.is_due(Instant::now() + detector.config().unknown_retry_interval));
    }

    #[test]
    fn transport_unavailable() {
        let bus = SimulatedBus::with_vehicle(Protocol::Iso15765_4);
        let mut detector = ProtocolDetector::default();
        let mut transport = bus.clone();
        detector.detect(&mut transport).unwrap();

        bus.set_ready(false);
        detector.mark_suspect();
        assert_eq!(
            detector.detect(&mut transport),
            Err(Error::TransportUnavailable)
        );
        assert_eq!(detector.active(), Protocol::Unknown);
    }
}
