//! OBD-II service payload decoding (SAE J1979), shared by every protocol.

use super::{mismatch, names, Reading, Signal};
use crate::Result;

/// Service identifiers of the requests this crate issues.
pub mod service {
    pub const CURRENT_DATA: u8 = 0x01;
    pub const READ_DTC: u8 = 0x03;
    pub const CLEAR_DTC: u8 = 0x04;
}

pub const POSITIVE_RESPONSE: u8 = 0x40;
pub const NEGATIVE_RESPONSE: u8 = 0x7f;

type Formula = fn(&[u8]) -> f64;

struct SignalSpec {
    name: &'static str,
    unit: &'static str,
    formula: Formula,
}

struct PidSpec {
    pid: u8,
    len: usize,
    signals: &'static [SignalSpec],
}

const fn signal(name: &'static str, unit: &'static str, formula: Formula) -> SignalSpec {
    SignalSpec { name, unit, formula }
}

const fn pid(pid: u8, len: usize, signals: &'static [SignalSpec]) -> PidSpec {
    PidSpec { pid, len, signals }
}

fn a(b: &[u8]) -> f64 {
    b[0] as f64
}

fn ab(b: &[u8]) -> f64 {
    (b[0] as f64 * 256.0) + b[1] as f64
}

fn percent(b: &[u8]) -> f64 {
    b[0] as f64 * 100.0 / 255.0
}

fn temperature(b: &[u8]) -> f64 {
    b[0] as f64 - 40.0
}

fn rpm(b: &[u8]) -> f64 {
    ab(b) / 4.0
}

fn mass_air_flow(b: &[u8]) -> f64 {
    ab(b) / 100.0
}

fn millivolts(b: &[u8]) -> f64 {
    ab(b) / 1000.0
}

fn mil_on(b: &[u8]) -> f64 {
    (b[0] >> 7) as f64
}

fn dtc_count(b: &[u8]) -> f64 {
    (b[0] & 0x7f) as f64
}

static PIDS: &[PidSpec] = &[
    // Supported PID bitmaps carry no signal but keep multi-PID responses aligned
    pid(0x00, 4, &[]),
    pid(
        0x01,
        4,
        &[
            signal(names::MIL_STATUS, "", mil_on),
            signal(names::STORED_DTC_COUNT, "", dtc_count),
        ],
    ),
    pid(0x04, 1, &[signal(names::ENGINE_LOAD, "%", percent)]),
    pid(0x05, 1, &[signal(names::COOLANT_TEMPERATURE, "°C", temperature)]),
    pid(0x0b, 1, &[signal(names::INTAKE_MANIFOLD_PRESSURE, "kPa", a)]),
    pid(0x0c, 2, &[signal(names::ENGINE_RPM, "rpm", rpm)]),
    pid(0x0d, 1, &[signal(names::VEHICLE_SPEED, "km/h", a)]),
    pid(0x0f, 1, &[signal(names::INTAKE_AIR_TEMPERATURE, "°C", temperature)]),
    pid(0x10, 2, &[signal(names::MASS_AIR_FLOW, "g/s", mass_air_flow)]),
    pid(0x11, 1, &[signal(names::THROTTLE_POSITION, "%", percent)]),
    pid(0x20, 4, &[]),
    pid(0x2f, 1, &[signal(names::FUEL_LEVEL, "%", percent)]),
    pid(0x40, 4, &[]),
    pid(0x42, 2, &[signal(names::BATTERY_VOLTAGE, "V", millivolts)]),
    pid(0x46, 1, &[signal(names::AMBIENT_AIR_TEMPERATURE, "°C", temperature)]),
    pid(0x5c, 1, &[signal(names::OIL_TEMPERATURE, "°C", temperature)]),
];

fn lookup(pid: u8) -> Option<&'static PidSpec> {
    PIDS.iter().find(|spec| spec.pid == pid)
}

/// Number of data bytes following `pid` in a service 01 response, if the PID is known.
pub fn pid_len(pid: u8) -> Option<usize> {
    lookup(pid).map(|spec| spec.len)
}

/// Decode a service response payload, service byte first. `counted_dtcs` selects the CAN
/// framing of service 03 responses, where a count byte precedes the code pairs.
pub fn decode_service(payload: &[u8], counted_dtcs: bool) -> Result<Vec<Reading>> {
    let Some((&sid, rest)) = payload.split_first() else {
        return mismatch();
    };

    match sid {
        sid if sid == service::CURRENT_DATA | POSITIVE_RESPONSE => decode_current_data(rest),
        sid if sid == service::READ_DTC | POSITIVE_RESPONSE => {
            let codes = if counted_dtcs {
                let Some((&count, pairs)) = rest.split_first() else {
                    return mismatch();
                };
                let pairs = &pairs[..pairs.len().min(count as usize * 2)];
                crate::dtc::decode(pairs)?
            } else {
                crate::dtc::decode(rest)?
            };
            Ok(vec![Reading::TroubleCodes(codes)])
        }
        sid if sid == service::CLEAR_DTC | POSITIVE_RESPONSE => {
            Ok(vec![Reading::TroubleCodesCleared])
        }
        // Negative responses and services this crate does not track
        _ => Ok(vec![]),
    }
}

fn decode_current_data(mut rest: &[u8]) -> Result<Vec<Reading>> {
    let mut readings = vec![];

    while let Some((&pid, data)) = rest.split_first() {
        let Some(spec) = lookup(pid) else {
            break;
        };
        if data.len() < spec.len {
            return mismatch();
        }

        let (bytes, tail) = data.split_at(spec.len);
        readings.extend(
            spec.signals
                .iter()
                .map(|spec| Reading::Signal(Signal::new(spec.name, (spec.formula)(bytes), spec.unit))),
        );
        rest = tail;
    }

    Ok(readings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn signal(readings: &[Reading], name: &str) -> f64 {
        readings
            .iter()
            .find_map(|r| match r {
                Reading::Signal(s) if s.name == name => Some(s.value),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn rpm_decode() {
        // ((0x1A * 256) + 0x2B) / 4 = 1674.75
        let readings = decode_service(&[0x41, 0x0c, 0x1a, 0x2b], true).unwrap();
        assert!((signal(&readings, names::ENGINE_RPM) - 1674.75).abs() < 0.01);
    }

    #[test]
    fn coolant_temp_decode() {
        let readings = decode_service(&[0x41, 0x05, 0x73], true).unwrap();
        assert!((signal(&readings, names::COOLANT_TEMPERATURE) - 75.0).abs() < 0.01);
    }

    #[test]
    fn battery_voltage_decode() {
        // 0x3174 = 12660 mV
        let readings = decode_service(&[0x41, 0x42, 0x31, 0x74], true).unwrap();
        assert!((signal(&readings, names::BATTERY_VOLTAGE) - 12.66).abs() < 0.001);
    }

    #[test]
    fn monitor_status_decode() {
        let readings = decode_service(&[0x41, 0x01, 0x83, 0x07, 0xe5, 0x00], true).unwrap();
        assert_eq!(signal(&readings, names::MIL_STATUS), 1.0);
        assert_eq!(signal(&readings, names::STORED_DTC_COUNT), 3.0);
    }

    #[test]
    fn multiple_pids_in_one_response() {
        let readings = decode_service(&[0x41, 0x0d, 0x32, 0x11, 0xff], true).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(signal(&readings, names::VEHICLE_SPEED), 50.0);
        assert!((signal(&readings, names::THROTTLE_POSITION) - 100.0).abs() < 0.01);
    }

    #[test]
    fn unknown_pid_stops_decoding() {
        let readings = decode_service(&[0x41, 0x0d, 0x32, 0xa6, 0x01], true).unwrap();
        assert_eq!(readings.len(), 1);
        assert!(decode_service(&[0x41, 0xa6, 0x01], true).unwrap().is_empty());
    }

    #[test]
    fn truncated_pid_is_mismatch() {
        assert_eq!(decode_service(&[0x41, 0x0c, 0x1a], true), Err(Error::DecodeMismatch));
        assert_eq!(decode_service(&[], true), Err(Error::DecodeMismatch));
    }

    #[test]
    fn negative_response_yields_nothing() {
        assert!(decode_service(&[0x7f, 0x01, 0x12], true).unwrap().is_empty());
    }

    #[test]
    fn dtc_framing() {
        let counted = decode_service(&[0x43, 0x02, 0x01, 0x43, 0x03, 0x00], true).unwrap();
        assert_eq!(counted, vec![Reading::TroubleCodes(vec![0x0143, 0x0300])]);

        // Legacy links pad to three pairs
        let uncounted = decode_service(&[0x43, 0x01, 0x43, 0x00, 0x00, 0x00, 0x00], false).unwrap();
        assert_eq!(uncounted, vec![Reading::TroubleCodes(vec![0x0143])]);

        assert_eq!(
            decode_service(&[0x44], true).unwrap(),
            vec![Reading::TroubleCodesCleared]
        );
    }
}
