//! Thread-safe table of named vehicle signals.
//!
//! One mutex guards the whole table, so a snapshot never observes a value without the min/max
//! written with it. Stored trouble codes live in their own typed slot next to the signals.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// One named vehicle signal and its history bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub unit: String,
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub valid: bool,
    pub last_update: Instant,
}

impl Parameter {
    fn new(name: &str, value: f64, unit: &str, at: Instant) -> Self {
        Self {
            name: name.to_string(),
            unit: unit.to_string(),
            value,
            min: value,
            max: value,
            valid: true,
            last_update: at,
        }
    }

    pub fn age(&self) -> Duration {
        self.last_update.elapsed()
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        !self.valid || self.age() > max_age
    }
}

/// Trouble codes most recently reported by the vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct DtcSlot {
    /// Codes in wire order
    pub codes: Vec<u16>,
    pub valid: bool,
    pub last_update: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    params: HashMap<String, Parameter>,
    dtcs: Option<DtcSlot>,
}

/// Shared parameter table. Clones refer to the same table.
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    inner: Arc<Mutex<Inner>>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update `name`. A new name seeds min and max with `value`. Non-finite values are
    /// rejected and leave the entry untouched.
    pub fn upsert(&self, name: &str, value: f64, unit: &str) -> bool {
        if !value.is_finite() {
            debug!("Ignoring non-finite value for {}", name);
            return false;
        }

        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.params.get_mut(name) {
            Some(param) => {
                param.value = value;
                param.min = param.min.min(value);
                param.max = param.max.max(value);
                param.valid = true;
                param.last_update = now;
                if param.unit != unit {
                    param.unit = unit.to_string();
                }
            }
            None => {
                inner
                    .params
                    .insert(name.to_string(), Parameter::new(name, value, unit, now));
            }
        }
        true
    }

    /// Mark `name` invalid, keeping its history. Returns false for unknown names.
    pub fn invalidate(&self, name: &str) -> bool {
        match self.inner.lock().params.get_mut(name) {
            Some(param) => {
                param.valid = false;
                true
            }
            None => false,
        }
    }

    /// Mark every entry, trouble codes included, invalid.
    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock();
        inner.params.values_mut().for_each(|param| param.valid = false);
        if let Some(slot) = inner.dtcs.as_mut() {
            slot.valid = false;
        }
    }

    /// Consistent copy of the whole table.
    pub fn snapshot_all(&self) -> HashMap<String, Parameter> {
        self.inner.lock().params.clone()
    }

    pub fn get(&self, name: &str) -> Option<Parameter> {
        self.inner.lock().params.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry and the trouble codes.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.params.clear();
        inner.dtcs = None;
    }

    pub fn set_dtcs(&self, codes: Vec<u16>) {
        self.inner.lock().dtcs = Some(DtcSlot {
            codes,
            valid: true,
            last_update: Instant::now(),
        });
    }

    pub fn dtcs(&self) -> Option<DtcSlot> {
        self.inner.lock().dtcs.clone()
    }

    /// Invalidate and empty the trouble code slot. Returns false if no codes were ever reported.
    pub fn clear_dtcs(&self) -> bool {
        match self.inner.lock().dtcs.as_mut() {
            Some(slot) => {
                slot.codes.clear();
                slot.valid = false;
                slot.last_update = Instant::now();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_upsert_seeds_bounds() {
        let store = ParameterStore::new();
        store.upsert("EngineRPM", 1500.0, "rpm");
        let param = store.get("EngineRPM").unwrap();
        assert_eq!((param.min, param.value, param.max), (1500.0, 1500.0, 1500.0));
        assert!(param.valid);
    }

    #[test]
    fn bounds_expand() {
        let store = ParameterStore::new();
        for v in [90.0, 85.0, 102.0, 95.0] {
            store.upsert("CoolantTemperature", v, "°C");
        }
        let param = store.get("CoolantTemperature").unwrap();
        assert_eq!(param.value, 95.0);
        assert_eq!(param.min, 85.0);
        assert_eq!(param.max, 102.0);
    }

    #[test]
    fn non_finite_is_rejected() {
        let store = ParameterStore::new();
        store.upsert("BatteryVoltage", 12.6, "V");
        assert!(!store.upsert("BatteryVoltage", f64::NAN, "V"));
        assert_eq!(store.get("BatteryVoltage").unwrap().value, 12.6);
    }

    #[test]
    fn invalidate_keeps_history() {
        let store = ParameterStore::new();
        store.upsert("FuelLevel", 40.0, "%");
        store.upsert("FuelLevel", 38.0, "%");
        assert!(store.invalidate("FuelLevel"));
        assert!(!store.invalidate("OilLevel"));

        let param = store.get("FuelLevel").unwrap();
        assert!(!param.valid);
        assert_eq!((param.min, param.value, param.max), (38.0, 38.0, 40.0));

        // Next write revalidates
        store.upsert("FuelLevel", 37.0, "%");
        assert!(store.get("FuelLevel").unwrap().valid);
    }

    #[test]
    fn dtc_slot() {
        let store = ParameterStore::new();
        assert!(!store.clear_dtcs());
        store.set_dtcs(vec![0x0300]);
        assert_eq!(store.dtcs().unwrap().codes, vec![0x0300]);
        assert!(store.clear_dtcs());
        let slot = store.dtcs().unwrap();
        assert!(slot.codes.is_empty());
        assert!(!slot.valid);
    }
}
