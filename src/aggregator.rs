//! Fixed vehicle-state record built from the [`ParameterStore`].

use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};
use tracing::debug;

use crate::decoder::names;
use crate::dtc::{Dtc, DtcCheck, DEFAULT_CAPACITY};
use crate::store::ParameterStore;

/// Quantities tracked by a [`DiagnosticSnapshot`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display, EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Quantity {
    EngineRpm,
    BatteryVoltage,
    OilLevel,
    CoolantTemperature,
    FuelLevel,
    VehicleSpeed,
    ThrottlePosition,
}

impl Quantity {
    /// Name of the store parameter feeding this quantity.
    pub fn parameter(&self) -> &'static str {
        match self {
            Quantity::EngineRpm => names::ENGINE_RPM,
            Quantity::BatteryVoltage => names::BATTERY_VOLTAGE,
            Quantity::OilLevel => names::OIL_LEVEL,
            Quantity::CoolantTemperature => names::COOLANT_TEMPERATURE,
            Quantity::FuelLevel => names::FUEL_LEVEL,
            Quantity::VehicleSpeed => names::VEHICLE_SPEED,
            Quantity::ThrottlePosition => names::THROTTLE_POSITION,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AggregatorConfig {
    /// Maximum number of trouble codes carried by a snapshot
    pub dtc_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            dtc_capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Point-in-time copy of the vehicle state. Fields keep their last valid value while the
/// source parameter is missing or invalid.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiagnosticSnapshot {
    pub engine_rpm: f64,
    pub battery_voltage: f64,
    pub oil_level: f64,
    pub coolant_temperature: f64,
    pub fuel_level: f64,
    pub vehicle_speed: f64,
    pub throttle_position: f64,
    /// At most the configured capacity, in the order reported by the vehicle
    pub dtcs: Vec<Dtc>,
    pub dtc_truncated: bool,
}

impl DiagnosticSnapshot {
    pub fn get(&self, quantity: Quantity) -> f64 {
        match quantity {
            Quantity::EngineRpm => self.engine_rpm,
            Quantity::BatteryVoltage => self.battery_voltage,
            Quantity::OilLevel => self.oil_level,
            Quantity::CoolantTemperature => self.coolant_temperature,
            Quantity::FuelLevel => self.fuel_level,
            Quantity::VehicleSpeed => self.vehicle_speed,
            Quantity::ThrottlePosition => self.throttle_position,
        }
    }

    fn field(&mut self, quantity: Quantity) -> &mut f64 {
        match quantity {
            Quantity::EngineRpm => &mut self.engine_rpm,
            Quantity::BatteryVoltage => &mut self.battery_voltage,
            Quantity::OilLevel => &mut self.oil_level,
            Quantity::CoolantTemperature => &mut self.coolant_temperature,
            Quantity::FuelLevel => &mut self.fuel_level,
            Quantity::VehicleSpeed => &mut self.vehicle_speed,
            Quantity::ThrottlePosition => &mut self.throttle_position,
        }
    }

    pub fn dtc_count(&self) -> usize {
        self.dtcs.len()
    }

    pub fn has_dtcs(&self) -> bool {
        !self.dtcs.is_empty()
    }
}

/// Reads the store on the caller's cadence and keeps the last snapshot.
pub struct DiagnosticAggregator {
    store: ParameterStore,
    config: AggregatorConfig,
    last: DiagnosticSnapshot,
}

impl DiagnosticAggregator {
    pub fn new(store: ParameterStore, config: AggregatorConfig) -> Self {
        Self {
            store,
            config,
            last: DiagnosticSnapshot::default(),
        }
    }

    pub fn store(&self) -> &ParameterStore {
        &self.store
    }

    /// Recompute the snapshot from one consistent copy of the store.
    pub fn refresh(&mut self) -> DiagnosticSnapshot {
        let params = self.store.snapshot_all();
        let mut snapshot = self.last.clone();

        for quantity in Quantity::iter() {
            if let Some(param) = params.get(quantity.parameter()).filter(|p| p.valid) {
                *snapshot.field(quantity) = param.value;
            }
        }

        let check = self.check_dtcs(self.config.dtc_capacity);
        snapshot.dtc_truncated = check.truncated();
        snapshot.dtcs = check.codes;

        self.last = snapshot.clone();
        snapshot
    }

    /// Last snapshot returned by [`DiagnosticAggregator::refresh`].
    pub fn last(&self) -> &DiagnosticSnapshot {
        &self.last
    }

    /// Parse the stored trouble codes, keeping at most `max_codes`. Codes beyond the cap are
    /// dropped and reported through [`DtcCheck::truncated`].
    pub fn check_dtcs(&self, max_codes: usize) -> DtcCheck {
        let Some(slot) = self.store.dtcs().filter(|slot| slot.valid) else {
            return DtcCheck::default();
        };

        let available = slot.codes.len();
        if available > max_codes {
            debug!("{} trouble codes present, keeping {}", available, max_codes);
        }

        DtcCheck {
            codes: slot.codes.into_iter().take(max_codes).map(Dtc).collect(),
            available,
        }
    }

    /// Forget the stored trouble codes until the vehicle reports new ones. The vehicle itself is
    /// not told to clear its codes.
    pub fn clear_dtcs(&mut self) -> bool {
        let cleared = self.store.clear_dtcs();
        self.last.dtcs.clear();
        self.last.dtc_truncated = false;
        cleared
    }
}
