use std::thread;

use motodiag::store::ParameterStore;

#[test]
fn bounds_track_every_write() {
    let sequences: [&[f64]; 4] = [
        &[1.0],
        &[5.0, 3.0, 9.0, 4.0],
        &[-40.0, 120.5, 0.0, 87.25, 87.25],
        &[12.6, 12.4, 14.1, 13.8, 11.9, 12.0],
    ];

    for values in sequences {
        let store = ParameterStore::new();
        for v in values {
            store.upsert("BatteryVoltage", *v, "V");
        }

        let param = store.get("BatteryVoltage").unwrap();
        let last = *values.last().unwrap();
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

        assert_eq!(param.value, last);
        assert!(param.min <= param.value && param.value <= param.max);
        assert_eq!(param.min, min);
        assert_eq!(param.max, max);
    }
}

#[test]
fn invalidate_all_preserves_history() {
    let store = ParameterStore::new();
    store.upsert("EngineRPM", 900.0, "rpm");
    store.upsert("EngineRPM", 4500.0, "rpm");
    store.upsert("EngineRPM", 2100.0, "rpm");
    store.upsert("CoolantTemperature", 88.0, "°C");
    store.set_dtcs(vec![0x0300]);

    let before = store.snapshot_all();
    store.invalidate_all();
    let after = store.snapshot_all();

    assert_eq!(before.len(), after.len());
    for (name, param) in &after {
        let prior = &before[name];
        assert!(!param.valid);
        assert_eq!(param.value, prior.value);
        assert_eq!(param.min, prior.min);
        assert_eq!(param.max, prior.max);
        assert_eq!(param.unit, prior.unit);
    }
    assert!(!store.dtcs().unwrap().valid);
}

#[test]
fn clear_removes_everything() {
    let store = ParameterStore::new();
    store.upsert("FuelLevel", 50.0, "%");
    store.set_dtcs(vec![0x0171]);
    store.clear();
    assert!(store.is_empty());
    assert!(store.dtcs().is_none());
}

#[test]
fn snapshots_are_never_torn() {
    let store = ParameterStore::new();
    store.upsert("VehicleSpeed", 0.0, "km/h");

    let writer = {
        let store = store.clone();
        thread::spawn(move || {
            for i in 0..10_000 {
                store.upsert("VehicleSpeed", (i % 200) as f64, "km/h");
            }
        })
    };

    for _ in 0..1_000 {
        let snapshot = store.snapshot_all();
        let param = &snapshot["VehicleSpeed"];
        assert!(param.min <= param.value && param.value <= param.max);
    }

    writer.join().unwrap();
    let param = store.get("VehicleSpeed").unwrap();
    assert_eq!((param.min, param.max), (0.0, 199.0));
}
