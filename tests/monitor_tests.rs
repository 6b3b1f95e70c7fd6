use std::time::Duration;

use motodiag::monitor::{AsyncMonitor, MonitorConfig};
use motodiag::protocol::Protocol;
use motodiag::session::{Session, SessionConfig};
use motodiag::store::ParameterStore;
use motodiag::transport::sim::SimulatedBus;
use motodiag::{Error, StreamExt};

const DETECTION_TIMEOUT: Duration = Duration::from_secs(5);

fn monitor(bus: &SimulatedBus) -> AsyncMonitor {
    let session = Session::new(
        bus.clone(),
        ParameterStore::new(),
        SessionConfig {
            pids: vec![0x0c, 0x42],
            ..Default::default()
        },
    );
    AsyncMonitor::new(session, MonitorConfig::default())
}

#[tokio::test]
#[serial_test::serial]
async fn snapshots_follow_the_vehicle() {
    let bus = SimulatedBus::with_vehicle(Protocol::Iso15765_4);
    bus.set_pid(0x0c, &[0x1a, 0xf8]);
    bus.set_pid(0x42, &[0x31, 0x74]);
    let monitor = monitor(&bus);

    let protocol = monitor.wait_for_protocol(DETECTION_TIMEOUT).await.unwrap();
    assert_eq!(protocol, Protocol::Iso15765_4);

    let stream = monitor
        .snapshots(Duration::from_millis(20))
        .timeout(DETECTION_TIMEOUT);
    tokio::pin!(stream);

    loop {
        let snapshot = stream.next().await.unwrap().expect("no snapshot in time");
        if snapshot.engine_rpm > 0.0 && snapshot.battery_voltage > 0.0 {
            assert_eq!(snapshot.engine_rpm, 1726.0);
            assert!((snapshot.battery_voltage - 12.66).abs() < 0.001);
            break;
        }
    }
}

#[tokio::test]
#[serial_test::serial]
async fn no_vehicle_times_out() {
    let bus = SimulatedBus::new(&Default::default());
    let monitor = monitor(&bus);
    assert_eq!(
        monitor.wait_for_protocol(Duration::from_millis(300)).await,
        Err(Error::Timeout)
    );
    assert_eq!(monitor.protocol(), Protocol::Unknown);
}

#[tokio::test]
#[serial_test::serial]
async fn clear_vehicle_dtcs() {
    let bus = SimulatedBus::with_vehicle(Protocol::Iso15765_4);
    bus.set_dtcs(&[0x0300, 0x0171]);
    let monitor = monitor(&bus);
    monitor.wait_for_protocol(DETECTION_TIMEOUT).await.unwrap();

    // Codes are read by the first request after detection
    while monitor.check_dtcs(10).count() < 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    monitor.clear_vehicle_dtcs().await.unwrap();
    while monitor.check_dtcs(10).count() > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(bus.dtcs().is_empty());
    assert!(!monitor.snapshot().has_dtcs());
}

#[tokio::test]
#[serial_test::serial]
async fn resume_after_transport_loss() {
    let bus = SimulatedBus::with_vehicle(Protocol::Iso15765_4);
    let monitor = monitor(&bus);
    let mut changes = monitor.protocol_changes();
    monitor.wait_for_protocol(DETECTION_TIMEOUT).await.unwrap();

    bus.set_ready(false);
    tokio::time::timeout(
        DETECTION_TIMEOUT,
        changes.wait_for(|p| *p == Protocol::Unknown),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(monitor.resume().await, Err(Error::TransportUnavailable));

    bus.set_ready(true);
    monitor.resume().await.unwrap();
    let protocol = monitor.wait_for_protocol(DETECTION_TIMEOUT).await.unwrap();
    assert_eq!(protocol, Protocol::Iso15765_4);
}
