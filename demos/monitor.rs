use std::time::Duration;

use motodiag::can::{Frame, Identifier};
use motodiag::decoder::{names, SignalLayout};
use motodiag::monitor::AsyncMonitor;
use motodiag::protocol::Protocol;
use motodiag::session::{Session, SessionConfig};
use motodiag::store::ParameterStore;
use motodiag::transport::sim::SimulatedBus;
use motodiag::StreamExt;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let bus = SimulatedBus::with_vehicle(Protocol::Can11);
    // Dashboard frame: rpm in bytes 0..2, oil level in byte 2 (0.5 %/bit)
    bus.add_broadcast(Frame::new(Identifier::Standard(0x120), &[0x0f, 0xa0, 0xb4]).unwrap());
    bus.add_broadcast(Frame::new(Identifier::Standard(0x121), &[0x7d]).unwrap());
    bus.add_broadcast(Frame::new(Identifier::Standard(0x122), &[0x00, 0x3c]).unwrap());

    let layouts = vec![
        SignalLayout::new(Identifier::Standard(0x120), names::ENGINE_RPM, "rpm", 0, 2),
        SignalLayout::new(Identifier::Standard(0x120), names::OIL_LEVEL, "%", 2, 1)
            .scaled(0.5, 0.0),
        SignalLayout::new(Identifier::Standard(0x121), names::COOLANT_TEMPERATURE, "°C", 0, 1)
            .scaled(1.0, -40.0),
        SignalLayout::new(Identifier::Standard(0x122), names::VEHICLE_SPEED, "km/h", 0, 2),
    ];

    let session = Session::new(
        bus,
        ParameterStore::new(),
        SessionConfig {
            layouts,
            ..Default::default()
        },
    );
    let monitor = AsyncMonitor::new(session, Default::default());

    let protocol = monitor
        .wait_for_protocol(Duration::from_secs(5))
        .await
        .unwrap();
    println!("Detected {}", protocol);

    let mut snapshots = monitor.snapshots(Duration::from_millis(500)).take(5);
    while let Some(snapshot) = snapshots.next().await {
        println!("{:?}", snapshot);
    }
}
