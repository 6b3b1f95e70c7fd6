//! # motodiag
//! Protocol auto-detection and vehicle signal aggregation for motorcycle diagnostic buses. The crate sits on top of a raw bus [`transport::Transport`], works out which of the OBD link protocols (raw CAN, ISO 15765-4, ISO 9141-2, ISO 14230-4, SAE J1850 PWM/VPW) the vehicle speaks, decodes the signals it reports and keeps a thread-safe table of named parameters from which consistent snapshots are built.
//!
//! ## Blocking Example
//!
//! A [`session::Session`] drives the transport from a polling loop. The [`aggregator::DiagnosticAggregator`] reads the same [`store::ParameterStore`] at its own cadence.
//!
//! ```rust
//! use motodiag::aggregator::DiagnosticAggregator;
//! use motodiag::protocol::Protocol;
//! use motodiag::session::Session;
//! use motodiag::store::ParameterStore;
//! use motodiag::transport::sim::SimulatedBus;
//!
//! let bus = SimulatedBus::with_vehicle(Protocol::Iso15765_4);
//! bus.set_pid(0x0c, &[0x1a, 0xf8]);
//!
//! let store = ParameterStore::new();
//! let mut session = Session::new(bus, store.clone(), Default::default());
//! let mut aggregator = DiagnosticAggregator::new(store, Default::default());
//!
//! for _ in 0..2 {
//!     session.poll().unwrap();
//! }
//! assert_eq!(session.protocol(), Protocol::Iso15765_4);
//! assert_eq!(aggregator.refresh().engine_rpm, 1726.0);
//! ```
//!
//! ## Async Example
//!
//! The [`monitor::AsyncMonitor`] runs the session on a background thread and streams snapshots.
//!
//! ```rust
//! use motodiag::monitor::AsyncMonitor;
//! use motodiag::StreamExt;
//! use std::time::Duration;
//!
//! async fn monitor_example(session: motodiag::session::Session<motodiag::transport::sim::SimulatedBus>) {
//!     let monitor = AsyncMonitor::new(session, Default::default());
//!     let mut snapshots = monitor.snapshots(Duration::from_millis(500));
//!
//!     while let Some(snapshot) = snapshots.next().await {
//!         println!("{} rpm, {} V", snapshot.engine_rpm, snapshot.battery_voltage);
//!     }
//! }
//! ```

pub mod aggregator;
pub mod can;
pub mod decoder;
pub mod detector;
pub mod dtc;
mod error;
pub mod monitor;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transport;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use tokio_stream::{Stream, StreamExt};
