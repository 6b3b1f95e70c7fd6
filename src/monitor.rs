//! Async wrapper running a [`Session`] on a background thread.

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::aggregator::{AggregatorConfig, DiagnosticAggregator, DiagnosticSnapshot};
use crate::dtc::DtcCheck;
use crate::error::Error;
use crate::protocol::Protocol;
use crate::session::Session;
use crate::transport::Transport;
use crate::{Result, Stream};

const COMMAND_BUFFER_SIZE: usize = 16;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MonitorConfig {
    /// Pause between two session polls
    pub poll_interval: Duration,
    pub aggregator: AggregatorConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            aggregator: AggregatorConfig::default(),
        }
    }
}

type Reply = oneshot::Sender<Result<()>>;

enum Command {
    Resume(Reply),
    Reset(Reply),
    ClearVehicleDtcs(Reply),
}

fn process<T: Transport>(
    mut session: Session<T>,
    mut shutdown_receiver: oneshot::Receiver<()>,
    mut command_receiver: mpsc::Receiver<Command>,
    protocol_sender: watch::Sender<Protocol>,
    poll_interval: Duration,
) {
    while shutdown_receiver.try_recv().is_err() {
        while let Ok(command) = command_receiver.try_recv() {
            let (reply, result) = match command {
                Command::Resume(reply) => (reply, session.resume()),
                Command::Reset(reply) => {
                    session.reset();
                    (reply, Ok(()))
                }
                Command::ClearVehicleDtcs(reply) => (reply, session.request_vehicle_dtc_clear()),
            };
            // Caller may have given up waiting
            let _ = reply.send(result);
        }

        match session.poll() {
            Ok(stats) if stats.mismatches > 0 => {
                debug!("{} of {} frames mismatched", stats.mismatches, stats.frames)
            }
            Ok(_) => {}
            // Stays suspended until resumed
            Err(Error::TransportUnavailable) => {}
            Err(e) => debug!("Poll failed: {}", e),
        }

        let protocol = session.protocol();
        protocol_sender.send_if_modified(|current| {
            let changed = *current != protocol;
            *current = protocol;
            changed
        });

        std::thread::sleep(poll_interval);
    }
}

/// Runs a [`Session`] on a background thread and exposes the aggregated vehicle state to async
/// code. Uses tokio channels to communicate with the background thread. Dropping the monitor
/// stops the thread.
pub struct AsyncMonitor {
    processing_handle: Option<std::thread::JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
    command_sender: mpsc::Sender<Command>,
    protocol_receiver: watch::Receiver<Protocol>,
    aggregator: Arc<Mutex<DiagnosticAggregator>>,
}

impl AsyncMonitor {
    pub fn new<T: Transport + Send + 'static>(session: Session<T>, config: MonitorConfig) -> Self {
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();
        let (command_sender, command_receiver) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (protocol_sender, protocol_receiver) = watch::channel(session.protocol());

        let aggregator = DiagnosticAggregator::new(session.store().clone(), config.aggregator);

        let processing_handle = std::thread::spawn(move || {
            process(
                session,
                shutdown_receiver,
                command_receiver,
                protocol_sender,
                config.poll_interval,
            );
        });

        AsyncMonitor {
            processing_handle: Some(processing_handle),
            shutdown: Some(shutdown_sender),
            command_sender,
            protocol_receiver,
            aggregator: Arc::new(Mutex::new(aggregator)),
        }
    }

    /// Protocol currently locked by the session.
    pub fn protocol(&self) -> Protocol {
        *self.protocol_receiver.borrow()
    }

    /// Receiver notified whenever the active protocol changes.
    pub fn protocol_changes(&self) -> watch::Receiver<Protocol> {
        self.protocol_receiver.clone()
    }

    /// Wait until a protocol other than [`Protocol::Unknown`] is locked. Returns
    /// [`Error::Timeout`] if none is found in time.
    pub async fn wait_for_protocol(&self, timeout: Duration) -> Result<Protocol> {
        let mut receiver = self.protocol_receiver.clone();
        let protocol = tokio::time::timeout(timeout, receiver.wait_for(|p| *p != Protocol::Unknown))
            .await?
            .map_err(|_| Error::TransportUnavailable)?;
        Ok(*protocol)
    }

    /// Fresh snapshot of the vehicle state.
    pub fn snapshot(&self) -> DiagnosticSnapshot {
        self.aggregator.lock().refresh()
    }

    /// Snapshot every `period`.
    pub fn snapshots(&self, period: Duration) -> impl Stream<Item = DiagnosticSnapshot> {
        let aggregator = self.aggregator.clone();

        Box::pin(stream! {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let snapshot = aggregator.lock().refresh();
                yield snapshot;
            }
        })
    }

    pub fn check_dtcs(&self, max_codes: usize) -> DtcCheck {
        self.aggregator.lock().check_dtcs(max_codes)
    }

    /// Forget the stored trouble codes locally. See [`AsyncMonitor::clear_vehicle_dtcs`] to
    /// clear them on the vehicle.
    pub fn clear_dtcs(&self) -> bool {
        self.aggregator.lock().clear_dtcs()
    }

    async fn command(&self, command: impl FnOnce(Reply) -> Command) -> Result<()> {
        let (reply_sender, reply_receiver) = oneshot::channel();
        self.command_sender
            .send(command(reply_sender))
            .await
            .map_err(|_| Error::TransportUnavailable)?;
        reply_receiver
            .await
            .map_err(|_| Error::TransportUnavailable)?
    }

    /// Resume a session suspended after a transport failure.
    pub async fn resume(&self) -> Result<()> {
        self.command(Command::Resume).await
    }

    /// Drop all parameters and restart detection.
    pub async fn reset(&self) -> Result<()> {
        self.command(Command::Reset).await
    }

    /// Send an OBD clear-codes request to the vehicle.
    pub async fn clear_vehicle_dtcs(&self) -> Result<()> {
        self.command(Command::ClearVehicleDtcs).await
    }
}

impl Drop for AsyncMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.processing_handle.take() {
            // Send shutdown signal to background thread
            if let Some(shutdown) = self.shutdown.take() {
                let _ = shutdown.send(());
            }
            let _ = handle.join();
        }
    }
}
