//! Broadcast hub for live anomaly alerts.
//!
//! Single-writer pattern: one coordinator task owns the set of connected
//! subscribers and applies register / unregister / broadcast commands it
//! receives over an MPSC channel. Each subscriber gets a bounded outbound
//! buffer drained by its own writer task; the coordinator only ever
//! `try_send`s into those buffers, and a subscriber whose buffer is full or
//! closed is dropped instead of being waited on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::MessageSource;
use crate::models::{Alert, Anomaly};

// ---

/// Capacity of the coordinator's command queue.
const COMMAND_QUEUE: usize = 256;

pub type ConnectionId = u64;

/// A serialized alert, shared by every subscriber it is queued for.
pub type AlertFrame = Arc<str>;

#[derive(Debug, Error)]
pub enum HubError {
    /// The coordinator task has exited.
    #[error("broadcast hub is not running")]
    Stopped,
}

/// A registered subscriber's end of its outbound buffer.
///
/// `receiver` yields `None` once the hub has dropped the connection.
pub struct Subscription {
    pub id: ConnectionId,
    pub receiver: mpsc::Receiver<AlertFrame>,
}

enum Command {
    Register {
        id: ConnectionId,
        outbound: mpsc::Sender<AlertFrame>,
    },
    Unregister(ConnectionId),
    Broadcast(Alert),
    Count(oneshot::Sender<usize>),
}

/// Cloneable handle used to talk to the coordinator.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
    next_id: Arc<AtomicU64>,
    buffer: usize,
}

/// The coordinator. Owns the membership set; run it with [`Hub::run`].
pub struct Hub {
    commands: mpsc::Receiver<Command>,
    connections: HashMap<ConnectionId, mpsc::Sender<AlertFrame>>,
}

impl Hub {
    // ---
    /// Create a hub whose subscribers each buffer up to `buffer` alerts.
    pub fn new(buffer: usize) -> (Hub, HubHandle) {
        // ---
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let hub = Hub {
            commands: rx,
            connections: HashMap::new(),
        };
        let handle = HubHandle {
            commands: tx,
            next_id: Arc::new(AtomicU64::new(1)),
            buffer: buffer.max(1),
        };
        (hub, handle)
    }

    /// Apply commands until `cancel` fires or every handle is dropped, then
    /// drain what is queued and close all connections.
    pub async fn run(mut self, cancel: CancellationToken) {
        // ---
        info!("broadcast hub started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
            }
        }

        self.commands.close();
        while let Some(command) = self.commands.recv().await {
            self.apply(command);
        }

        info!(
            "broadcast hub stopped, closing {} connection(s)",
            self.connections.len()
        );
        self.connections.clear();
    }

    fn apply(&mut self, command: Command) {
        // ---
        match command {
            Command::Register { id, outbound } => {
                self.connections.insert(id, outbound);
                debug!(
                    "Subscriber {} registered ({} active)",
                    id,
                    self.connections.len()
                );
            }
            Command::Unregister(id) => {
                if self.connections.remove(&id).is_some() {
                    debug!(
                        "Subscriber {} unregistered ({} active)",
                        id,
                        self.connections.len()
                    );
                }
            }
            Command::Broadcast(alert) => self.broadcast(&alert),
            Command::Count(reply) => {
                let _ = reply.send(self.connections.len());
            }
        }
    }

    fn broadcast(&mut self, alert: &Alert) {
        // ---
        let frame: AlertFrame = match serde_json::to_string(alert) {
            Ok(json) => json.into(),
            Err(e) => {
                error!("Failed to encode alert: {}", e);
                return;
            }
        };

        let mut dropped = Vec::new();
        for (id, outbound) in &self.connections {
            match outbound.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Subscriber {} is not keeping up, dropping it", id);
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Subscriber {} has gone away", id);
                    dropped.push(*id);
                }
            }
        }

        for id in dropped {
            self.connections.remove(&id);
        }
        debug!(
            "Broadcast {} alert to {} subscriber(s)",
            alert.kind,
            self.connections.len()
        );
    }
}

impl HubHandle {
    // ---
    /// Add a subscriber and hand back its outbound buffer.
    pub async fn register(&self) -> Result<Subscription, HubError> {
        // ---
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbound, receiver) = mpsc::channel(self.buffer);
        self.send(Command::Register { id, outbound }).await?;
        Ok(Subscription { id, receiver })
    }

    /// Remove a subscriber. Unknown or already-removed ids are ignored.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.send(Command::Unregister(id)).await
    }

    pub async fn broadcast(&self, alert: Alert) -> Result<(), HubError> {
        self.send(Command::Broadcast(alert)).await
    }

    /// Number of currently registered subscribers.
    pub async fn connection_count(&self) -> Result<usize, HubError> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.send(Command::Count(tx)).await?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    async fn send(&self, command: Command) -> Result<(), HubError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HubError::Stopped)
    }
}

/// Time budgets for the alert consumer loop.
#[derive(Debug, Clone)]
pub struct AlertConsumerSettings {
    pub fetch_timeout: Duration,
    pub retry_delay: Duration,
}

impl Default for AlertConsumerSettings {
    fn default() -> Self {
        AlertConsumerSettings {
            fetch_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Pull anomalies off the alert stream and broadcast them until `cancel`
/// fires or the hub stops.
pub async fn consume_alerts(
    source: Arc<dyn MessageSource>,
    hub: HubHandle,
    settings: AlertConsumerSettings,
    cancel: CancellationToken,
) {
    // ---
    info!("alert consumer started");
    loop {
        let fetched = tokio::select! {
            _ = cancel.cancelled() => break,
            fetched = tokio::time::timeout(settings.fetch_timeout, source.fetch()) => fetched,
        };

        let payload = match fetched {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => {
                warn!("Error consuming anomaly alert: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(settings.retry_delay) => continue,
                }
            }
            // quiet stream
            Err(_) => continue,
        };

        let anomaly: Anomaly = match serde_json::from_slice(&payload) {
            Ok(anomaly) => anomaly,
            Err(e) => {
                warn!("Skipping malformed anomaly payload: {}", e);
                continue;
            }
        };

        info!(
            "Received anomaly alert: {} - {} - {}",
            anomaly.kind, anomaly.parameter, anomaly.value
        );

        if let Err(e) = hub.broadcast(anomaly.to_alert()).await {
            error!("Error broadcasting anomaly: {}", e);
            break;
        }
    }
    info!("alert consumer stopped");
}
