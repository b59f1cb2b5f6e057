//! Broadcast relay
//!
//! Fans soul engine events out to every registered connection and forwards
//! client messages back to the engine.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{ErrorCode, InboundMessage, OutboundMessage, ProtocolError};
use super::registry::ConnectionRegistry;
use crate::soul::{SoulClient, SoulError, UpstreamEvent};

/// Errors that can occur forwarding a client message
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] SoulError),
}

impl RelayError {
    /// Error frame reported back to the offending client
    pub fn to_message(&self) -> OutboundMessage {
        match self {
            RelayError::Malformed(e) => {
                OutboundMessage::error(e.to_string(), ErrorCode::InvalidMessage)
            }
            RelayError::Upstream(e) => {
                OutboundMessage::error(e.to_string(), ErrorCode::UpstreamUnavailable)
            }
        }
    }
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Connects the soul engine session to the connection registry
pub struct Relay {
    registry: Arc<ConnectionRegistry>,
    soul: Arc<SoulClient>,
}

impl Relay {
    pub fn new(registry: Arc<ConnectionRegistry>, soul: Arc<SoulClient>) -> Self {
        Self { registry, soul }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn soul(&self) -> &Arc<SoulClient> {
        &self.soul
    }

    /// Broadcast an event to every open connection
    ///
    /// Recipients are the registry members at the time of the call. A closed
    /// connection, or one whose queue rejects the frame, is deregistered
    /// without affecting the others. Returns the number of connections the
    /// frame was queued for.
    pub async fn relay(&self, event: &UpstreamEvent) -> usize {
        let json = match OutboundMessage::from(event).to_json() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!("Failed to serialize {} event: {}", event.kind, e);
                return 0;
            }
        };

        let recipients = self.registry.snapshot().await;
        let mut delivered = 0;
        let mut failed = Vec::new();

        for connection in &recipients {
            if !connection.is_open() {
                debug!("Dropping closed connection {}", connection.id());
                failed.push(connection.id());
                continue;
            }
            if connection.send(Arc::clone(&json)) {
                delivered += 1;
            } else {
                warn!(
                    "Failed to send {} event to {}",
                    event.kind,
                    connection.peer_addr()
                );
                failed.push(connection.id());
            }
        }

        for id in &failed {
            self.registry.remove(id).await;
        }

        debug!("Broadcast {} to {} clients: {}", event.kind, delivered, json);
        delivered
    }

    /// Forward a raw client frame upstream as a `said` action
    pub fn forward(&self, text: &str) -> RelayResult<()> {
        let inbound = InboundMessage::from_json(text)?;
        info!("Received message: {}", inbound.message);
        self.soul.dispatch(inbound.into_dispatch())?;
        Ok(())
    }

    /// Relay events until the subscription ends or shutdown is signalled
    pub async fn run(
        &self,
        mut events: broadcast::Receiver<UpstreamEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                result = events.recv() => {
                    match result {
                        Ok(event) => {
                            self.relay(&event).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Relay lagged behind soul engine by {} events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("Soul event stream closed");
                            break;
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("Relay stopping");
                    break;
                }
            }
        }
    }
}
