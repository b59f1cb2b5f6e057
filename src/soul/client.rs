//! Soul engine client
//!
//! Holds the single upstream session shared by every downstream connection.
//! Engine frames are decoded and assembled on a background task; subscribers
//! only ever see events with complete content.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{ContentAssembler, DispatchAction, EngineFrame, RelayFrame, UpstreamEvent};
use crate::config::SoulConfig;

/// Capacity of the event channel feeding subscribers
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Errors that can occur talking to the soul engine
#[derive(Debug, Error)]
pub enum SoulError {
    #[error("Failed to connect to soul engine: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Timed out connecting to soul engine after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Soul engine session is not connected")]
    Disconnected,
}

/// Result type for soul engine operations
pub type SoulResult<T> = Result<T, SoulError>;

/// Client side of a soul engine session
pub struct SoulClient {
    soul_id: Uuid,
    event_tx: broadcast::Sender<UpstreamEvent>,
    dispatch_tx: mpsc::UnboundedSender<DispatchAction>,
}

impl SoulClient {
    /// Connect to the engine and start the session task
    pub async fn connect(config: &SoulConfig) -> SoulResult<Self> {
        let soul_id = Uuid::new_v4();
        let url = session_url(config, soul_id);
        info!(
            "Connecting to soul engine as {}/{} ({})",
            config.organization, config.blueprint, soul_id
        );

        let (ws_stream, _) = timeout(config.connect_timeout(), connect_async(url.as_str()))
            .await
            .map_err(|_| SoulError::ConnectTimeout(config.connect_timeout()))??;

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_session(
            ws_stream,
            soul_id,
            event_tx.clone(),
            dispatch_rx,
        ));

        info!("Connected to soul engine session {}", soul_id);
        Ok(Self {
            soul_id,
            event_tx,
            dispatch_tx,
        })
    }

    /// Create a client with no upstream session
    ///
    /// Subscribers never receive events and every dispatch fails with
    /// [`SoulError::Disconnected`].
    pub fn offline() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (dispatch_tx, _) = mpsc::unbounded_channel();
        Self {
            soul_id: Uuid::new_v4(),
            event_tx,
            dispatch_tx,
        }
    }

    /// Session identifier sent to the engine
    pub fn soul_id(&self) -> Uuid {
        self.soul_id
    }

    /// Subscribe to `says` and `thinks` events in emission order
    pub fn subscribe(&self) -> broadcast::Receiver<UpstreamEvent> {
        self.event_tx.subscribe()
    }

    /// Send an action upstream without waiting for acknowledgement
    pub fn dispatch(&self, action: DispatchAction) -> SoulResult<()> {
        self.dispatch_tx
            .send(action)
            .map_err(|_| SoulError::Disconnected)
    }

    /// Whether the upstream session task is still running
    pub fn is_connected(&self) -> bool {
        !self.dispatch_tx.is_closed()
    }

    /// Create a client wired to an in-process engine stand-in
    #[cfg(test)]
    pub fn loopback() -> (Self, EngineHandle) {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let client = Self {
            soul_id: Uuid::new_v4(),
            event_tx: event_tx.clone(),
            dispatch_tx,
        };
        (
            client,
            EngineHandle {
                event_tx,
                dispatch_rx,
            },
        )
    }
}

/// Engine side of a loopback client
#[cfg(test)]
pub struct EngineHandle {
    event_tx: broadcast::Sender<UpstreamEvent>,
    pub dispatch_rx: mpsc::UnboundedReceiver<DispatchAction>,
}

#[cfg(test)]
impl EngineHandle {
    /// Emit an event to every subscriber
    pub fn emit(&self, event: UpstreamEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Build the session URL for a soul
pub fn session_url(config: &SoulConfig, soul_id: Uuid) -> String {
    format!(
        "{}/{}/{}/{}",
        config.engine_url.trim_end_matches('/'),
        config.organization,
        config.blueprint,
        soul_id
    )
}

/// Pump frames between the engine socket and the client channels
async fn run_session<S>(
    ws_stream: WebSocketStream<S>,
    soul_id: Uuid,
    event_tx: broadcast::Sender<UpstreamEvent>,
    mut dispatch_rx: mpsc::UnboundedReceiver<DispatchAction>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut assembler = ContentAssembler::new();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<EngineFrame>(&text) {
                            Ok(frame) => {
                                if let Some(event) = assembler.push(frame) {
                                    debug!("Soul {} event ({} bytes)", event.kind, event.content.len());
                                    // No subscribers is not an error
                                    let _ = event_tx.send(event);
                                }
                            }
                            Err(e) => {
                                warn!("Skipping undecodable engine frame: {}", e);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                            error!("Failed to answer engine ping: {}", e);
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        warn!("Soul engine closed session {}", soul_id);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Soul engine connection error: {}", e);
                        break;
                    }
                    None => {
                        warn!("Soul engine connection dropped for session {}", soul_id);
                        break;
                    }
                }
            }
            action = dispatch_rx.recv() => {
                let Some(action) = action else {
                    debug!("Soul client dropped, closing session {}", soul_id);
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                };
                let json = match serde_json::to_string(&RelayFrame::Dispatch(action)) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode dispatch: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(Message::Text(json)).await {
                    error!("Failed to dispatch to soul engine: {}", e);
                    break;
                }
            }
        }
    }

    if assembler.pending_count() > 0 {
        warn!(
            "Discarding {} incomplete engine streams",
            assembler.pending_count()
        );
    }
    info!("Soul engine session {} ended", soul_id);
}
