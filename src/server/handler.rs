//! HTTP and WebSocket handlers
//!
//! The root route answers plain requests with the liveness body and upgrades
//! WebSocket requests into clients registered with the relay.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::registry::Connection;
use super::relay::Relay;

/// Body of the liveness response
pub const LIVENESS_BODY: &str = "WebSocket server is running";

/// Shared state passed to the handlers
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub shutdown: CancellationToken,
    pub connections: TaskTracker,
}

/// Build the router serving the liveness route and WebSocket upgrades on `/`
pub fn build_router(state: AppState) -> Router {
    Router::new().route("/", get(root_handler)).with_state(state)
}

/// Upgrade WebSocket requests, answer everything else with the liveness body
async fn root_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(
            WebSocketUpgradeRejection::InvalidConnectionHeader(_)
            | WebSocketUpgradeRejection::InvalidUpgradeHeader(_),
        ) => {
            debug!("Liveness check from {}", peer_addr);
            return LIVENESS_BODY.into_response();
        }
        Err(rejection) => {
            warn!("Rejected WebSocket upgrade from {}: {}", peer_addr, rejection);
            return rejection.into_response();
        }
    };

    // Held for the lifetime of the connection so shutdown can wait on it
    let token = state.connections.token();
    ws.on_upgrade(move |socket| {
        handle_socket(socket, peer_addr, state.relay, state.shutdown, token)
    })
}

/// Register an upgraded client and serve it until either side closes
async fn handle_socket(
    socket: WebSocket,
    peer_addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown: CancellationToken,
    _token: TaskTrackerToken,
) {
    let (tx, mut outbound_rx) = mpsc::unbounded_channel();
    let connection = Arc::new(Connection::new(peer_addr, tx));
    let connection_id = connection.id();
    relay.registry().add(connection).await;
    info!("Client connected: {} ({})", peer_addr, connection_id);

    if let Err(e) = run_connection(socket, peer_addr, &relay, &mut outbound_rx, &shutdown).await {
        error!("Connection error from {}: {}", peer_addr, e);
    }

    relay.registry().remove(&connection_id).await;
    info!("Client disconnected: {}", peer_addr);
}

/// Message handling loop for a registered client
async fn run_connection(
    socket: WebSocket,
    peer_addr: SocketAddr,
    relay: &Relay,
    outbound_rx: &mut mpsc::UnboundedReceiver<Arc<String>>,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    loop {
        tokio::select! {
            // Receive messages from client
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received message from {}: {}", peer_addr, text.as_str());

                        if let Err(e) = relay.forward(text.as_str()) {
                            warn!("Rejected message from {}: {}", peer_addr, e);
                            let error_json = e.to_message().to_json()?;
                            ws_sender.send(Message::Text(error_json.into())).await?;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received binary message from {} ({} bytes), ignoring", peer_addr, data.len());
                    }
                    // Pongs are answered by the socket itself
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!("Client {} requested close", peer_addr);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", peer_addr, e);
                        break;
                    }
                    None => break,
                }
            }
            // Forward broadcasts queued by the relay
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        ws_sender.send(Message::Text(frame.to_string().into())).await?;
                    }
                    None => break,
                }
            }
            _ = shutdown.cancelled() => {
                debug!("Shutdown signal received, closing connection to {}", peer_addr);
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    Ok(())
}
