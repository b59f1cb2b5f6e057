//! WebSocket server implementation
//!
//! Listens on a single port for browser clients, shared with the HTTP
//! liveness route, and runs the relay task that feeds them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use super::handler::{build_router, AppState};
use super::registry::ConnectionRegistry;
use super::relay::Relay;
use crate::soul::SoulClient;

/// How long shutdown waits for client connections to close
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self { bind, port }
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// WebSocket server relaying a soul session to browser clients
pub struct RelayServer {
    config: ServerConfig,
    relay: Arc<Relay>,
    shutdown: CancellationToken,
    connections: TaskTracker,
}

impl RelayServer {
    /// Create a new server around an already created soul client
    pub fn new(config: ServerConfig, soul: Arc<SoulClient>) -> Self {
        Self {
            config,
            relay: Arc::new(Relay::new(Arc::new(ConnectionRegistry::new()), soul)),
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
        }
    }

    /// Registry of open client connections
    #[cfg(test)]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(self.relay.registry())
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("Server running on http://{}", addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    ///
    /// The relay subscribes to the soul client before the first connection
    /// is accepted. Returns once every client connection has been sent a
    /// close frame, or after [`SHUTDOWN_GRACE_PERIOD`].
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let events = self.relay.soul().subscribe();
        let relay_task = {
            let relay = Arc::clone(&self.relay);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move { relay.run(events, shutdown).await })
        };

        let app = build_router(AppState {
            relay: Arc::clone(&self.relay),
            shutdown: self.shutdown.clone(),
            connections: self.connections.clone(),
        });

        let shutdown = self.shutdown.clone();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Shutdown signal received, stopping server");
        })
        .await?;

        let _ = relay_task.await;

        self.connections.close();
        let open = self.connections.len();
        if open > 0 {
            info!("Closing {} client connections", open);
        }
        if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, self.connections.wait())
            .await
            .is_err()
        {
            warn!(
                "{} client connections still open after {:?}",
                self.connections.len(),
                SHUTDOWN_GRACE_PERIOD
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soul::{DispatchAction, EngineHandle, UpstreamEvent};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    const TIMEOUT: Duration = Duration::from_secs(5);

    type WsStream = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<TcpStream>,
    >;

    /// Start a relay backed by a loopback soul client
    async fn start_relay() -> (SocketAddr, Arc<RelayServer>, EngineHandle) {
        let (soul, engine) = SoulClient::loopback();
        let server = Arc::new(RelayServer::new(
            ServerConfig::new("127.0.0.1".to_string(), 0),
            Arc::new(soul),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve(listener).await });

        (addr, server, engine)
    }

    async fn connect(addr: SocketAddr) -> WsStream {
        let (ws, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();
        ws
    }

    /// Wait until the registry holds exactly `count` connections
    async fn wait_for_connections(server: &RelayServer, count: usize) {
        let registry = server.registry();
        timeout(TIMEOUT, async {
            while registry.len().await != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timeout waiting for registry");
    }

    /// Read the next text message as JSON
    async fn read_json(ws: &mut WsStream) -> Value {
        loop {
            let msg = timeout(TIMEOUT, ws.next())
                .await
                .expect("timeout waiting for message")
                .expect("stream closed")
                .expect("ws error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, addr
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        timeout(TIMEOUT, stream.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();
        response
    }

    #[test]
    fn test_server_config() {
        let config = ServerConfig::new("127.0.0.1".to_string(), 5001);
        assert_eq!(config.socket_addr(), "127.0.0.1:5001");
    }

    #[tokio::test]
    async fn test_liveness_route() {
        let (addr, _server, _engine) = start_relay().await;

        let response = http_get(addr, "/").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("WebSocket server is running"));

        let response = http_get(addr, "/missing").await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found"));
    }

    #[tokio::test]
    async fn test_upgrade_with_slow_request_head() {
        let (addr, server, engine) = start_relay().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request_line = format!("GET / HTTP/1.1\r\nHost: {}\r\n", addr);
        stream.write_all(request_line.as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        stream
            .write_all(
                b"Connection: Upgrade\r\n\
                  Upgrade: websocket\r\n\
                  Sec-WebSocket-Version: 13\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
            )
            .await
            .unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        timeout(TIMEOUT, async {
            while !head.ends_with(b"\r\n\r\n") {
                stream.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
            }
        })
        .await
        .expect("timeout waiting for response head");

        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("HTTP/1.1 101"), "unexpected response: {}", head);
        wait_for_connections(&server, 1).await;

        // The upgraded stream receives broadcasts like any other client
        let mut ws = tokio_tungstenite::WebSocketStream::from_raw_socket(
            stream,
            tokio_tungstenite::tungstenite::protocol::Role::Client,
            None,
        )
        .await;
        engine.emit(UpstreamEvent::says("slow but here"));
        let msg = timeout(TIMEOUT, ws.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(
            msg.into_text().unwrap(),
            r#"{"type":"says","content":"slow but here"}"#
        );
    }

    #[tokio::test]
    async fn test_broadcast_scenario() {
        let (addr, server, engine) = start_relay().await;

        let mut a = connect(addr).await;
        let mut b = connect(addr).await;
        wait_for_connections(&server, 2).await;

        engine.emit(UpstreamEvent::thinks("pondering"));
        let expected = json!({"type": "thinks", "content": "pondering"});
        assert_eq!(read_json(&mut a).await, expected);
        assert_eq!(read_json(&mut b).await, expected);

        a.close(None).await.unwrap();
        drop(a);
        wait_for_connections(&server, 1).await;

        engine.emit(UpstreamEvent::says("done"));
        assert_eq!(
            read_json(&mut b).await,
            json!({"type": "says", "content": "done"})
        );
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (addr, server, engine) = start_relay().await;

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(connect(addr).await);
        }
        wait_for_connections(&server, 3).await;

        for i in 0..10 {
            engine.emit(UpstreamEvent::says(format!("message {}", i)));
        }

        for client in &mut clients {
            for i in 0..10 {
                let value = read_json(client).await;
                assert_eq!(value["content"], format!("message {}", i));
            }
        }
    }

    #[tokio::test]
    async fn test_client_message_is_dispatched() {
        let (addr, server, mut engine) = start_relay().await;
        let mut ws = connect(addr).await;
        wait_for_connections(&server, 1).await;

        ws.send(Message::Text(r#"{"message":"hi there"}"#.to_string()))
            .await
            .unwrap();

        let action = timeout(TIMEOUT, engine.dispatch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(action, DispatchAction::said("hi there"));
    }

    #[tokio::test]
    async fn test_malformed_message_keeps_connection_open() {
        let (addr, server, mut engine) = start_relay().await;
        let mut ws = connect(addr).await;
        wait_for_connections(&server, 1).await;

        ws.send(Message::Text("{not json".to_string())).await.unwrap();
        let reply = read_json(&mut ws).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["code"], "invalid_message");
        assert!(engine.dispatch_rx.try_recv().is_err());

        // The same connection still forwards and receives
        ws.send(Message::Text(r#"{"message":"still here"}"#.to_string()))
            .await
            .unwrap();
        let action = timeout(TIMEOUT, engine.dispatch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(action.content, "still here");

        engine.emit(UpstreamEvent::says("welcome back"));
        assert_eq!(read_json(&mut ws).await["content"], "welcome back");
        assert_eq!(server.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_closed_connections_leave_registry() {
        let (addr, server, _engine) = start_relay().await;

        let clients: Vec<WsStream> = {
            let mut clients = Vec::new();
            for _ in 0..4 {
                clients.push(connect(addr).await);
            }
            clients
        };
        wait_for_connections(&server, 4).await;

        drop(clients);
        wait_for_connections(&server, 0).await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let (addr, server, _engine) = start_relay().await;
        let mut ws = connect(addr).await;
        wait_for_connections(&server, 1).await;

        server.shutdown();

        let closed = timeout(TIMEOUT, async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn test_serve_returns_after_clients_are_closed() {
        let (soul, _engine) = SoulClient::loopback();
        let server = Arc::new(RelayServer::new(
            ServerConfig::new("127.0.0.1".to_string(), 0),
            Arc::new(soul),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(connect(addr).await);
        }
        wait_for_connections(&server, 3).await;

        server.shutdown();
        timeout(TIMEOUT, serving)
            .await
            .expect("serve did not return")
            .unwrap()
            .unwrap();

        // Every connection task finished before serve returned
        assert_eq!(server.registry().len().await, 0);
        for ws in &mut clients {
            let msg = timeout(TIMEOUT, ws.next()).await.unwrap();
            assert!(matches!(msg, Some(Ok(Message::Close(_)))));
        }
    }
}
