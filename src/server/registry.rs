//! Connection registry
//!
//! Tracks the open downstream connections. Each connection is represented by
//! the sending half of its outbound queue; the socket itself is owned by the
//! connection's handler task.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

/// A registered downstream connection
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    peer_addr: SocketAddr,
    tx: mpsc::UnboundedSender<Arc<String>>,
}

impl Connection {
    pub fn new(peer_addr: SocketAddr, tx: mpsc::UnboundedSender<Arc<String>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_addr,
            tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether the handler is still draining this connection's queue
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a serialized frame, returning false if the connection is gone
    pub fn send(&self, frame: Arc<String>) -> bool {
        self.tx.send(frame).is_ok()
    }
}

/// Set of currently open connections
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection
    pub async fn add(&self, connection: Arc<Connection>) {
        let mut connections = self.connections.write().await;
        debug!("Registering connection {} from {}", connection.id(), connection.peer_addr());
        connections.insert(connection.id(), connection);
    }

    /// Deregister a connection, returning whether it was present
    pub async fn remove(&self, id: &Uuid) -> bool {
        let removed = self.connections.write().await.remove(id).is_some();
        if removed {
            debug!("Deregistered connection {}", id);
        }
        removed
    }

    /// Copy of the current members
    ///
    /// Later registrations and removals do not affect the returned list.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Number of registered connections
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }
}
