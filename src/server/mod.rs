//! WebSocket server module
//!
//! Accepts browser clients, tracks them in the connection registry and relays
//! soul engine events to them.

mod handler;
mod protocol;
mod registry;
mod relay;
mod websocket;

pub use websocket::{RelayServer, ServerConfig};
