//! Soul engine module
//!
//! Upstream client adapter: one session with the remote soul engine, a stream
//! of `says`/`thinks` events and a one-way dispatch back to it.

mod client;
mod event;

pub use client::*;
pub use event::*;
