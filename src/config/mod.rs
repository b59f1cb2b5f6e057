//! Configuration module
//!
//! Handles loading relay configuration from TOML.

mod relay;

pub use relay::*;
