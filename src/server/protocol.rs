//! Protocol message definitions
//!
//! Defines the JSON frames exchanged between browser clients and the relay.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::soul::{DispatchAction, EventKind, UpstreamEvent};

/// Maximum inbound message length (64KB)
pub const MAX_MESSAGE_LENGTH: usize = 64 * 1024;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Error codes for client-facing error frames
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The inbound frame was not a valid message
    InvalidMessage,
    /// The soul engine session is unavailable
    UpstreamUnavailable,
}

// ============================================================================
// Client Messages
// ============================================================================

/// Message sent from a client to the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundMessage {
    /// What the client said
    pub message: String,
}

impl InboundMessage {
    /// Parse and validate an inbound message from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let inbound: Self = serde_json::from_str(json)?;
        inbound.validate()?;
        Ok(inbound)
    }

    /// Validate message contents
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.message.is_empty() {
            return Err(ProtocolError::ValidationError(
                "message cannot be empty".to_string(),
            ));
        }
        if self.message.len() > MAX_MESSAGE_LENGTH {
            return Err(ProtocolError::ValidationError(format!(
                "message exceeds maximum length of {} bytes",
                MAX_MESSAGE_LENGTH
            )));
        }
        Ok(())
    }

    /// Convert into the upstream `said` action
    pub fn into_dispatch(self) -> DispatchAction {
        DispatchAction::said(self.message)
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// Messages sent from the relay to clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// The soul said something
    Says { content: String },

    /// The soul thought something
    Thinks { content: String },

    /// A client frame could not be handled
    Error { message: String, code: ErrorCode },
}

impl OutboundMessage {
    /// Create an Error message
    pub fn error(message: impl Into<String>, code: ErrorCode) -> Self {
        OutboundMessage::Error {
            message: message.into(),
            code,
        }
    }

    /// Serialize the message to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<&UpstreamEvent> for OutboundMessage {
    fn from(event: &UpstreamEvent) -> Self {
        let content = event.content.clone();
        match event.kind {
            EventKind::Says => OutboundMessage::Says { content },
            EventKind::Thinks => OutboundMessage::Thinks { content },
        }
    }
}
