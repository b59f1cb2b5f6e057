//! Soul engine event types
//!
//! Typed events received from the engine, the dispatch action sent back to it,
//! and the JSON frames both travel in. Streamed content is assembled here
//! before an event is handed to subscribers.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Action name used when forwarding what a client said
pub const SAID_ACTION: &str = "said";

/// Most streams assembled at once before the oldest is dropped
pub const MAX_PENDING_STREAMS: usize = 256;

/// Kinds of engine events relayed to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Something the soul said out loud
    Says,
    /// An internal thought of the soul
    Thinks,
}

impl EventKind {
    /// Map an engine action name to a relayed kind
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "says" => Some(EventKind::Says),
            "thinks" => Some(EventKind::Thinks),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Says => "says",
            EventKind::Thinks => "thinks",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An engine event with fully resolved content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEvent {
    pub kind: EventKind,
    pub content: String,
}

impl UpstreamEvent {
    pub fn new(kind: EventKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    #[cfg(test)]
    pub fn says(content: impl Into<String>) -> Self {
        Self::new(EventKind::Says, content)
    }

    #[cfg(test)]
    pub fn thinks(content: impl Into<String>) -> Self {
        Self::new(EventKind::Thinks, content)
    }
}

/// One-way action dispatched to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchAction {
    pub action: String,
    pub content: String,
}

impl DispatchAction {
    /// Create a `said` action carrying client input
    pub fn said(content: impl Into<String>) -> Self {
        Self {
            action: SAID_ACTION.to_string(),
            content: content.into(),
        }
    }
}

// ============================================================================
// Wire Frames
// ============================================================================

/// Frames received from the engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineFrame {
    /// An event whose content arrived in one piece
    Event {
        id: String,
        action: String,
        content: String,
    },
    /// A partial piece of a streamed event
    Chunk {
        id: String,
        action: String,
        delta: String,
    },
    /// Marks a streamed event as complete
    End { id: String },
}

/// Frames sent to the engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    Dispatch(DispatchAction),
}

// ============================================================================
// Content Assembly
// ============================================================================

#[derive(Debug)]
struct PendingContent {
    kind: EventKind,
    content: String,
    started: u64,
}

/// Resolves engine frames into complete events
///
/// Events come out in the order their content completes, which for streamed
/// events is the order of their `end` frames. At most [`MAX_PENDING_STREAMS`]
/// streams are held; starting another drops the oldest unfinished one.
#[derive(Debug, Default)]
pub struct ContentAssembler {
    pending: HashMap<String, PendingContent>,
    next_stream: u64,
}

impl ContentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame, returning an event once its content is complete
    pub fn push(&mut self, frame: EngineFrame) -> Option<UpstreamEvent> {
        match frame {
            EngineFrame::Event {
                id,
                action,
                content,
            } => {
                let Some(kind) = EventKind::from_action(&action) else {
                    debug!("Ignoring engine event {} with action {}", id, action);
                    return None;
                };
                // A complete event supersedes anything streamed under the same id
                self.pending.remove(&id);
                Some(UpstreamEvent::new(kind, content))
            }
            EngineFrame::Chunk { id, action, delta } => {
                let Some(kind) = EventKind::from_action(&action) else {
                    debug!("Ignoring engine chunk {} with action {}", id, action);
                    return None;
                };
                if !self.pending.contains_key(&id) {
                    if self.pending.len() >= MAX_PENDING_STREAMS {
                        self.evict_oldest();
                    }
                    self.next_stream += 1;
                    self.pending.insert(
                        id.clone(),
                        PendingContent {
                            kind,
                            content: String::new(),
                            started: self.next_stream,
                        },
                    );
                }
                if let Some(pending) = self.pending.get_mut(&id) {
                    pending.content.push_str(&delta);
                }
                None
            }
            EngineFrame::End { id } => match self.pending.remove(&id) {
                Some(pending) => Some(UpstreamEvent::new(pending.kind, pending.content)),
                None => {
                    warn!("Received end for unknown engine stream {}", id);
                    None
                }
            },
        }
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(_, pending)| pending.started)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            if let Some(pending) = self.pending.remove(&id) {
                warn!(
                    "Dropping unfinished engine stream {} ({} bytes of {})",
                    id,
                    pending.content.len(),
                    pending.kind
                );
            }
        }
    }

    /// Number of streams still waiting for their end frame
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
