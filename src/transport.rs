//! Transport events
//!
//! The application owns the physical connection and reports what happens to
//! it as [`TransportEvent`]s. Inbound text frames are tagged JSON:
//!
//! ```json
//! {"type": "invalidate", "ids": ["sub-1", "sub-7"]}
//! ```

use crate::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Messages pushed by the server over the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    /// Live queries whose data changed, by server subscription id
    #[serde(rename = "invalidate")]
    Invalidate { ids: Vec<String> },
    /// Any message this layer does not handle
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    /// Parse one inbound text frame
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// What happened on the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connection established, including every reconnection
    Open,
    Close,
    Receive(InboundMessage),
}

impl TransportEvent {
    /// Build a receive event from a raw text frame. Frames that cannot be
    /// parsed are logged and dropped.
    pub fn from_text(text: &str) -> Option<Self> {
        match InboundMessage::parse(text) {
            Ok(message) => Some(TransportEvent::Receive(message)),
            Err(e) => {
                warn!("Dropping malformed inbound message: {}", e);
                None
            }
        }
    }
}
