//! Wire protocol of the call stream.
//!
//! Two disjoint shapes share one connection:
//! - text frames carrying a JSON control object `{"type": "transcript", "role", "text"}`;
//!   any other `type`, or unparseable JSON, is ignored.
//! - binary frames carrying encoded audio. A zero-length binary frame from the peer
//!   means "no audio reply" and is distinct from the channel closing.
//!
//! The client only ever sends binary frames, one per finished utterance.

use crate::error::VoiceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// MIME type of agent replies (synthesized speech).
pub const REPLY_MIME: &str = "audio/mpeg";

/// Speaker of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
    System,
}

impl Role {
    /// Map a peer-supplied role name. Anything that is neither the user nor the
    /// system was authored by the agent side.
    pub fn from_wire(role: &str) -> Self {
        match role.trim().to_ascii_lowercase().as_str() {
            "user" => Role::User,
            "system" => Role::System,
            _ => Role::Agent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Agent => "agent",
            Role::System => "system",
        }
    }
}

/// One entry of the call's chat log. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
}

impl ChatTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }
}

impl fmt::Display for ChatTurn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.role.as_str(), self.text)
    }
}

/// Raw frame as carried by the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Synthesized speech received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub payload: Vec<u8>,
    pub mime: &'static str,
}

impl Reply {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            mime: REPLY_MIME,
        }
    }
}

/// Control objects carried in text frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ControlMessage {
    Transcript { role: String, text: String },
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Transcript(ChatTurn),
    Reply(Reply),
    /// Zero-length binary frame: the peer has nothing to say.
    NoReply,
    /// Unknown control type or malformed text; carries the reason for logging.
    Ignored(String),
}

impl Inbound {
    pub fn decode(frame: WireFrame) -> Self {
        match frame {
            WireFrame::Binary(bytes) if bytes.is_empty() => Inbound::NoReply,
            WireFrame::Binary(bytes) => Inbound::Reply(Reply::new(bytes)),
            WireFrame::Text(text) => match decode_control(&text) {
                Ok(turn) => Inbound::Transcript(turn),
                Err(e) => {
                    debug!("ignoring text frame: {}", e);
                    Inbound::Ignored(e.to_string())
                }
            },
        }
    }
}

fn decode_control(text: &str) -> Result<ChatTurn, VoiceError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();
    if kind != "transcript" {
        return Err(VoiceError::MalformedMessage(format!(
            "unsupported control type {:?}",
            kind
        )));
    }
    match serde_json::from_value::<ControlMessage>(value)? {
        ControlMessage::Transcript { role, text } => Ok(ChatTurn::new(Role::from_wire(&role), text)),
    }
}
