//! Wire protocol and shared data model.
//!
//! ## Wire format
//! Every frame on the event channel is one JSON object:
//!
//! ```json
//! {"event": "send-message", "payload": {"message": {...}}, "from": "participant-id"}
//! ```
//!
//! `from` is stamped by the hub on relayed frames and is absent on frames a
//! client publishes.

use std::fmt::Write;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TimestampConfig;
use crate::error::Result;

// ---------------------------------------------------------------------------
// Chat entries
// ---------------------------------------------------------------------------

/// Who produced a chat entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    User,
    Assistant,
}

/// One immutable line of the shared transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub id: String,
    pub author: String,
    pub body: String,
    pub created_at: String,
    pub origin: Origin,
}

impl ChatEntry {
    /// Build an entry with a fresh v4 UUID.
    pub fn new(author: impl Into<String>, body: impl Into<String>, origin: Origin, created_at: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            author: author.into(),
            body: body.into(),
            created_at,
            origin,
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.origin == Origin::Assistant
    }
}

/// Renders chat timestamps. Same instant and settings always give the same
/// string.
#[derive(Debug, Clone)]
pub struct TimestampFormatter {
    pattern: String,
    offset: FixedOffset,
}

impl TimestampFormatter {
    /// An unrenderable pattern falls back to the default one.
    pub fn new(cfg: &TimestampConfig) -> Self {
        let offset = FixedOffset::east_opt(cfg.utc_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| Utc.fix());
        let pattern = match cfg.validate() {
            Ok(()) => cfg.format.clone(),
            Err(e) => {
                tracing::warn!(error = %e, "using default timestamp pattern");
                TimestampConfig::default().format
            }
        };
        Self { pattern, offset }
    }

    pub fn format(&self, at: DateTime<Utc>) -> String {
        let mut out = String::new();
        match write!(out, "{}", at.with_timezone(&self.offset).format(&self.pattern)) {
            Ok(()) => out,
            Err(_) => at.to_rfc3339(),
        }
    }

    pub fn now(&self) -> String {
        self.format(Utc::now())
    }
}

impl Default for TimestampFormatter {
    fn default() -> Self {
        Self::new(&TimestampConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceKind {
    ActivityStart,
    ActivityPause,
}

/// Ephemeral typing signal. Never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSignal {
    pub kind: PresenceKind,
    pub cursor_offset: Option<usize>,
    pub file_id: Option<String>,
}

impl PresenceSignal {
    pub fn into_event(self) -> ChannelEvent {
        let payload = PresencePayload {
            cursor_position: self.cursor_offset,
            file_id: self.file_id,
        };
        match self.kind {
            PresenceKind::ActivityStart => ChannelEvent::TypingStart(payload),
            PresenceKind::ActivityPause => ChannelEvent::TypingPause(payload),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// Full content of one file as held by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    pub file_id: String,
    pub content: String,
}

impl DocumentSnapshot {
    pub fn new(file_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            content: content.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Channel events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub participant_id: String,
    pub username: String,
}

/// Every event name carried on the channel, with its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ChannelEvent {
    SendMessage { message: ChatEntry },
    ReceiveMessage { message: ChatEntry },
    #[serde(rename_all = "camelCase")]
    FileUpdated { file_id: String, new_content: String },
    TypingStart(PresencePayload),
    TypingPause(PresencePayload),
    /// Sent by the hub to a new connection only; `members` lists who was
    /// already in the room.
    #[serde(rename_all = "camelCase")]
    Welcome {
        participant_id: String,
        #[serde(default)]
        members: Vec<PeerInfo>,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantJoined { participant_id: String, username: String },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft { participant_id: String },
}

impl ChannelEvent {
    /// Wire name of the event, e.g. `"file-updated"`.
    pub fn name(&self) -> &'static str {
        match self {
            ChannelEvent::SendMessage { .. } => "send-message",
            ChannelEvent::ReceiveMessage { .. } => "receive-message",
            ChannelEvent::FileUpdated { .. } => "file-updated",
            ChannelEvent::TypingStart(_) => "typing-start",
            ChannelEvent::TypingPause(_) => "typing-pause",
            ChannelEvent::Welcome { .. } => "welcome",
            ChannelEvent::ParticipantJoined { .. } => "participant-joined",
            ChannelEvent::ParticipantLeft { .. } => "participant-left",
        }
    }
}

/// A channel event plus the id of the participant that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub event: ChannelEvent,
    pub from: Option<String>,
}

impl Envelope {
    pub fn local(event: ChannelEvent) -> Self {
        Self { event, from: None }
    }

    pub fn from_participant(event: ChannelEvent, participant_id: impl Into<String>) -> Self {
        Self {
            event,
            from: Some(participant_id.into()),
        }
    }

    pub fn encode(&self) -> Result<String> {
        let mut value = serde_json::to_value(&self.event)?;
        if let (Some(from), Some(obj)) = (&self.from, value.as_object_mut()) {
            obj.insert("from".to_string(), serde_json::Value::String(from.clone()));
        }
        Ok(serde_json::to_string(&value)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        let mut value: serde_json::Value = serde_json::from_str(text)?;
        let from = value
            .as_object_mut()
            .and_then(|obj| obj.remove("from"))
            .and_then(|v| v.as_str().map(str::to_string));
        let event = serde_json::from_value(value)?;
        Ok(Self { event, from })
    }
}
