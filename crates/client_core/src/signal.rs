use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const CALL_SIGNAL_KIND: &str = "call_signal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    #[default]
    #[serde(alias = "Voice")]
    Voice,
    #[serde(alias = "Video")]
    Video,
}

impl CallType {
    pub fn label(self) -> &'static str {
        match self {
            Self::Voice => "Voice",
            Self::Video => "Video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "subType", rename_all = "snake_case")]
pub enum CallSignal {
    Offer {
        #[serde(rename = "callType", default)]
        call_type: CallType,
    },
    Accept,
    End,
    MediaState {
        #[serde(rename = "mediaType")]
        media_kind: MediaKind,
        enabled: bool,
    },
    /// Display-only audit line written when a live call ends.
    SystemLog { content: String, duration: String },
}

impl CallSignal {
    pub fn sub_type(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Accept => "accept",
            Self::End => "end",
            Self::MediaState { .. } => "media_state",
            Self::SystemLog { .. } => "system_log",
        }
    }

    /// Whether the signal drives the call state machine. `system_log` never does.
    pub fn is_actionable(&self) -> bool {
        !matches!(self, Self::SystemLog { .. })
    }

    /// Offer, accept and end: losing one of these breaks the handshake.
    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::Offer { .. } | Self::Accept | Self::End)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("content is not a call signal")]
pub struct NotASignal;

#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    kind: &'static str,
    #[serde(flatten)]
    signal: &'a CallSignal,
}

pub fn encode(signal: &CallSignal) -> String {
    let envelope = OutboundEnvelope {
        kind: CALL_SIGNAL_KIND,
        signal,
    };
    serde_json::to_string(&envelope).unwrap_or_default()
}

pub fn decode(content: &str) -> Result<CallSignal, NotASignal> {
    let value: Value = serde_json::from_str(content).map_err(|_| NotASignal)?;
    if envelope_kind(&value) != Some(CALL_SIGNAL_KIND) {
        return Err(NotASignal);
    }
    serde_json::from_value(value).map_err(|_| NotASignal)
}

/// Reads the envelope discriminator, accepting the legacy `type` key.
pub(crate) fn envelope_kind(value: &Value) -> Option<&str> {
    let object = value.as_object()?;
    object
        .get("kind")
        .or_else(|| object.get("type"))
        .and_then(Value::as_str)
}

/// `MM:SS`, minutes unbounded (`61:05` after an hour and a bit).
pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
