use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::signal::envelope_kind;

pub const RICH_MESSAGE_KIND: &str = "rich_message";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RichAttachment {
    pub name: String,
    /// Human readable, e.g. `1.5 KB`.
    #[serde(default)]
    pub size: String,
    #[serde(rename = "type", default)]
    pub mime_type: String,
    /// `data:<mime>;base64,<payload>`
    #[serde(default)]
    pub data: String,
}

impl RichAttachment {
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        let mime_type = mime_type.into();
        Self {
            name: name.into(),
            size: format_bytes(bytes.len() as u64),
            data: format!("data:{mime_type};base64,{}", STANDARD.encode(bytes)),
            mime_type,
        }
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RichMessage {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub files: Vec<RichAttachment>,
}

#[derive(Serialize)]
struct OutboundRich<'a> {
    kind: &'static str,
    #[serde(flatten)]
    message: &'a RichMessage,
}

pub fn encode_rich(message: &RichMessage) -> String {
    serde_json::to_string(&OutboundRich {
        kind: RICH_MESSAGE_KIND,
        message,
    })
    .unwrap_or_default()
}

pub fn decode_rich(content: &str) -> Option<RichMessage> {
    let value: Value = serde_json::from_str(content).ok()?;
    if envelope_kind(&value) != Some(RICH_MESSAGE_KIND) {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// Best-effort MIME type from a file extension.
pub fn mime_type_for(name: &str) -> &'static str {
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "txt" | "log" => "text/plain",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["B", "KB", "MB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = (value * 10.0).round() / 10.0;
    if rounded.fract() == 0.0 {
        format!("{} {}", rounded as u64, UNITS[unit])
    } else {
        format!("{rounded:.1} {}", UNITS[unit])
    }
}
