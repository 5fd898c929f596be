use serde::{Deserialize, Serialize};

use crate::domain::{DeliveryStatus, Direction, Seconds, UserId};

pub const USER_ID_HEADER: &str = "x-user-id";

/// The relay assigns no message id; consumers derive identity from
/// `(counterpart, timestamp)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(alias = "type")]
    pub direction: Direction,
    #[serde(alias = "user")]
    pub counterpart: UserId,
    pub timestamp: Seconds,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeliveryStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboxResponse {
    pub messages: Vec<MessageRecord>,
}

/// Missing fields decode as empty so the relay can answer with a validation
/// error instead of a body rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub status: String,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub status: String,
}
