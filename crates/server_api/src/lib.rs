use chrono::Utc;
use shared::{
    domain::{DeliveryStatus, Direction, Seconds, UserId},
    error::{ApiError, ErrorCode},
    protocol::{LoginResponse, MessageRecord},
};
use storage::Storage;
use tracing::{debug, info};

pub const LOOPBACK_REPLY: &str = "Identity verified. Transmission loop back successful.";

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    /// Handle that answers every message with [`LOOPBACK_REPLY`].
    pub loopback_service: UserId,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub looped_back: usize,
    pub deferred: usize,
}

pub async fn login(ctx: &ApiContext, raw_user_id: &str) -> Result<LoginResponse, ApiError> {
    let user_id = UserId::new(raw_user_id);
    if user_id.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "Invalid ID"));
    }
    let created = ctx
        .storage
        .register_user(&user_id, now())
        .await
        .map_err(internal)?;
    info!(user = %user_id, created, "relay: login");
    Ok(LoginResponse {
        status: "connected".into(),
        user_id,
    })
}

pub async fn authenticate(ctx: &ApiContext, header: Option<&str>) -> Result<UserId, ApiError> {
    let user_id = UserId::new(header.unwrap_or_default());
    if user_id.is_empty() {
        return Err(ApiError::new(ErrorCode::Unauthorized, "Unauthorized"));
    }
    let registered = ctx
        .storage
        .is_registered(&user_id)
        .await
        .map_err(internal)?;
    if !registered {
        return Err(ApiError::new(ErrorCode::Unauthorized, "Unauthorized"));
    }
    Ok(user_id)
}

pub async fn send_message(
    ctx: &ApiContext,
    sender: &UserId,
    recipient: &str,
    message: &str,
) -> Result<i64, ApiError> {
    let recipient = UserId::new(recipient);
    if recipient.is_empty() || message.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "Missing fields"));
    }
    let id = ctx
        .storage
        .enqueue_outgoing(sender, &recipient, message, now())
        .await
        .map_err(internal)?;
    debug!(%sender, %recipient, id, "relay: message queued");
    Ok(id)
}

/// The caller's inbox and outgoing queue merged into one list, oldest first.
/// Ties keep inbox records ahead of outgoing ones.
pub async fn list_messages(ctx: &ApiContext, user_id: &UserId) -> Result<Vec<MessageRecord>, ApiError> {
    let inbox = ctx.storage.list_inbox(user_id).await.map_err(internal)?;
    let outgoing = ctx.storage.list_outgoing(user_id).await.map_err(internal)?;

    let mut messages = Vec::with_capacity(inbox.len() + outgoing.len());
    messages.extend(inbox.into_iter().map(|m| MessageRecord {
        direction: Direction::Received,
        counterpart: m.sender,
        timestamp: m.received_at,
        content: m.payload,
        status: None,
    }));
    messages.extend(outgoing.into_iter().map(|m| MessageRecord {
        direction: Direction::Sent,
        counterpart: m.recipient,
        timestamp: m.last_attempt,
        content: m.payload,
        status: Some(m.status),
    }));
    messages.sort_by_key(|m| m.timestamp);
    Ok(messages)
}

/// One delivery pass over every pending outgoing record.
pub async fn flush_outgoing(ctx: &ApiContext) -> Result<DeliveryReport, ApiError> {
    let pending = ctx.storage.pending_outgoing().await.map_err(internal)?;
    let mut report = DeliveryReport::default();
    for record in pending {
        debug_assert_eq!(record.status, DeliveryStatus::Pending);
        let now = now();
        if record.recipient == ctx.loopback_service {
            let done = ctx
                .storage
                .complete_delivery(record.id, &record.owner, &record.recipient, LOOPBACK_REPLY, now)
                .await
                .map_err(internal)?;
            if done {
                report.looped_back += 1;
            }
            continue;
        }

        let registered = ctx
            .storage
            .is_registered(&record.recipient)
            .await
            .map_err(internal)?;
        if registered {
            let done = ctx
                .storage
                .complete_delivery(record.id, &record.recipient, &record.owner, &record.payload, now)
                .await
                .map_err(internal)?;
            if done {
                report.delivered += 1;
            }
        } else {
            ctx.storage
                .bump_attempt(record.id, now)
                .await
                .map_err(internal)?;
            report.deferred += 1;
        }
    }
    if report != DeliveryReport::default() {
        debug!(?report, "relay: delivery pass");
    }
    Ok(report)
}

fn now() -> Seconds {
    Utc::now().timestamp()
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}
