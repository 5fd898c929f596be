use anyhow::{Context, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite, Transaction,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{DeliveryStatus, Seconds, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredInboxMessage {
    pub id: i64,
    pub owner: UserId,
    pub sender: UserId,
    pub payload: String,
    pub received_at: Seconds,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredOutgoing {
    pub id: i64,
    pub owner: UserId,
    pub recipient: UserId,
    pub payload: String,
    pub status: DeliveryStatus,
    pub attempts: i64,
    pub queued_at: Seconds,
    pub last_attempt: Seconds,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn register_user(&self, user_id: &UserId, now: Seconds) -> Result<bool> {
        let result =
            sqlx::query("INSERT OR IGNORE INTO users (user_id, registered_at) VALUES (?, ?)")
                .bind(user_id.as_str())
                .bind(now)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn is_registered(&self, user_id: &UserId) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE user_id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    pub async fn enqueue_outgoing(
        &self,
        owner: &UserId,
        recipient: &UserId,
        payload: &str,
        now: Seconds,
    ) -> Result<i64> {
        let rec = sqlx::query(
            "INSERT INTO outgoing_queue (owner, recipient, payload, status, attempts, queued_at, last_attempt)
             VALUES (?, ?, ?, 'pending', 0, ?, ?) RETURNING id",
        )
        .bind(owner.as_str())
        .bind(recipient.as_str())
        .bind(payload)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(rec.try_get::<i64, _>(0)?)
    }

    pub async fn pending_outgoing(&self) -> Result<Vec<StoredOutgoing>> {
        let rows = sqlx::query(
            "SELECT id, owner, recipient, payload, status, attempts, queued_at, last_attempt
             FROM outgoing_queue WHERE status = 'pending' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(outgoing_from_row).collect()
    }

    pub async fn list_outgoing(&self, owner: &UserId) -> Result<Vec<StoredOutgoing>> {
        let rows = sqlx::query(
            "SELECT id, owner, recipient, payload, status, attempts, queued_at, last_attempt
             FROM outgoing_queue WHERE owner = ? ORDER BY id",
        )
        .bind(owner.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(outgoing_from_row).collect()
    }

    pub async fn list_inbox(&self, owner: &UserId) -> Result<Vec<StoredInboxMessage>> {
        let rows = sqlx::query(
            "SELECT id, owner, sender, payload, received_at FROM inbox WHERE owner = ? ORDER BY id",
        )
        .bind(owner.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(inbox_from_row).collect()
    }

    pub async fn insert_inbox(
        &self,
        owner: &UserId,
        sender: &UserId,
        payload: &str,
        received_at: Seconds,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let received_at = next_inbox_stamp(&mut tx, owner, sender, received_at).await?;
        let rec = sqlx::query(
            "INSERT INTO inbox (owner, sender, payload, received_at) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(owner.as_str())
        .bind(sender.as_str())
        .bind(payload)
        .bind(received_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(rec.try_get::<i64, _>(0)?)
    }

    /// Marks an outgoing record sent and writes `inbox_payload` into
    /// `inbox_owner`'s inbox in one transaction. Returns `false` without
    /// writing anything if the record was no longer pending.
    ///
    /// Inbox stamps per (owner, sender) strictly increase, so records
    /// delivered in the same pass never share a `(counterpart, timestamp)`.
    pub async fn complete_delivery(
        &self,
        outgoing_id: i64,
        inbox_owner: &UserId,
        inbox_sender: &UserId,
        inbox_payload: &str,
        now: Seconds,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE outgoing_queue
             SET status = 'sent', attempts = attempts + 1, last_attempt = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now)
        .bind(outgoing_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        let received_at = next_inbox_stamp(&mut tx, inbox_owner, inbox_sender, now).await?;
        sqlx::query("INSERT INTO inbox (owner, sender, payload, received_at) VALUES (?, ?, ?, ?)")
            .bind(inbox_owner.as_str())
            .bind(inbox_sender.as_str())
            .bind(inbox_payload)
            .bind(received_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn bump_attempt(&self, outgoing_id: i64, now: Seconds) -> Result<()> {
        sqlx::query(
            "UPDATE outgoing_queue SET attempts = attempts + 1, last_attempt = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now)
        .bind(outgoing_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

async fn next_inbox_stamp(
    tx: &mut Transaction<'_, Sqlite>,
    owner: &UserId,
    sender: &UserId,
    now: Seconds,
) -> Result<Seconds> {
    let latest: Option<i64> =
        sqlx::query_scalar("SELECT MAX(received_at) FROM inbox WHERE owner = ? AND sender = ?")
            .bind(owner.as_str())
            .bind(sender.as_str())
            .fetch_one(&mut **tx)
            .await?;
    Ok(match latest {
        Some(latest) if latest >= now => latest + 1,
        _ => now,
    })
}

fn inbox_from_row(r: &SqliteRow) -> Result<StoredInboxMessage> {
    Ok(StoredInboxMessage {
        id: r.try_get("id")?,
        owner: UserId(r.try_get("owner")?),
        sender: UserId(r.try_get("sender")?),
        payload: r.try_get("payload")?,
        received_at: r.try_get("received_at")?,
    })
}

fn outgoing_from_row(r: &SqliteRow) -> Result<StoredOutgoing> {
    let raw_status: String = r.try_get("status")?;
    let status = DeliveryStatus::parse(&raw_status)
        .with_context(|| format!("unknown delivery status '{raw_status}'"))?;
    Ok(StoredOutgoing {
        id: r.try_get("id")?,
        owner: UserId(r.try_get("owner")?),
        recipient: UserId(r.try_get("recipient")?),
        payload: r.try_get("payload")?,
        status,
        attempts: r.try_get("attempts")?,
        queued_at: r.try_get("queued_at")?,
        last_attempt: r.try_get("last_attempt")?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
