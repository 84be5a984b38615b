//! libSQL backend: async `ConversationStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::identity::{BandMember, normalize_address};
use crate::pipeline::types::{
    Classification, Direction, DispatchStatus, NewMessage, Origin, StoredMessage,
};
use crate::store::migrations;
use crate::store::traits::{ConversationRecord, ConversationStore};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn get_message(&self, id: &str) -> Result<StoredMessage, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                row_to_message(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))
            }
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "message".into(),
                id: id.into(),
            }),
            Err(e) => Err(DatabaseError::Query(format!("get_message: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Fixed-width UTC timestamp so claim times compare as text.
fn claim_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Map an insert error, separating unique-key violations.
fn insert_error(context: &str, e: libsql::Error) -> DatabaseError {
    let message = e.to_string();
    if message.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(format!("{context}: {message}"))
    } else {
        DatabaseError::Query(format!("{context}: {message}"))
    }
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, seq, direction, sender, subject, body, provider_message_id, classification, dispatch_status, delivery_id, dispatch_response, created_at";

const CONVERSATION_COLUMNS: &str = "c.id, c.origin, c.correspondent, c.started_at, c.last_activity, \
     (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id)";

fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, libsql::Error> {
    let id: String = row.get(0)?;
    let direction_str: String = row.get(3)?;
    let classification_str: Option<String> = row.get(8).ok();
    let status_str: String = row.get(9)?;
    let created_str: String = row.get(12)?;

    let classification = classification_str.and_then(|raw| {
        serde_json::from_str::<Classification>(&raw)
            .map_err(|e| warn!(id = %id, error = %e, "Unreadable classification column"))
            .ok()
    });

    Ok(StoredMessage {
        conversation_id: row.get(1)?,
        seq: row.get(2)?,
        direction: Direction::parse(&direction_str).unwrap_or(Direction::Inbound),
        sender: row.get(4)?,
        subject: row.get(5).ok(),
        body: row.get(6)?,
        provider_message_id: row.get(7).ok(),
        classification,
        dispatch_status: DispatchStatus::parse(&status_str),
        delivery_id: row.get(10).ok(),
        dispatch_response: row.get(11).ok(),
        created_at: parse_datetime(&created_str),
        id,
    })
}

fn row_to_conversation(row: &libsql::Row) -> Result<ConversationRecord, libsql::Error> {
    let origin_str: String = row.get(1)?;
    let started_str: String = row.get(3)?;
    let last_str: String = row.get(4)?;
    Ok(ConversationRecord {
        id: row.get(0)?,
        origin: Origin::parse(&origin_str).unwrap_or(Origin::Email),
        correspondent: row.get(2)?,
        started_at: parse_datetime(&started_str),
        last_activity: parse_datetime(&last_str),
        message_count: row.get::<i64>(5).unwrap_or(0),
    })
}

fn row_to_member(row: &libsql::Row) -> Result<BandMember, libsql::Error> {
    Ok(BandMember {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl ConversationStore for LibSqlBackend {
    // ── Conversations ───────────────────────────────────────────────

    async fn ensure_conversation(
        &self,
        conversation_id: &str,
        origin: Origin,
        correspondent: &str,
    ) -> Result<ConversationRecord, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO conversations (id, origin, correspondent, started_at, last_activity)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT (id) DO UPDATE SET last_activity = excluded.last_activity",
                params![
                    conversation_id,
                    origin.as_str(),
                    normalize_address(correspondent),
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ensure_conversation: {e}")))?;

        self.get_conversation(conversation_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "conversation".into(),
                id: conversation_id.into(),
            })
    }

    async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1"),
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_conversation(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_conversation: {e}"))),
        }
    }

    async fn list_conversations(
        &self,
        limit: usize,
    ) -> Result<Vec<ConversationRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations c
                     ORDER BY c.last_activity DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_conversations: {e}")))?;

        let mut conversations = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_conversation(&row) {
                Ok(c) => conversations.push(c),
                Err(e) => warn!("Skipping conversation row: {e}"),
            }
        }
        Ok(conversations)
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn append_message(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> Result<StoredMessage, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let classification = message
            .classification
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(format!("classification: {e}")))?;
        let dispatch_status = match message.direction {
            Direction::Inbound => DispatchStatus::Pending,
            Direction::Outbound => DispatchStatus::None,
        };

        // Sequence assignment and insert happen in one statement.
        self.conn()
            .execute(
                "INSERT INTO messages (id, conversation_id, seq, direction, sender, subject, body,
                    provider_message_id, classification, dispatch_status, created_at)
                 SELECT ?1, ?2, COALESCE(MAX(seq), 0) + 1, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10
                 FROM messages WHERE conversation_id = ?2",
                params![
                    id.clone(),
                    conversation_id,
                    message.direction.as_str(),
                    message.sender,
                    opt_text_owned(message.subject),
                    message.body,
                    opt_text_owned(message.provider_message_id),
                    opt_text_owned(classification),
                    dispatch_status.as_str(),
                    message.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| insert_error("append_message", e))?;

        if let Err(e) = self
            .conn()
            .execute(
                "UPDATE conversations SET last_activity = ?2 WHERE id = ?1",
                params![conversation_id, Utc::now().to_rfc3339()],
            )
            .await
        {
            warn!(conversation_id, error = %e, "Failed to bump conversation activity");
        }

        let stored = self.get_message(&id).await?;
        debug!(
            id = %stored.id,
            conversation_id,
            seq = stored.seq,
            direction = stored.direction.as_str(),
            "Message appended"
        );
        Ok(stored)
    }

    async fn load_history(&self, conversation_id: &str) -> Result<Vec<StoredMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC"
                ),
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_history: {e}")))?;

        let mut messages = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => messages.push(
                    row_to_message(&row)
                        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
                ),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("load_history: {e}"))),
            }
        }
        Ok(messages)
    }

    async fn find_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE provider_message_id = ?1"),
                params![provider_message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_by_provider_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_message(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_by_provider_id: {e}"))),
        }
    }

    // ── Dispatch bookkeeping ────────────────────────────────────────

    async fn claim_dispatch(
        &self,
        message_id: &str,
        stale_after: Duration,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now();
        let stale_after = chrono::Duration::from_std(stale_after)
            .map_err(|e| DatabaseError::Query(format!("claim_dispatch: bad stale bound: {e}")))?;
        let affected = self
            .conn()
            .execute(
                "UPDATE messages SET dispatch_status = 'in_flight', claimed_at = ?2
                 WHERE id = ?1 AND (
                    dispatch_status IN ('pending', 'failed')
                    OR (dispatch_status = 'in_flight' AND (claimed_at IS NULL OR claimed_at <= ?3))
                 )",
                params![message_id, claim_time(now), claim_time(now - stale_after)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_dispatch: {e}")))?;
        Ok(affected == 1)
    }

    async fn complete_dispatch(
        &self,
        message_id: &str,
        delivery_id: Option<&str>,
        response: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE messages SET dispatch_status = 'dispatched', delivery_id = ?2,
                    dispatch_response = ?3, dispatch_error = NULL, dispatched_at = ?4
                 WHERE id = ?1",
                params![
                    message_id,
                    opt_text(delivery_id),
                    opt_text(response),
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_dispatch: {e}")))?;
        debug!(id = message_id, delivery_id = delivery_id.unwrap_or("-"), "Dispatch completed");
        Ok(())
    }

    async fn fail_dispatch(&self, message_id: &str, reason: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE messages SET dispatch_status = 'failed', dispatch_error = ?2 WHERE id = ?1",
                params![message_id, reason],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_dispatch: {e}")))?;
        Ok(())
    }

    // ── Roster ──────────────────────────────────────────────────────

    async fn list_band_members(&self) -> Result<Vec<BandMember>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT id, name, email FROM band_members ORDER BY name ASC", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_band_members: {e}")))?;

        let mut members = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => members.push(
                    row_to_member(&row)
                        .map_err(|e| DatabaseError::Query(format!("band member row parse: {e}")))?,
                ),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_band_members: {e}"))),
            }
        }
        Ok(members)
    }

    async fn upsert_band_member(&self, member: &BandMember) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO band_members (id, name, email, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (id) DO UPDATE SET name = excluded.name, email = excluded.email,
                    updated_at = excluded.updated_at",
                params![
                    normalize_address(&member.email),
                    member.name.clone(),
                    member.email.clone(),
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_band_member: {e}")))?;
        Ok(())
    }
}
