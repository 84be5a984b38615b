//! `ConversationStore` trait: the single async interface for persistence.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DatabaseError;
use crate::pipeline::identity::BandMember;
use crate::pipeline::types::{NewMessage, Origin, StoredMessage};

/// A conversation row plus light aggregates.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationRecord {
    pub id: String,
    pub origin: Origin,
    /// Normalized address or session identity of the other party.
    pub correspondent: String,
    pub message_count: i64,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Backend-agnostic persistence for conversations, messages and the roster.
///
/// Appends are durable once the call returns.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create the conversation if missing; touch `last_activity` otherwise.
    async fn ensure_conversation(
        &self,
        conversation_id: &str,
        origin: Origin,
        correspondent: &str,
    ) -> Result<ConversationRecord, DatabaseError>;

    async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationRecord>, DatabaseError>;

    /// Most recently active first.
    async fn list_conversations(&self, limit: usize)
    -> Result<Vec<ConversationRecord>, DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Append a message and return it with its assigned sequence position.
    ///
    /// A duplicate `provider_message_id` is a `DatabaseError::Constraint`.
    async fn append_message(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> Result<StoredMessage, DatabaseError>;

    /// All messages of a conversation in insertion order.
    async fn load_history(&self, conversation_id: &str) -> Result<Vec<StoredMessage>, DatabaseError>;

    async fn find_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError>;

    // ── Dispatch bookkeeping ────────────────────────────────────────

    /// Atomically move a message from `pending`/`failed` to `in_flight`.
    ///
    /// An `in_flight` claim older than `stale_after` is taken over; its
    /// owner is presumed dead. Returns false when someone else holds a
    /// live claim or the dispatch already finished.
    async fn claim_dispatch(
        &self,
        message_id: &str,
        stale_after: Duration,
    ) -> Result<bool, DatabaseError>;

    /// Mark a claimed dispatch as delivered.
    async fn complete_dispatch(
        &self,
        message_id: &str,
        delivery_id: Option<&str>,
        response: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Mark a claimed dispatch as failed so a retry can claim it again.
    async fn fail_dispatch(&self, message_id: &str, reason: &str) -> Result<(), DatabaseError>;

    // ── Roster ──────────────────────────────────────────────────────

    async fn list_band_members(&self) -> Result<Vec<BandMember>, DatabaseError>;

    /// Insert or update a member, keyed by normalized address.
    async fn upsert_band_member(&self, member: &BandMember) -> Result<(), DatabaseError>;
}
