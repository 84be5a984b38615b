//! Shared types for the conversation routing pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::identity::{BandMember, normalize_address};

// ── Inbound message ─────────────────────────────────────────────────

/// Which surface a conversation lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Chat,
    Email,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Email => "email",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(Self::Chat),
            "email" => Some(Self::Email),
            _ => None,
        }
    }
}

/// A message as handed to the router by a channel (chat endpoint or webhook).
///
/// Webhook events arrive here only after signature verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Provider-assigned identifier, the dedup key for retried deliveries.
    pub provider_message_id: String,
    /// Stable conversation key (see [`conversation_key_for_email`] / [`conversation_key_for_chat`]).
    pub conversation_id: String,
    pub origin: Origin,
    /// Email address or chat-session identity of the sender.
    pub sender: String,
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    pub body: String,
    /// In-Reply-To root or normalized subject for email threads.
    pub thread_reference: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Build a message from a parsed inbound email.
    pub fn email(
        provider_message_id: impl Into<String>,
        sender: &str,
        subject: Option<String>,
        body: impl Into<String>,
        thread_reference: Option<String>,
    ) -> Self {
        Self {
            provider_message_id: provider_message_id.into(),
            conversation_id: conversation_key_for_email(sender),
            origin: Origin::Email,
            sender: sender.trim().to_string(),
            sender_name: None,
            subject,
            body: body.into(),
            thread_reference,
            received_at: Utc::now(),
        }
    }

    /// Build a message from a chat turn. `session` defaults to the sender identity.
    pub fn chat(
        provider_message_id: impl Into<String>,
        sender: &str,
        session: Option<&str>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            provider_message_id: provider_message_id.into(),
            conversation_id: conversation_key_for_chat(session.unwrap_or(sender)),
            origin: Origin::Chat,
            sender: sender.trim().to_string(),
            sender_name: None,
            subject: None,
            body: body.into(),
            thread_reference: None,
            received_at: Utc::now(),
        }
    }
}

/// Email conversations are keyed by correspondent, so a new subject from a
/// known venue stays a follow-up.
pub fn conversation_key_for_email(sender: &str) -> String {
    format!("email:{}", normalize_address(sender))
}

/// Chat conversations are keyed by session. Keys already carrying the
/// `chat:` prefix are returned unchanged.
pub fn conversation_key_for_chat(session: &str) -> String {
    let session = session.trim();
    if session.starts_with("chat:") {
        session.to_string()
    } else {
        format!("chat:{}", session.to_lowercase())
    }
}

// ── Conversation state ──────────────────────────────────────────────

/// Direction of a stored message relative to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

/// Position of a message within its conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    First,
    FollowUp,
}

impl Stage {
    /// Stage is a pure function of how many inbound messages the
    /// correspondent has already sent in this conversation.
    pub fn from_prior_inbound(count: usize) -> Self {
        if count == 0 { Self::First } else { Self::FollowUp }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::First => "FIRST",
            Self::FollowUp => "FOLLOW_UP",
        }
    }
}

/// Conversation lifecycle. `Active` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationState {
    AwaitingFirstMessage,
    Active,
}

impl ConversationState {
    /// Derived from history: any inbound message makes the conversation active.
    pub fn from_inbound_count(count: usize) -> Self {
        if count == 0 {
            Self::AwaitingFirstMessage
        } else {
            Self::Active
        }
    }
}

/// Who the sender is, relative to the band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CounterpartyKind {
    BandMember { member_id: String },
    External,
}

impl CounterpartyKind {
    pub fn is_band_member(&self) -> bool {
        matches!(self, Self::BandMember { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::BandMember { .. } => "BAND_MEMBER",
            Self::External => "EXTERNAL",
        }
    }
}

// ── Intent ──────────────────────────────────────────────────────────

/// Closed intent taxonomy. Every processed inbound message carries exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    VenueInquiry,
    Negotiation,
    Proposal,
    FollowUp,
    BandAvailabilityRequest,
    Other,
}

impl Intent {
    /// Labels the follow-up classifier is allowed to return.
    pub const FOLLOW_UP_LABELS: [Intent; 4] =
        [Self::Negotiation, Self::Proposal, Self::FollowUp, Self::Other];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VenueInquiry => "VENUE_INQUIRY",
            Self::Negotiation => "NEGOTIATION",
            Self::Proposal => "PROPOSAL",
            Self::FollowUp => "FOLLOW_UP",
            Self::BandAvailabilityRequest => "BAND_AVAILABILITY_REQUEST",
            Self::Other => "OTHER",
        }
    }

    /// Parse a follow-up label. Anything outside the four follow-up labels
    /// is rejected, including the other taxonomy members.
    pub fn parse_follow_up(raw: &str) -> Option<Self> {
        let normalized = raw
            .trim()
            .trim_matches(|c: char| c == '"' || c == '\'' || c == '.' || c == '`')
            .trim()
            .to_uppercase()
            .replace([' ', '-'], "_");
        Self::FOLLOW_UP_LABELS
            .into_iter()
            .find(|intent| intent.as_str() == normalized)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Entities ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    Person,
    Date,
}

/// A typed value pulled out of message text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub kind: EntityKind,
    pub value: String,
    pub confidence: f32,
    /// Byte range in the source text, when the value appears verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<(usize, usize)>,
}

/// Result of one extraction call. Missing fields mean "not found".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person: Option<ExtractedEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<ExtractedEntity>,
}

impl Entities {
    pub fn person_value(&self) -> Option<&str> {
        self.person.as_ref().map(|e| e.value.as_str())
    }

    pub fn date_value(&self) -> Option<&str> {
        self.date.as_ref().map(|e| e.value.as_str())
    }
}

// ── Action plan ─────────────────────────────────────────────────────

/// What to do about one inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionPlan {
    /// Email a band member asking about a date.
    SendAvailabilityEmail { member: BandMember, date: String },
    /// Reply to the correspondent on the conversation's origin channel.
    SendReply { text: String },
    /// No third-party email. A clarification, when present, is still sent
    /// back to the user.
    NoAction {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        clarification: Option<String>,
    },
}

impl ActionPlan {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::SendAvailabilityEmail { .. } => "send_availability_email",
            Self::SendReply { .. } => "send_reply",
            Self::NoAction { .. } => "no_action",
        }
    }
}

/// Everything the router decided about one inbound message. Attached to
/// the stored message exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: Intent,
    pub stage: Stage,
    pub counterparty: CounterpartyKind,
    pub entities: Entities,
    pub plan: ActionPlan,
}

// ── Dispatch bookkeeping ────────────────────────────────────────────

/// Delivery state of an inbound message's action plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// Not applicable (outbound rows).
    None,
    Pending,
    InFlight,
    Dispatched,
    Failed,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Dispatched => "dispatched",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "in_flight" => Self::InFlight,
            "dispatched" => Self::Dispatched,
            "failed" => Self::Failed,
            _ => Self::None,
        }
    }
}

/// A message as persisted in a conversation's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    /// Position in the conversation, starting at 1.
    pub seq: i64,
    pub direction: Direction,
    pub sender: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    pub dispatch_status: DispatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
    /// Reply text shown to the chat user once dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_response: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A message to be appended to history.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub direction: Direction,
    pub sender: String,
    pub body: String,
    pub subject: Option<String>,
    pub provider_message_id: Option<String>,
    pub classification: Option<Classification>,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    /// An inbound message with its classification attached.
    pub fn inbound(message: &InboundMessage, classification: Classification) -> Self {
        Self {
            direction: Direction::Inbound,
            sender: message.sender.clone(),
            body: message.body.clone(),
            subject: message.subject.clone(),
            provider_message_id: Some(message.provider_message_id.clone()),
            classification: Some(classification),
            created_at: message.received_at,
        }
    }

    /// A message sent by the agent.
    pub fn outbound(sender: &str, body: impl Into<String>, subject: Option<String>) -> Self {
        Self {
            direction: Direction::Outbound,
            sender: sender.to_string(),
            body: body.into(),
            subject,
            provider_message_id: None,
            classification: None,
            created_at: Utc::now(),
        }
    }
}

/// Count inbound messages from `sender` in `history`.
pub fn prior_inbound_from(history: &[StoredMessage], sender: &str) -> usize {
    let sender = normalize_address(sender);
    history
        .iter()
        .filter(|m| m.direction == Direction::Inbound && normalize_address(&m.sender) == sender)
        .count()
}
