//! Language capability: the narrow extract / classify / compose seam.
//!
//! The router only ever talks to [`LanguageCapability`]. [`ProviderCapability`]
//! implements it on top of any [`LlmProvider`], so the model vendor can be
//! swapped (or mocked) without touching routing logic.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::AgentIdentity;
use crate::error::LlmError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::{Direction, Entities, Intent};

/// Max tokens for the follow-up label (one word).
const CLASSIFY_MAX_TOKENS: u32 = 16;

/// Max tokens for the extraction JSON.
const EXTRACT_MAX_TOKENS: u32 = 200;

/// Max tokens for a composed reply.
const COMPOSE_MAX_TOKENS: u32 = 400;

const COMPOSE_TEMPERATURE: f32 = 0.7;

/// Sign-off placeholders models like to leave in drafts.
const NAME_PLACEHOLDERS: &[&str] = &["[Your Name]", "[YourName]", "[your name]", "[Agent Name]"];

/// One turn of a conversation transcript, oldest first.
#[derive(Debug, Clone)]
pub struct Turn {
    pub direction: Direction,
    pub sender: String,
    pub text: String,
}

/// Input for entity extraction. Built deterministically from the message.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub text: String,
    /// Roster names, so the model can answer with a full name.
    pub roster_names: Vec<String>,
}

/// Input for reply composition.
#[derive(Debug, Clone)]
pub struct ComposeRequest<'a> {
    pub intent: Intent,
    /// Full ordered transcript, including the message being answered.
    pub history: &'a [Turn],
    pub entities: &'a Entities,
}

/// The three language operations the router needs.
///
/// Implementations may fail or return garbage; callers validate and degrade.
#[async_trait]
pub trait LanguageCapability: Send + Sync {
    /// Return a raw follow-up label. The caller maps it onto the taxonomy.
    async fn classify_follow_up(&self, text: &str) -> Result<String, LlmError>;

    /// Return the raw extraction object. The caller validates its shape.
    async fn extract_entities(
        &self,
        request: &ExtractionRequest,
    ) -> Result<serde_json::Value, LlmError>;

    /// Compose a reply from the full conversation.
    async fn compose_reply(&self, request: &ComposeRequest<'_>) -> Result<String, LlmError>;
}

/// [`LanguageCapability`] backed by an LLM provider.
pub struct ProviderCapability {
    llm: Arc<dyn LlmProvider>,
    identity: AgentIdentity,
}

impl ProviderCapability {
    pub fn new(llm: Arc<dyn LlmProvider>, identity: AgentIdentity) -> Self {
        Self { llm, identity }
    }

    async fn run(&self, request: CompletionRequest) -> Result<String, LlmError> {
        let response = self.llm.complete(request).await?;
        let content = response.content.trim().to_string();
        if content.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason: "empty completion".to_string(),
            });
        }
        Ok(content)
    }
}

#[async_trait]
impl LanguageCapability for ProviderCapability {
    async fn classify_follow_up(&self, text: &str) -> Result<String, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_classify_system_prompt()),
            ChatMessage::user(truncate(text, 2000)),
        ])
        .with_temperature(0.0)
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let label = self.run(request).await?;
        debug!(label = %label, "Follow-up classifier output");
        Ok(label)
    }

    async fn extract_entities(
        &self,
        request: &ExtractionRequest,
    ) -> Result<serde_json::Value, LlmError> {
        let completion = CompletionRequest::new(vec![
            ChatMessage::system(
                "You extract booking details for a band booking agent. \
                 Always return a single valid JSON object. Do not explain.",
            ),
            ChatMessage::user(build_extraction_prompt(request)),
        ])
        .with_temperature(0.0)
        .with_max_tokens(EXTRACT_MAX_TOKENS);

        let raw = self.run(completion).await?;
        let json = extract_json_object(&raw);
        let value: serde_json::Value = serde_json::from_str(&json)?;
        Ok(value)
    }

    async fn compose_reply(&self, request: &ComposeRequest<'_>) -> Result<String, LlmError> {
        let mut messages = vec![
            ChatMessage::system(build_persona_prompt(&self.identity)),
            ChatMessage::system(build_task_prompt(request, &self.identity)),
        ];
        for turn in request.history {
            messages.push(match turn.direction {
                Direction::Inbound => ChatMessage::user(turn.text.clone()),
                Direction::Outbound => ChatMessage::assistant(turn.text.clone()),
            });
        }

        let completion = CompletionRequest::new(messages)
            .with_temperature(COMPOSE_TEMPERATURE)
            .with_max_tokens(COMPOSE_MAX_TOKENS);

        let text = self.run(completion).await?;
        Ok(fill_name_placeholders(&text, &self.identity.agent_name))
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_classify_system_prompt() -> String {
    let labels = Intent::FOLLOW_UP_LABELS
        .iter()
        .map(|i| i.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "You classify follow-up messages from venues talking to a band's booking agent.\n\n\
         Reply with exactly one label from: {labels}.\n\n\
         - NEGOTIATION: discussing or changing dates, times, payment or other terms\n\
         - PROPOSAL: the venue proposes specific dates, payment or terms\n\
         - FOLLOW_UP: checking in on an earlier conversation, asking for next steps\n\
         - OTHER: anything else\n\n\
         Respond with ONLY the label, nothing else."
    )
}

fn build_extraction_prompt(request: &ExtractionRequest) -> String {
    let mut prompt = String::with_capacity(512);
    if !request.roster_names.is_empty() {
        prompt.push_str(&format!(
            "Band members: {}\n\n",
            request.roster_names.join(", ")
        ));
    }
    prompt.push_str("Message:\n");
    prompt.push_str(&truncate(&request.text, 2000));
    prompt.push_str(
        "\n\nReturn a JSON object with exactly these keys:\n\
         {\"person\": {\"value\": <band member name or null>, \"confidence\": <0.0-1.0>},\n \
         \"date\": {\"value\": <date or null>, \"confidence\": <0.0-1.0>}}\n\n\
         Use the band member's full name when the message refers to one. \
         Use YYYY-MM-DD when the year is stated, otherwise copy the date as written. \
         Use null for anything not mentioned.",
    );
    prompt
}

fn build_persona_prompt(identity: &AgentIdentity) -> String {
    format!(
        "You are {agent}, the booking agent for the band \"{band}\".\n\n\
         You coordinate live performance bookings, collect availability from band \
         members and talk to venues about booking opportunities.\n\n\
         Constraints:\n\
         - You cannot confirm bookings without human approval\n\
         - You cannot sign contracts or make final commitments\n\
         - Escalate anything ambiguous to a human\n\n\
         Be professional, friendly and concise. Sign replies as {agent}.",
        agent = identity.agent_name,
        band = identity.band_name,
    )
}

fn build_task_prompt(request: &ComposeRequest<'_>, identity: &AgentIdentity) -> String {
    let date = request
        .entities
        .date_value()
        .map(crate::pipeline::dates::display_date)
        .unwrap_or_else(|| "(not specified)".to_string());

    match request.intent {
        Intent::VenueInquiry => format!(
            "A venue is contacting {band} for the first time.\n\
             Requested date: {date}\n\n\
             Thank them for their interest, acknowledge the requested date if one was given, \
             say you will check the band's availability and follow up, and ask for any missing \
             details (event type, expected attendance, payment offer, PA availability, load-in time). \
             Do not confirm the booking. Keep it to 3-5 sentences.",
            band = identity.band_name,
        ),
        Intent::Negotiation => format!(
            "The venue is negotiating terms. Date under discussion: {date}\n\n\
             Respond professionally and stay consistent with everything said earlier in the \
             conversation. If the terms look acceptable, say you will present them to the band \
             for approval. Never accept a booking outright."
        ),
        Intent::Proposal => format!(
            "The venue has made a proposal. Date: {date}\n\n\
             Restate the proposed terms so both sides agree on them, then explain that the band \
             must approve before anything is confirmed."
        ),
        Intent::FollowUp => "The venue is following up on this conversation.\n\n\
             Summarize where things stand and give a clear next step."
            .to_string(),
        Intent::BandAvailabilityRequest | Intent::Other => "Reply helpfully to the latest message, \
             using the conversation so far for context. If you are unsure what is being asked, \
             ask a short clarifying question."
            .to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Replace sign-off placeholders with the agent's display name.
pub fn fill_name_placeholders(text: &str, agent_name: &str) -> String {
    NAME_PLACEHOLDERS
        .iter()
        .fold(text.to_string(), |acc, placeholder| {
            acc.replace(placeholder, agent_name)
        })
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
