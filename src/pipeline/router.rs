//! Conversation router: the per-message state machine.
//!
//! For each inbound message, under the conversation lock:
//! 1. dedup on the provider message id
//! 2. derive stage from history and counterparty from the roster
//! 3. extract entities, classify intent
//! 4. build the action plan (composing reply text where needed)
//! 5. append the message with its classification attached
//!
//! Collaborator failures degrade; only storage and lock errors propagate.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{AgentIdentity, RoutingConfig};
use crate::error::{DatabaseError, RoutingError};
use crate::pipeline::capability::{ComposeRequest, LanguageCapability, Turn};
use crate::pipeline::classifier::IntentClassifier;
use crate::pipeline::dates::display_date;
use crate::pipeline::extractor::EntityExtractor;
use crate::pipeline::identity::{Roster, normalize_address};
use crate::pipeline::locks::{ConversationGuard, ConversationLocks};
use crate::pipeline::types::{
    ActionPlan, Classification, ConversationState, Direction, Entities, InboundMessage, Intent,
    NewMessage, Stage, StoredMessage, prior_inbound_from,
};
use crate::store::ConversationStore;

/// Router output for one inbound message.
#[derive(Debug, Clone)]
pub struct RoutedMessage {
    /// The stored inbound message, classification attached.
    pub message: StoredMessage,
    pub classification: Classification,
    /// Conversation state observed before this message was appended.
    pub state_before: ConversationState,
    /// True when the provider id was already recorded (a retried delivery).
    pub duplicate: bool,
}

pub struct ConversationRouter {
    store: Arc<dyn ConversationStore>,
    capability: Arc<dyn LanguageCapability>,
    roster: Roster,
    extractor: EntityExtractor,
    classifier: IntentClassifier,
    locks: ConversationLocks,
    identity: AgentIdentity,
    routing: RoutingConfig,
}

impl ConversationRouter {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        capability: Arc<dyn LanguageCapability>,
        roster: Roster,
        identity: AgentIdentity,
        routing: RoutingConfig,
    ) -> Self {
        Self {
            extractor: EntityExtractor::new(
                Arc::clone(&capability),
                routing.collaborator_timeout,
                routing.min_entity_confidence,
            ),
            classifier: IntentClassifier::new(Arc::clone(&capability), routing.collaborator_timeout),
            store,
            capability,
            roster,
            locks: ConversationLocks::new(),
            identity,
            routing,
        }
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn routing(&self) -> &RoutingConfig {
        &self.routing
    }

    /// Classify and record one inbound message.
    pub async fn route(&self, message: &InboundMessage) -> Result<RoutedMessage, RoutingError> {
        self.route_held(message).await.map(|(routed, _guard)| routed)
    }

    /// Like [`route`](Self::route), but hands back the conversation guard so
    /// the caller can finish dispatch before the next message is read.
    pub async fn route_held(
        &self,
        message: &InboundMessage,
    ) -> Result<(RoutedMessage, ConversationGuard), RoutingError> {
        validate_inbound(message)?;

        let guard = self
            .locks
            .acquire(&message.conversation_id, self.routing.lock_timeout)
            .await?;

        if let Some(existing) = self.find_duplicate(&message.provider_message_id).await? {
            return Ok((existing, guard));
        }

        self.store
            .ensure_conversation(
                &message.conversation_id,
                message.origin,
                &normalize_address(&message.sender),
            )
            .await?;
        let history = self.store.load_history(&message.conversation_id).await?;

        let prior = prior_inbound_from(&history, &message.sender);
        let stage = Stage::from_prior_inbound(prior);
        let state_before = ConversationState::from_inbound_count(
            history
                .iter()
                .filter(|m| m.direction == Direction::Inbound)
                .count(),
        );
        let counterparty = self.roster.resolve(&message.sender);

        let entities = self.extractor.extract(&message.body, &self.roster).await;
        let intent = self
            .classifier
            .classify(&message.body, stage, &counterparty)
            .await;
        let plan = self.build_plan(intent, &entities, message, &history).await;

        let classification = Classification {
            intent,
            stage,
            counterparty,
            entities,
            plan,
        };

        let stored = match self
            .store
            .append_message(
                &message.conversation_id,
                NewMessage::inbound(message, classification.clone()),
            )
            .await
        {
            Ok(stored) => stored,
            // Same provider id recorded under another conversation key.
            Err(DatabaseError::Constraint(reason)) => {
                warn!(
                    provider_message_id = %message.provider_message_id,
                    reason = %reason,
                    "Provider id already recorded, treating as duplicate"
                );
                let existing = self
                    .find_duplicate(&message.provider_message_id)
                    .await?
                    .ok_or(RoutingError::Database(DatabaseError::Constraint(reason)))?;
                return Ok((existing, guard));
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            conversation_id = %message.conversation_id,
            seq = stored.seq,
            intent = intent.as_str(),
            stage = stage.as_str(),
            counterparty = classification.counterparty.label(),
            plan = classification.plan.label(),
            "Message routed"
        );

        Ok((
            RoutedMessage {
                message: stored,
                classification,
                state_before,
                duplicate: false,
            },
            guard,
        ))
    }

    async fn find_duplicate(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<RoutedMessage>, RoutingError> {
        let Some(existing) = self.store.find_by_provider_id(provider_message_id).await? else {
            return Ok(None);
        };
        let Some(classification) = existing.classification.clone() else {
            return Err(RoutingError::InvalidMessage(format!(
                "provider id {provider_message_id} belongs to an unclassified message"
            )));
        };
        debug!(
            provider_message_id,
            conversation_id = %existing.conversation_id,
            status = existing.dispatch_status.as_str(),
            "Duplicate delivery"
        );
        Ok(Some(RoutedMessage {
            message: existing,
            classification,
            state_before: ConversationState::Active,
            duplicate: true,
        }))
    }

    // ── Action plans ────────────────────────────────────────────────

    async fn build_plan(
        &self,
        intent: Intent,
        entities: &Entities,
        message: &InboundMessage,
        history: &[StoredMessage],
    ) -> ActionPlan {
        match intent {
            Intent::BandAvailabilityRequest => self.availability_plan(entities),
            Intent::VenueInquiry => {
                let transcript = [Turn {
                    direction: Direction::Inbound,
                    sender: message.sender.clone(),
                    text: message.body.clone(),
                }];
                let text = match self.compose(intent, &transcript, entities).await {
                    Some(text) => text,
                    None => venue_ack_template(message, entities, &self.identity),
                };
                ActionPlan::SendReply {
                    text: finalize_venue_ack(text, entities, &self.identity),
                }
            }
            _ => {
                let transcript = transcript(history, message);
                let text = match self.compose(intent, &transcript, entities).await {
                    Some(text) => text,
                    None => general_template(intent, message, &self.identity),
                };
                ActionPlan::SendReply { text }
            }
        }
    }

    /// Needs a roster member and a date; otherwise asks for what is missing.
    fn availability_plan(&self, entities: &Entities) -> ActionPlan {
        let member = entities
            .person_value()
            .and_then(|name| self.roster.find_by_name(name));

        match (member, entities.date_value()) {
            (Some(member), Some(date)) => ActionPlan::SendAvailabilityEmail {
                member: member.clone(),
                date: date.to_string(),
            },
            (member, date) => {
                let clarification =
                    availability_clarification(entities.person_value(), member.map(|m| m.first_name()), date, &self.roster);
                debug!(clarification = %clarification, "Availability request incomplete");
                ActionPlan::NoAction {
                    clarification: Some(clarification),
                }
            }
        }
    }

    async fn compose(&self, intent: Intent, history: &[Turn], entities: &Entities) -> Option<String> {
        let request = ComposeRequest {
            intent,
            history,
            entities,
        };
        match tokio::time::timeout(
            self.routing.collaborator_timeout,
            self.capability.compose_reply(&request),
        )
        .await
        {
            Ok(Ok(text)) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Ok(Ok(_)) => {
                warn!(intent = intent.as_str(), "Composer returned empty text, using template");
                None
            }
            Ok(Err(e)) => {
                warn!(intent = intent.as_str(), error = %e, "Reply composition failed, using template");
                None
            }
            Err(_) => {
                warn!(
                    intent = intent.as_str(),
                    timeout = ?self.routing.collaborator_timeout,
                    "Reply composition timed out, using template"
                );
                None
            }
        }
    }
}

fn validate_inbound(message: &InboundMessage) -> Result<(), RoutingError> {
    if message.provider_message_id.trim().is_empty() {
        return Err(RoutingError::InvalidMessage("missing provider message id".into()));
    }
    if message.sender.trim().is_empty() {
        return Err(RoutingError::InvalidMessage("missing sender".into()));
    }
    if message.body.trim().is_empty() {
        return Err(RoutingError::InvalidMessage("empty message body".into()));
    }
    Ok(())
}

/// History plus the message being answered, oldest first.
fn transcript(history: &[StoredMessage], current: &InboundMessage) -> Vec<Turn> {
    history
        .iter()
        .map(|m| Turn {
            direction: m.direction,
            sender: m.sender.clone(),
            text: m.body.clone(),
        })
        .chain(std::iter::once(Turn {
            direction: Direction::Inbound,
            sender: current.sender.clone(),
            text: current.body.clone(),
        }))
        .collect()
}

fn availability_clarification(
    person_ref: Option<&str>,
    member_first_name: Option<&str>,
    date: Option<&str>,
    roster: &Roster,
) -> String {
    let names = roster.display_names();
    let roster_hint = if names.is_empty() {
        String::new()
    } else {
        format!(" Band members: {names}.")
    };

    match (member_first_name, date) {
        (Some(first), None) => format!("What date should I ask {first} about?"),
        (None, date) => {
            let who = match person_ref {
                Some(reference) => format!("I couldn't match \"{reference}\" to anyone in the band."),
                None => "Which band member should I ask?".to_string(),
            };
            let when = match date {
                Some(date) => format!(" I'll ask them about {}.", display_date(date)),
                None => " And for what date?".to_string(),
            };
            format!("{who}{when}{roster_hint}")
        }
        // A resolved member and a date never need clarifying.
        (Some(first), Some(date)) => format!("Should I ask {first} about {}?", display_date(date)),
    }
}

/// Make sure a venue acknowledgement echoes the date and carries the
/// agent's name.
fn finalize_venue_ack(text: String, entities: &Entities, identity: &AgentIdentity) -> String {
    let mut text = text.trim().to_string();

    if let Some(date) = entities.date_value() {
        let shown = display_date(date);
        if !text.contains(&shown) && !text.contains(date) {
            let sentence = format!("\n\nWe've noted your interest in {shown}.");
            // Keep the sign-off last when the draft already has one.
            match text.rfind("\n\n") {
                Some(idx) if text[idx..].contains(&identity.agent_name) => {
                    text.insert_str(idx, &sentence)
                }
                _ => text.push_str(&sentence),
            }
        }
    }

    if !text.contains(&identity.agent_name) {
        text.push_str(&format!("\n\nBest,\n{}", identity.agent_name));
    }
    text
}

fn greeting(message: &InboundMessage) -> String {
    match message.sender_name.as_deref().and_then(|n| n.split_whitespace().next()) {
        Some(first) => format!("Hi {first},"),
        None => "Hi there,".to_string(),
    }
}

fn venue_ack_template(message: &InboundMessage, entities: &Entities, identity: &AgentIdentity) -> String {
    let date_line = entities
        .date_value()
        .map(|d| format!(" We've noted your interest in {}.", display_date(d)))
        .unwrap_or_default();
    format!(
        "{}\n\nThanks for reaching out about booking {}!{date_line} I'll check with the band and get back to you shortly.\n\nBest,\n{}",
        greeting(message),
        identity.band_name,
        identity.agent_name
    )
}

fn general_template(intent: Intent, message: &InboundMessage, identity: &AgentIdentity) -> String {
    let body = match intent {
        Intent::Negotiation => "Thanks for the details. I'll go over the terms with the band and come back to you soon.",
        Intent::Proposal => "Thanks for the proposal! I'll review it with the band and follow up shortly.",
        Intent::FollowUp => "Thanks for following up. I'm still confirming with the band and will be in touch soon.",
        _ => "Thanks for your message. I'll get back to you soon.",
    };
    format!("{}\n\n{body}\n\nBest,\n{}", greeting(message), identity.agent_name)
}
