//! Action dispatcher: turns an action plan into outbound side effects.
//!
//! Fire-and-confirm. Transport errors are reported, never retried here.

use std::sync::Arc;

use tracing::{error, info};

use crate::channels::email::EmailTransport;
use crate::channels::email_types::normalize_subject;
use crate::config::AgentIdentity;
use crate::error::DispatchError;
use crate::pipeline::dates::display_date;
use crate::pipeline::identity::BandMember;
use crate::pipeline::types::{ActionPlan, Origin};

/// Where replies for a conversation go.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub conversation_id: String,
    pub origin: Origin,
    /// Address of the correspondent (email origin) or chat identity.
    pub reply_to: String,
    /// Subject of the message being answered, for `Re:` threading.
    pub subject: Option<String>,
}

/// One email handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub delivery_id: String,
}

/// What a dispatch did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchResult {
    /// Text shown to the person who sent the message.
    pub response: Option<String>,
    pub deliveries: Vec<Delivery>,
}

pub struct ActionDispatcher {
    transport: Arc<dyn EmailTransport>,
    identity: AgentIdentity,
}

impl ActionDispatcher {
    pub fn new(transport: Arc<dyn EmailTransport>, identity: AgentIdentity) -> Self {
        Self {
            transport,
            identity,
        }
    }

    pub async fn dispatch(
        &self,
        plan: &ActionPlan,
        context: &DispatchContext,
    ) -> Result<DispatchResult, DispatchError> {
        let result = match plan {
            ActionPlan::SendAvailabilityEmail { member, date } => {
                self.send_availability_email(member, date).await
            }
            ActionPlan::SendReply { text } => self.reply(text, context).await,
            ActionPlan::NoAction {
                clarification: Some(text),
            } => self.reply(text, context).await,
            ActionPlan::NoAction {
                clarification: None,
            } => Ok(DispatchResult::default()),
        };

        match &result {
            Ok(done) => info!(
                conversation_id = %context.conversation_id,
                plan = plan.label(),
                deliveries = done.deliveries.len(),
                "Action dispatched"
            ),
            Err(e) => error!(
                conversation_id = %context.conversation_id,
                plan = plan.label(),
                error = %e,
                "Dispatch failed"
            ),
        }
        result
    }

    async fn send_availability_email(
        &self,
        member: &BandMember,
        date: &str,
    ) -> Result<DispatchResult, DispatchError> {
        if !member.email.contains('@') {
            return Err(DispatchError::UnknownMember(member.name.clone()));
        }
        let shown = display_date(date);
        let subject = format!("Availability check: {shown}");
        let body = format!(
            "Hi {},\n\nAre you available to play a show with {} on {shown}? \
             Just reply to this email with yes or no.\n\nThanks,\n{}",
            member.first_name(),
            self.identity.band_name,
            self.identity.agent_name,
        );

        let delivery = self.send(&member.email, &subject, &body).await?;
        Ok(DispatchResult {
            response: Some(format!(
                "I've emailed {} to ask about their availability on {shown}.",
                member.name
            )),
            deliveries: vec![delivery],
        })
    }

    /// Reply on the conversation's own channel.
    async fn reply(&self, text: &str, context: &DispatchContext) -> Result<DispatchResult, DispatchError> {
        match context.origin {
            Origin::Chat => Ok(DispatchResult {
                response: Some(text.to_string()),
                deliveries: Vec::new(),
            }),
            Origin::Email => {
                if !context.reply_to.contains('@') {
                    return Err(DispatchError::MissingReplyAddress(
                        context.conversation_id.clone(),
                    ));
                }
                let subject = reply_subject(context.subject.as_deref(), &self.identity);
                let delivery = self.send(&context.reply_to, &subject, text).await?;
                Ok(DispatchResult {
                    response: Some(text.to_string()),
                    deliveries: vec![delivery],
                })
            }
        }
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<Delivery, DispatchError> {
        let delivery_id = self
            .transport
            .send(to, &self.identity.agent_name, subject, body)
            .await?;
        info!(to, delivery_id = %delivery_id, subject, "Email handed to transport");
        Ok(Delivery {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            delivery_id,
        })
    }
}

fn reply_subject(subject: Option<&str>, identity: &AgentIdentity) -> String {
    match subject.map(normalize_subject).filter(|s| !s.is_empty()) {
        Some(subject) => format!("Re: {subject}"),
        None => format!("Booking {}", identity.band_name),
    }
}
