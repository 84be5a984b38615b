//! Booking service: route, claim, dispatch, record.
//!
//! This is what the HTTP handlers call. The router commits the decision;
//! dispatch runs afterwards and a transport failure never rolls it back.
//! The conversation lock is held until outbound messages are recorded, so
//! the next message in the conversation is composed against them.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{DispatchError, Error};
use crate::pipeline::dispatcher::{ActionDispatcher, DispatchContext, DispatchResult};
use crate::pipeline::router::{ConversationRouter, RoutedMessage};
use crate::pipeline::types::{
    ActionPlan, DispatchStatus, InboundMessage, Intent, NewMessage, Origin, Stage,
};
use crate::store::ConversationStore;

/// Result of handling one inbound message end to end.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub conversation_id: String,
    pub message_id: String,
    pub intent: Intent,
    pub stage: Stage,
    pub plan: ActionPlan,
    /// Reply text for the sender, if any.
    pub response: Option<String>,
    pub delivery_ids: Vec<String>,
    /// The message had already been handled; nothing was sent this time.
    pub duplicate: bool,
}

pub struct BookingService {
    store: Arc<dyn ConversationStore>,
    router: ConversationRouter,
    dispatcher: ActionDispatcher,
}

impl BookingService {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        router: ConversationRouter,
        dispatcher: ActionDispatcher,
    ) -> Self {
        Self {
            store,
            router,
            dispatcher,
        }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn router(&self) -> &ConversationRouter {
        &self.router
    }

    /// Route and dispatch one inbound message.
    ///
    /// Retried deliveries of an already-dispatched message return the
    /// recorded response; retries of a failed or abandoned dispatch send
    /// again.
    pub async fn handle(&self, message: InboundMessage) -> Result<ProcessOutcome, Error> {
        let (routed, _guard) = self.router.route_held(&message).await?;
        let message_id = routed.message.id.clone();

        if routed.duplicate && routed.message.dispatch_status == DispatchStatus::Dispatched {
            info!(message_id = %message_id, "Already dispatched, returning recorded outcome");
            return Ok(recorded_outcome(&routed));
        }

        let claim_ttl = self.router.routing().dispatch_claim_ttl;
        if !self.store.claim_dispatch(&message_id, claim_ttl).await? {
            // Lost a race with a concurrent delivery of the same message.
            return match self.store.find_by_provider_id(&message.provider_message_id).await? {
                Some(current) if current.dispatch_status == DispatchStatus::Dispatched => {
                    Ok(recorded_outcome(&RoutedMessage {
                        message: current,
                        ..routed
                    }))
                }
                _ => Err(DispatchError::InFlight(message_id).into()),
            };
        }

        if routed.message.dispatch_status == DispatchStatus::InFlight {
            warn!(message_id = %message_id, ttl = ?claim_ttl, "Took over abandoned dispatch claim");
        }

        let context = DispatchContext {
            conversation_id: routed.message.conversation_id.clone(),
            origin: message.origin,
            reply_to: message.sender.clone(),
            subject: message.subject.clone(),
        };

        let result = match self
            .dispatcher
            .dispatch(&routed.classification.plan, &context)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                if let Err(db) = self.store.fail_dispatch(&message_id, &e.to_string()).await {
                    warn!(message_id = %message_id, error = %db, "Could not record dispatch failure");
                }
                return Err(e.into());
            }
        };

        let delivery_id = result.deliveries.first().map(|d| d.delivery_id.as_str());
        self.store
            .complete_dispatch(&message_id, delivery_id, result.response.as_deref())
            .await?;
        self.record_outbound(&context, &result).await;

        Ok(ProcessOutcome {
            conversation_id: context.conversation_id,
            message_id,
            intent: routed.classification.intent,
            stage: routed.classification.stage,
            plan: routed.classification.plan,
            response: result.response,
            delivery_ids: result
                .deliveries
                .into_iter()
                .map(|d| d.delivery_id)
                .collect(),
            duplicate: routed.duplicate,
        })
    }

    /// Append what was sent so later composition sees the whole exchange.
    async fn record_outbound(&self, context: &DispatchContext, result: &DispatchResult) {
        let from = &self.router.identity().from_address;
        let mut outbound: Vec<NewMessage> = result
            .deliveries
            .iter()
            .map(|d| NewMessage::outbound(from, d.body.clone(), Some(d.subject.clone())))
            .collect();
        if context.origin == Origin::Chat
            && let Some(text) = &result.response
        {
            outbound.push(NewMessage::outbound(from, text.clone(), None));
        }

        for message in outbound {
            if let Err(e) = self
                .store
                .append_message(&context.conversation_id, message)
                .await
            {
                warn!(
                    conversation_id = %context.conversation_id,
                    error = %e,
                    "Failed to record outbound message"
                );
            }
        }
    }
}

fn recorded_outcome(routed: &RoutedMessage) -> ProcessOutcome {
    ProcessOutcome {
        conversation_id: routed.message.conversation_id.clone(),
        message_id: routed.message.id.clone(),
        intent: routed.classification.intent,
        stage: routed.classification.stage,
        plan: routed.classification.plan.clone(),
        response: routed.message.dispatch_response.clone(),
        delivery_ids: routed.message.delivery_id.iter().cloned().collect(),
        duplicate: true,
    }
}
