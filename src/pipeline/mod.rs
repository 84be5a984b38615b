//! Conversation intent and routing pipeline.
//!
//! Inbound messages from chat and email flow through:
//! 1. `Roster::resolve()`: band member or external party
//! 2. `EntityExtractor::extract()`: person and date references
//! 3. `IntentClassifier::classify()`: ordered rule table, model only for follow-ups
//! 4. `ConversationRouter`: stage, action plan, attach-once recording
//! 5. `ActionDispatcher`: availability email or reply on the origin channel

pub mod capability;
pub mod classifier;
pub mod dates;
pub mod dispatcher;
pub mod extractor;
pub mod identity;
pub mod locks;
pub mod router;
pub mod service;
pub mod types;

pub use capability::{LanguageCapability, ProviderCapability};
pub use dispatcher::ActionDispatcher;
pub use identity::{BandMember, Roster};
pub use router::ConversationRouter;
pub use service::{BookingService, ProcessOutcome};
