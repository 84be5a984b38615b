//! Intent classification as an ordered rule table.
//!
//! Rules are evaluated top to bottom and the first match wins:
//! 1. Band member asking about a member's availability → `BAND_AVAILABILITY_REQUEST`
//! 2. External sender, first message → `VENUE_INQUIRY` (the model is never consulted)
//! 3. External sender, follow-up → model picks from the follow-up labels
//! 4. Anything else → `OTHER`

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::pipeline::capability::LanguageCapability;
use crate::pipeline::types::{CounterpartyKind, Intent, Stage};

/// One row of the decision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    BandAvailabilityAsk,
    FirstExternalContact,
    ExternalFollowUp,
    Fallback,
}

/// Priority order. Changing this changes business behavior.
pub const RULES: [Rule; 4] = [
    Rule::BandAvailabilityAsk,
    Rule::FirstExternalContact,
    Rule::ExternalFollowUp,
    Rule::Fallback,
];

impl Rule {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BandAvailabilityAsk => "band_availability_ask",
            Self::FirstExternalContact => "first_external_contact",
            Self::ExternalFollowUp => "external_follow_up",
            Self::Fallback => "fallback",
        }
    }
}

/// What a matching rule decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Decided(Intent),
    /// Ask the model, constrained to the follow-up labels.
    DelegateFollowUp,
}

/// Detects "is X free on Y?" style asks.
pub struct AvailabilityAskDetector {
    topic: Vec<Regex>,
    ask: Vec<Regex>,
}

impl AvailabilityAskDetector {
    pub fn default_patterns() -> Self {
        let topic = vec![
            Regex::new(r"(?i)\bavailab(le|ility)\b").unwrap(),
            Regex::new(r"(?i)\bfree\s+(on|for|that|the)\b").unwrap(),
            Regex::new(r"(?i)\bcan\s+(\w+\s+)?(make\s+it|play|do\s+it|come)\b").unwrap(),
        ];
        let ask = vec![
            Regex::new(r"\?").unwrap(),
            Regex::new(r"(?i)\b(ask|check\s+(with|if|whether)|find\s+out|see\s+if)\b").unwrap(),
            Regex::new(r"(?i)^\s*(can|could|would|please)\s+you\b").unwrap(),
        ];
        Self { topic, ask }
    }

    /// True when the text is about availability and phrased as an ask, so a
    /// member stating "I'm available" does not qualify.
    pub fn is_availability_ask(&self, text: &str) -> bool {
        self.topic.iter().any(|r| r.is_match(text)) && self.ask.iter().any(|r| r.is_match(text))
    }
}

/// Maps (text, stage, counterparty) to exactly one intent.
pub struct IntentClassifier {
    capability: Arc<dyn LanguageCapability>,
    timeout: Duration,
    detector: AvailabilityAskDetector,
}

impl IntentClassifier {
    pub fn new(capability: Arc<dyn LanguageCapability>, timeout: Duration) -> Self {
        Self {
            capability,
            timeout,
            detector: AvailabilityAskDetector::default_patterns(),
        }
    }

    fn applies(&self, rule: Rule, text: &str, stage: Stage, counterparty: &CounterpartyKind) -> Option<Verdict> {
        match rule {
            Rule::BandAvailabilityAsk => (counterparty.is_band_member()
                && self.detector.is_availability_ask(text))
            .then_some(Verdict::Decided(Intent::BandAvailabilityRequest)),
            Rule::FirstExternalContact => (!counterparty.is_band_member() && stage == Stage::First)
                .then_some(Verdict::Decided(Intent::VenueInquiry)),
            Rule::ExternalFollowUp => (!counterparty.is_band_member() && stage == Stage::FollowUp)
                .then_some(Verdict::DelegateFollowUp),
            Rule::Fallback => Some(Verdict::Decided(Intent::Other)),
        }
    }

    /// Walk the table and return the first matching rule. Pure, no I/O.
    pub fn decide(&self, text: &str, stage: Stage, counterparty: &CounterpartyKind) -> (Rule, Verdict) {
        RULES
            .into_iter()
            .find_map(|rule| {
                self.applies(rule, text, stage, counterparty)
                    .map(|verdict| (rule, verdict))
            })
            .unwrap_or((Rule::Fallback, Verdict::Decided(Intent::Other)))
    }

    /// Classify a message. Never fails: model errors, timeouts and
    /// out-of-taxonomy labels all become `OTHER`.
    pub async fn classify(&self, text: &str, stage: Stage, counterparty: &CounterpartyKind) -> Intent {
        let (rule, verdict) = self.decide(text, stage, counterparty);
        let intent = match verdict {
            Verdict::Decided(intent) => intent,
            Verdict::DelegateFollowUp => self.classify_follow_up(text).await,
        };
        debug!(
            rule = rule.name(),
            stage = stage.as_str(),
            counterparty = counterparty.label(),
            intent = intent.as_str(),
            "Intent classified"
        );
        intent
    }

    async fn classify_follow_up(&self, text: &str) -> Intent {
        match tokio::time::timeout(self.timeout, self.capability.classify_follow_up(text)).await {
            Ok(Ok(label)) => Intent::parse_follow_up(&label).unwrap_or_else(|| {
                warn!(label = %label, "Classifier returned a label outside the follow-up set, using OTHER");
                Intent::Other
            }),
            Ok(Err(e)) => {
                warn!(error = %e, "Follow-up classification failed, using OTHER");
                Intent::Other
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "Follow-up classification timed out, using OTHER");
                Intent::Other
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::LlmError;
    use crate::pipeline::capability::{ComposeRequest, ExtractionRequest};

    /// Returns a fixed label (or an error) and counts calls.
    struct LabelCapability {
        label: Option<&'static str>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl LabelCapability {
        fn new(label: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                label,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LanguageCapability for LabelCapability {
        async fn classify_follow_up(&self, _text: &str) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.label.map(str::to_string).ok_or(LlmError::RequestFailed {
                provider: "label".into(),
                reason: "boom".into(),
            })
        }

        async fn extract_entities(&self, _request: &ExtractionRequest) -> Result<serde_json::Value, LlmError> {
            Ok(serde_json::Value::Null)
        }

        async fn compose_reply(&self, _request: &ComposeRequest<'_>) -> Result<String, LlmError> {
            Ok(String::new())
        }
    }

    fn member() -> CounterpartyKind {
        CounterpartyKind::BandMember {
            member_id: "john@band.example".into(),
        }
    }

    fn classifier(capability: Arc<LabelCapability>) -> IntentClassifier {
        IntentClassifier::new(capability, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn first_external_message_is_venue_inquiry_without_model() {
        let cap = LabelCapability::new(Some("NEGOTIATION"));
        let c = classifier(cap.clone());
        let intent = c
            .classify("URGENT CANCEL", Stage::First, &CounterpartyKind::External)
            .await;
        assert_eq!(intent, Intent::VenueInquiry);
        assert_eq!(cap.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn follow_up_uses_model_label() {
        let cap = LabelCapability::new(Some("proposal"));
        let intent = classifier(cap.clone())
            .classify("How about $1200 on the 5th?", Stage::FollowUp, &CounterpartyKind::External)
            .await;
        assert_eq!(intent, Intent::Proposal);
        assert_eq!(cap.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn follow_up_never_returns_venue_inquiry() {
        // The model tries to push a follow-up back into the first-message rule.
        let cap = LabelCapability::new(Some("VENUE_INQUIRY"));
        let intent = classifier(cap)
            .classify("Hi again", Stage::FollowUp, &CounterpartyKind::External)
            .await;
        assert_eq!(intent, Intent::Other);
    }

    #[tokio::test]
    async fn malformed_label_error_and_timeout_degrade_to_other() {
        let garbage = classifier(LabelCapability::new(Some("CANCELLATION, probably")))
            .classify("x", Stage::FollowUp, &CounterpartyKind::External)
            .await;
        assert_eq!(garbage, Intent::Other);

        let failed = classifier(LabelCapability::new(None))
            .classify("x", Stage::FollowUp, &CounterpartyKind::External)
            .await;
        assert_eq!(failed, Intent::Other);

        let slow = Arc::new(LabelCapability {
            label: Some("NEGOTIATION"),
            delay: Duration::from_secs(5),
            calls: AtomicUsize::new(0),
        });
        let timed_out = classifier(slow)
            .classify("x", Stage::FollowUp, &CounterpartyKind::External)
            .await;
        assert_eq!(timed_out, Intent::Other);
    }

    #[tokio::test]
    async fn band_member_availability_ask() {
        let intent = classifier(LabelCapability::new(None))
            .classify(
                "ask John what his availability is for July 4th",
                Stage::First,
                &member(),
            )
            .await;
        assert_eq!(intent, Intent::BandAvailabilityRequest);
    }

    #[tokio::test]
    async fn band_member_first_message_is_never_venue_inquiry() {
        let c = classifier(LabelCapability::new(Some("NEGOTIATION")));
        let intent = c.classify("hey, new show idea", Stage::First, &member()).await;
        assert_eq!(intent, Intent::Other);
        let (rule, _) = c.decide("hey, new show idea", Stage::First, &member());
        assert_eq!(rule, Rule::Fallback);
    }

    #[tokio::test]
    async fn external_availability_ask_is_not_gated_in() {
        let intent = classifier(LabelCapability::new(Some("OTHER")))
            .classify(
                "Can you check if I am available on July 4th?",
                Stage::First,
                &CounterpartyKind::External,
            )
            .await;
        assert_eq!(intent, Intent::VenueInquiry);
    }

    #[test]
    fn availability_detector() {
        let d = AvailabilityAskDetector::default_patterns();
        assert!(d.is_availability_ask("ask John what his availability is for July 4th"));
        assert!(d.is_availability_ask("Is Jane free on August 2?"));
        assert!(d.is_availability_ask("can you find out if Mike can make it Friday"));
        assert!(!d.is_availability_ask("I'm available on the 4th"));
        assert!(!d.is_availability_ask("what time is load-in?"));
    }

    #[test]
    fn rule_order_is_fixed() {
        assert_eq!(RULES[0], Rule::BandAvailabilityAsk);
        assert_eq!(RULES[1], Rule::FirstExternalContact);
        assert_eq!(RULES[2], Rule::ExternalFollowUp);
        assert_eq!(RULES[3], Rule::Fallback);
    }
}
