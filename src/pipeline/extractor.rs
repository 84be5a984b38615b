//! Entity extraction with shape validation and graceful degradation.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::pipeline::capability::{ExtractionRequest, LanguageCapability};
use crate::pipeline::identity::Roster;
use crate::pipeline::types::{Entities, EntityKind, ExtractedEntity};

/// Longest value accepted as a person/date reference.
const MAX_REFERENCE_CHARS: usize = 100;

/// Values models use to mean "nothing found".
const EMPTY_MARKERS: &[&str] = &["", "null", "none", "n/a", "unknown", "(not specified)", "not specified"];

/// Extracts a person and a date reference from message text.
///
/// Never fails: errors, timeouts, malformed output and low-confidence
/// fields all degrade to "not found".
pub struct EntityExtractor {
    capability: Arc<dyn LanguageCapability>,
    timeout: Duration,
    min_confidence: f32,
}

impl EntityExtractor {
    pub fn new(capability: Arc<dyn LanguageCapability>, timeout: Duration, min_confidence: f32) -> Self {
        Self {
            capability,
            timeout,
            min_confidence,
        }
    }

    /// Build the extraction request for `text`. Same input, same request.
    pub fn build_request(text: &str, roster: &Roster) -> ExtractionRequest {
        ExtractionRequest {
            text: text.trim().to_string(),
            roster_names: roster.members().iter().map(|m| m.name.clone()).collect(),
        }
    }

    pub async fn extract(&self, text: &str, roster: &Roster) -> Entities {
        let request = Self::build_request(text, roster);
        if request.text.is_empty() {
            return Entities::default();
        }

        let raw = match tokio::time::timeout(self.timeout, self.capability.extract_entities(&request)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!(error = %e, "Entity extraction failed, continuing without entities");
                return Entities::default();
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "Entity extraction timed out, continuing without entities");
                return Entities::default();
            }
        };

        let entities = validate(&raw, text, self.min_confidence);
        debug!(
            person = entities.person_value().unwrap_or("-"),
            date = entities.date_value().unwrap_or("-"),
            "Entities extracted"
        );
        entities
    }
}

/// Validate a raw extraction object into typed entities.
///
/// Each field may be absent/null, a bare string, or
/// `{"value": string, "confidence": number}`. Anything else is absent.
pub fn validate(raw: &Value, source_text: &str, min_confidence: f32) -> Entities {
    let Some(object) = raw.as_object() else {
        warn!(raw = %raw, "Extraction output is not an object");
        return Entities::default();
    };

    Entities {
        person: validate_field(object.get("person"), EntityKind::Person, source_text, min_confidence),
        date: validate_field(object.get("date"), EntityKind::Date, source_text, min_confidence),
    }
}

fn validate_field(
    field: Option<&Value>,
    kind: EntityKind,
    source_text: &str,
    min_confidence: f32,
) -> Option<ExtractedEntity> {
    let (value, confidence) = match field? {
        Value::Null => return None,
        Value::String(s) => (s.as_str(), 1.0_f32),
        Value::Object(map) => {
            let value = match map.get("value")? {
                Value::String(s) => s.as_str(),
                Value::Null => return None,
                other => {
                    warn!(?kind, value = %other, "Malformed entity value");
                    return None;
                }
            };
            let confidence = match map.get("confidence") {
                None | Some(Value::Null) => 1.0,
                Some(Value::Number(n)) => n.as_f64()? as f32,
                Some(other) => {
                    warn!(?kind, confidence = %other, "Malformed entity confidence");
                    return None;
                }
            };
            (value, confidence)
        }
        other => {
            warn!(?kind, value = %other, "Malformed entity field");
            return None;
        }
    };

    let value = value.trim();
    if EMPTY_MARKERS.contains(&value.to_lowercase().as_str())
        || value.chars().count() > MAX_REFERENCE_CHARS
        || value.contains('\n')
    {
        return None;
    }
    if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
        warn!(?kind, confidence, "Entity confidence out of range");
        return None;
    }
    if confidence < min_confidence {
        debug!(?kind, value, confidence, "Dropping low-confidence entity");
        return None;
    }

    Some(ExtractedEntity {
        kind,
        value: value.to_string(),
        confidence,
        span: find_span(source_text, value),
    })
}

/// Byte range of `value` in `text`, case-insensitive, when it appears verbatim.
fn find_span(text: &str, value: &str) -> Option<(usize, usize)> {
    let lower_text = text.to_lowercase();
    let lower_value = value.to_lowercase();
    // Lower-casing can change byte lengths outside ASCII.
    if lower_text.len() != text.len() || lower_value.len() != value.len() {
        return None;
    }
    lower_text
        .find(&lower_value)
        .map(|start| (start, start + value.len()))
}
