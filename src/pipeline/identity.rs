//! Sender identity resolution against the band roster.

use serde::{Deserialize, Serialize};

use crate::pipeline::types::CounterpartyKind;

/// A known band member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandMember {
    /// Stable identifier (the normalized contact address).
    pub id: String,
    pub name: String,
    pub email: String,
}

impl BandMember {
    pub fn new(name: &str, email: &str) -> Self {
        Self {
            id: normalize_address(email),
            name: name.trim().to_string(),
            email: email.trim().to_string(),
        }
    }

    /// First whitespace-separated token of the name.
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or(&self.name)
    }
}

/// Trim and lower-case an address or session identity.
pub fn normalize_address(identity: &str) -> String {
    identity.trim().to_lowercase()
}

/// The fixed set of band members.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    members: Vec<BandMember>,
}

impl Roster {
    pub fn new(members: Vec<BandMember>) -> Self {
        Self { members }
    }

    pub fn members(&self) -> &[BandMember] {
        &self.members
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Map a sender identity to band member or external party.
    ///
    /// Exact match on the normalized address. This is the only gate for the
    /// availability-request flow.
    pub fn resolve(&self, identity: &str) -> CounterpartyKind {
        let needle = normalize_address(identity);
        if needle.is_empty() {
            return CounterpartyKind::External;
        }
        match self.members.iter().find(|m| m.id == needle) {
            Some(member) => CounterpartyKind::BandMember {
                member_id: member.id.clone(),
            },
            None => CounterpartyKind::External,
        }
    }

    pub fn get(&self, member_id: &str) -> Option<&BandMember> {
        self.members.iter().find(|m| m.id == member_id)
    }

    /// Resolve a free-text person reference to a single member.
    ///
    /// Tries exact full name, then a unique first-name match, then a unique
    /// substring match. Ambiguity resolves to `None`.
    pub fn find_by_name(&self, reference: &str) -> Option<&BandMember> {
        let needle = reference.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }

        if let Some(member) = self
            .members
            .iter()
            .find(|m| m.name.to_lowercase() == needle)
        {
            return Some(member);
        }

        let first_token = needle.split_whitespace().next().unwrap_or(&needle);
        if let Some(member) = unique(
            self.members
                .iter()
                .filter(|m| m.first_name().to_lowercase() == first_token),
        ) {
            return Some(member);
        }

        unique(
            self.members
                .iter()
                .filter(|m| m.name.to_lowercase().contains(&needle)),
        )
    }

    /// Comma-separated member names, for prompts and clarification text.
    pub fn display_names(&self) -> String {
        self.members
            .iter()
            .map(|m| m.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn unique<'a>(mut candidates: impl Iterator<Item = &'a BandMember>) -> Option<&'a BandMember> {
    let first = candidates.next()?;
    match candidates.next() {
        Some(_) => None,
        None => Some(first),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> Roster {
        Roster::new(vec![
            BandMember::new("John Smith", "John.Smith@band.example"),
            BandMember::new("Jane Doe", "jane@band.example"),
            BandMember::new("Johnny Cash", "johnny@band.example"),
        ])
    }

    #[test]
    fn resolve_is_case_insensitive_and_trimmed() {
        let roster = roster();
        assert_eq!(
            roster.resolve("  JOHN.smith@Band.Example "),
            CounterpartyKind::BandMember {
                member_id: "john.smith@band.example".into()
            }
        );
    }

    #[test]
    fn unknown_and_empty_senders_are_external() {
        let roster = roster();
        assert_eq!(roster.resolve("venue@club.example"), CounterpartyKind::External);
        assert_eq!(roster.resolve("   "), CounterpartyKind::External);
        // Prefix of a member address is not a match.
        assert_eq!(roster.resolve("jane@band"), CounterpartyKind::External);
    }

    #[test]
    fn find_by_full_name_then_first_name() {
        let roster = roster();
        assert_eq!(roster.find_by_name("jane doe").unwrap().name, "Jane Doe");
        assert_eq!(roster.find_by_name("Jane").unwrap().name, "Jane Doe");
        assert_eq!(roster.find_by_name("John").unwrap().name, "John Smith");
        assert_eq!(roster.find_by_name("Johnny").unwrap().name, "Johnny Cash");
    }

    #[test]
    fn ambiguous_or_unknown_names_are_unresolved() {
        let roster = roster();
        // "joh" is a substring of both John Smith and Johnny Cash.
        assert!(roster.find_by_name("joh").is_none());
        assert!(roster.find_by_name("Ringo").is_none());
        assert!(roster.find_by_name("").is_none());
    }

    #[test]
    fn substring_fallback() {
        let roster = roster();
        assert_eq!(roster.find_by_name("smith").unwrap().name, "John Smith");
    }

    #[test]
    fn display_names_lists_everyone() {
        assert_eq!(roster().display_names(), "John Smith, Jane Doe, Johnny Cash");
    }
}
