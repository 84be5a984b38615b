//! Date reference resolution and display.
//!
//! References with a year ("2026-07-04", "July 4th, 2026") resolve as
//! written. Month/day references without a year ("July 4th", "4 Jul",
//! "7/4") resolve to their next occurrence on or after today. Anything
//! else ("next Friday", "July 4 to July 6") is shown as written.

use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate, Utc};
use regex::Regex;

static ORDINAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{1,2})(st|nd|rd|th)\b").unwrap());
static HAS_YEAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{4}\b").unwrap());

const WITH_YEAR: &[&str] = &["%Y-%m-%d", "%B %d %Y", "%d %B %Y", "%m/%d/%Y"];

/// Render a date reference for outbound text, resolved against today.
pub fn display_date(value: &str) -> String {
    display_date_from(value, Utc::now().date_naive())
}

/// Render a date reference as `Month D, YYYY` when it resolves, else as written.
pub fn display_date_from(value: &str, today: NaiveDate) -> String {
    match resolve_date(value, today) {
        Some(date) => date.format("%B %-d, %Y").to_string(),
        None => value.trim().to_string(),
    }
}

pub fn resolve_date(value: &str, today: NaiveDate) -> Option<NaiveDate> {
    let cleaned = normalize(value);
    if cleaned.is_empty() {
        return None;
    }

    if HAS_YEAR.is_match(&cleaned) {
        return WITH_YEAR
            .iter()
            .find_map(|format| NaiveDate::parse_from_str(&cleaned, format).ok());
    }

    // Feb 29 may need a few years to come round again.
    (today.year()..=today.year() + 4)
        .filter_map(|year| month_day_in(&cleaned, year))
        .find(|date| *date >= today)
}

fn month_day_in(cleaned: &str, year: i32) -> Option<NaiveDate> {
    let candidates = [
        (format!("{cleaned} {year}"), "%B %d %Y"),
        (format!("{cleaned} {year}"), "%d %B %Y"),
        (format!("{cleaned}/{year}"), "%m/%d/%Y"),
    ];
    candidates
        .iter()
        .find_map(|(text, format)| NaiveDate::parse_from_str(text, format).ok())
}

fn normalize(value: &str) -> String {
    let without_ordinals = ORDINAL.replace_all(value.trim(), "$1");
    without_ordinals
        .replace(',', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
