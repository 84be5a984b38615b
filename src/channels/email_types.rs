//! Inbound email text helpers: addresses, subjects, bodies.

use mail_parser::{HeaderValue, MessageParser};

/// An inbound email reduced to what the router consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEmail {
    pub sender: String,
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    pub body: String,
    pub thread_reference: Option<String>,
    pub message_id: Option<String>,
}

/// Split `"Name <addr@host>"` into (address, name). Bare addresses have no name.
pub fn parse_address(raw: &str) -> (String, Option<String>) {
    let raw = raw.trim();
    if let (Some(open), Some(close)) = (raw.rfind('<'), raw.rfind('>'))
        && close > open
    {
        let address = raw[open + 1..close].trim().to_string();
        let name = raw[..open].trim().trim_matches('"').trim();
        let name = (!name.is_empty()).then(|| name.to_string());
        return (address, name);
    }
    (raw.to_string(), None)
}

/// Remove any number of leading `Re:` / `Fwd:` / `Fw:` prefixes.
pub fn normalize_subject(subject: &str) -> String {
    let mut s = subject.trim();
    loop {
        let lower = s.to_lowercase();
        let stripped = ["re:", "fwd:", "fw:"]
            .iter()
            .find(|prefix| lower.starts_with(**prefix))
            .map(|prefix| s[prefix.len()..].trim_start());
        match stripped {
            Some(rest) => s = rest,
            None => return s.to_string(),
        }
    }
}

/// Thread reference: the root of `References`, else `In-Reply-To`, else the
/// normalized subject.
pub fn thread_reference(
    references: Option<&str>,
    in_reply_to: Option<&str>,
    subject: Option<&str>,
) -> Option<String> {
    let first_id = |s: &str| s.split_whitespace().next().map(str::to_string);
    references
        .and_then(first_id)
        .or_else(|| in_reply_to.and_then(first_id))
        .or_else(|| {
            subject
                .map(normalize_subject)
                .filter(|s| !s.is_empty())
        })
}

/// Pick readable body text: plain text preferred, HTML stripped otherwise,
/// quoted reply text removed.
pub fn readable_body(text: Option<&str>, html: Option<&str>) -> String {
    let raw = match (text, html) {
        (Some(t), _) if !t.trim().is_empty() => t.to_string(),
        (_, Some(h)) if !h.trim().is_empty() => strip_html(h),
        _ => String::new(),
    };
    strip_quoted_text(&raw).trim().to_string()
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip quoted text from an email body.
///
/// Drops `>` lines and everything after an "On ... wrote:" attribution or
/// an "Original Message" separator.
pub fn strip_quoted_text(body: &str) -> String {
    let mut result = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('>') {
            continue;
        }
        if (trimmed.starts_with("On ") && trimmed.ends_with("wrote:"))
            || (trimmed.starts_with("---") && trimmed.contains("Original Message"))
        {
            break;
        }
        result.push(line);
    }

    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }
    result.join("\n")
}

/// Parse a raw RFC 5322 message.
pub fn parse_raw_email(raw: &[u8]) -> Option<ParsedEmail> {
    let parsed = MessageParser::default().parse(raw)?;

    let from = parsed.from().and_then(|addr| addr.first());
    let sender = from.and_then(|a| a.address()).map(str::to_string)?;
    let sender_name = from.and_then(|a| a.name()).map(str::to_string);
    let subject = parsed.subject().map(str::to_string);

    let text = parsed.body_text(0);
    let html = parsed.body_html(0);
    let body = readable_body(text.as_deref(), html.as_deref());

    let references = header_text(parsed.references());
    let in_reply_to = header_text(parsed.in_reply_to());

    Some(ParsedEmail {
        sender,
        sender_name,
        thread_reference: thread_reference(
            references.as_deref(),
            in_reply_to.as_deref(),
            subject.as_deref(),
        ),
        subject,
        body,
        message_id: parsed.message_id().map(str::to_string),
    })
}

/// First message id of a References / In-Reply-To header.
fn header_text(value: &HeaderValue) -> Option<String> {
    match value {
        HeaderValue::Text(t) => Some(t.to_string()),
        HeaderValue::TextList(list) => list.first().map(|t| t.to_string()),
        _ => None,
    }
}
