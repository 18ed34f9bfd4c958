//! Raw RFC 822 → [`StructuredMessage`].
//!
//! Never fails on odd content: when the MIME structure is unreadable the raw
//! text becomes the body.

use chrono::{DateTime, Utc};
use mail_parser::{Address, Message, MessageParser};

use super::{FetchedMessage, StructuredMessage};
use crate::error::ParseError;

/// Summary length in characters.
const SUMMARY_CHARS: usize = 300;

/// Parse one fetched message for `account`.
pub fn parse_message(
    account: &str,
    item: &FetchedMessage,
) -> Result<StructuredMessage, ParseError> {
    if item.raw.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError::EmptyBody { uid: item.uid });
    }

    let mut msg = StructuredMessage {
        account: account.to_string(),
        uid: item.uid,
        ..Default::default()
    };

    let Some(parsed) = MessageParser::default().parse(&item.raw) else {
        msg.body = String::from_utf8_lossy(&item.raw).trim().to_string();
        msg.summary = summarize(&msg.body);
        return Ok(msg);
    };

    msg.from = format_addresses(parsed.from());
    msg.to = format_addresses(parsed.to());
    msg.subject = parsed.subject().unwrap_or_default().to_string();
    msg.timestamp = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0));

    msg.body = match extract_text(&parsed) {
        Some(text) => text,
        None => String::from_utf8_lossy(&item.raw).trim().to_string(),
    };
    msg.summary = summarize(&msg.body);
    Ok(msg)
}

/// `Name <addr>` for each address, comma-joined.
pub fn format_addresses(addr: Option<&Address>) -> String {
    let Some(addr) = addr else {
        return String::new();
    };
    let addrs: Vec<&mail_parser::Addr> = match addr {
        Address::List(list) => list.iter().collect(),
        Address::Group(groups) => groups.iter().flat_map(|g| g.addresses.iter()).collect(),
    };
    addrs
        .into_iter()
        .filter_map(|a| {
            let email = a.address.as_deref()?;
            Some(match a.name.as_deref().map(str::trim) {
                Some(name) if !name.is_empty() => format!("{name} <{email}>"),
                _ => email.to_string(),
            })
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Plain text part, else HTML with tags stripped.
fn extract_text(parsed: &Message) -> Option<String> {
    if let Some(text) = parsed.body_text(0) {
        let text = text.trim();
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }
    if let Some(html) = parsed.body_html(0) {
        let text = strip_html(html.as_ref());
        if !text.is_empty() {
            return Some(text);
        }
    }
    None
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

/// First 300 characters, with `...` when truncated.
pub fn summarize(content: &str) -> String {
    let content = content.trim();
    if content.is_empty() {
        return "(empty)".to_string();
    }
    match content.char_indices().nth(SUMMARY_CHARS) {
        Some((cut, _)) => format!("{}...", &content[..cut]),
        None => content.to_string(),
    }
}
