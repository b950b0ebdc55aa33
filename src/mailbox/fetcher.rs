//! Listing and decoding of unseen messages.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders, PartType};
use tracing::debug;

use super::{MailboxSession, MessageId, RawMessage};
use crate::error::MailboxError;
use crate::pipeline::sanitize::strip_invisible;

/// Subject used when a message carries none.
pub const NO_SUBJECT: &str = "(no subject)";

/// A fetched message reduced to what the relay needs.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub id: MessageId,
    /// MIME-decoded subject.
    pub subject: String,
    pub sender: String,
    /// `Date:` header, when present and valid.
    pub date: Option<DateTime<Utc>>,
    /// Plain-text body, cut to a bounded prefix. Codes sit near the top of a
    /// message; the cut keeps footers and signatures out of extraction.
    pub body: String,
}

/// Ids of the newest `limit` unseen messages, still oldest first.
pub async fn list_recent_unseen(
    session: &mut dyn MailboxSession,
    limit: usize,
) -> Result<(usize, Vec<MessageId>), MailboxError> {
    let mut ids = session.search_unseen().await?;
    let total = ids.len();
    if total > limit {
        ids.drain(..total - limit);
    }
    Ok((total, ids))
}

/// Fetch and decode one message.
pub async fn fetch_message(
    session: &mut dyn MailboxSession,
    id: &str,
    body_prefix_chars: usize,
) -> Result<DecodedMessage, MailboxError> {
    let raw = session.fetch_raw(id).await?;
    decode_message(&raw, body_prefix_chars)
}

/// Decode raw RFC 822 bytes.
pub fn decode_message(raw: &RawMessage, body_prefix_chars: usize) -> Result<DecodedMessage, MailboxError> {
    let parsed = MessageParser::default()
        .parse(&raw.bytes)
        .ok_or_else(|| MailboxError::Parse { id: raw.id.clone() })?;

    let subject = decode_subject(&parsed);
    let body = truncate_chars(&extract_body(&parsed), body_prefix_chars);
    let date = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0));

    debug!(id = %raw.id, subject = %subject, body_len = body.len(), "Decoded message");

    Ok(DecodedMessage {
        id: raw.id.clone(),
        subject,
        sender: extract_sender(&parsed),
        date,
        body,
    })
}

/// MIME-decoded subject. Adjacent encoded-words are joined by the parser;
/// if it cannot decode the header, the raw header text is used instead.
fn decode_subject(parsed: &mail_parser::Message) -> String {
    if let Some(subject) = parsed.subject() {
        let subject = subject.trim();
        if !subject.is_empty() {
            return subject.to_string();
        }
    }
    parsed
        .header_raw("Subject")
        .map(|raw| raw.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|raw| !raw.is_empty())
        .unwrap_or_else(|| NO_SUBJECT.to_string())
}

/// Extract the sender address from a parsed email.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// Depth-first search for the first plain-text part that is not an
/// attachment. Falls back to the first inline HTML part, less its head,
/// styles and scripts, then to the top-level payload.
fn extract_body(parsed: &mail_parser::Message) -> String {
    if let Some(text) = find_part(parsed, 0, &|part: &mail_parser::MessagePart| {
        matches!(part.body, PartType::Text(_))
    }) {
        return text;
    }
    if let Some(html) = find_part(parsed, 0, &|part: &mail_parser::MessagePart| {
        matches!(part.body, PartType::Html(_))
    }) {
        return strip_invisible(&html);
    }
    parsed
        .parts
        .first()
        .map(|root| String::from_utf8_lossy(root.contents()).into_owned())
        .unwrap_or_default()
}

fn find_part(
    parsed: &mail_parser::Message,
    index: u32,
    wanted: &dyn Fn(&mail_parser::MessagePart) -> bool,
) -> Option<String> {
    let part = parsed.part(index)?;
    match &part.body {
        PartType::Multipart(children) => children
            .iter()
            .find_map(|&child| find_part(parsed, child, wanted)),
        PartType::Text(text) | PartType::Html(text) if wanted(part) && !is_attachment(part) => {
            Some(text.to_string())
        }
        _ => None,
    }
}

fn is_attachment(part: &mail_parser::MessagePart) -> bool {
    part.content_disposition()
        .is_some_and(|cd| cd.ctype().eq_ignore_ascii_case("attachment"))
}

/// First `max` characters of `text`.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}
