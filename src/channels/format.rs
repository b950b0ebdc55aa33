//! Forward payload formatting.

use std::sync::LazyLock;

use chrono::{DateTime, Local, Utc};
use regex::Regex;

use crate::mailbox::DecodedMessage;
use crate::mailbox::fetcher::truncate_chars;

/// Subject length cap, in characters.
pub const MAX_TITLE_CHARS: usize = 100;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

static VALIDITY_EN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:valid|expires?)\s+(?:for|in)\s+([0-9]{1,3})\s*(min(?:ute)?s?|hours?)\b")
        .unwrap()
});

static VALIDITY_CN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9]{1,3})\s*(分钟|小时)内有效|有效期\s*(?:为)?\s*([0-9]{1,3})\s*(分钟|小时)").unwrap()
});

/// Escape the characters legacy Markdown treats as markup.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Expiry phrase in the subject, rendered as a short note.
pub fn validity_note(subject: &str) -> Option<String> {
    if let Some(caps) = VALIDITY_EN.captures(subject) {
        let unit = if caps[2].to_lowercase().starts_with('h') {
            "hours"
        } else {
            "minutes"
        };
        return Some(format!("valid for {} {unit}", &caps[1]));
    }
    let caps = VALIDITY_CN.captures(subject)?;
    let (n, unit) = match (caps.get(1), caps.get(2)) {
        (Some(n), Some(unit)) => (n.as_str(), unit.as_str()),
        _ => (caps.get(3)?.as_str(), caps.get(4)?.as_str()),
    };
    Some(format!("{n}{unit}内有效"))
}

/// Chat text for one forwarded code.
///
/// Title, time, code and (optionally) validity, one per line. The time is
/// the message's own `Date:` when it has one.
pub fn format_forward(message: &DecodedMessage, code: &str, now: DateTime<Utc>) -> String {
    let title = escape_markdown(&truncate_chars(&message.subject, MAX_TITLE_CHARS));
    let time = message
        .date
        .unwrap_or(now)
        .with_timezone(&Local)
        .format(TIME_FORMAT);

    let mut text = format!("🔐 *{title}*\n⏰ {time}\n🔢 验证码: `{code}`");
    if let Some(note) = validity_note(&message.subject) {
        text.push_str(&format!("\n⌛ {}", escape_markdown(&note)));
    }
    text
}
