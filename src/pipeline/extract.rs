//! Verification-code extraction.
//!
//! Rules live in an ordered table. Label-anchored rules run first, against
//! the raw body (their anchors may sit in a different element than the
//! digits) and then against the sanitized body. Bare digit runs are only
//! ever looked for in sanitized text, where styling numbers are gone.
//!
//! A candidate that fails [`is_plausible_code`] does not end the search;
//! the next match, and then the next rule, is tried.

use std::sync::LazyLock;

use regex::Regex;
use tracing::trace;

use super::sanitize::sanitize;
use super::types::{ExtractionResult, TextSource};

pub const MIN_CODE_LEN: usize = 4;
pub const MAX_CODE_LEN: usize = 8;

/// Codes whose numeric value is below this are treated as placeholders.
pub const MIN_CODE_VALUE: u32 = 100;

/// Well-known dummy values not caught by the identical/sequential checks.
const DENYLIST: &[&str] = &["123123", "112233", "121212", "123321", "147258", "159753"];

/// Whatever may sit between a label and its code: whitespace, separators,
/// the copula ("is", "是", "为"), entities and whole tags.
const FILLER: &str = r"(?:\s|&nbsp;|&#160;|<[^>]*>|[:：=]|是|为|is|was)*";

/// How a rule finds candidates.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Capture group `group` of every match of `regex`.
    Anchored { regex: Regex, group: usize },
    /// Maximal runs of exactly `len` ASCII digits with no letter or digit
    /// on either side. `skip_years` drops runs that read as a year.
    DigitRun { len: usize, skip_years: bool },
}

/// One extraction rule.
#[derive(Debug, Clone)]
pub struct CodeRule {
    pub name: &'static str,
    pub source: TextSource,
    pub matcher: Matcher,
}

static DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]+").unwrap());

fn anchored(name: &'static str, source: TextSource, label: &str) -> CodeRule {
    let pattern = format!(r"{label}{FILLER}([0-9]{{{MIN_CODE_LEN},{MAX_CODE_LEN}}})(?:[^0-9]|$)");
    CodeRule {
        name,
        source,
        matcher: Matcher::Anchored {
            regex: Regex::new(&pattern).unwrap(),
            group: 1,
        },
    }
}

/// Ordered rule set.
pub struct CodeExtractor {
    rules: Vec<CodeRule>,
}

impl CodeExtractor {
    /// Built-in rules, highest priority first.
    pub fn default_rules() -> Self {
        let cn_label = r"(?:验证码|校验码|动态码|确认码|安全码|激活码|动态密码)";
        let en_label = r"(?i)\b(?:code|passcode|pin|otp)\b";
        let bracket = r"(?:【[^】]{1,30}】|\[[^\]\r\n]{1,30}\])";

        let mut rules = Vec::new();
        for source in [TextSource::Raw, TextSource::Sanitized] {
            rules.push(anchored("cn_label", source, cn_label));
            rules.push(anchored("en_label", source, en_label));
            rules.push(anchored("bracket", source, bracket));
        }
        rules.push(CodeRule {
            name: "digits_6",
            source: TextSource::Sanitized,
            matcher: Matcher::DigitRun {
                len: 6,
                skip_years: false,
            },
        });
        rules.push(CodeRule {
            name: "digits_4",
            source: TextSource::Sanitized,
            matcher: Matcher::DigitRun {
                len: 4,
                skip_years: true,
            },
        });

        Self { rules }
    }

    /// Custom rule set, evaluated in the given order.
    pub fn with_rules(rules: Vec<CodeRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[CodeRule] {
        &self.rules
    }

    /// First plausible code in `body`, or `None`.
    pub fn extract(&self, body: &str) -> Option<ExtractionResult> {
        if body.is_empty() {
            return None;
        }
        let sanitized = sanitize(body);

        for rule in &self.rules {
            let text = match rule.source {
                TextSource::Raw => body,
                TextSource::Sanitized => sanitized.as_str(),
            };
            if let Some(code) = candidates(&rule.matcher, text).find(|c| {
                let ok = is_plausible_code(c);
                if !ok {
                    trace!(rule = rule.name, candidate = %c, "Rejected placeholder code");
                }
                ok
            }) {
                return Some(ExtractionResult {
                    code,
                    rule: rule.name,
                    source: rule.source,
                });
            }
        }
        None
    }
}

impl Default for CodeExtractor {
    fn default() -> Self {
        Self::default_rules()
    }
}

fn candidates<'a>(matcher: &'a Matcher, text: &'a str) -> Box<dyn Iterator<Item = String> + 'a> {
    match matcher {
        Matcher::Anchored { regex, group } => Box::new(
            regex
                .captures_iter(text)
                .filter_map(move |caps| caps.get(*group).map(|m| m.as_str().to_string())),
        ),
        Matcher::DigitRun { len, skip_years } => Box::new(
            DIGITS
                .find_iter(text)
                .filter(move |m| m.as_str().len() == *len && is_bare(text, m.start(), m.end()))
                .map(|m| m.as_str().to_string())
                .filter(move |run| !(*skip_years && looks_like_year(run))),
        ),
    }
}

/// No ASCII letter directly before or after `text[start..end]`. Digits
/// cannot be adjacent: runs are maximal.
fn is_bare(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    !before.is_some_and(|c| c.is_ascii_alphabetic()) && !after.is_some_and(|c| c.is_ascii_alphabetic())
}

fn looks_like_year(run: &str) -> bool {
    run.parse::<u32>().is_ok_and(|y| (1900..=2099).contains(&y))
}

/// Acceptance filter for candidate codes.
pub fn is_plausible_code(code: &str) -> bool {
    if !(MIN_CODE_LEN..=MAX_CODE_LEN).contains(&code.len())
        || !code.bytes().all(|b| b.is_ascii_digit())
    {
        return false;
    }
    let digits = code.as_bytes();
    if digits.iter().all(|&d| d == digits[0]) {
        return false;
    }
    let steps: Vec<i16> = digits
        .windows(2)
        .map(|w| i16::from(w[1]) - i16::from(w[0]))
        .collect();
    if steps.iter().all(|&s| s == 1) || steps.iter().all(|&s| s == -1) {
        return false;
    }
    if DENYLIST.contains(&code) {
        return false;
    }
    code.parse::<u32>().is_ok_and(|v| v >= MIN_CODE_VALUE)
}
