//! Forwarding policy.
//!
//! Two checks, in this order:
//! - a subject containing an exclude term is never forwarded
//! - otherwise a message is forwarded iff a code was extracted
//!
//! Keyword hits without a code are logged but withheld: a message that
//! talks about a code but carries none is nothing a user can act on.

use tracing::debug;

use crate::config::FilterConfig;
use crate::pipeline::types::{ExtractionResult, FilterDecision};

/// Subject terms that mark routine, non-code mail.
pub const DEFAULT_EXCLUDE_TERMS: &[&str] = &[
    "report",
    "weekly",
    "meeting",
    "invoice",
    "newsletter",
    "receipt",
    "statement",
    "subscription",
    "unsubscribe",
    "promotion",
    "周报",
    "日报",
    "月报",
    "会议",
    "发票",
    "账单",
    "订阅",
    "广告",
    "报告",
];

/// Terms that suggest a verification message.
pub const DEFAULT_KEYWORDS: &[&str] = &[
    "验证码",
    "校验码",
    "动态码",
    "verification",
    "verify",
    "code",
    "otp",
    "passcode",
    "登录",
    "login",
    "security",
    "安全",
];

/// Subject/body policy deciding whether an extracted code is forwarded.
#[derive(Debug, Clone)]
pub struct FilterPolicy {
    /// Lowercased.
    exclude_terms: Vec<String>,
    /// Lowercased.
    keywords: Vec<String>,
}

impl FilterPolicy {
    pub fn new(exclude_terms: Vec<String>, keywords: Vec<String>) -> Self {
        Self {
            exclude_terms: normalize(exclude_terms),
            keywords: normalize(keywords),
        }
    }

    /// Built-in lists.
    pub fn default_policy() -> Self {
        Self::new(to_owned(DEFAULT_EXCLUDE_TERMS), to_owned(DEFAULT_KEYWORDS))
    }

    /// Configured lists, falling back to the built-in ones per list.
    pub fn from_config(config: &FilterConfig) -> Self {
        Self::new(
            config
                .exclude_terms
                .clone()
                .unwrap_or_else(|| to_owned(DEFAULT_EXCLUDE_TERMS)),
            config
                .keywords
                .clone()
                .unwrap_or_else(|| to_owned(DEFAULT_KEYWORDS)),
        )
    }

    pub fn exclude_terms(&self) -> &[String] {
        &self.exclude_terms
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Decide whether a message is forwarded.
    pub fn evaluate(
        &self,
        subject: &str,
        body: &str,
        extraction: Option<&ExtractionResult>,
    ) -> FilterDecision {
        let subject_lc = subject.to_lowercase();

        if let Some(term) = self.exclude_terms.iter().find(|t| subject_lc.contains(t.as_str())) {
            return FilterDecision::skip(format!("subject contains excluded term \"{term}\""));
        }

        let Some(extraction) = extraction else {
            if let Some(keyword) = self.keyword_hit(&subject_lc, body) {
                debug!(subject = %subject, keyword = %keyword, "Keyword present but no code found");
                return FilterDecision::skip(format!("keyword \"{keyword}\" but no code"));
            }
            return FilterDecision::skip("no code found");
        };

        FilterDecision::forward(format!("code found by {}", extraction.rule))
    }

    fn keyword_hit(&self, subject_lc: &str, body: &str) -> Option<&str> {
        let body_lc = body.to_lowercase();
        self.keywords
            .iter()
            .find(|k| subject_lc.contains(k.as_str()) || body_lc.contains(k.as_str()))
            .map(String::as_str)
    }
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self::default_policy()
    }
}

fn normalize(terms: Vec<String>) -> Vec<String> {
    terms
        .into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn to_owned(terms: &[&str]) -> Vec<String> {
    terms.iter().map(|t| t.to_string()).collect()
}
