//! Shared types for the extraction/filter pipeline.

use serde::Serialize;

/// Which rendition of the body a rule ran against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TextSource {
    /// The body as decoded, markup included.
    Raw,
    /// The body after sanitization.
    Sanitized,
}

/// An accepted verification code and the rule that found it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionResult {
    /// ASCII digits, length 4–8.
    pub code: String,
    /// Name of the rule that produced the code.
    pub rule: &'static str,
    pub source: TextSource,
}

/// Forwarding decision for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterDecision {
    pub forward: bool,
    /// Human-readable explanation, used in logs.
    pub reason: String,
}

impl FilterDecision {
    pub fn forward(reason: impl Into<String>) -> Self {
        Self {
            forward: true,
            reason: reason.into(),
        }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            forward: false,
            reason: reason.into(),
        }
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        if self.forward { "forward" } else { "skip" }
    }
}
