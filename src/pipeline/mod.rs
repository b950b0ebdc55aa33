//! Per-message processing: sanitize, extract, filter.
//!
//! Every fetched message flows through:
//! 1. `CodeExtractor::extract()`, rules over the raw then sanitized body
//! 2. `FilterPolicy::evaluate()`, subject veto plus the code requirement
//!
//! Nothing here does I/O; the scheduler owns fetching and dispatch.

pub mod extract;
pub mod filter;
pub mod sanitize;
pub mod types;

pub use extract::{CodeExtractor, CodeRule, Matcher, is_plausible_code};
pub use filter::FilterPolicy;
pub use sanitize::sanitize;
pub use types::{ExtractionResult, FilterDecision, TextSource};
