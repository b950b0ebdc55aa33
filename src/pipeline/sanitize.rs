//! Body sanitization: strips markup and styling noise before generic digit
//! matching.
//!
//! Formatted mail is full of digit runs that are not codes: colors
//! (`#336699`), sizes (`600px`), card and account numbers, dates, clock
//! times. Each pass below blanks one family of them out.

use std::sync::LazyLock;

use regex::Regex;

/// `<style>` / `<script>` blocks and HTML comments, contents included.
static BLOCKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<style\b[^>]*>.*?</style\s*>|<script\b[^>]*>.*?</script\s*>|<!--.*?-->")
        .unwrap()
});

/// The whole document `<head>`, title and inline CSS included.
static HEAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<head\b[^>]*>.*?</head\s*>").unwrap());

static TAGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

static ENTITIES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&(?:[a-zA-Z]{2,8}|#[0-9]{1,6}|#[xX][0-9a-fA-F]{1,6});").unwrap());

/// `#rgb` … `#rrggbbaa` and `rgb()/rgba()` calls.
static COLORS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)#[0-9a-f]{3,8}\b|\brgba?\s*\([^)]*\)").unwrap()
});

/// CSS lengths and percentages.
static MEASUREMENTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[0-9]+(?:\.[0-9]+)?\s*(?:px|pt|em|rem|vh|vw)\b|[0-9]+(?:\.[0-9]+)?%").unwrap()
});

/// Three or more digit groups joined by spaces or hyphens: card, account
/// and phone numbers.
static DIGIT_GROUPS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9]{3,}(?:[ -][0-9]{3,}){2,}").unwrap());

/// Calendar dates and clock times.
static DATES_TIMES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"[0-9]{4}[-/.年][0-9]{1,2}[-/.月][0-9]{1,2}日?|[0-9]{1,2}[/.-][0-9]{1,2}[/.-][0-9]{4}|[0-9]{1,2}:[0-9]{2}(?::[0-9]{2})?",
    )
    .unwrap()
});

/// Passes in the order they run. Markup goes first so that attribute values
/// disappear together with their tags.
static PASSES: LazyLock<[&'static Regex; 7]> = LazyLock::new(|| {
    [
        &*BLOCKS,
        &*TAGS,
        &*ENTITIES,
        &*COLORS,
        &*MEASUREMENTS,
        &*DIGIT_GROUPS,
        &*DATES_TIMES,
    ]
});

/// Drop the parts of an HTML document a reader never sees: `<head>`,
/// `<style>`, `<script>` and comments. Visible markup is kept.
pub fn strip_invisible(html: &str) -> String {
    let out = HEAD.replace_all(html, " ");
    BLOCKS.replace_all(&out, " ").trim().to_string()
}

/// Remove markup and styling noise, then normalize whitespace.
pub fn sanitize(text: &str) -> String {
    let mut out = text.to_string();
    for pass in PASSES.iter() {
        if pass.is_match(&out) {
            out = pass.replace_all(&out, " ").into_owned();
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}
