//! Message content sanitizing.
//!
//! Every stored message body is plain text: all markup is stripped, the
//! contents of script-like elements are dropped entirely, and surrounding
//! whitespace is trimmed. Entities are left as written.

use regex::Regex;
use std::sync::LazyLock;

/// Elements whose text content is never shown to a user.
static HIDDEN_BLOCKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|textarea|option|noscript)\b[^>]*>.*?</(script|style|textarea|option|noscript)\s*>")
        .expect("valid hidden block pattern")
});

static COMMENTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid comment pattern"));

static TAGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)</?[A-Za-z!?][^>]*>").expect("valid tag pattern")
});

/// Strip markup and trim. May return an empty string.
pub fn sanitize(raw: &str) -> String {
    let text = HIDDEN_BLOCKS.replace_all(raw, "");
    let text = COMMENTS.replace_all(&text, "");
    let text = TAGS.replace_all(&text, "");
    text.trim().to_string()
}
