//! Failure reason scrubbing
//!
//! Upstream error bodies sometimes echo the request URL or headers. Every
//! failure reason passes through [`sanitize`] before it is logged, persisted
//! to the stats file or returned to a caller.

use std::sync::LazyLock;

use regex::Regex;

/// Maximum length (in characters) of a sanitized reason.
pub const MAX_REASON_CHARS: usize = 200;

const REDACTED: &str = "[REDACTED]";

static GOOGLE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"AIza[0-9A-Za-z_\-]{30,}").expect("static regex"));

static BEARER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bbearer\s+[^\s,;]+").expect("static regex"));

static QUERY_SECRET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b((?:api_?)?key|(?:access_)?token)=[^&\s]+").expect("static regex")
});

// Long opaque tokens: hex digests, JWT segments, unknown key formats
static OPAQUE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9_\-]{32,}").expect("static regex"));

/// Redact credential-like material from `text` and cap it at
/// [`MAX_REASON_CHARS`] characters.
///
/// `known_secrets` are replaced verbatim first, so pool keys are removed
/// even when they do not look like any known format.
pub fn sanitize<'a>(text: &str, known_secrets: impl IntoIterator<Item = &'a str>) -> String {
    let mut out = text.to_string();
    for secret in known_secrets {
        if !secret.is_empty() && out.contains(secret) {
            out = out.replace(secret, REDACTED);
        }
    }

    let out = GOOGLE_KEY.replace_all(&out, REDACTED);
    let out = BEARER.replace_all(&out, "Bearer [REDACTED]");
    let out = QUERY_SECRET.replace_all(&out, "$1=[REDACTED]");
    let out = OPAQUE_TOKEN.replace_all(&out, REDACTED);

    let collapsed = out.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, MAX_REASON_CHARS)
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((byte_index, _)) => text[..byte_index].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "AIzaSyD3x4mpl3K3y0123456789abcdefghij";
    const NONE: [&str; 0] = [];

    #[test]
    fn redacts_known_pool_secret() {
        let custom = "custom-secret-format-abc";
        let out = sanitize(&format!("bad key {custom} rejected"), [custom]);
        assert_eq!(out, "bad key [REDACTED] rejected");
    }

    #[test]
    fn redacts_google_style_keys_without_pool_context() {
        let out = sanitize(&format!("API key {KEY} not valid"), NONE);
        assert!(!out.contains("AIza"), "got: {out}");
        assert!(out.contains("[REDACTED]"));
    }

    #[test]
    fn redacts_bearer_tokens() {
        let out = sanitize("401: Authorization: Bearer ya29.a0AfH6SM", NONE);
        assert_eq!(out, "401: Authorization: Bearer [REDACTED]");
    }

    #[test]
    fn redacts_query_parameters() {
        let out = sanitize(
            "GET https://host/v1/models?key=abc123&alt=json failed; token=xyz",
            NONE,
        );
        assert!(out.contains("key=[REDACTED]&alt=json"), "got: {out}");
        assert!(out.contains("token=[REDACTED]"), "got: {out}");
        assert!(!out.contains("abc123"));
    }

    #[test]
    fn redacts_long_opaque_tokens() {
        let token = "0123456789abcdef0123456789abcdef01";
        let out = sanitize(&format!("session {token} expired"), NONE);
        assert_eq!(out, "session [REDACTED] expired");
    }

    #[test]
    fn keeps_ordinary_text() {
        let text = "429 Too Many Requests: quota exceeded for metric generate_requests";
        assert_eq!(sanitize(text, NONE), text);
    }

    #[test]
    fn truncates_to_max_chars_on_char_boundary() {
        let text = "é".repeat(500);
        let out = sanitize(&text, NONE);
        assert_eq!(out.chars().count(), MAX_REASON_CHARS);
    }

    #[test]
    fn collapses_whitespace() {
        assert_eq!(sanitize("line one\n\n   line two\t", NONE), "line one line two");
    }
}
