//! Failure classification for upstream responses
//!
//! A single ordered rule table decides how the invoker reacts to a failed
//! request:
//!
//! 1. An explicit kind set by the request layer wins outright
//! 2. HTTP status rules (429 → rate limited, 408/5xx → network, 4xx → invalid)
//! 3. Keyword rules on the message, case-insensitive on token boundaries
//!    (`_` and camelCase humps split tokens, so `userRateLimitExceeded`
//!    contains `rate` and `limit`)
//! 4. Anything else is `Unknown`
//!
//! User rules (from config or [`Classifier::add_rule`]) are consulted before
//! the built-in rules of the same stage.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ClassifierRuleConfig;

/// How the invoker should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Key hit its quota; cool it down and rotate
    RateLimited,
    /// Transient; back off and retry on the same key
    Network,
    /// The request itself is wrong; retrying will not help
    InvalidRequest,
    Unknown,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Network => "network",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Typed failure returned by a request closure.
///
/// `message` may contain anything the upstream sent back, including echoed
/// keys; the pool sanitizes it before it is logged, persisted or returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: Option<ErrorKind>,
    pub status: Option<u16>,
    pub message: String,
}

impl Failure {
    /// Failure with only a message; classified by keywords.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            status: None,
            message: message.into(),
        }
    }

    /// HTTP error response; classified by status, then by body keywords.
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        Self {
            kind: None,
            status: Some(status),
            message: body.into(),
        }
    }

    pub fn with_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            status: None,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::RateLimited, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Network, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::InvalidRequest, message)
    }

    /// Map a transport-level reqwest error.
    ///
    /// Timeouts and connection failures are network errors regardless of
    /// wording; anything carrying a status is left to the status rules.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let message = err.to_string();
        if err.is_timeout() || err.is_connect() {
            return Self::network(message);
        }
        match err.status() {
            Some(status) => Self::http(status.as_u16(), message),
            None if err.is_request() || err.is_body() => Self::network(message),
            None => Self::message(message),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {status}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Status(u16),
    /// `None` when the pattern failed to compile; never matches
    Keyword(Option<Regex>),
}

/// One entry of the classification table.
#[derive(Debug, Clone)]
pub struct Rule {
    matcher: Matcher,
    kind: ErrorKind,
}

impl Rule {
    pub fn status(status: u16, kind: ErrorKind) -> Self {
        Self {
            matcher: Matcher::Status(status),
            kind,
        }
    }

    /// Case-insensitive whole-token match on `keyword` (taken literally).
    pub fn keyword(keyword: &str, kind: ErrorKind) -> Self {
        Self::keywords(&[keyword], kind)
    }

    /// Whole-token match on any of `keywords`.
    pub fn keywords(keywords: &[&str], kind: ErrorKind) -> Self {
        Self::pattern(
            &format!(r"(?i)(?:^|[^a-z0-9])(?:{})(?:$|[^a-z0-9])", alternation(keywords)),
            kind,
        )
    }

    /// Match any of `keywords` at the start of a token: `limit` matches
    /// `limited` and `LimitExceeded` but not `unlimited`.
    pub fn keyword_prefixes(keywords: &[&str], kind: ErrorKind) -> Self {
        Self::pattern(
            &format!(r"(?i)(?:^|[^a-z0-9])(?:{})", alternation(keywords)),
            kind,
        )
    }

    fn pattern(pattern: &str, kind: ErrorKind) -> Self {
        let regex = match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!(pattern, error = %e, "classifier rule ignored, pattern does not compile");
                None
            }
        };
        Self {
            matcher: Matcher::Keyword(regex),
            kind,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn matches_status(&self, status: u16) -> bool {
        matches!(self.matcher, Matcher::Status(s) if s == status)
    }

    fn matches_message(&self, message: &str) -> bool {
        matches!(&self.matcher, Matcher::Keyword(Some(re)) if re.is_match(message))
    }
}

impl From<&ClassifierRuleConfig> for Rule {
    fn from(config: &ClassifierRuleConfig) -> Self {
        match (&config.keyword, config.status) {
            (Some(keyword), _) => Rule::keyword(keyword, config.kind),
            (None, Some(status)) => Rule::status(status, config.kind),
            // Rejected by config validation; status 0 never occurs
            (None, None) => Rule::status(0, config.kind),
        }
    }
}

fn alternation(keywords: &[&str]) -> String {
    keywords
        .iter()
        .map(|k| regex::escape(k.trim()))
        .collect::<Vec<_>>()
        .join("|")
}

/// Insert a space at each lower-to-upper case transition so camelCase
/// reason codes (`rateLimitExceeded`) split into tokens.
fn split_camel_case(message: &str) -> String {
    let mut out = String::with_capacity(message.len() + 8);
    let mut prev: Option<char> = None;
    for c in message.chars() {
        if c.is_ascii_uppercase()
            && prev.is_some_and(|p| p.is_ascii_lowercase() || p.is_ascii_digit())
        {
            out.push(' ');
        }
        out.push(c);
        prev = Some(c);
    }
    out
}

const RATE_LIMIT_KEYWORDS: &[&str] = &[
    "429",
    "quota",
    "rate",
    "rate_limit",
    "rate limit",
    "resource_exhausted",
    "resource exhausted",
    "limit",
    "exhausted",
    "too many requests",
];

const INVALID_REQUEST_KEYWORDS: &[&str] = &[
    "api key",
    "api_key",
    "api_key_invalid",
    "unauthorized",
    "unauthenticated",
    "permission",
    "permission_denied",
    "forbidden",
    "invalid",
    "invalid_argument",
    "bad request",
    "schema",
    "malformed",
    "400",
];

const NETWORK_KEYWORDS: &[&str] = &[
    "timeout",
    "timed out",
    "deadline_exceeded",
    "connection",
    "connect",
    "network",
    "unavailable",
    "reset",
    "refused",
    "dns",
    "socket",
    "eof",
    "503",
];

/// Ordered classification table.
#[derive(Debug, Clone)]
pub struct Classifier {
    user_status: Vec<Rule>,
    user_keywords: Vec<Rule>,
    builtin_status: Vec<Rule>,
    builtin_keywords: Vec<Rule>,
}

impl Default for Classifier {
    fn default() -> Self {
        let builtin_status = [
            (429, ErrorKind::RateLimited),
            (408, ErrorKind::Network),
            (500, ErrorKind::Network),
            (502, ErrorKind::Network),
            (503, ErrorKind::Network),
            (504, ErrorKind::Network),
            (400, ErrorKind::InvalidRequest),
            (401, ErrorKind::InvalidRequest),
            (403, ErrorKind::InvalidRequest),
            (404, ErrorKind::InvalidRequest),
            (422, ErrorKind::InvalidRequest),
        ]
        .into_iter()
        .map(|(status, kind)| Rule::status(status, kind))
        .collect();

        let builtin_keywords = vec![
            Rule::keyword_prefixes(RATE_LIMIT_KEYWORDS, ErrorKind::RateLimited),
            Rule::keywords(INVALID_REQUEST_KEYWORDS, ErrorKind::InvalidRequest),
            Rule::keywords(NETWORK_KEYWORDS, ErrorKind::Network),
        ];

        Self {
            user_status: Vec::new(),
            user_keywords: Vec::new(),
            builtin_status,
            builtin_keywords,
        }
    }
}

impl Classifier {
    /// Built-in table plus the configured extra rules.
    pub fn from_config(rules: &[ClassifierRuleConfig]) -> Self {
        let mut classifier = Self::default();
        for rule in rules {
            classifier.add_rule(Rule::from(rule));
        }
        classifier
    }

    /// Append a user rule. User rules run before the built-ins of their stage,
    /// in the order they were added.
    pub fn add_rule(&mut self, rule: Rule) {
        match rule.matcher {
            Matcher::Status(_) => self.user_status.push(rule),
            Matcher::Keyword(_) => self.user_keywords.push(rule),
        }
    }

    pub fn classify(&self, failure: &Failure) -> ErrorKind {
        if let Some(kind) = failure.kind {
            return kind;
        }

        if let Some(status) = failure.status
            && let Some(rule) = self
                .user_status
                .iter()
                .chain(&self.builtin_status)
                .find(|r| r.matches_status(status))
        {
            return rule.kind;
        }

        let message = split_camel_case(&failure.message);
        self.user_keywords
            .iter()
            .chain(&self.builtin_keywords)
            .find(|r| r.matches_message(&message))
            .map(|r| r.kind)
            .unwrap_or(ErrorKind::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(failure: Failure) -> ErrorKind {
        Classifier::default().classify(&failure)
    }

    #[test]
    fn explicit_kind_wins_over_status_and_text() {
        let failure = Failure {
            kind: Some(ErrorKind::Network),
            status: Some(429),
            message: "quota exceeded".into(),
        };
        assert_eq!(classify(failure), ErrorKind::Network);
    }

    #[test]
    fn status_rules() {
        assert_eq!(classify(Failure::http(429, "")), ErrorKind::RateLimited);
        for status in [408, 500, 502, 503, 504] {
            assert_eq!(classify(Failure::http(status, "")), ErrorKind::Network, "{status}");
        }
        for status in [400, 401, 403, 404, 422] {
            assert_eq!(
                classify(Failure::http(status, "")),
                ErrorKind::InvalidRequest,
                "{status}"
            );
        }
    }

    #[test]
    fn status_beats_keywords() {
        // A 500 that mentions quota is still treated as transient
        assert_eq!(
            classify(Failure::http(500, "quota backend unavailable")),
            ErrorKind::Network
        );
    }

    #[test]
    fn unmatched_status_falls_through_to_keywords() {
        assert_eq!(
            classify(Failure::http(418, "RESOURCE_EXHAUSTED")),
            ErrorKind::RateLimited
        );
        assert_eq!(classify(Failure::http(418, "teapot")), ErrorKind::Unknown);
    }

    #[test]
    fn rate_limit_keywords() {
        for message in [
            "429 Too Many Requests",
            "Quota exceeded for quota metric",
            "RESOURCE_EXHAUSTED",
            "Resource has been exhausted (e.g. check quota).",
            "rate_limit hit",
            "Rate limited, slow down",
            "daily LIMIT reached",
        ] {
            assert_eq!(classify(Failure::message(message)), ErrorKind::RateLimited, "{message}");
        }
    }

    #[test]
    fn camel_case_reason_codes_are_rate_limits() {
        for message in [
            "reason: rateLimitExceeded",
            "userRateLimitExceeded",
            "quotaExceeded for metric generate_content_requests",
            "dailyLimitExceeded",
            "RateLimitError: slow down",
            "ResourceExhausted",
            "user_rate_limit_exceeded",
        ] {
            assert_eq!(classify(Failure::message(message)), ErrorKind::RateLimited, "{message}");
        }
    }

    #[test]
    fn rate_limit_on_a_failed_attempt_without_status() {
        let failure = Failure {
            kind: None,
            status: None,
            message: "googleapi: Error 403: userRateLimitExceeded".into(),
        };
        assert_eq!(classify(failure), ErrorKind::RateLimited);
    }

    #[test]
    fn keywords_require_token_start() {
        // "generate" and "moderate" contain "rate"; "unlimited" contains "limit"
        for message in [
            "could not generate output",
            "moderate load",
            "unlimited plan",
            "generateContent failed",
        ] {
            assert_ne!(classify(Failure::message(message)), ErrorKind::RateLimited, "{message}");
        }
    }

    #[test]
    fn invalid_request_keywords() {
        for message in [
            "API key not valid. Please pass a valid API key.",
            "API_KEY_INVALID",
            "PERMISSION_DENIED",
            "Invalid JSON payload received",
            "response did not match schema",
        ] {
            assert_eq!(
                classify(Failure::message(message)),
                ErrorKind::InvalidRequest,
                "{message}"
            );
        }
    }

    #[test]
    fn network_keywords() {
        for message in [
            "operation timed out",
            "Connection reset by peer",
            "dns error: failed to lookup address",
            "The service is currently unavailable",
        ] {
            assert_eq!(classify(Failure::message(message)), ErrorKind::Network, "{message}");
        }
    }

    #[test]
    fn rate_limit_checked_before_network() {
        assert_eq!(
            classify(Failure::message("connection closed: quota exhausted")),
            ErrorKind::RateLimited
        );
    }

    #[test]
    fn unmatched_is_unknown() {
        assert_eq!(classify(Failure::message("something odd")), ErrorKind::Unknown);
        assert_eq!(classify(Failure::message("")), ErrorKind::Unknown);
    }

    #[test]
    fn user_rules_take_precedence() {
        let mut classifier = Classifier::default();
        classifier.add_rule(Rule::keyword("billing", ErrorKind::RateLimited));
        classifier.add_rule(Rule::status(400, ErrorKind::Network));

        assert_eq!(
            classifier.classify(&Failure::message("billing account closed")),
            ErrorKind::RateLimited
        );
        assert_eq!(classifier.classify(&Failure::http(400, "")), ErrorKind::Network);
        // Built-ins still apply to everything else
        assert_eq!(classifier.classify(&Failure::http(429, "")), ErrorKind::RateLimited);
    }

    #[test]
    fn configured_keywords_are_literal() {
        let rules = vec![ClassifierRuleConfig {
            keyword: Some("a.b".into()),
            status: None,
            kind: ErrorKind::Network,
        }];
        let classifier = Classifier::from_config(&rules);
        assert_eq!(classifier.classify(&Failure::message("a.b failed")), ErrorKind::Network);
        assert_eq!(classifier.classify(&Failure::message("axb failed")), ErrorKind::Unknown);
    }

    #[test]
    fn camel_case_splitting() {
        assert_eq!(split_camel_case("userRateLimitExceeded"), "user Rate Limit Exceeded");
        assert_eq!(split_camel_case("RESOURCE_EXHAUSTED"), "RESOURCE_EXHAUSTED");
        assert_eq!(split_camel_case("http2Error"), "http2 Error");
    }

    #[test]
    fn user_keywords_match_whole_tokens() {
        let mut classifier = Classifier::default();
        classifier.add_rule(Rule::keyword("billing", ErrorKind::InvalidRequest));
        assert_eq!(
            classifier.classify(&Failure::message("billingDisabled")),
            ErrorKind::InvalidRequest
        );
        assert_eq!(
            classifier.classify(&Failure::message("prebilling check")),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn failure_display_includes_status() {
        assert_eq!(Failure::http(503, "down").to_string(), "HTTP 503: down");
        assert_eq!(Failure::message("boom").to_string(), "boom");
    }
}
