//! Error Classifier: turns a raw upstream/internal failure string into a
//! stable, loggable, user-facing shape.
//!
//! Grounded on `original_source/core/error_handler.py`'s keyword-based
//! `categorize_error`/`assess_severity`/`suggest_remediation` and its
//! fingerprinting scheme (category + a normalized message hash), kept as
//! keyword matching rather than promoted to a typed error enum because the
//! inputs here are free-form strings surfaced from `crate::agent::AgentError`
//! and breaker/pool failures, not a closed set the gateway itself defines.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Database,
    Validation,
    Permission,
    Resource,
    Timeout,
    Logic,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 8] = [
        ErrorCategory::Network,
        ErrorCategory::Database,
        ErrorCategory::Validation,
        ErrorCategory::Permission,
        ErrorCategory::Resource,
        ErrorCategory::Timeout,
        ErrorCategory::Logic,
        ErrorCategory::Unknown,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub const ALL: [ErrorSeverity; 5] = [
        ErrorSeverity::Info,
        ErrorSeverity::Low,
        ErrorSeverity::Medium,
        ErrorSeverity::High,
        ErrorSeverity::Critical,
    ];
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub fingerprint: String,
    pub message: String,
    pub remediation: Option<String>,
}

/// Categorizes a raw error message by keyword. Order matters: more specific
/// categories are checked before the generic `Unknown` fallback.
pub fn categorize(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();

    const TIMEOUT: &[&str] = &["timed out", "timeout", "deadline exceeded"];
    const NETWORK: &[&str] = &["connection refused", "connection reset", "broken pipe", "dns", "unreachable"];
    const DATABASE: &[&str] = &["neo4j", "graph store", "cypher", "bolt://", "database"];
    const PERMISSION: &[&str] = &["unauthorized", "forbidden", "invalid api key", "authentication", "permission denied"];
    const VALIDATION: &[&str] = &["invalid input", "validation failed", "malformed"];
    const LOGIC: &[&str] = &["unexpected response", "protocol error", "parse error", "unexpected event"];
    const RESOURCE: &[&str] = &[
        "pool exhausted", "out of memory", "resource exhausted", "too many connections",
        "rate limit", "too many requests", "429",
    ];

    if TIMEOUT.iter().any(|k| lower.contains(k)) {
        ErrorCategory::Timeout
    } else if DATABASE.iter().any(|k| lower.contains(k)) {
        ErrorCategory::Database
    } else if NETWORK.iter().any(|k| lower.contains(k)) {
        ErrorCategory::Network
    } else if PERMISSION.iter().any(|k| lower.contains(k)) {
        ErrorCategory::Permission
    } else if VALIDATION.iter().any(|k| lower.contains(k)) {
        ErrorCategory::Validation
    } else if RESOURCE.iter().any(|k| lower.contains(k)) {
        ErrorCategory::Resource
    } else if LOGIC.iter().any(|k| lower.contains(k)) {
        ErrorCategory::Logic
    } else {
        ErrorCategory::Unknown
    }
}

/// Grades severity from the category, with a couple of keyword escalations
/// (repeated/cascading failures read as more severe than a one-off).
pub fn assess_severity(category: ErrorCategory, message: &str) -> ErrorSeverity {
    let lower = message.to_lowercase();
    let escalated = lower.contains("cascad") || lower.contains("circuit open") || lower.contains("repeated");

    let base = match category {
        ErrorCategory::Validation => ErrorSeverity::Low,
        ErrorCategory::Resource => ErrorSeverity::Medium,
        ErrorCategory::Timeout | ErrorCategory::Network => ErrorSeverity::Medium,
        ErrorCategory::Database => ErrorSeverity::Medium,
        ErrorCategory::Permission => ErrorSeverity::High,
        ErrorCategory::Logic => ErrorSeverity::High,
        ErrorCategory::Unknown => ErrorSeverity::Critical,
    };

    if escalated && base < ErrorSeverity::Critical {
        match base {
            ErrorSeverity::Info => ErrorSeverity::Low,
            ErrorSeverity::Low => ErrorSeverity::Medium,
            ErrorSeverity::Medium => ErrorSeverity::High,
            ErrorSeverity::High => ErrorSeverity::Critical,
            ErrorSeverity::Critical => ErrorSeverity::Critical,
        }
    } else {
        base
    }
}

static DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("static digit pattern is valid"));
static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"'[^']*'|"[^"]*""#).expect("static quoted pattern is valid"));

/// A stable fingerprint: category plus a hash of the first 100 characters of
/// the message with numbers and quoted substrings normalized out, so e.g.
/// two timeouts against different session ids collapse to the same
/// fingerprint. `(filename:line)` from the original's fingerprinting scheme
/// has no counterpart here since these messages carry no call-site info by
/// the time they reach the classifier.
pub fn fingerprint(category: ErrorCategory, message: &str) -> String {
    let truncated: String = message.chars().take(100).collect();
    let normalized = QUOTED.replace_all(&truncated, "_");
    let normalized = DIGITS.replace_all(&normalized, "_");
    let input = format!("{category:?}:{normalized}");
    blake3::hash(input.as_bytes()).to_hex()[..12].to_string()
}

pub fn suggest_remediation(category: ErrorCategory) -> Option<&'static str> {
    match category {
        ErrorCategory::Timeout => Some("retry the request; consider raising the turn deadline"),
        ErrorCategory::Network => Some("check upstream agent process connectivity"),
        ErrorCategory::Database => Some("check the graph store connection; memory enrichment degrades silently meanwhile"),
        ErrorCategory::Permission => Some("verify upstream credentials are configured correctly"),
        ErrorCategory::Validation => None,
        ErrorCategory::Logic => Some("the upstream agent returned an unexpected payload shape"),
        ErrorCategory::Resource => Some("increase pool size, raise rate limits, or reduce concurrent session load"),
        ErrorCategory::Unknown => Some("this indicates a gateway bug; file a report with the fingerprint"),
    }
}

/// Runs the full classification pipeline over a raw error message.
pub fn classify(message: &str) -> ClassifiedError {
    classify_with_context(message, None)
}

/// Like [`classify`], but takes a hint about which surface the error
/// occurred on. Health-check paths never escalate to `Critical`: a failed
/// liveness probe is the mechanism working as intended, not an outage.
pub fn classify_with_context(message: &str, endpoint_hint: Option<&str>) -> ClassifiedError {
    let category = categorize(message);
    let mut severity = assess_severity(category, message);
    let is_health_check = endpoint_hint.is_some_and(|e| e.contains("health"));
    if is_health_check && severity == ErrorSeverity::Critical {
        severity = ErrorSeverity::High;
    }
    ClassifiedError {
        category,
        severity,
        fingerprint: fingerprint(category, message),
        message: message.to_string(),
        remediation: suggest_remediation(category).map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorizes_timeout() {
        assert_eq!(categorize("request timed out after 30s"), ErrorCategory::Timeout);
    }

    #[test]
    fn categorizes_rate_limit_as_resource() {
        assert_eq!(categorize("429 Too Many Requests"), ErrorCategory::Resource);
    }

    #[test]
    fn categorizes_graph_store_as_database() {
        assert_eq!(categorize("neo4j connection lost"), ErrorCategory::Database);
    }

    #[test]
    fn unknown_message_falls_back_to_unknown() {
        assert_eq!(categorize("something weird happened"), ErrorCategory::Unknown);
    }

    #[test]
    fn fingerprint_is_stable_across_varying_numbers() {
        let a = fingerprint(ErrorCategory::Timeout, "query to session abc123 timed out after 30s");
        let b = fingerprint(ErrorCategory::Timeout, "query to session xyz789 timed out after 45s");
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_category_escalates_to_critical() {
        assert_eq!(
            assess_severity(ErrorCategory::Unknown, "unexpected panic"),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn cascading_keyword_escalates_severity() {
        let base = assess_severity(ErrorCategory::Network, "connection refused");
        let escalated = assess_severity(ErrorCategory::Network, "cascading connection refused failures");
        assert!(escalated > base);
    }

    #[test]
    fn classify_fills_every_field() {
        let result = classify("connection refused by upstream");
        assert_eq!(result.category, ErrorCategory::Network);
        assert!(result.remediation.is_some());
        assert!(!result.fingerprint.is_empty());
    }

    #[test]
    fn health_check_context_never_reports_critical() {
        let result = classify_with_context("something weird happened", Some("health-check"));
        assert_eq!(result.category, ErrorCategory::Unknown);
        assert_eq!(result.severity, ErrorSeverity::High);
    }
}
