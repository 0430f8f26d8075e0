//! Field-level validators for gateway-facing request bodies.
//!
//! Grounded on `original_source/core/input_validator.py`'s `InputValidator`:
//! chat messages are stripped of XSS/SQL-injection/path-traversal patterns
//! and HTML-escaped rather than rejected outright, while structural fields
//! (session id, project id, address, dict size) are rejected on mismatch.

use std::sync::LazyLock;

use regex::Regex;

const MAX_MESSAGE_CHARS: usize = 50_000;
const MAX_PROJECT_ID_CHARS: usize = 100;
const MAX_DICT_BYTES: usize = 10_000;

static XSS_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?is)<script[^>]*>.*?</script>",
        r"(?i)javascript:",
        r"(?i)on\w+\s*=",
        r"(?is)<iframe[^>]*>",
        r"(?i)vbscript:",
        r"(?i)data:text/html",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static XSS pattern is valid"))
    .collect()
});

static SQL_INJECTION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bUNION\b.*\bSELECT\b",
        r"(?i)\bDROP\b.*\bTABLE\b",
        r"(?i)'\s*OR\s*'",
        r"(?m)--\s*$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static SQL injection pattern is valid"))
    .collect()
});

static PATH_TRAVERSAL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"\.\./+", r"(?i)\.\.%2f", r"/etc/passwd"]
        .iter()
        .map(|p| Regex::new(p).expect("static path traversal pattern is valid"))
        .collect()
});

static SESSION_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}$",
    )
    .expect("static session id pattern is valid")
});

static PROJECT_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w\-]+$").expect("static project id pattern is valid"));

static ADDRESS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-f0-9]{16}$").expect("static address pattern is valid"));

#[derive(Debug, thiserror::Error)]
pub enum ValidationFailure {
    #[error("message too long (max {MAX_MESSAGE_CHARS} characters)")]
    MessageTooLong,
    #[error("invalid session id")]
    InvalidSessionId,
    #[error("invalid number")]
    InvalidNumber,
    #[error("project id too long (max {MAX_PROJECT_ID_CHARS} characters)")]
    ProjectIdTooLong,
    #[error("project id contains invalid characters")]
    ProjectIdInvalidChars,
    #[error("invalid address (must be 16 hex characters)")]
    InvalidAddress,
    #[error("{field} must be a JSON object")]
    NotAnObject { field: String },
    #[error("{field} is too large")]
    TooLarge { field: String },
}

/// Sanitizes a chat message: strips NUL bytes, enforces a length cap, strips
/// (rather than rejects) XSS/SQL-injection/path-traversal patterns, then
/// HTML-escapes and trims the remainder.
pub fn chat_message(value: &str) -> Result<String, ValidationFailure> {
    let mut value = value.replace('\0', "");

    if value.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ValidationFailure::MessageTooLong);
    }

    for pattern in XSS_PATTERNS.iter() {
        value = pattern.replace_all(&value, "").into_owned();
    }
    for pattern in SQL_INJECTION_PATTERNS.iter() {
        value = pattern.replace_all(&value, "").into_owned();
    }
    for pattern in PATH_TRAVERSAL_PATTERNS.iter() {
        value = pattern.replace_all(&value, "").into_owned();
    }

    Ok(html_escape(&value).trim().to_string())
}

fn html_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            other => out.push(other),
        }
    }
    out
}

/// Validates and canonicalizes a session id: lowercase, trimmed, must match
/// the standard UUID shape.
pub fn session_id(value: &str) -> Result<String, ValidationFailure> {
    let value = value.trim().to_lowercase();
    if !SESSION_ID_PATTERN.is_match(&value) {
        return Err(ValidationFailure::InvalidSessionId);
    }
    Ok(value)
}

/// Validates and trims a project id: at most 100 characters, restricted to
/// word characters and hyphens.
pub fn project_id(value: &str) -> Result<String, ValidationFailure> {
    let value = value.trim().to_string();
    if value.len() > MAX_PROJECT_ID_CHARS {
        return Err(ValidationFailure::ProjectIdTooLong);
    }
    if !PROJECT_ID_PATTERN.is_match(&value) {
        return Err(ValidationFailure::ProjectIdInvalidChars);
    }
    Ok(value)
}

/// Coerces a JSON number to its canonical form: integer-valued floats
/// collapse to integers.
pub fn number(value: &serde_json::Value) -> Result<serde_json::Number, ValidationFailure> {
    let as_f64 = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
    .ok_or(ValidationFailure::InvalidNumber)?;

    if as_f64.fract() == 0.0 && as_f64.is_finite() {
        Ok(serde_json::Number::from(as_f64 as i64))
    } else {
        serde_json::Number::from_f64(as_f64).ok_or(ValidationFailure::InvalidNumber)
    }
}

/// Validates a hex address: strips an optional `0x` prefix, requires exactly
/// 16 hex characters.
pub fn address(value: &str) -> Result<String, ValidationFailure> {
    let mut value = value.trim().to_lowercase();
    if let Some(stripped) = value.strip_prefix("0x") {
        value = stripped.to_string();
    }
    if !ADDRESS_PATTERN.is_match(&value) {
        return Err(ValidationFailure::InvalidAddress);
    }
    Ok(value)
}

/// Validates a free-form config dict: must serialize to a JSON object under
/// the size cap.
pub fn dict(
    value: &serde_json::Value,
    field_name: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, ValidationFailure> {
    let Some(map) = value.as_object() else {
        return Err(ValidationFailure::NotAnObject {
            field: field_name.to_string(),
        });
    };
    let encoded = serde_json::to_vec(value).unwrap_or_default();
    if encoded.len() > MAX_DICT_BYTES {
        return Err(ValidationFailure::TooLarge {
            field: field_name.to_string(),
        });
    }
    Ok(map.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_strips_script_tags() {
        let out = chat_message("hello <script>alert(1)</script> world").unwrap();
        assert!(!out.contains("script"));
        assert!(out.contains("hello"));
        assert!(out.contains("world"));
    }

    #[test]
    fn chat_message_rejects_over_length() {
        let long = "a".repeat(MAX_MESSAGE_CHARS + 1);
        assert!(matches!(
            chat_message(&long),
            Err(ValidationFailure::MessageTooLong)
        ));
    }

    #[test]
    fn chat_message_escapes_html() {
        let out = chat_message("<b>bold</b> & \"quoted\"").unwrap();
        assert!(out.contains("&lt;b&gt;"));
        assert!(out.contains("&amp;"));
        assert!(out.contains("&quot;"));
    }

    #[test]
    fn session_id_normalizes_case() {
        assert_eq!(
            session_id("550E8400-E29B-41D4-A716-446655440000").unwrap(),
            "550e8400-e29b-41d4-a716-446655440000"
        );
    }

    #[test]
    fn session_id_rejects_non_uuid() {
        assert!(session_id("not-a-uuid").is_err());
    }

    #[test]
    fn project_id_rejects_invalid_chars() {
        assert!(project_id("valid_project-1").is_ok());
        assert!(project_id("invalid project!").is_err());
    }

    #[test]
    fn number_collapses_integer_valued_floats() {
        let n = number(&serde_json::json!(4.0)).unwrap();
        assert_eq!(n.as_i64(), Some(4));
        let n = number(&serde_json::json!(4.5)).unwrap();
        assert!(n.as_f64().is_some());
    }

    #[test]
    fn address_strips_0x_prefix() {
        assert_eq!(address("0xABCDEF0123456789").unwrap(), "abcdef0123456789");
    }

    #[test]
    fn address_rejects_wrong_length() {
        assert!(address("0xabcd").is_err());
    }

    #[test]
    fn dict_rejects_non_object() {
        assert!(dict(&serde_json::json!([1, 2, 3]), "config").is_err());
    }

    #[test]
    fn dict_rejects_oversized_payload() {
        let big: serde_json::Value =
            serde_json::json!({ "x": "y".repeat(MAX_DICT_BYTES + 1) });
        assert!(matches!(
            dict(&big, "config"),
            Err(ValidationFailure::TooLarge { .. })
        ));
    }
}
