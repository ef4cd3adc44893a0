//! Secret redaction for raw AI output before it is persisted.

use regex::Regex;
use std::sync::LazyLock;

static SK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)sk-[a-zA-Z0-9_-]{20,}").expect("valid regex"));

static ENV_SECRET_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(\b(?:api[_-]?key|secret|password|token)\s*[:=]\s*["']?)([a-zA-Z0-9_-]{20,})(["']?)"#)
        .expect("valid regex")
});

/// Replace anything that looks like a secret with a placeholder.
#[must_use]
pub fn redact_secrets(text: &str) -> String {
    let out = SK_PATTERN.replace_all(text, "sk-***REDACTED***");
    ENV_SECRET_PATTERN
        .replace_all(&out, "${1}***REDACTED***${3}")
        .into_owned()
}
