//! Output scrubbing before results leave the executor.

use std::sync::LazyLock;

use regex::Regex;

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("static regex compiles"));

static REDACTIONS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (
            r"(?i)(password|passwd|secret|token|api[_-]?key|bearer)\s*[=:]\s*\S+",
            "${1}=<REDACTED>",
        ),
        (r"(?i)(authorization:\s*bearer\s+)\S+", "${1}<REDACTED>"),
        (r"\b[sp]k[_-](?:test|live)[_-]\S+", "<STRIPE_KEY_REDACTED>"),
        (r"\bwhsec_\S+", "<WEBHOOK_SECRET_REDACTED>"),
    ]
    .into_iter()
    .map(|(pattern, replacement)| {
        (
            Regex::new(pattern).expect("static redaction pattern compiles"),
            replacement,
        )
    })
    .collect()
});

/// Strip ANSI escapes, redact credentials, and cut to `max_chars`.
pub fn sanitize_output(raw: &str, max_chars: usize) -> String {
    let mut text = ANSI_ESCAPE.replace_all(raw, "").into_owned();
    for (pattern, replacement) in REDACTIONS.iter() {
        text = pattern.replace_all(&text, *replacement).into_owned();
    }

    let total = text.chars().count();
    if total > max_chars {
        let mut cut: String = text.chars().take(max_chars).collect();
        cut.push_str(&format!("\n\n... (output truncated, {total} total chars)"));
        cut
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ansi() {
        assert_eq!(sanitize_output("\x1b[32mOK\x1b[0m", 100), "OK");
    }

    #[test]
    fn redacts_credentials() {
        let out = sanitize_output("DB_PASSWORD: hunter2\nAuthorization: Bearer abc.def", 1000);
        assert!(!out.contains("hunter2"));
        assert!(!out.contains("abc.def"));
        assert!(out.contains("<REDACTED>"));

        let out = sanitize_output("key sk_live_123abc and whsec_999", 1000);
        assert_eq!(out, "key <STRIPE_KEY_REDACTED> and <WEBHOOK_SECRET_REDACTED>");
    }

    #[test]
    fn truncates_by_chars() {
        let out = sanitize_output(&"é".repeat(20), 5);
        assert!(out.starts_with("ééééé\n\n... (output truncated, 20 total chars)"));
    }

    #[test]
    fn short_output_untouched() {
        assert_eq!(sanitize_output("plain", 10), "plain");
    }
}
