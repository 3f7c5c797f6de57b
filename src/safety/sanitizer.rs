//! Redaction of secret-shaped substrings in command output.
//!
//! ```rust
//! use shellcage::safety::OutputSanitizer;
//!
//! let sanitizer = OutputSanitizer::new();
//! let out = sanitizer.sanitize("API_KEY=sk-aaabbbcccdddeeefffggghhhiiijjjkkklll");
//! assert!(out.contains("[REDACTED]"));
//! assert!(!out.contains("sk-aaa"));
//! ```

use std::borrow::Cow;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Marker that replaces every redacted span.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// A named secret shape and its replacement template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretPattern {
    pub name: String,
    pub pattern: String,
    /// Replacement, may use `${n}` capture references.
    pub replacement: String,
}

struct CompiledSecret {
    name: String,
    regex: Regex,
    replacement: String,
}

/// Compiled set of secret shapes.
///
/// Patterns run in order, so specific token shapes are replaced before the
/// generic `KEY=value` rule sees them.
pub struct OutputSanitizer {
    patterns: Vec<CompiledSecret>,
}

impl OutputSanitizer {
    pub fn new() -> Self {
        let patterns = default_secret_patterns()
            .into_iter()
            .filter_map(|p| compile_secret(p).ok())
            .collect();
        Self { patterns }
    }

    /// Add a pattern. Invalid regexes are logged and ignored.
    pub fn with_pattern(mut self, pattern: SecretPattern) -> Self {
        match compile_secret(pattern) {
            Ok(compiled) => self.patterns.push(compiled),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to compile secret pattern, skipping");
            }
        }
        self
    }

    /// Replace every secret-shaped span with [`REDACTION_MARKER`].
    ///
    /// Input with nothing to redact comes back borrowed and unchanged.
    pub fn sanitize<'a>(&self, input: &'a str) -> Cow<'a, str> {
        if !self.patterns.iter().any(|p| p.regex.is_match(input)) {
            return Cow::Borrowed(input);
        }

        let mut result = input.to_string();
        for pattern in &self.patterns {
            if let Cow::Owned(replaced) = pattern
                .regex
                .replace_all(&result, pattern.replacement.as_str())
            {
                tracing::trace!(pattern = %pattern.name, "Redacted secret from output");
                result = replaced;
            }
        }
        Cow::Owned(result)
    }

    pub fn sanitize_owned(&self, input: &str) -> String {
        self.sanitize(input).into_owned()
    }

    /// Whether `input` holds anything that would be redacted.
    pub fn contains_secret(&self, input: &str) -> bool {
        self.patterns.iter().any(|p| p.regex.is_match(input))
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

impl Default for OutputSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

fn compile_secret(pattern: SecretPattern) -> Result<CompiledSecret, regex::Error> {
    Ok(CompiledSecret {
        regex: Regex::new(&pattern.pattern)?,
        name: pattern.name,
        replacement: pattern.replacement,
    })
}

fn secret(name: &str, pattern: &str, replacement: &str) -> SecretPattern {
    SecretPattern {
        name: name.to_string(),
        pattern: pattern.to_string(),
        replacement: replacement.to_string(),
    }
}

/// Built-in secret shapes.
pub fn default_secret_patterns() -> Vec<SecretPattern> {
    vec![
        secret("openai_key", r"\bsk-(?:proj-|ant-)?[A-Za-z0-9_-]{20,}", REDACTION_MARKER),
        secret("bearer", r"(?i)\b(bearer\s+)[A-Za-z0-9._~+/=-]{16,}", "${1}[REDACTED]"),
        secret(
            "jwt",
            r"\beyJ[A-Za-z0-9_-]{8,}\.[A-Za-z0-9_-]{4,}\.[A-Za-z0-9_-]{4,}",
            REDACTION_MARKER,
        ),
        secret("github", r"\b(?:ghp|gho|ghs|ghu|ghr)_[A-Za-z0-9]{30,}", REDACTION_MARKER),
        secret("github_pat", r"\bgithub_pat_[A-Za-z0-9_]{40,}", REDACTION_MARKER),
        secret("slack", r"\bxox[abposr]-[A-Za-z0-9-]{10,}", REDACTION_MARKER),
        secret("aws_access_key", r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b", REDACTION_MARKER),
        secret("telegram_bot_token", r"\b\d{8,10}:[A-Za-z0-9_-]{35,}", REDACTION_MARKER),
        secret(
            "private_key",
            r"-----BEGIN (?:RSA |EC |DSA |OPENSSH )?PRIVATE KEY-----[\s\S]*?(?:-----END (?:RSA |EC |DSA |OPENSSH )?PRIVATE KEY-----|$)",
            REDACTION_MARKER,
        ),
        secret(
            "secret_assignment",
            r#"(?i)(\b[A-Z0-9_]*(?:API_?KEY|TOKEN|SECRET|PASSWORD|PASSWD)[A-Z0-9_]*\s*[=:]\s*['"]?)[^\s'"]{16,}"#,
            "${1}[REDACTED]",
        ),
    ]
}
