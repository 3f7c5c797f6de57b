//! Security Gate: the static checks every command passes before it reaches a
//! sandbox.
//!
//! - Command classification (blocked, dangerous, allowed) against the
//!   [`PatternStore`]
//! - Redaction of secret-shaped output
//! - Sensitive-file detection
//! - Workspace path containment

pub mod command_gate;
pub mod path_guard;
pub mod patterns;
pub mod sanitizer;

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use command_gate::{ChatType, CommandVerdict, classify};
pub use path_guard::{PathCheck, PathGuard, SHARED_DIR};
pub use patterns::{
    BlockedPattern, PatternEntry, PatternFile, PatternSet, PatternStore, PatternSummary,
    SensitiveFileRule,
};
pub use sanitizer::{OutputSanitizer, REDACTION_MARKER, SecretPattern};

use crate::error::SafetyError;

/// Unified gate combining the pattern store, sanitizer and path guard.
pub struct SecurityGate {
    patterns: Arc<PatternStore>,
    sanitizer: OutputSanitizer,
    paths: PathGuard,
}

impl SecurityGate {
    pub fn new(patterns: Arc<PatternStore>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            patterns,
            sanitizer: OutputSanitizer::new(),
            paths: PathGuard::new(workspace_root),
        }
    }

    /// Built-in patterns over the given workspace root.
    pub fn with_defaults(workspace_root: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(PatternStore::builtin()), workspace_root)
    }

    /// Classify a command for a chat context.
    pub fn classify(&self, command: &str, chat: ChatType) -> CommandVerdict {
        let verdict = classify(&self.patterns.snapshot(), command, chat);
        if verdict.blocked {
            tracing::warn!(
                command = %self.sanitizer.sanitize(command),
                %chat,
                reason = verdict.reason.as_deref().unwrap_or_default(),
                "Command blocked"
            );
        } else if verdict.dangerous {
            tracing::info!(
                command = %self.sanitizer.sanitize(command),
                reason = verdict.reason.as_deref().unwrap_or_default(),
                "Dangerous command allowed in private chat"
            );
        }
        verdict
    }

    /// Redact secret-shaped substrings.
    pub fn sanitize_output<'a>(&self, text: &'a str) -> Cow<'a, str> {
        self.sanitizer.sanitize(text)
    }

    /// Whether `path` names a file that typically holds credentials.
    pub fn is_sensitive_file(&self, path: &str) -> bool {
        self.sensitive_reason(path).is_some()
    }

    /// Reason of the first sensitive-file rule matching `path`.
    pub fn sensitive_reason(&self, path: &str) -> Option<String> {
        self.patterns
            .snapshot()
            .sensitive_files()
            .iter()
            .find(|rule| rule.is_match(path))
            .map(|rule| rule.reason().to_string())
    }

    /// Containment check of `path` against the caller's workspace `cwd`.
    pub fn is_path_safe(&self, path: &Path, cwd: &Path) -> PathCheck {
        self.paths.check(path, cwd)
    }

    /// Resolve a user-supplied path against `cwd`.
    pub fn normalize_path(&self, input: &str, cwd: &Path) -> PathBuf {
        self.paths.normalize(input, cwd)
    }

    /// Reload the pattern file.
    pub fn rescan(&self) -> Result<PatternSummary, SafetyError> {
        self.patterns.rescan().map(|set| set.summary())
    }

    pub fn patterns(&self) -> &PatternStore {
        &self.patterns
    }

    pub fn sanitizer(&self) -> &OutputSanitizer {
        &self.sanitizer
    }

    pub fn path_guard(&self) -> &PathGuard {
        &self.paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_files_detected() {
        let gate = SecurityGate::with_defaults("/workspace");
        for path in [
            ".env",
            "/workspace/123/.env",
            "/run/secrets/api_key",
            "/run/secrets/telegram_token",
            "credentials.json",
            "/home/user/.ssh/id_rsa",
            "id_ed25519",
        ] {
            assert!(gate.is_sensitive_file(path), "'{path}' should be sensitive");
        }
    }

    #[test]
    fn test_normal_files_not_sensitive() {
        let gate = SecurityGate::with_defaults("/workspace");
        for path in [
            "test.py",
            "README.md",
            "/workspace/123/script.js",
            "data.csv",
            "config.yaml",
        ] {
            assert!(!gate.is_sensitive_file(path), "'{path}' should not be sensitive");
        }
    }

    #[test]
    fn test_classify_uses_current_snapshot() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"blocked": []}}"#).unwrap();
        let store = Arc::new(PatternStore::load(file.path()).unwrap());
        let gate = SecurityGate::new(Arc::clone(&store), "/workspace");
        assert!(!gate.classify("cat /etc/shadow", ChatType::Private).blocked);

        std::fs::write(
            file.path(),
            r#"{"blocked": [{"pattern": "/etc/shadow", "reason": "System file access"}]}"#,
        )
        .unwrap();
        let summary = gate.rescan().unwrap();
        assert_eq!(summary.generation, 1);
        assert_eq!(summary.blocked, 1);
        assert!(gate.classify("cat /etc/shadow", ChatType::Private).blocked);
    }

    #[test]
    fn test_sanitize_output_passthrough() {
        let gate = SecurityGate::with_defaults("/workspace");
        assert_eq!(gate.sanitize_output("plain text"), "plain text");
    }
}
