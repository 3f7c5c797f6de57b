//! Pattern Store: blocked, dangerous and sensitive-file matchers.
//!
//! Patterns are versioned configuration. A [`PatternSet`] is an immutable
//! snapshot; [`PatternStore`] holds the current one behind an `Arc` and
//! [`PatternStore::rescan`] swaps in a freshly loaded snapshot. Readers that
//! already hold a snapshot keep using it.
//!
//! File format (every section optional, missing sections use the built-ins):
//!
//! ```json
//! {
//!   "version": 3,
//!   "blocked":         [{"pattern": "/etc/shadow", "reason": "System file access"}],
//!   "dangerous":       [{"pattern": "\\brm\\s+-", "reason": "Destructive delete"}],
//!   "sensitive_files": [{"pattern": "(^|/)\\.env$", "reason": "Environment file"}]
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::SafetyError;

/// One `{pattern, reason}` pair as it appears in the pattern file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternEntry {
    pub pattern: String,
    pub reason: String,
}

impl PatternEntry {
    fn new(pattern: &str, reason: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// On-disk pattern file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternFile {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub blocked: Option<Vec<PatternEntry>>,
    #[serde(default)]
    pub dangerous: Option<Vec<PatternEntry>>,
    #[serde(default)]
    pub sensitive_files: Option<Vec<PatternEntry>>,
}

/// A compiled command pattern with the reason reported on match.
#[derive(Debug, Clone)]
pub struct BlockedPattern {
    regex: Regex,
    reason: String,
}

impl BlockedPattern {
    pub fn is_match(&self, command: &str) -> bool {
        self.regex.is_match(command)
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }
}

/// A compiled path matcher for files that hold secrets.
#[derive(Debug, Clone)]
pub struct SensitiveFileRule {
    regex: Regex,
    reason: String,
}

impl SensitiveFileRule {
    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

fn compile(entry: &PatternEntry, skipped: &mut usize) -> Option<(Regex, String)> {
    match RegexBuilder::new(&entry.pattern)
        .case_insensitive(true)
        .build()
    {
        Ok(regex) => Some((regex, entry.reason.clone())),
        Err(e) => {
            tracing::warn!(
                pattern = %entry.pattern,
                error = %e,
                "Skipping malformed security pattern"
            );
            *skipped += 1;
            None
        }
    }
}

/// Counts reported by [`PatternSet::summary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSummary {
    pub generation: u64,
    pub version: u32,
    pub blocked: usize,
    pub dangerous: usize,
    pub sensitive: usize,
    pub skipped: usize,
}

/// Immutable snapshot of every compiled pattern.
#[derive(Debug, Clone)]
pub struct PatternSet {
    generation: u64,
    version: u32,
    blocked: Vec<BlockedPattern>,
    dangerous: Vec<BlockedPattern>,
    sensitive: Vec<SensitiveFileRule>,
    skipped: usize,
}

impl PatternSet {
    /// The built-in defaults.
    pub fn builtin() -> Self {
        Self::from_file(PatternFile::default(), 0)
    }

    /// Compile a pattern file, filling missing sections from the built-ins.
    pub fn from_file(file: PatternFile, generation: u64) -> Self {
        let mut skipped = 0;

        let blocked = file
            .blocked
            .unwrap_or_else(default_blocked)
            .iter()
            .filter_map(|e| compile(e, &mut skipped))
            .map(|(regex, reason)| BlockedPattern { regex, reason })
            .collect();
        let dangerous = file
            .dangerous
            .unwrap_or_else(default_dangerous)
            .iter()
            .filter_map(|e| compile(e, &mut skipped))
            .map(|(regex, reason)| BlockedPattern { regex, reason })
            .collect();
        let sensitive = file
            .sensitive_files
            .unwrap_or_else(default_sensitive_files)
            .iter()
            .filter_map(|e| compile(e, &mut skipped))
            .map(|(regex, reason)| SensitiveFileRule { regex, reason })
            .collect();

        Self {
            generation,
            version: file.version,
            blocked,
            dangerous,
            sensitive,
            skipped,
        }
    }

    /// Read and compile a pattern file from disk.
    pub fn load(path: &Path, generation: u64) -> Result<Self, SafetyError> {
        let raw = std::fs::read_to_string(path).map_err(|source| SafetyError::PatternFileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let file: PatternFile =
            serde_json::from_str(&raw).map_err(|source| SafetyError::PatternFileParse {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::from_file(file, generation))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn blocked(&self) -> &[BlockedPattern] {
        &self.blocked
    }

    pub fn dangerous(&self) -> &[BlockedPattern] {
        &self.dangerous
    }

    pub fn sensitive_files(&self) -> &[SensitiveFileRule] {
        &self.sensitive
    }

    /// Entries dropped because their regex did not compile.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn summary(&self) -> PatternSummary {
        PatternSummary {
            generation: self.generation,
            version: self.version,
            blocked: self.blocked.len(),
            dangerous: self.dangerous.len(),
            sensitive: self.sensitive.len(),
            skipped: self.skipped,
        }
    }
}

/// Holds the current [`PatternSet`] and reloads it on request.
#[derive(Debug)]
pub struct PatternStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<PatternSet>>,
    generation: AtomicU64,
}

impl PatternStore {
    /// A store over the built-in defaults. `rescan` is unavailable.
    pub fn builtin() -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(PatternSet::builtin())),
            generation: AtomicU64::new(0),
        }
    }

    /// Load patterns from `path`.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SafetyError> {
        let path = path.into();
        let set = PatternSet::load(&path, 0)?;
        tracing::info!(
            path = %path.display(),
            blocked = set.blocked().len(),
            dangerous = set.dangerous().len(),
            sensitive = set.sensitive_files().len(),
            skipped = set.skipped(),
            "Security patterns loaded"
        );
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(set)),
            generation: AtomicU64::new(0),
        })
    }

    /// Built-ins when `path` is `None`, the file otherwise.
    pub fn from_optional_path(path: Option<PathBuf>) -> Result<Self, SafetyError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::builtin()),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<PatternSet> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Reload the pattern file and swap the new snapshot in.
    ///
    /// On error the current snapshot stays in place.
    pub fn rescan(&self) -> Result<Arc<PatternSet>, SafetyError> {
        let path = self.path.as_deref().ok_or(SafetyError::NoPatternFile)?;
        let next = self.generation.load(Ordering::SeqCst) + 1;
        let set = Arc::new(PatternSet::load(path, next)?);

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&set);
        self.generation.store(next, Ordering::SeqCst);

        tracing::info!(
            generation = next,
            blocked = set.blocked().len(),
            skipped = set.skipped(),
            "Security patterns rescanned"
        );
        Ok(set)
    }
}

impl Default for PatternStore {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Built-in blocked command patterns.
pub fn default_blocked() -> Vec<PatternEntry> {
    vec![
        // Environment dumps
        PatternEntry::new(r"^\s*(env|printenv|set|export)\s*$", "Environment dump"),
        PatternEntry::new(r"(^|[;&|]\s*)env\s*($|[|;&>])", "Environment dump"),
        PatternEntry::new(r"\bprintenv\b", "Environment dump"),
        PatternEntry::new(r"(^|[;&|]\s*)(set|export)\s*($|[|;&>])", "Environment dump"),
        PatternEntry::new(r"\bexport\s+-p\b", "Environment dump"),
        PatternEntry::new(r"\bdeclare\s+-[a-z]*x", "Environment dump"),
        PatternEntry::new(r"\bcompgen\s+-[ev]\b", "Environment dump"),
        PatternEntry::new(r"/proc/[^/\s]+/environ", "Process environment access"),
        PatternEntry::new(r"/proc/[^/\s]+/(cmdline|mem|maps)\b", "Process memory access"),
        // System files
        PatternEntry::new(r"/etc/(passwd|shadow|gshadow|hosts|sudoers)\b", "System file access"),
        PatternEntry::new(r"/run/secrets\b", "Secret mount access"),
        PatternEntry::new(r"/var/run/docker\.sock|/run/docker\.sock", "Container runtime socket"),
        // Credential files
        PatternEntry::new(r"(^|[\s/'\x22=<>:])\.env\b", "Environment file access"),
        PatternEntry::new(r"\.(npmrc|netrc|pypirc|pgpass|git-credentials)\b", "Credential file access"),
        PatternEntry::new(r"\bcredentials\.json\b", "Credential file access"),
        PatternEntry::new(r"\.aws/(credentials|config)\b", "Cloud credential access"),
        PatternEntry::new(r"\.docker/config\.json\b", "Registry credential access"),
        PatternEntry::new(r"\.ssh/|\bid_(rsa|dsa|ecdsa|ed25519)\b", "SSH key access"),
        PatternEntry::new(r"\.(bash|zsh|python)_history\b", "Shell history access"),
        // Scripted environment access
        PatternEntry::new(r"\bos\.environ\b", "Environment access from script"),
        PatternEntry::new(r"\bos\.getenv\b", "Environment access from script"),
        PatternEntry::new(r"\bprocess\.env\b", "Environment access from script"),
        PatternEntry::new(r"\bSystem\.getenv\b", "Environment access from script"),
        PatternEntry::new(r"\bENV\s*\[", "Environment access from script"),
        PatternEntry::new(r"\$ENV\{", "Environment access from script"),
        PatternEntry::new(r"\bgetenv\s*\(", "Environment access from script"),
        // Encoding exfiltration
        PatternEntry::new(
            r"\b(base64|xxd|hexdump|od|uuencode|openssl\s+enc)\b.*\.(env|npmrc|netrc)\b",
            "Encoding of credential file",
        ),
        PatternEntry::new(
            r"\.(env|npmrc|netrc)\b.*\|\s*(base64|xxd|hexdump|od|uuencode)\b",
            "Encoding of credential file",
        ),
        // Internal services
        PatternEntry::new(r"\b(proxy|gateway|core|bot|tools-api|userbot):\d{2,5}\b", "Internal service access"),
        PatternEntry::new(
            r"https?://(proxy|gateway|core|bot|tools-api|userbot)(/|:|\s|$)",
            "Internal service access",
        ),
        PatternEntry::new(r"169\.254\.169\.254|metadata\.google\.internal", "Cloud metadata access"),
        // Resource exhaustion
        PatternEntry::new(r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:", "Fork bomb"),
        PatternEntry::new(r"\bfork\s*\(\s*\)", "Fork bomb"),
        PatternEntry::new(r"\bwhile\s+true\s*;\s*do\s+\S*\s*&\s*done", "Fork bomb"),
        // Packages that dump the environment
        PatternEntry::new(r"\bnpx\s+(-y\s+|--yes\s+)?\S*env\S*", "Environment-dumping package"),
        // Escapes and privilege changes
        PatternEntry::new(r"\bdocker\s+\w+", "Container runtime access"),
        PatternEntry::new(r"\bnsenter\b|\bchroot\b|\bunshare\b", "Namespace escape"),
        PatternEntry::new(r"\bsudo\b|\bsu\s+(-|root)\b|\bsu\s*$", "Privilege escalation"),
        PatternEntry::new(r"/dev/tcp/|/dev/udp/", "Reverse shell"),
        PatternEntry::new(r"\b(nc|ncat|netcat)\b.*\s-[a-z]*e\b", "Reverse shell"),
    ]
}

/// Built-in patterns for commands blocked only in group chats.
pub fn default_dangerous() -> Vec<PatternEntry> {
    vec![
        PatternEntry::new(r"\brm\s+(-[a-z]*\s+)*-[a-z]*[rf]", "Recursive or forced delete"),
        PatternEntry::new(r"\bfind\b.*\s-delete\b", "Bulk delete"),
        PatternEntry::new(r"\bshred\b|\bmkfs(\.\w+)?\b|\bdd\s+if=", "Destructive disk operation"),
        PatternEntry::new(r"\bchmod\b", "Permission change"),
        PatternEntry::new(r"\bchown\b|\bchgrp\b", "Ownership change"),
        PatternEntry::new(r"\b(kill|pkill|killall)\b", "Process termination"),
        PatternEntry::new(
            r"\bgit\s+(push\s+.*(-f|--force)\b|reset\s+--hard|clean\s+-[a-z]*f)",
            "Destructive git operation",
        ),
        PatternEntry::new(r">\s*/dev/(sd|nvme|hd)", "Raw device write"),
    ]
}

/// Built-in sensitive file matchers.
pub fn default_sensitive_files() -> Vec<PatternEntry> {
    vec![
        PatternEntry::new(r"(^|/)\.env(\.[^/]*)?$", "Environment file"),
        PatternEntry::new(r"(^|/)\.(npmrc|netrc|pypirc|pgpass|git-credentials)$", "Credential dotfile"),
        PatternEntry::new(r"(^|/)credentials(\.json)?$", "Credential file"),
        PatternEntry::new(r"(^|/)id_(rsa|dsa|ecdsa|ed25519)$", "SSH private key"),
        PatternEntry::new(r"(^|/)\.ssh/", "SSH directory"),
        PatternEntry::new(r"^/run/secrets(/|$)", "Secret mount"),
        PatternEntry::new(r"\.(pem|key|p12|pfx|keystore)$", "Key material"),
        PatternEntry::new(r"(^|/)\.docker/config\.json$", "Registry credentials"),
        PatternEntry::new(r"(^|/)secrets?\.(json|ya?ml|toml)$", "Secrets file"),
        PatternEntry::new(r"(^|/)\.(bash|zsh|python)_history$", "Shell history"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn test_builtin_compiles_cleanly() {
        let set = PatternSet::builtin();
        assert_eq!(set.skipped(), 0);
        assert_eq!(set.blocked().len(), default_blocked().len());
        assert_eq!(set.dangerous().len(), default_dangerous().len());
        assert_eq!(set.sensitive_files().len(), default_sensitive_files().len());
        assert_eq!(set.generation(), 0);
    }

    #[test]
    fn test_patterns_are_case_insensitive() {
        let set = PatternSet::builtin();
        assert!(set.blocked().iter().any(|p| p.is_match("CAT /ETC/SHADOW")));
    }

    #[test]
    fn test_malformed_pattern_is_skipped() {
        let file = PatternFile {
            version: 2,
            blocked: Some(vec![
                PatternEntry::new("[unclosed", "broken"),
                PatternEntry::new(r"\bforbidden\b", "Custom rule"),
            ]),
            dangerous: None,
            sensitive_files: None,
        };
        let set = PatternSet::from_file(file, 0);
        assert_eq!(set.skipped(), 1);
        assert_eq!(set.blocked().len(), 1);
        assert_eq!(set.blocked()[0].reason(), "Custom rule");
        // Missing sections fall back to the built-ins.
        assert_eq!(set.dangerous().len(), default_dangerous().len());
        assert_eq!(set.version(), 2);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let err = PatternStore::load("/nonexistent/patterns.json").unwrap_err();
        assert!(matches!(err, SafetyError::PatternFileRead { .. }));
    }

    #[test]
    fn test_load_invalid_json_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = PatternStore::load(file.path()).unwrap_err();
        assert!(matches!(err, SafetyError::PatternFileParse { .. }));
    }

    #[test]
    fn test_rescan_swaps_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"version": 1, "blocked": [{{"pattern": "alpha", "reason": "first"}}]}}"#
        )
        .unwrap();
        let store = PatternStore::load(file.path()).unwrap();
        let before = store.snapshot();
        assert_eq!(before.blocked()[0].reason(), "first");

        std::fs::write(
            file.path(),
            r#"{"version": 2, "blocked": [{"pattern": "beta", "reason": "second"}, {"pattern": "gamma", "reason": "third"}]}"#,
        )
        .unwrap();
        let after = store.rescan().unwrap();

        assert_eq!(after.generation(), 1);
        assert_eq!(after.blocked().len(), 2);
        assert_eq!(store.snapshot().version(), 2);
        // The old snapshot is untouched.
        assert_eq!(before.blocked().len(), 1);
        assert_eq!(before.generation(), 0);
    }

    #[test]
    fn test_failed_rescan_keeps_current() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"version": 1}}"#).unwrap();
        let store = PatternStore::load(file.path()).unwrap();

        std::fs::write(file.path(), "garbage").unwrap();
        assert!(store.rescan().is_err());
        assert_eq!(store.snapshot().version(), 1);
        assert_eq!(store.snapshot().generation(), 0);
    }

    #[test]
    fn test_builtin_store_cannot_rescan() {
        let store = PatternStore::builtin();
        assert!(matches!(store.rescan(), Err(SafetyError::NoPatternFile)));
    }
}
