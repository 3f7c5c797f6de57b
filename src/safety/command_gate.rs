//! Static command classification.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::safety::patterns::PatternSet;

/// The kind of chat a command arrives from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    /// One-to-one chat with the bot.
    #[default]
    Private,
    Group,
    Supergroup,
    Channel,
}

impl ChatType {
    /// Group, supergroup and channel chats are shared contexts.
    pub fn is_group(&self) -> bool {
        !matches!(self, Self::Private)
    }
}

impl FromStr for ChatType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "private" => Ok(Self::Private),
            "group" => Ok(Self::Group),
            "supergroup" => Ok(Self::Supergroup),
            "channel" => Ok(Self::Channel),
            other => Err(format!(
                "unknown chat type '{}', expected private, group, supergroup or channel",
                other
            )),
        }
    }
}

impl fmt::Display for ChatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Private => "private",
            Self::Group => "group",
            Self::Supergroup => "supergroup",
            Self::Channel => "channel",
        };
        f.write_str(name)
    }
}

/// Result of classifying a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandVerdict {
    pub blocked: bool,
    pub dangerous: bool,
    pub reason: Option<String>,
}

impl CommandVerdict {
    pub fn allowed() -> Self {
        Self {
            blocked: false,
            dangerous: false,
            reason: None,
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            blocked: true,
            dangerous: false,
            reason: Some(reason.into()),
        }
    }

    fn dangerous(reason: &str, chat: ChatType) -> Self {
        Self {
            blocked: chat.is_group(),
            dangerous: true,
            reason: Some(reason.to_string()),
        }
    }

    /// Neither blocked nor dangerous.
    pub fn is_clean(&self) -> bool {
        !self.blocked && !self.dangerous
    }
}

/// Classify `command` against `patterns` for a chat of kind `chat`.
///
/// Blocked patterns win regardless of chat. Dangerous patterns block only in
/// group chats; in a private chat the verdict is `dangerous` but not blocked.
pub fn classify(patterns: &PatternSet, command: &str, chat: ChatType) -> CommandVerdict {
    if command.trim().is_empty() {
        return CommandVerdict::blocked("Empty command");
    }

    if let Some(pattern) = patterns.blocked().iter().find(|p| p.is_match(command)) {
        return CommandVerdict::blocked(pattern.reason());
    }

    if let Some(pattern) = patterns.dangerous().iter().find(|p| p.is_match(command)) {
        return CommandVerdict::dangerous(pattern.reason(), chat);
    }

    CommandVerdict::allowed()
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn check(command: &str, chat: ChatType) -> CommandVerdict {
        classify(&PatternSet::builtin(), command, chat)
    }

    #[test]
    fn test_env_commands_blocked() {
        for cmd in ["env", "printenv", "set", "export", "env | grep KEY", "printenv HOME"] {
            assert!(check(cmd, ChatType::Private).blocked, "'{cmd}' should be blocked");
        }
    }

    #[test]
    fn test_proc_environ_blocked() {
        for cmd in [
            "cat /proc/self/environ",
            "cat /proc/1/environ",
            "strings /proc/self/environ",
        ] {
            assert!(check(cmd, ChatType::Private).blocked, "'{cmd}' should be blocked");
        }
    }

    #[test]
    fn test_system_files_and_secrets_blocked() {
        for cmd in [
            "cat /etc/passwd",
            "cat /etc/shadow",
            "cat /etc/hosts",
            "cat /run/secrets/api_key",
            "ls /run/secrets/",
            "cat /run/secrets/telegram_token",
        ] {
            assert!(check(cmd, ChatType::Private).blocked, "'{cmd}' should be blocked");
        }
    }

    #[test]
    fn test_dotfiles_blocked() {
        for cmd in ["cat .env", "cat .npmrc", "cat .netrc", "cat credentials.json"] {
            assert!(check(cmd, ChatType::Private).blocked, "'{cmd}' should be blocked");
        }
    }

    #[test]
    fn test_scripted_env_access_blocked() {
        for cmd in [
            r#"python3 -c "import os; print(os.environ)""#,
            r#"python -c "import os; os.environ""#,
            r#"node -e "console.log(process.env)""#,
        ] {
            assert!(check(cmd, ChatType::Private).blocked, "'{cmd}' should be blocked");
        }
    }

    #[test]
    fn test_encoding_exfiltration_blocked() {
        for cmd in ["cat .env | base64", "base64 .env", "xxd .env", "hexdump .env"] {
            assert!(check(cmd, ChatType::Private).blocked, "'{cmd}' should be blocked");
        }
    }

    #[test]
    fn test_internal_services_blocked() {
        for cmd in [
            "curl http://proxy:3200/",
            "wget http://proxy:3200/health",
            "curl http://gateway:4000/",
        ] {
            let verdict = check(cmd, ChatType::Private);
            assert_eq!(verdict.reason.as_deref(), Some("Internal service access"), "{cmd}");
        }
    }

    #[test]
    fn test_fork_bombs_and_npx_blocked() {
        for cmd in [":(){ :|:& };:", "fork()", "npx test-json-env", "npx env-dump"] {
            assert!(check(cmd, ChatType::Private).blocked, "'{cmd}' should be blocked");
        }
    }

    #[test]
    fn test_blocked_regardless_of_chat() {
        for chat in [ChatType::Private, ChatType::Group, ChatType::Channel] {
            let verdict = check("cat /etc/shadow", chat);
            assert!(verdict.blocked);
            assert!(!verdict.dangerous);
        }
    }

    #[test]
    fn test_legitimate_commands_allowed() {
        for cmd in [
            "echo hello",
            "ls -la",
            "pwd",
            "whoami",
            "date",
            "python3 --version",
            "pip install requests",
            "git status",
            "cat file.txt",
            "mkdir test_dir",
            "curl https://example.com",
            "wget https://example.com/file.tar.gz",
            "python3 script.py",
            "node app.js",
            "npm install express",
            "tree .",
            "find . -name '*.py'",
            "grep -r 'hello' .",
            "wc -l file.txt",
            "head -20 file.txt",
            "tail -20 file.txt",
            "sort file.txt",
            "uniq file.txt",
            "diff a.txt b.txt",
        ] {
            let verdict = check(cmd, ChatType::Group);
            assert!(verdict.is_clean(), "'{cmd}' should be allowed: {:?}", verdict.reason);
        }
    }

    #[test]
    fn test_dangerous_blocked_in_groups() {
        for cmd in ["rm -rf ./test", "chmod 777 file.txt", "kill 1234"] {
            for chat in [ChatType::Group, ChatType::Supergroup, ChatType::Channel] {
                let verdict = check(cmd, chat);
                assert!(verdict.blocked && verdict.dangerous, "'{cmd}' in {chat}");
            }
        }
    }

    #[test]
    fn test_dangerous_allowed_in_private() {
        let verdict = check("rm -rf ./x", ChatType::Private);
        assert_eq!(
            verdict,
            CommandVerdict {
                blocked: false,
                dangerous: true,
                reason: Some("Recursive or forced delete".to_string()),
            }
        );
    }

    #[test]
    fn test_empty_command_blocked() {
        assert_eq!(check("   ", ChatType::Private), CommandVerdict::blocked("Empty command"));
    }

    #[test]
    fn test_chat_type_parsing() {
        assert_eq!("private".parse::<ChatType>().unwrap(), ChatType::Private);
        assert_eq!("SuperGroup".parse::<ChatType>().unwrap(), ChatType::Supergroup);
        assert!("dm".parse::<ChatType>().is_err());
        assert!(!ChatType::Private.is_group());
        assert!(ChatType::Channel.is_group());
        assert_eq!(ChatType::default(), ChatType::Private);
    }
}
