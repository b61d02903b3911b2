//! Shared deterministic types for the agent core.
//!
//! These types define stable contracts between core components and the
//! persisted session file. They do not depend on I/O.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operating persona requested for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Default,
    Review,
    Fix,
    Plan,
    Security,
    Test,
    Refactor,
    Docs,
    Explain,
    Git,
    Infra,
    Architect,
    Optimize,
    Deploy,
    Migrate,
}

impl Mode {
    pub const ALL: [Mode; 15] = [
        Mode::Default,
        Mode::Review,
        Mode::Fix,
        Mode::Plan,
        Mode::Security,
        Mode::Test,
        Mode::Refactor,
        Mode::Docs,
        Mode::Explain,
        Mode::Git,
        Mode::Infra,
        Mode::Architect,
        Mode::Optimize,
        Mode::Deploy,
        Mode::Migrate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Default => "default",
            Mode::Review => "review",
            Mode::Fix => "fix",
            Mode::Plan => "plan",
            Mode::Security => "security",
            Mode::Test => "test",
            Mode::Refactor => "refactor",
            Mode::Docs => "docs",
            Mode::Explain => "explain",
            Mode::Git => "git",
            Mode::Infra => "infra",
            Mode::Architect => "architect",
            Mode::Optimize => "optimize",
            Mode::Deploy => "deploy",
            Mode::Migrate => "migrate",
        }
    }

    /// Human-readable persona label shown in banners and sent in the system prompt.
    pub fn label(self) -> &'static str {
        match self {
            Mode::Default => "Default (coding agent)",
            Mode::Review => "Code Review",
            Mode::Fix => "Debug & Fix",
            Mode::Plan => "Plan Only",
            Mode::Security => "Security Audit (OWASP)",
            Mode::Test => "Test Writer",
            Mode::Refactor => "Refactorer",
            Mode::Docs => "Documentation Writer",
            Mode::Explain => "Explain (junior-friendly)",
            Mode::Git => "Git Expert",
            Mode::Infra => "Infrastructure / DevOps",
            Mode::Architect => "System Architect",
            Mode::Optimize => "Performance Optimizer",
            Mode::Deploy => "Deployer",
            Mode::Migrate => "Migration Planner",
        }
    }

    /// Read-only personas answer with analysis only and never reach PLAN_REVIEW.
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            Mode::Plan | Mode::Review | Mode::Security | Mode::Architect | Mode::Explain
        )
    }

    /// Split a leading mode keyword off a prompt (`fix the build` -> `Fix`, `the build`).
    ///
    /// Only non-default modes are detected; the prompt is returned unchanged otherwise.
    pub fn detect_from_prompt(words: &[String]) -> (Option<Mode>, &[String]) {
        let Some(first) = words.first() else {
            return (None, words);
        };
        match first.to_lowercase().parse::<Mode>() {
            Ok(Mode::Default) | Err(_) => (None, words),
            Ok(mode) => (Some(mode), &words[1..]),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown mode '{0}' (run `brain modes` for the list)")]
pub struct UnknownMode(pub String);

impl FromStr for Mode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| UnknownMode(s.to_string()))
    }
}

/// Operating system family the commands are generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetOs {
    Windows,
    Linux,
    Macos,
}

impl TargetOs {
    pub fn host() -> Self {
        if cfg!(windows) {
            TargetOs::Windows
        } else if cfg!(target_os = "macos") {
            TargetOs::Macos
        } else {
            TargetOs::Linux
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TargetOs::Windows => "windows",
            TargetOs::Linux => "linux",
            TargetOs::Macos => "macos",
        }
    }

    /// Platform description used in the system prompt.
    pub fn shell_description(self) -> &'static str {
        match self {
            TargetOs::Windows => "Windows (PowerShell)",
            TargetOs::Linux => "Linux (bash)",
            TargetOs::Macos => "macOS (bash)",
        }
    }
}

impl fmt::Display for TargetOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conversation role of a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One transcript message exchanged with the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Atomic, ordered group of command lines extracted from one model response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandBlock {
    lines: Vec<String>,
}

impl CommandBlock {
    pub fn new(lines: Vec<String>) -> Self {
        Self { lines }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines joined with `\n`, as handed to the shell.
    pub fn script(&self) -> String {
        self.lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn mode_parses_every_known_keyword() {
        for mode in Mode::ALL {
            assert_eq!(mode.as_str().parse::<Mode>(), Ok(mode));
        }
        assert_eq!(
            "yolo".parse::<Mode>(),
            Err(UnknownMode("yolo".to_string()))
        );
    }

    #[test]
    fn detects_mode_keyword_at_prompt_start() {
        let prompt = words(&["Fix", "the", "build"]);
        let (mode, rest) = Mode::detect_from_prompt(&prompt);
        assert_eq!(mode, Some(Mode::Fix));
        assert_eq!(rest, &prompt[1..]);
    }

    #[test]
    fn ordinary_first_word_keeps_prompt_intact() {
        let prompt = words(&["create", "app.js"]);
        let (mode, rest) = Mode::detect_from_prompt(&prompt);
        assert_eq!(mode, None);
        assert_eq!(rest, prompt.as_slice());

        let prompt = words(&["default", "thing"]);
        assert_eq!(Mode::detect_from_prompt(&prompt).0, None);
    }

    #[test]
    fn read_only_modes() {
        let read_only: Vec<Mode> = Mode::ALL.into_iter().filter(|m| m.is_read_only()).collect();
        assert_eq!(
            read_only,
            vec![
                Mode::Review,
                Mode::Plan,
                Mode::Security,
                Mode::Explain,
                Mode::Architect
            ]
        );
    }

    #[test]
    fn command_block_serializes_as_plain_line_list() {
        let block = CommandBlock::new(vec!["mkdir app".to_string(), "cd app".to_string()]);
        let json = serde_json::to_string(&block).expect("serialize");
        assert_eq!(json, r#"["mkdir app","cd app"]"#);
        assert_eq!(block.script(), "mkdir app\ncd app");
    }
}
