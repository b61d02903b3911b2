//! Operator prompts.
//!
//! The [`Confirmer`] trait is the seam the orchestrator asks yes/no questions
//! through. Tests use scripted confirmers with predetermined answers.

use std::io::IsTerminal;

use anyhow::{Context, Result};
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input, Password};
use tracing::warn;

pub trait Confirmer {
    /// Ask `question`; `false` means declined.
    fn confirm(&self, question: &str) -> Result<bool>;
}

/// Interactive yes/no prompt on the controlling terminal.
///
/// Without a terminal on stdin every question is answered "no", so nothing
/// runs unattended.
pub struct TerminalConfirmer {
    theme: ColorfulTheme,
}

impl TerminalConfirmer {
    pub fn new() -> Self {
        Self {
            theme: ColorfulTheme::default(),
        }
    }
}

impl Default for TerminalConfirmer {
    fn default() -> Self {
        Self::new()
    }
}

impl Confirmer for TerminalConfirmer {
    fn confirm(&self, question: &str) -> Result<bool> {
        if !std::io::stdin().is_terminal() {
            warn!(question, "no terminal attached; treating as declined");
            return Ok(false);
        }
        Confirm::with_theme(&self.theme)
            .with_prompt(question)
            .default(false)
            .interact()
            .context("read confirmation")
    }
}

/// Masked prompt for the API key used by `brain auth`.
pub fn prompt_api_key() -> Result<String> {
    let key = Password::with_theme(&ColorfulTheme::default())
        .with_prompt("API key")
        .interact()
        .context("read api key")?;
    Ok(key.trim().to_string())
}

/// One line of input for the interactive loop. Empty input is allowed.
pub fn prompt_line(prompt: &str) -> Result<String> {
    Input::<String>::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .allow_empty(true)
        .interact_text()
        .context("read prompt")
}
