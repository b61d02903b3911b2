//! Prompt builder: renders the system, recovery and clarify prompts.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::core::types::{Mode, TargetOs};
use crate::io::context::ProjectSnapshot;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const RECOVERY_TEMPLATE: &str = include_str!("prompts/recovery.md");
const CLARIFY_TEMPLATE: &str = include_str!("prompts/clarify.md");

/// Fence tag the model is asked to use for commands on `os`.
pub fn shell_tag(os: TargetOs) -> &'static str {
    match os {
        TargetOs::Windows => "powershell",
        TargetOs::Linux | TargetOs::Macos => "bash",
    }
}

/// Inputs for the system prompt of one session.
#[derive(Debug, Clone, Copy)]
pub struct SystemPromptInput<'a> {
    pub mode: Mode,
    pub os: TargetOs,
    pub snapshot: &'a ProjectSnapshot,
    pub context: Option<&'a str>,
}

/// Compiled templates. Build once per process.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .context("compile system prompt template")?;
        env.add_template("recovery", RECOVERY_TEMPLATE)
            .context("compile recovery prompt template")?;
        env.add_template("clarify", CLARIFY_TEMPLATE)
            .context("compile clarify prompt template")?;
        Ok(Self { env })
    }

    pub fn render_system(&self, input: &SystemPromptInput<'_>) -> Result<String> {
        let template = self.env.get_template("system")?;
        let rendered = template.render(context! {
            platform => input.os.shell_description(),
            cwd => input.snapshot.cwd.as_str(),
            snapshot => input.snapshot.render(),
            mode_label => input.mode.label(),
            read_only => input.mode.is_read_only(),
            windows => input.os == TargetOs::Windows,
            shell_tag => shell_tag(input.os),
            context => input.context.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered.trim_end().to_string())
    }

    /// User message asking for a fix of `command`, which failed with `error`.
    pub fn render_recovery(&self, os: TargetOs, command: &str, error: &str) -> Result<String> {
        let template = self.env.get_template("recovery")?;
        let rendered = template.render(context! {
            shell_tag => shell_tag(os),
            command => command.trim(),
            error => error.trim(),
        })?;
        Ok(rendered.trim_end().to_string())
    }

    /// Follow-up sent once when a response yields no commands.
    pub fn render_clarify(&self, os: TargetOs) -> Result<String> {
        let template = self.env.get_template("clarify")?;
        let rendered = template.render(context! { shell_tag => shell_tag(os) })?;
        Ok(rendered.trim_end().to_string())
    }
}
