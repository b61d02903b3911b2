//! Execution engine: runs one command block in the host shell.
//!
//! The [`ShellRunner`] trait decouples orchestration from real process
//! spawning. Tests use scripted runners that return predetermined results.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::safety::is_system_path;
use crate::core::types::CommandBlock;
use crate::io::process::{CommandOutput, SpawnError, run_command_with_timeout};

pub const EXIT_TIMEOUT: i32 = 124;
pub const EXIT_REFUSED_WORKDIR: i32 = 126;
pub const EXIT_SPAWN_FAILED: i32 = 127;

/// Outcome of one block. Failures are data, never errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    fn failed(exit_code: i32, stderr: String) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr,
            timed_out: false,
        }
    }

    /// Error text handed to the model during recovery.
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exit code {}\n{}", self.exit_code, self.stdout.trim())
        } else {
            format!("exit code {}\n{stderr}", self.exit_code)
        }
    }
}

pub trait ShellRunner {
    fn execute(&self, block: &CommandBlock) -> ExecResult;
}

/// Runs blocks in PowerShell on Windows and bash elsewhere.
#[derive(Debug, Clone)]
pub struct HostShell {
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl ShellRunner for HostShell {
    #[instrument(skip_all, fields(workdir = %self.workdir.display(), lines = block.lines().len()))]
    fn execute(&self, block: &CommandBlock) -> ExecResult {
        let workdir = self.workdir.to_string_lossy();
        if is_system_path(&format!("{workdir}/")) {
            warn!("refusing to run in a system directory");
            return ExecResult::failed(
                EXIT_REFUSED_WORKDIR,
                format!("refusing to run in system directory {workdir}"),
            );
        }

        let result = match self.run(block) {
            Ok(output) => self.to_result(output),
            Err(err) if err.downcast_ref::<SpawnError>().is_some() => {
                ExecResult::failed(EXIT_SPAWN_FAILED, format!("{err:#}"))
            }
            Err(err) => ExecResult::failed(1, format!("{err:#}")),
        };
        info!(
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            "block finished"
        );
        result
    }
}

impl HostShell {
    #[cfg(windows)]
    fn run(&self, block: &CommandBlock) -> Result<CommandOutput> {
        use std::io::Write;

        use anyhow::Context;

        let mut file = tempfile::Builder::new()
            .prefix("brain-")
            .suffix(".ps1")
            .tempfile()
            .context("create temp script")?;
        file.write_all(powershell_script(&self.workdir, block).as_bytes())
            .context("write temp script")?;
        // Dropping the handle keeps the file; dropping `script` deletes it.
        let script = file.into_temp_path();

        let mut cmd = Command::new("powershell.exe");
        cmd.args([
            "-NoProfile",
            "-NonInteractive",
            "-ExecutionPolicy",
            "Bypass",
            "-File",
        ])
        .arg(&*script)
        .current_dir(&self.workdir);
        run_command_with_timeout(cmd, self.timeout, self.output_limit_bytes)
    }

    #[cfg(not(windows))]
    fn run(&self, block: &CommandBlock) -> Result<CommandOutput> {
        let mut cmd = Command::new("bash");
        cmd.args(["--noprofile", "--norc", "-e", "-c"])
            .arg(block.script())
            .current_dir(&self.workdir);
        run_command_with_timeout(cmd, self.timeout, self.output_limit_bytes)
    }

    fn to_result(&self, output: CommandOutput) -> ExecResult {
        let stdout = output.stdout_text();
        let mut stderr = output.stderr_text();
        if output.timed_out {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!(
                "command timed out after {}s",
                self.timeout.as_secs()
            ));
            return ExecResult {
                exit_code: EXIT_TIMEOUT,
                stdout,
                stderr,
                timed_out: true,
            };
        }
        ExecResult {
            exit_code: exit_code(&output),
            stdout,
            stderr,
            timed_out: false,
        }
    }
}

#[cfg(unix)]
fn exit_code(output: &CommandOutput) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    output
        .status
        .code()
        .or_else(|| output.status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(output: &CommandOutput) -> i32 {
    output.status.code().unwrap_or(1)
}

/// PowerShell script body: stop on first error, pinned to `workdir`.
pub fn powershell_script(workdir: &Path, block: &CommandBlock) -> String {
    let dir = workdir.to_string_lossy().replace('\'', "''");
    format!(
        "$ErrorActionPreference = \"Stop\"\nSet-Location -LiteralPath '{dir}'\n{}\n",
        block.script()
    )
}
