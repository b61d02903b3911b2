//! Operator-facing terminal output.
//!
//! Everything the operator reads goes to stdout through here; diagnostics go
//! through `tracing` to stderr.

use dialoguer::console::style;

use crate::core::safety::Verdict;
use crate::core::session::Event;
use crate::core::state::FsmState;
use crate::core::types::{CommandBlock, Mode};
use crate::io::context::Refusal;
use crate::io::shell::ExecResult;
use crate::io::session_store::SessionSummary;

pub fn session_started(session_id: &str, mode: Mode) {
    println!(
        "{} {} {}",
        style("brain").bold().cyan(),
        style(mode.label()).bold(),
        style(format!("session {session_id}")).dim()
    );
}

pub fn response(text: &str) {
    println!("\n{}\n", text.trim());
}

pub fn plan(blocks: &[CommandBlock]) {
    println!("{}", style(format!("Plan: {} block(s)", blocks.len())).bold());
    for (index, block) in blocks.iter().enumerate() {
        println!("{}", style(format!("  [{}]", index + 1)).dim());
        for line in block.lines() {
            println!("    {}", style(line).yellow());
        }
    }
}

pub fn running(block: &CommandBlock) {
    for line in block.lines() {
        println!("{} {}", style("$").dim(), style(line).bold());
    }
}

pub fn exec_result(result: &ExecResult) {
    if !result.stdout.trim().is_empty() {
        println!("{}", result.stdout.trim_end());
    }
    if !result.stderr.trim().is_empty() {
        println!("{}", style(result.stderr.trim_end()).red());
    }
    if result.success() {
        println!("{}", style("ok").green());
    } else {
        println!("{}", style(format!("failed (exit code {})", result.exit_code)).red().bold());
    }
}

pub fn refusal(verdict: &Verdict) {
    let reason = verdict.reason.as_deref().unwrap_or("blocked");
    let category = verdict
        .category
        .map(|c| format!(" [{c}]"))
        .unwrap_or_default();
    println!(
        "{} {reason}{category}",
        style("Refused by safety guard:").red().bold()
    );
}

pub fn downgrade(verdict: &Verdict) {
    let reason = verdict.reason.as_deref().unwrap_or("dangerous command");
    println!(
        "{} {reason}; each block will need confirmation",
        style("Auto-execute disabled:").yellow().bold()
    );
}

pub fn attachment_refused(refusal: &Refusal) {
    println!(
        "{} {}: {}",
        style("Not attached").yellow(),
        refusal.path.display(),
        refusal.reason
    );
}

pub fn error(message: &str) {
    println!("{} {message}", style("error:").red().bold());
}

pub fn finished(session_id: &str, state: FsmState, executed: u32, failed: u32) {
    let label = match state {
        FsmState::Done => style(state.as_str()).green().bold(),
        FsmState::Aborted => style(state.as_str()).red().bold(),
        _ => style(state.as_str()).yellow().bold(),
    };
    println!(
        "{label} {} {}",
        style(format!("executed={executed} failed={failed}")).dim(),
        style(format!("session {session_id}")).dim()
    );
}

pub fn session_row(summary: &SessionSummary) {
    let prompt: String = summary.prompt.chars().take(60).collect();
    println!(
        "{}  {:<16} {:<10} {}  {}",
        summary.session_id,
        summary.state.as_str(),
        summary.mode.as_str(),
        summary.started_at.format("%Y-%m-%d %H:%M"),
        prompt
    );
}

pub fn event_row(index: usize, event: &Event) {
    let metadata = event
        .metadata
        .as_ref()
        .map(|m| serde_json::Value::Object(m.clone()).to_string())
        .unwrap_or_default();
    println!(
        "{:>3}  {}  {} -> {}  {}",
        index,
        event.timestamp.format("%H:%M:%S%.3f"),
        event.from,
        style(event.to.as_str()).bold(),
        style(metadata).dim()
    );
}
