//! Continue a persisted session from its pending command blocks.

use anyhow::Result;
use serde_json::json;
use thiserror::Error;
use tracing::{info, instrument};

use crate::core::fsm::Fsm;
use crate::core::session::{Session, metadata};
use crate::core::state::FsmState;
use crate::io::confirm::Confirmer;
use crate::io::model::ModelClient;
use crate::io::shell::ShellRunner;
use crate::orchestrator::{BlockRun, Orchestrator, RunOutcome, Turn, execute_blocks};
use crate::ui;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResumeError {
    #[error("session in state {state} cannot be resumed")]
    NotResumable { state: FsmState },
}

#[derive(Debug)]
pub enum ResumeOutcome {
    /// No pending blocks; the session was left as it was.
    NothingPending { state: FsmState },
    /// The operator declined; the session was left as it was.
    Declined,
    /// A block failed again; the session stays at CMD_FAILED.
    Halted(RunOutcome),
    Finished(RunOutcome),
}

/// Pick up `session` where it stopped.
///
/// Blocks already executed are never re-run: only `pending_commands` is
/// replayed, in order, and replay stops at the first failure.
#[instrument(skip_all, fields(session_id = %session.session_id, state = %session.current_state))]
pub fn resume_session<M, S, C>(
    orch: &Orchestrator<'_, M, S, C>,
    session: Session,
) -> Result<ResumeOutcome>
where
    M: ModelClient,
    S: ShellRunner,
    C: Confirmer,
{
    let state = session.current_state;
    if session.pending_commands.is_empty() {
        info!("nothing pending");
        return Ok(ResumeOutcome::NothingPending { state });
    }

    match state {
        FsmState::AwaitingConfirm | FsmState::CmdSuccess | FsmState::Executing => {
            ui::plan(&session.pending_commands);
            if !orch.confirmer().confirm("Resume and run the pending blocks?")? {
                return Ok(ResumeOutcome::Declined);
            }
            let mut fsm = Fsm::restore(session, orch.sink());
            let run = execute_blocks(&mut fsm, orch.shell(), orch.confirmer(), false)?;
            let outcome = orch.finish(fsm.into_session());
            Ok(match run {
                BlockRun::Failed { .. } => ResumeOutcome::Halted(outcome),
                BlockRun::Drained | BlockRun::Declined => ResumeOutcome::Finished(outcome),
            })
        }
        FsmState::CmdFailed | FsmState::ErrorRecovery => {
            if !orch
                .confirmer()
                .confirm("The last command failed. Let brain try to fix it?")?
            {
                return Ok(ResumeOutcome::Declined);
            }
            let prepared = orch.prepare_restored(&session)?;
            let command = session
                .pending_commands
                .first()
                .map(|block| block.script())
                .unwrap_or_default();
            let error = last_failure(&session);
            let mut fsm = Fsm::restore(session, orch.sink());
            if state == FsmState::CmdFailed {
                fsm.transition(
                    FsmState::ErrorRecovery,
                    Some(metadata([("command", json!(command)), ("resumed", json!(true))])),
                )?;
            }
            let outcome = orch.drive(fsm, Turn::Recovery { command, error }, &prepared)?;
            Ok(ResumeOutcome::Finished(outcome))
        }
        state => Err(ResumeError::NotResumable { state }.into()),
    }
}

/// Error text recorded by the most recent CMD_FAILED event.
fn last_failure(session: &Session) -> String {
    session
        .events
        .iter()
        .rev()
        .find(|event| event.to == FsmState::CmdFailed)
        .and_then(|event| event.metadata.as_ref())
        .and_then(|meta| meta.get("error"))
        .and_then(|value| value.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| "the command failed".to_string())
}
