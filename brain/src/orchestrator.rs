//! Drives one session through prompt, plan, confirm, execute and recover.
//!
//! The session is processed as a queue of [`Turn`]s. The initial turn comes
//! from the operator's prompt; a failed block whose fix the operator accepts
//! queues one [`Turn::Recovery`]. Each turn yields at most one follow-up, so
//! recovery never nests. Every state change goes through the FSM and is
//! persisted before the next step starts.

use std::collections::VecDeque;
use std::path::PathBuf;

use anyhow::Result;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::extract::extract;
use crate::core::fsm::{Fsm, SessionSink};
use crate::core::safety::{Verdict, review_plan};
use crate::core::session::{Metadata, NewSession, Session, metadata};
use crate::core::state::FsmState;
use crate::core::types::{CommandBlock, Message, Mode, TargetOs};
use crate::io::config::AgentConfig;
use crate::io::confirm::Confirmer;
use crate::io::context::{load_attachments, scan_project};
use crate::io::model::{ModelClient, ModelError, ModelRequest};
use crate::io::prompt::{PromptEngine, SystemPromptInput};
use crate::io::shell::ShellRunner;
use crate::io::telemetry::{TelemetryHandle, TelemetryReporter};
use crate::ui;

const ERROR_METADATA_CHARS: usize = 2_000;

/// No credential is configured; nothing was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no API key configured; run `brain auth` or set BRAIN_API_KEY")]
pub struct MissingApiKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub prompt: String,
    pub mode: Mode,
    pub auto_execute: bool,
    pub context_files: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub session_id: String,
    pub final_state: FsmState,
    pub commands_executed: u32,
    pub commands_failed: u32,
    /// Present when the session reached DONE or ABORTED.
    pub telemetry: Option<TelemetryHandle>,
}

/// One round trip with the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Turn {
    Initial,
    Recovery { command: String, error: String },
}

/// How a run over the pending blocks ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BlockRun {
    /// Every block succeeded; the session is DONE.
    Drained,
    /// The operator said no; the session is ABORTED.
    Declined,
    /// The head block failed; the session is at CMD_FAILED.
    Failed { command: String, error: String },
}

/// System prompt and attachments for the model calls of one session.
#[derive(Debug, Clone)]
pub(crate) struct Prepared {
    system: String,
    context: Option<String>,
}

struct Reply {
    text: String,
    blocks: Vec<CommandBlock>,
    clarified: bool,
}

pub struct Orchestrator<'a, M, S, C> {
    config: &'a AgentConfig,
    sink: &'a dyn SessionSink,
    model: &'a M,
    shell: &'a S,
    confirmer: &'a C,
    telemetry: &'a TelemetryReporter,
    prompts: PromptEngine,
    os: TargetOs,
}

impl<'a, M, S, C> Orchestrator<'a, M, S, C>
where
    M: ModelClient,
    S: ShellRunner,
    C: Confirmer,
{
    pub fn new(
        config: &'a AgentConfig,
        sink: &'a dyn SessionSink,
        model: &'a M,
        shell: &'a S,
        confirmer: &'a C,
        telemetry: &'a TelemetryReporter,
    ) -> Result<Self> {
        Ok(Self {
            config,
            sink,
            model,
            shell,
            confirmer,
            telemetry,
            prompts: PromptEngine::new()?,
            os: TargetOs::host(),
        })
    }

    /// Generate commands for a different platform than the host.
    pub fn with_os(mut self, os: TargetOs) -> Self {
        self.os = os;
        self
    }

    pub(crate) fn sink(&self) -> &'a dyn SessionSink {
        self.sink
    }

    pub(crate) fn confirmer(&self) -> &'a C {
        self.confirmer
    }

    pub(crate) fn shell(&self) -> &'a S {
        self.shell
    }

    /// Run one prompt to DONE or ABORTED.
    ///
    /// Model and command failures end the session, they are not errors. An
    /// error means the session could not be recorded or no key is configured.
    #[instrument(skip_all, fields(mode = %request.mode, auto_execute = request.auto_execute))]
    pub fn run(&self, request: RunRequest) -> Result<RunOutcome> {
        if self.config.api_key.is_none() {
            return Err(MissingApiKey.into());
        }

        let session = Session::new(NewSession {
            mode: request.mode,
            os: self.os,
            model: self.config.model.clone(),
            prompt: request.prompt,
            auto_execute: request.auto_execute,
        });
        info!(session_id = %session.session_id, "session started");
        ui::session_started(&session.session_id, session.mode);

        let mut fsm = Fsm::new(session, self.sink);
        fsm.transition(
            FsmState::AuthCheck,
            Some(metadata([("credential", "present")])),
        )?;
        let prepared = self.scan_context(&mut fsm, &request.context_files)?;
        self.drive(fsm, Turn::Initial, &prepared)
    }

    /// Process turns until the queue is empty, then report.
    pub(crate) fn drive(
        &self,
        mut fsm: Fsm<'_>,
        first: Turn,
        prepared: &Prepared,
    ) -> Result<RunOutcome> {
        let mut queue = VecDeque::from([first]);
        while let Some(turn) = queue.pop_front() {
            if let Some(next) = self.run_turn(&mut fsm, turn, prepared)? {
                queue.push_back(next);
            }
        }
        Ok(self.finish(fsm.into_session()))
    }

    pub(crate) fn finish(&self, session: Session) -> RunOutcome {
        let telemetry = session
            .current_state
            .is_terminal()
            .then(|| self.telemetry.report(&session));
        ui::finished(
            &session.session_id,
            session.current_state,
            session.commands_executed,
            session.commands_failed,
        );
        RunOutcome {
            session_id: session.session_id,
            final_state: session.current_state,
            commands_executed: session.commands_executed,
            commands_failed: session.commands_failed,
            telemetry,
        }
    }

    fn scan_context(&self, fsm: &mut Fsm<'_>, files: &[PathBuf]) -> Result<Prepared> {
        let snapshot = scan_project(&self.config.workdir);
        let attachments = load_attachments(&self.config.workdir, files);
        for refusal in &attachments.refused {
            ui::attachment_refused(refusal);
        }
        let context = attachments.render();
        let system = self.prompts.render_system(&SystemPromptInput {
            mode: fsm.session().mode,
            os: fsm.session().os,
            snapshot: &snapshot,
            context: context.as_deref(),
        })?;

        let refused: Vec<Value> = attachments
            .refused
            .iter()
            .map(|r| json!({"path": r.path.display().to_string(), "reason": r.reason}))
            .collect();
        fsm.transition(
            FsmState::ContextScan,
            Some(metadata([
                ("entries", json!(snapshot.entries.len())),
                ("attachments", json!(attachments.accepted.len())),
                ("refused", Value::Array(refused)),
            ])),
        )?;
        Ok(Prepared { system, context })
    }

    /// Prompt material for a restored session. Attachments are not re-read.
    pub(crate) fn prepare_restored(&self, session: &Session) -> Result<Prepared> {
        let snapshot = scan_project(&self.config.workdir);
        let system = self.prompts.render_system(&SystemPromptInput {
            mode: session.mode,
            os: session.os,
            snapshot: &snapshot,
            context: None,
        })?;
        Ok(Prepared {
            system,
            context: None,
        })
    }

    fn run_turn(
        &self,
        fsm: &mut Fsm<'_>,
        turn: Turn,
        prepared: &Prepared,
    ) -> Result<Option<Turn>> {
        match turn {
            Turn::Initial => fsm.transition(FsmState::ApiCall, None)?,
            Turn::Recovery { command, error } => {
                let message = self
                    .prompts
                    .render_recovery(fsm.session().os, &command, &error)?;
                fsm.transition_with(
                    FsmState::ApiCall,
                    Some(metadata([("recovery", true)])),
                    |s| s.messages.push(Message::user(message)),
                )?;
            }
        }

        let Some(reply) = self.ask_model(fsm, prepared)? else {
            return Ok(None);
        };

        ui::response(&reply.text);
        let mut display_meta = metadata([("blocks", reply.blocks.len())]);
        if reply.clarified {
            display_meta.insert("clarified".to_string(), Value::Bool(true));
        }
        let Reply { text, blocks, .. } = reply;
        fsm.transition_with(FsmState::Display, Some(display_meta), |s| {
            s.messages.push(Message::assistant(text));
        })?;

        let read_only = fsm.session().mode.is_read_only();
        if read_only || blocks.is_empty() {
            let reason = if read_only {
                "read-only mode"
            } else {
                "no commands"
            };
            fsm.transition(FsmState::Done, Some(metadata([("reason", reason)])))?;
            return Ok(None);
        }

        if !self.review(fsm, blocks)? {
            return Ok(None);
        }

        match execute_blocks(fsm, self.shell, self.confirmer, true)? {
            BlockRun::Drained | BlockRun::Declined => Ok(None),
            BlockRun::Failed { command, error } => self.offer_recovery(fsm, command, error),
        }
    }

    /// Call the model, re-prompting once when an executing mode gets no commands.
    ///
    /// Returns `None` after aborting the session on a model failure.
    fn ask_model(&self, fsm: &mut Fsm<'_>, prepared: &Prepared) -> Result<Option<Reply>> {
        let text = match self.call_model(fsm.session(), prepared) {
            Ok(text) => text,
            Err(err) => {
                self.abort_on_model_error(fsm, &err)?;
                return Ok(None);
            }
        };
        let blocks = extract(&text);
        if !blocks.is_empty() || fsm.session().mode.is_read_only() {
            return Ok(Some(Reply {
                text,
                blocks,
                clarified: false,
            }));
        }

        debug!("no commands in reply; asking once more");
        let clarify = self.prompts.render_clarify(fsm.session().os)?;
        fsm.update(|s| {
            s.messages.push(Message::assistant(text));
            s.messages.push(Message::user(clarify));
        });
        match self.call_model(fsm.session(), prepared) {
            Ok(text) => Ok(Some(Reply {
                blocks: extract(&text),
                text,
                clarified: true,
            })),
            Err(err) => {
                self.abort_on_model_error(fsm, &err)?;
                Ok(None)
            }
        }
    }

    fn call_model(&self, session: &Session, prepared: &Prepared) -> Result<String> {
        let messages = std::iter::once(Message::system(prepared.system.clone()))
            .chain(session.messages.iter().cloned())
            .collect();
        self.model.complete(&ModelRequest {
            model: session.model.clone(),
            messages,
            mode: session.mode,
            os: session.os,
            context: prepared.context.clone(),
        })
    }

    fn abort_on_model_error(&self, fsm: &mut Fsm<'_>, err: &anyhow::Error) -> Result<()> {
        warn!(err = %err, "model call failed");
        ui::error(&format!("{err:#}"));
        let unauthorized = matches!(
            err.downcast_ref::<ModelError>(),
            Some(ModelError::Unauthorized { .. })
        );
        fsm.transition(
            FsmState::Aborted,
            Some(metadata([
                ("reason", json!("model call failed")),
                ("error", json!(preview(&format!("{err:#}")))),
                ("unauthorized", json!(unauthorized)),
            ])),
        )
    }

    /// PLAN_REVIEW then AWAITING_CONFIRM. Returns `false` when the plan was refused.
    fn review(&self, fsm: &mut Fsm<'_>, blocks: Vec<CommandBlock>) -> Result<bool> {
        let review = review_plan(&blocks, !fsm.session().requires_confirmation());
        let lines: usize = blocks.iter().map(|b| b.lines().len()).sum();
        fsm.transition(
            FsmState::PlanReview,
            Some(metadata([("blocks", blocks.len()), ("lines", lines)])),
        )?;

        if let Some(refusal) = &review.refusal {
            ui::refusal(refusal);
            let mut meta = verdict_metadata(refusal);
            meta.insert("reason".to_string(), json!("blocked by safety guard"));
            fsm.transition(FsmState::Aborted, Some(meta))?;
            return Ok(false);
        }

        let mut meta = metadata([("blocks", blocks.len())]);
        let downgraded = review.downgrade.is_some();
        if let Some(verdict) = &review.downgrade {
            ui::downgrade(verdict);
            meta.insert("downgraded".to_string(), Value::Bool(true));
            meta.extend(verdict_metadata(verdict));
        }
        ui::plan(&blocks);
        fsm.transition_with(FsmState::AwaitingConfirm, Some(meta), move |s| {
            s.pending_commands = blocks;
            if downgraded {
                s.auto_execute_downgraded = true;
            }
        })?;
        Ok(true)
    }

    /// Ask whether to let the model fix a failed block; accepted means a recovery turn.
    pub(crate) fn offer_recovery(
        &self,
        fsm: &mut Fsm<'_>,
        command: String,
        error: String,
    ) -> Result<Option<Turn>> {
        if !self
            .confirmer
            .confirm("The command failed. Let brain try to fix it?")?
        {
            fsm.abort("fix declined")?;
            return Ok(None);
        }
        if fsm.state() == FsmState::CmdFailed {
            fsm.transition(
                FsmState::ErrorRecovery,
                Some(metadata([("command", command.as_str())])),
            )?;
        }
        Ok(Some(Turn::Recovery { command, error }))
    }
}

/// Run pending blocks in order from AWAITING_CONFIRM, EXECUTING or CMD_SUCCESS.
///
/// With `confirm_each`, every block is confirmed first while the session
/// requires confirmation. A block in flight (state EXECUTING) is re-run
/// without a new EXECUTING event.
pub(crate) fn execute_blocks<S: ShellRunner, C: Confirmer>(
    fsm: &mut Fsm<'_>,
    shell: &S,
    confirmer: &C,
    confirm_each: bool,
) -> Result<BlockRun> {
    loop {
        let executed = fsm.session().commands_executed;
        let Some(block) = fsm.session().pending_commands.first().cloned() else {
            fsm.transition(FsmState::Done, Some(metadata([("executed", executed)])))?;
            return Ok(BlockRun::Drained);
        };

        ui::running(&block);
        if fsm.state() != FsmState::Executing {
            let ask = confirm_each && fsm.session().requires_confirmation();
            if ask && !confirmer.confirm("Run this block?")? {
                fsm.abort("declined by operator")?;
                return Ok(BlockRun::Declined);
            }
            fsm.transition(
                FsmState::Executing,
                Some(metadata([
                    ("block", json!(executed + 1)),
                    ("lines", json!(block.lines().len())),
                ])),
            )?;
        }

        let result = shell.execute(&block);
        ui::exec_result(&result);

        if result.success() {
            fsm.transition_with(
                FsmState::CmdSuccess,
                Some(metadata([("exit_code", result.exit_code)])),
                Session::complete_head_block,
            )?;
            continue;
        }

        let error = result.error_text();
        fsm.transition_with(
            FsmState::CmdFailed,
            Some(metadata([
                ("exit_code", json!(result.exit_code)),
                ("timed_out", json!(result.timed_out)),
                ("error", json!(preview(&error))),
            ])),
            Session::fail_head_block,
        )?;
        return Ok(BlockRun::Failed {
            command: block.script(),
            error,
        });
    }
}

fn verdict_metadata(verdict: &Verdict) -> Metadata {
    metadata([
        ("detail", json!(verdict.reason)),
        ("category", json!(verdict.category.map(|c| c.as_str()))),
    ])
}

fn preview(text: &str) -> String {
    text.chars().take(ERROR_METADATA_CHARS).collect()
}
