//! FSM states and the canonical transition table.
//!
//! The table is the single source of truth for which steps a session may take.
//! Both the engine and the session-file validator consult it, so a persisted
//! event log can never contain a transition the engine would have refused.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One state of the agent interaction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FsmState {
    Idle,
    AuthCheck,
    ContextScan,
    ApiCall,
    Display,
    PlanReview,
    AwaitingConfirm,
    Executing,
    CmdSuccess,
    CmdFailed,
    ErrorRecovery,
    Done,
    Aborted,
}

impl FsmState {
    pub const ALL: [FsmState; 13] = [
        FsmState::Idle,
        FsmState::AuthCheck,
        FsmState::ContextScan,
        FsmState::ApiCall,
        FsmState::Display,
        FsmState::PlanReview,
        FsmState::AwaitingConfirm,
        FsmState::Executing,
        FsmState::CmdSuccess,
        FsmState::CmdFailed,
        FsmState::ErrorRecovery,
        FsmState::Done,
        FsmState::Aborted,
    ];

    /// Allowed successor states.
    pub fn successors(self) -> &'static [FsmState] {
        use FsmState as S;
        match self {
            S::Idle => &[S::AuthCheck, S::Aborted],
            S::AuthCheck => &[S::ContextScan, S::Aborted],
            S::ContextScan => &[S::ApiCall, S::Aborted],
            S::ApiCall => &[S::Display, S::Aborted],
            S::Display => &[S::PlanReview, S::Done, S::Aborted],
            S::PlanReview => &[S::AwaitingConfirm, S::Done, S::Aborted],
            S::AwaitingConfirm => &[S::Executing, S::Aborted],
            S::Executing => &[S::CmdSuccess, S::CmdFailed, S::Aborted],
            S::CmdSuccess => &[S::Executing, S::Done, S::Aborted],
            S::CmdFailed => &[S::ErrorRecovery, S::Aborted],
            S::ErrorRecovery => &[S::ApiCall, S::Aborted],
            S::Done => &[S::Idle],
            S::Aborted => &[S::Idle],
        }
    }

    pub fn can_transition_to(self, to: FsmState) -> bool {
        self.successors().contains(&to)
    }

    /// DONE and ABORTED end an interaction run.
    pub fn is_terminal(self) -> bool {
        matches!(self, FsmState::Done | FsmState::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FsmState::Idle => "IDLE",
            FsmState::AuthCheck => "AUTH_CHECK",
            FsmState::ContextScan => "CONTEXT_SCAN",
            FsmState::ApiCall => "API_CALL",
            FsmState::Display => "DISPLAY",
            FsmState::PlanReview => "PLAN_REVIEW",
            FsmState::AwaitingConfirm => "AWAITING_CONFIRM",
            FsmState::Executing => "EXECUTING",
            FsmState::CmdSuccess => "CMD_SUCCESS",
            FsmState::CmdFailed => "CMD_FAILED",
            FsmState::ErrorRecovery => "ERROR_RECOVERY",
            FsmState::Done => "DONE",
            FsmState::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
