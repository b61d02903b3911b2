//! Session record: the unit persisted to disk after every FSM transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::state::FsmState;
use crate::core::types::{CommandBlock, Message, Mode, TargetOs};

/// Arbitrary JSON object attached to an event.
pub type Metadata = Map<String, Value>;

/// One recorded FSM transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub from: FsmState,
    pub to: FsmState,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Full state of one agent interaction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub mode: Mode,
    pub os: TargetOs,
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub auto_execute: bool,
    #[serde(default)]
    pub auto_execute_downgraded: bool,
    pub current_state: FsmState,
    pub events: Vec<Event>,
    pub commands_executed: u32,
    pub commands_failed: u32,
    /// Blocks not yet confirmed successful, in execution order.
    pub pending_commands: Vec<CommandBlock>,
    /// Lines already run successfully, in execution order.
    pub executed_commands: Vec<String>,
    pub messages: Vec<Message>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Inputs for a fresh session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub mode: Mode,
    pub os: TargetOs,
    pub model: String,
    pub prompt: String,
    pub auto_execute: bool,
}

impl Session {
    /// Create a session at IDLE with a fresh id and the prompt as first user message.
    pub fn new(params: NewSession) -> Self {
        let prompt_message = Message::user(params.prompt.clone());
        Self {
            session_id: Uuid::new_v4().to_string(),
            mode: params.mode,
            os: params.os,
            model: params.model,
            prompt: params.prompt,
            auto_execute: params.auto_execute,
            auto_execute_downgraded: false,
            current_state: FsmState::Idle,
            events: Vec::new(),
            commands_executed: 0,
            commands_failed: 0,
            pending_commands: Vec::new(),
            executed_commands: Vec::new(),
            messages: vec![prompt_message],
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// True while the operator has to approve each block.
    pub fn requires_confirmation(&self) -> bool {
        !self.auto_execute || self.auto_execute_downgraded
    }

    /// Pending blocks flattened to individual lines.
    pub fn pending_lines(&self) -> Vec<String> {
        self.pending_commands
            .iter()
            .flat_map(|block| block.lines().iter().cloned())
            .collect()
    }

    /// Record a successful block: drop it from the pending queue and bump counters.
    pub fn complete_head_block(&mut self) {
        if self.pending_commands.is_empty() {
            return;
        }
        let block = self.pending_commands.remove(0);
        self.executed_commands.extend(block.lines().iter().cloned());
        self.commands_executed += 1;
    }

    /// Record a failed block; it stays at the head of the pending queue.
    pub fn fail_head_block(&mut self) {
        self.commands_failed += 1;
    }
}

/// Build a metadata map from string pairs.
pub fn metadata<I, K, V>(pairs: I) -> Metadata
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{block, new_session};

    #[test]
    fn new_session_starts_idle_with_prompt_in_history() {
        let session = new_session(Mode::Default, false);
        assert_eq!(session.current_state, FsmState::Idle);
        assert!(session.events.is_empty());
        assert_eq!(session.messages, vec![Message::user(session.prompt.clone())]);
        assert!(Uuid::parse_str(&session.session_id).is_ok());
    }

    #[test]
    fn completing_head_block_moves_lines_to_executed() {
        let mut session = new_session(Mode::Default, false);
        session.pending_commands = vec![block(&["mkdir app", "cd app"]), block(&["npm init -y"])];

        session.complete_head_block();

        assert_eq!(session.pending_lines(), vec!["npm init -y".to_string()]);
        assert_eq!(
            session.executed_commands,
            vec!["mkdir app".to_string(), "cd app".to_string()]
        );
        assert_eq!(session.commands_executed, 1);
    }

    #[test]
    fn failing_head_block_keeps_it_pending() {
        let mut session = new_session(Mode::Default, false);
        session.pending_commands = vec![block(&["false"])];
        session.fail_head_block();
        assert_eq!(session.pending_lines(), vec!["false".to_string()]);
        assert_eq!(session.commands_failed, 1);
        assert_eq!(session.commands_executed, 0);
    }

    #[test]
    fn serializes_camel_case_record() {
        let session = new_session(Mode::Fix, true);
        let value = serde_json::to_value(&session).expect("serialize");
        for key in [
            "sessionId",
            "currentState",
            "pendingCommands",
            "executedCommands",
            "commandsExecuted",
            "commandsFailed",
            "startedAt",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["mode"], "fix");
        assert_eq!(value["currentState"], "IDLE");
        assert!(value.get("endedAt").is_none());
    }

    #[test]
    fn confirmation_required_unless_auto_execute_survives() {
        let mut session = new_session(Mode::Default, true);
        assert!(!session.requires_confirmation());
        session.auto_execute_downgraded = true;
        assert!(session.requires_confirmation());
        assert!(new_session(Mode::Default, false).requires_confirmation());
    }
}
