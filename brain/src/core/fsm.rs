//! Session FSM engine.
//!
//! Every mutation of a [`Session`] goes through [`Fsm::transition`] or
//! [`Fsm::transition_with`]. The engine checks the requested step against the
//! transition table, appends the event and persists the whole record through a
//! [`SessionSink`] before returning, so the on-disk record is never more than
//! one step behind.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::session::{Event, Metadata, Session, metadata};
use crate::core::state::FsmState;

/// Rejected transition request. Indicates a programming error in the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: FsmState,
    pub to: FsmState,
}

/// Storage for session snapshots.
pub trait SessionSink {
    fn save(&self, session: &Session) -> Result<()>;
}

/// Owns one session and enforces the transition table on it.
pub struct Fsm<'s> {
    session: Session,
    sink: &'s dyn SessionSink,
}

impl<'s> Fsm<'s> {
    /// Wrap a fresh session. Nothing is persisted until the first transition.
    pub fn new(session: Session, sink: &'s dyn SessionSink) -> Self {
        Self { session, sink }
    }

    /// Wrap a session loaded from storage, positioned at its saved state.
    pub fn restore(session: Session, sink: &'s dyn SessionSink) -> Self {
        debug!(
            session_id = %session.session_id,
            state = %session.current_state,
            events = session.events.len(),
            "restored session"
        );
        Self { session, sink }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> FsmState {
        self.session.current_state
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    /// Move to `to`, appending an event and persisting the session.
    pub fn transition(&mut self, to: FsmState, metadata: Option<Metadata>) -> Result<()> {
        self.transition_with(to, metadata, |_| {})
    }

    /// Move to `to` and apply `mutate` to the session in the same persisted write.
    ///
    /// On an illegal request nothing is mutated and [`IllegalTransition`] is returned.
    pub fn transition_with<F>(
        &mut self,
        to: FsmState,
        metadata: Option<Metadata>,
        mutate: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Session),
    {
        let from = self.session.current_state;
        if !from.can_transition_to(to) {
            warn!(
                session_id = %self.session.session_id,
                %from,
                %to,
                "rejected illegal transition"
            );
            return Err(IllegalTransition { from, to }.into());
        }

        mutate(&mut self.session);
        let now = Utc::now();
        self.session.events.push(Event {
            from,
            to,
            timestamp: now,
            metadata,
        });
        self.session.current_state = to;
        if to.is_terminal() {
            self.session.ended_at = Some(now);
        } else if from.is_terminal() {
            self.session.ended_at = None;
        }

        debug!(session_id = %self.session.session_id, %from, %to, "transition");
        self.sink
            .save(&self.session)
            .with_context(|| format!("persist session after {from} -> {to}"))
    }

    /// Abort from the current state, recording `reason`.
    pub fn abort(&mut self, reason: impl Into<String>) -> Result<()> {
        let reason: String = reason.into();
        self.transition(
            FsmState::Aborted,
            Some(metadata([("reason", Value::String(reason))])),
        )
    }

    /// Mutate fields that do not change the state (e.g. appending history).
    ///
    /// The change is persisted with the next transition.
    pub fn update<F>(&mut self, mutate: F)
    where
        F: FnOnce(&mut Session),
    {
        mutate(&mut self.session);
    }
}

/// Check a restored event log against the transition table.
///
/// Returns one message per violation (empty when valid).
pub fn validate_event_log(session: &Session) -> Vec<String> {
    let mut errors = Vec::new();
    let mut expected_from = FsmState::Idle;
    for (index, event) in session.events.iter().enumerate() {
        if !event.from.can_transition_to(event.to) {
            errors.push(format!(
                "event {index}: illegal transition {} -> {}",
                event.from, event.to
            ));
        }
        if event.from != expected_from {
            errors.push(format!(
                "event {index}: starts at {} but previous state was {expected_from}",
                event.from
            ));
        }
        expected_from = event.to;
    }
    if session.current_state != expected_from {
        errors.push(format!(
            "current state {} does not match last event state {expected_from}",
            session.current_state
        ));
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Mode;
    use crate::test_support::{MemorySink, block, new_session};

    const HAPPY_PATH: [FsmState; 9] = [
        FsmState::AuthCheck,
        FsmState::ContextScan,
        FsmState::ApiCall,
        FsmState::Display,
        FsmState::PlanReview,
        FsmState::AwaitingConfirm,
        FsmState::Executing,
        FsmState::CmdSuccess,
        FsmState::Done,
    ];

    #[test]
    fn happy_path_persists_every_step() {
        let sink = MemorySink::default();
        let mut fsm = Fsm::new(new_session(Mode::Default, false), &sink);

        for state in HAPPY_PATH {
            fsm.transition(state, None).expect("transition");
        }

        assert_eq!(fsm.state(), FsmState::Done);
        assert_eq!(sink.saves(), HAPPY_PATH.len());
        let saved = sink.last().expect("saved session");
        assert_eq!(saved.current_state, FsmState::Done);
        assert!(saved.ended_at.is_some());
        assert!(validate_event_log(&saved).is_empty());
        for event in &saved.events {
            assert!(event.from.can_transition_to(event.to));
        }
    }

    #[test]
    fn illegal_transition_mutates_nothing() {
        let sink = MemorySink::default();
        let mut fsm = Fsm::new(new_session(Mode::Default, false), &sink);
        let before = fsm.session().clone();

        let err = fsm
            .transition_with(FsmState::Executing, None, |s| s.commands_executed = 99)
            .expect_err("illegal");

        let illegal = err
            .downcast_ref::<IllegalTransition>()
            .expect("typed error");
        assert_eq!(illegal.from, FsmState::Idle);
        assert_eq!(illegal.to, FsmState::Executing);
        assert_eq!(fsm.session(), &before);
        assert_eq!(sink.saves(), 0);
    }

    #[test]
    fn abort_is_one_step_from_every_non_terminal_state() {
        for state in FsmState::ALL {
            if state.is_terminal() {
                continue;
            }
            let sink = MemorySink::default();
            let mut session = new_session(Mode::Default, false);
            session.current_state = state;
            let mut fsm = Fsm::restore(session, &sink);
            fsm.abort("operator").expect("abort");
            assert_eq!(fsm.state(), FsmState::Aborted);
            let event = fsm.session().events.last().expect("event");
            assert_eq!(event.from, state);
            assert_eq!(
                event.metadata.as_ref().and_then(|m| m.get("reason")),
                Some(&Value::String("operator".to_string()))
            );
        }
    }

    #[test]
    fn terminal_states_cannot_abort_again() {
        let sink = MemorySink::default();
        let mut session = new_session(Mode::Default, false);
        session.current_state = FsmState::Done;
        let mut fsm = Fsm::restore(session, &sink);
        assert!(fsm.abort("again").is_err());
        fsm.transition(FsmState::Idle, None).expect("back to idle");
        assert_eq!(fsm.session().ended_at, None);
    }

    #[test]
    fn mutation_is_persisted_with_the_transition() {
        let sink = MemorySink::default();
        let mut session = new_session(Mode::Default, false);
        session.current_state = FsmState::Executing;
        session.pending_commands = vec![block(&["echo hi"])];
        let mut fsm = Fsm::restore(session, &sink);

        fsm.transition_with(FsmState::CmdSuccess, None, Session::complete_head_block)
            .expect("success");

        let saved = sink.last().expect("saved");
        assert!(saved.pending_commands.is_empty());
        assert_eq!(saved.executed_commands, vec!["echo hi".to_string()]);
        assert_eq!(saved.commands_executed, 1);
    }

    #[test]
    fn event_log_validation_reports_tampering() {
        let sink = MemorySink::default();
        let mut fsm = Fsm::new(new_session(Mode::Default, false), &sink);
        fsm.transition(FsmState::AuthCheck, None).expect("auth");
        let mut session = fsm.into_session();
        session.events[0].to = FsmState::Executing;

        let errors = validate_event_log(&session);
        assert!(errors.iter().any(|e| e.contains("illegal transition")));
        assert!(errors.iter().any(|e| e.contains("does not match")));
    }
}
