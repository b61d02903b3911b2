//! Session files: one pretty-printed JSON record per session.
//!
//! Files live at `<dir>/<sessionId>.json` and are replaced atomically on every
//! save. Loading validates the record against the embedded JSON Schema and the
//! transition table before handing it back.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::core::fsm::{Fsm, SessionSink, validate_event_log};
use crate::core::session::Session;
use crate::core::state::FsmState;
use crate::core::types::Mode;

const SESSION_SCHEMA: &str = include_str!("../../schemas/session.schema.json");

/// One row of `brain sessions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    pub mode: Mode,
    pub state: FsmState,
    pub prompt: String,
    pub started_at: DateTime<Utc>,
    pub commands_executed: u32,
    pub commands_failed: u32,
    pub pending_blocks: usize,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.session_id.clone(),
            mode: session.mode,
            state: session.current_state,
            prompt: session.prompt.clone(),
            started_at: session.started_at,
            commands_executed: session.commands_executed,
            commands_failed: session.commands_failed,
            pending_blocks: session.pending_commands.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.dir.join(format!("{session_id}.json")))
    }

    /// Load a session and check it against the schema and the transition table.
    #[instrument(skip(self))]
    pub fn load(&self, session_id: &str) -> Result<Session> {
        let path = self.path_for(session_id)?;
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read session {}", path.display()))?;
        let session = parse_session(&contents)
            .with_context(|| format!("load session {}", path.display()))?;
        if session.session_id != session_id {
            return Err(anyhow!(
                "session file {} holds session {}",
                path.display(),
                session.session_id
            ));
        }
        debug!(state = %session.current_state, events = session.events.len(), "session loaded");
        Ok(session)
    }

    /// Load a session and position an FSM at its saved state.
    pub fn restore(&self, session_id: &str) -> Result<Fsm<'_>> {
        let session = self.load(session_id)?;
        Ok(Fsm::restore(session, self))
    }

    /// Summaries of every readable session, newest first.
    ///
    /// Unreadable files are skipped with a warning.
    pub fn list(&self) -> Result<Vec<SessionSummary>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut summaries = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("read sessions dir {}", self.dir.display()))?
        {
            let path = entry.context("read sessions dir entry")?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|contents| {
                    serde_json::from_str::<Session>(&contents).map_err(anyhow::Error::from)
                });
            match parsed {
                Ok(session) => summaries.push(SessionSummary::from(&session)),
                Err(err) => warn!(path = %path.display(), err = %err, "skipping unreadable session"),
            }
        }
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(summaries)
    }
}

impl SessionSink for SessionStore {
    fn save(&self, session: &Session) -> Result<()> {
        let path = self.path_for(&session.session_id)?;
        debug!(
            session_id = %session.session_id,
            state = %session.current_state,
            path = %path.display(),
            "writing session"
        );
        let mut buf = serde_json::to_string_pretty(session).context("serialize session")?;
        buf.push('\n');
        write_atomic(&path, &buf)
    }
}

/// Parse and validate a session record (schema, then event log).
pub fn parse_session(contents: &str) -> Result<Session> {
    let value: Value = serde_json::from_str(contents).context("parse session json")?;
    validate_schema(&value)?;
    let session: Session = serde_json::from_value(value).context("deserialize session")?;
    let errors = validate_event_log(&session);
    if !errors.is_empty() {
        return Err(anyhow!("session invariants failed: {}", errors.join("; ")));
    }
    Ok(session)
}

fn validate_schema(value: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(SESSION_SCHEMA).context("parse session schema")?;
    let validator =
        validator_for(&schema).map_err(|err| anyhow!("invalid session schema: {err}"))?;
    if !validator.is_valid(value) {
        let messages = validator
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "session schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

fn validate_session_id(session_id: &str) -> Result<()> {
    Uuid::parse_str(session_id)
        .map(|_| ())
        .map_err(|_| anyhow!("invalid session id '{session_id}' (expected a UUID)"))
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("session path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp session {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace session {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::metadata;
    use crate::test_support::{block, new_session};

    #[test]
    fn save_then_restore_keeps_state_events_and_pending() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path());
        let mut fsm = Fsm::new(new_session(Mode::Default, false), &store);
        for state in [
            FsmState::AuthCheck,
            FsmState::ContextScan,
            FsmState::ApiCall,
            FsmState::Display,
            FsmState::PlanReview,
        ] {
            fsm.transition(state, None).expect("transition");
        }
        fsm.transition_with(
            FsmState::AwaitingConfirm,
            Some(metadata([("blocks", 2)])),
            |s| s.pending_commands = vec![block(&["mkdir app"]), block(&["cd app", "npm init -y"])],
        )
        .expect("await");
        let saved = fsm.into_session();

        let restored = store.restore(&saved.session_id).expect("restore");
        let restored = restored.session();
        assert_eq!(restored.current_state, FsmState::AwaitingConfirm);
        assert_eq!(restored.events, saved.events);
        assert_eq!(restored.pending_commands, saved.pending_commands);
        assert_eq!(restored, &saved);
    }

    #[test]
    fn saved_file_is_pretty_json_with_trailing_newline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path().join("sessions"));
        let session = new_session(Mode::Git, false);
        store.save(&session).expect("save");

        let path = store.path_for(&session.session_id).expect("path");
        let contents = fs::read_to_string(&path).expect("read");
        assert!(contents.starts_with("{\n  \"sessionId\""));
        assert!(contents.ends_with("}\n"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn rejects_non_uuid_session_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path());
        let err = store.load("../../etc/passwd").expect_err("invalid id");
        assert!(err.to_string().contains("invalid session id"));
    }

    #[test]
    fn rejects_records_that_break_the_schema() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path());
        let session = new_session(Mode::Default, false);
        store.save(&session).expect("save");
        let path = store.path_for(&session.session_id).expect("path");
        let mut value: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        value["currentState"] = Value::String("SLEEPING".to_string());
        fs::write(&path, serde_json::to_string(&value).expect("serialize")).expect("write");

        let err = store.load(&session.session_id).expect_err("schema");
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn rejects_records_with_illegal_event_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path());
        let mut session = new_session(Mode::Default, false);
        session.current_state = FsmState::Executing;
        store.save(&session).expect("save");

        let err = store.load(&session.session_id).expect_err("invariants");
        assert!(format!("{err:#}").contains("session invariants failed"));
    }

    #[test]
    fn list_sorts_newest_first_and_skips_garbage() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path());
        let mut older = new_session(Mode::Default, false);
        older.started_at = older.started_at - chrono::Duration::hours(1);
        let newer = new_session(Mode::Fix, false);
        store.save(&older).expect("save older");
        store.save(&newer).expect("save newer");
        fs::write(temp.path().join("broken.json"), "{").expect("write garbage");

        let summaries = store.list().expect("list");
        let ids: Vec<&str> = summaries.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec![newer.session_id.as_str(), older.session_id.as_str()]);
        assert_eq!(summaries[0].mode, Mode::Fix);
    }

    #[test]
    fn list_of_missing_dir_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path().join("nope"));
        assert!(store.list().expect("list").is_empty());
    }
}
