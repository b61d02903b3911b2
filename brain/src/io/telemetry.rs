//! Best-effort upload of a finished session's event log.
//!
//! Reporting never blocks the caller and never returns an error: the upload
//! runs on its own thread and the outcome is only observable through
//! [`TelemetryHandle::wait`].

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::Serialize;
use tracing::debug;

use crate::core::session::{Event, Session};
use crate::core::state::FsmState;
use crate::core::types::{Mode, TargetOs};
use crate::io::config::AgentConfig;

const PROMPT_PREVIEW_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Failed,
    /// The attempt has not finished within the wait.
    Pending,
    /// Telemetry is switched off; nothing was sent.
    Disabled,
}

/// Completion handle for one report.
#[derive(Debug)]
pub struct TelemetryHandle {
    rx: Option<Receiver<Delivery>>,
    outcome: Option<Delivery>,
}

impl TelemetryHandle {
    fn completed(outcome: Delivery) -> Self {
        Self {
            rx: None,
            outcome: Some(outcome),
        }
    }

    /// Wait up to `timeout` for the attempt to finish.
    pub fn wait(&mut self, timeout: Duration) -> Delivery {
        if let Some(outcome) = self.outcome {
            return outcome;
        }
        let Some(rx) = &self.rx else {
            return Delivery::Failed;
        };
        let outcome = match rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => return Delivery::Pending,
            Err(RecvTimeoutError::Disconnected) => Delivery::Failed,
        };
        self.outcome = Some(outcome);
        outcome
    }
}

/// Body posted to `<api_base>/sessions/report`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub session_id: String,
    pub mode: Mode,
    pub os: TargetOs,
    pub prompt: String,
    pub events: Vec<Event>,
    pub final_state: FsmState,
    pub commands_executed: u32,
    pub commands_failed: u32,
}

impl From<&Session> for SessionReport {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.session_id.clone(),
            mode: session.mode,
            os: session.os,
            prompt: session.prompt.chars().take(PROMPT_PREVIEW_CHARS).collect(),
            events: session.events.clone(),
            final_state: session.current_state,
            commands_executed: session.commands_executed,
            commands_failed: session.commands_failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryReporter {
    sender: Option<Sender>,
}

#[derive(Debug, Clone)]
struct Sender {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl TelemetryReporter {
    /// Reporter for `config`; a client that cannot be built disables reporting.
    pub fn new(config: &AgentConfig) -> Self {
        if !config.telemetry {
            return Self::disabled();
        }
        match Client::builder().timeout(config.telemetry_timeout).build() {
            Ok(client) => Self {
                sender: Some(Sender {
                    client,
                    endpoint: format!("{}/sessions/report", config.api_base),
                    api_key: config.api_key.clone(),
                }),
            },
            Err(err) => {
                debug!(err = %err, "telemetry client unavailable; reporting disabled");
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Start uploading `session` in the background.
    pub fn report(&self, session: &Session) -> TelemetryHandle {
        let Some(sender) = self.sender.clone() else {
            return TelemetryHandle::completed(Delivery::Disabled);
        };
        let report = SessionReport::from(session);
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("brain-telemetry".to_string())
            .spawn(move || {
                let outcome = sender.send(&report);
                let _ = tx.send(outcome);
            });
        match spawned {
            Ok(_) => TelemetryHandle {
                rx: Some(rx),
                outcome: None,
            },
            Err(err) => {
                debug!(err = %err, "cannot spawn telemetry thread");
                TelemetryHandle::completed(Delivery::Failed)
            }
        }
    }
}

impl Sender {
    fn send(&self, report: &SessionReport) -> Delivery {
        let mut request = self.client.post(&self.endpoint).json(report);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        match request.send() {
            Ok(response) if response.status().is_success() => {
                debug!(session_id = %report.session_id, "telemetry delivered");
                Delivery::Delivered
            }
            Ok(response) => {
                debug!(status = response.status().as_u16(), "telemetry rejected");
                Delivery::Failed
            }
            Err(err) => {
                debug!(err = %err, "telemetry request failed");
                Delivery::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::path::PathBuf;

    use super::*;
    use crate::test_support::{new_session, serve_once};

    fn config(api_base: &str, telemetry: bool) -> AgentConfig {
        AgentConfig {
            api_key: Some("sk-test".to_string()),
            api_base: api_base.to_string(),
            model: "m".to_string(),
            model_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
            telemetry,
            telemetry_timeout: Duration::from_secs(3),
            output_limit_bytes: 1024,
            sessions_dir: PathBuf::from("/unused"),
            workdir: PathBuf::from("/unused"),
        }
    }

    #[test]
    fn report_truncates_prompt() {
        let mut session = new_session(Mode::Default, false);
        session.prompt = "x".repeat(800);
        let report = SessionReport::from(&session);
        assert_eq!(report.prompt.len(), PROMPT_PREVIEW_CHARS);
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["finalState"], "IDLE");
        assert!(json.get("commandsExecuted").is_some());
    }

    #[test]
    fn delivered_report_posts_event_log() {
        let server = serve_once(200, "{}");
        let reporter = TelemetryReporter::new(&config(&server.url, true));
        let session = new_session(Mode::Fix, false);

        let mut handle = reporter.report(&session);

        assert_eq!(handle.wait(Duration::from_secs(10)), Delivery::Delivered);
        let captured = server.finish();
        assert!(captured.starts_with("POST /sessions/report "));
        assert!(captured.contains(&session.session_id));
        assert!(captured.contains("\"finalState\":\"IDLE\""));
    }

    #[test]
    fn unreachable_backend_is_swallowed() {
        let reporter = TelemetryReporter::new(&config("http://127.0.0.1:9", true));
        let mut handle = reporter.report(&new_session(Mode::Default, false));
        assert_eq!(handle.wait(Duration::from_secs(10)), Delivery::Failed);
    }

    #[test]
    fn slow_backend_leaves_handle_pending() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let url = format!("http://{}", listener.local_addr().expect("addr"));
        let reporter = TelemetryReporter::new(&config(&url, true));
        let mut handle = reporter.report(&new_session(Mode::Default, false));
        assert_eq!(handle.wait(Duration::from_millis(50)), Delivery::Pending);
        drop(listener);
    }

    #[test]
    fn disabled_reporter_completes_immediately() {
        let reporter = TelemetryReporter::new(&config("http://127.0.0.1:9", false));
        let mut handle = reporter.report(&new_session(Mode::Default, false));
        assert_eq!(handle.wait(Duration::ZERO), Delivery::Disabled);
    }
}
