//! Test-only helpers: deterministic sessions and scripted collaborators.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;

use crate::core::fsm::SessionSink;
use crate::core::session::{NewSession, Session};
use crate::core::types::{CommandBlock, Mode, TargetOs};
use crate::io::config::AgentConfig;
use crate::io::confirm::Confirmer;
use crate::io::model::{ModelClient, ModelError, ModelRequest};
use crate::io::shell::{ExecResult, ShellRunner};

/// Fresh IDLE session on Linux with a fixed prompt.
pub fn new_session(mode: Mode, auto_execute: bool) -> Session {
    Session::new(NewSession {
        mode,
        os: TargetOs::Linux,
        model: "test-model".to_string(),
        prompt: "create a file named notes.txt".to_string(),
        auto_execute,
    })
}

pub fn block(lines: &[&str]) -> CommandBlock {
    CommandBlock::new(lines.iter().map(|l| l.to_string()).collect())
}

/// Agent settings for tests: key present, telemetry off, short timeouts.
pub fn test_config(dir: &Path) -> AgentConfig {
    AgentConfig {
        api_key: Some("sk-test-key".to_string()),
        api_base: "http://127.0.0.1:9".to_string(),
        model: "test-model".to_string(),
        model_timeout: Duration::from_secs(5),
        command_timeout: Duration::from_secs(10),
        telemetry: false,
        telemetry_timeout: Duration::from_secs(1),
        output_limit_bytes: 64 * 1024,
        sessions_dir: dir.join("sessions"),
        workdir: dir.to_path_buf(),
    }
}

pub fn ok(stdout: &str) -> ExecResult {
    ExecResult {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
        timed_out: false,
    }
}

pub fn failed(exit_code: i32, stderr: &str) -> ExecResult {
    ExecResult {
        exit_code,
        stdout: String::new(),
        stderr: stderr.to_string(),
        timed_out: false,
    }
}

/// Keeps every saved snapshot in memory.
#[derive(Default)]
pub struct MemorySink {
    saved: RefCell<Vec<Session>>,
}

impl MemorySink {
    pub fn saves(&self) -> usize {
        self.saved.borrow().len()
    }

    pub fn last(&self) -> Option<Session> {
        self.saved.borrow().last().cloned()
    }
}

impl SessionSink for MemorySink {
    fn save(&self, session: &Session) -> Result<()> {
        self.saved.borrow_mut().push(session.clone());
        Ok(())
    }
}

/// Model that replies from a queue and records every request.
///
/// An exhausted queue answers with [`ModelError::EmptyResponse`].
#[derive(Default)]
pub struct ScriptedModel {
    replies: RefCell<VecDeque<Result<String, ModelError>>>,
    requests: RefCell<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn replying(replies: &[&str]) -> Self {
        Self {
            replies: RefCell::new(replies.iter().map(|r| Ok(r.to_string())).collect()),
            requests: RefCell::default(),
        }
    }

    pub fn push_error(&self, err: ModelError) {
        self.replies.borrow_mut().push_back(Err(err));
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.borrow().clone()
    }
}

impl ModelClient for ScriptedModel {
    fn complete(&self, request: &ModelRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        match self.replies.borrow_mut().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(err)) => Err(err.into()),
            None => Err(ModelError::EmptyResponse.into()),
        }
    }
}

/// Shell that returns queued results and records the blocks it was given.
///
/// An exhausted queue succeeds with empty output.
#[derive(Default)]
pub struct ScriptedShell {
    results: RefCell<VecDeque<ExecResult>>,
    ran: RefCell<Vec<CommandBlock>>,
}

impl ScriptedShell {
    pub fn returning(results: Vec<ExecResult>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            ran: RefCell::default(),
        }
    }

    pub fn ran(&self) -> Vec<CommandBlock> {
        self.ran.borrow().clone()
    }
}

impl ShellRunner for ScriptedShell {
    fn execute(&self, block: &CommandBlock) -> ExecResult {
        self.ran.borrow_mut().push(block.clone());
        self.results
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| ok(""))
    }
}

/// Answers questions from a queue; an exhausted queue answers "no".
#[derive(Default)]
pub struct ScriptedConfirmer {
    answers: RefCell<VecDeque<bool>>,
    asked: RefCell<Vec<String>>,
}

impl ScriptedConfirmer {
    pub fn answering(answers: &[bool]) -> Self {
        Self {
            answers: RefCell::new(answers.iter().copied().collect()),
            asked: RefCell::default(),
        }
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.borrow().clone()
    }
}

impl Confirmer for ScriptedConfirmer {
    fn confirm(&self, question: &str) -> Result<bool> {
        self.asked.borrow_mut().push(question.to_string());
        Ok(self.answers.borrow_mut().pop_front().unwrap_or(false))
    }
}

/// HTTP server on a loopback port that answers exactly one request.
pub struct OneShotServer {
    pub url: String,
    handle: JoinHandle<String>,
}

impl OneShotServer {
    /// Wait for the request and return it raw (head and body).
    pub fn finish(self) -> String {
        self.handle.join().expect("server thread")
    }
}

pub fn serve_once(status: u16, body: &str) -> OneShotServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let url = format!("http://{}", listener.local_addr().expect("local addr"));
    let body = body.to_string();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let mut reader = BufReader::new(stream);
        let mut request = String::new();
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).expect("read header") == 0 {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
            let end = line == "\r\n";
            request.push_str(&line);
            if end {
                break;
            }
        }
        let mut payload = vec![0u8; content_length];
        reader.read_exact(&mut payload).expect("read body");
        request.push_str(&String::from_utf8_lossy(&payload));

        let reason = if status < 400 { "OK" } else { "Error" };
        let response = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let mut stream = reader.into_inner();
        stream.write_all(response.as_bytes()).expect("write response");
        stream.flush().expect("flush");
        request
    });
    OneShotServer { url, handle }
}
