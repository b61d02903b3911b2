//! `brain`: ask a model for shell commands and run them under supervision.
//!
//! Sessions are stored under `~/.brain/sessions/` (or `$BRAIN_HOME/sessions/`)
//! and can be listed, replayed and resumed.

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use brain::core::state::FsmState;
use brain::core::types::Mode;
use brain::exit_codes;
use brain::io::config::{API_KEY_ENV, AgentConfig, BrainConfig, BrainPaths, load_config, write_config};
use brain::io::confirm::{TerminalConfirmer, prompt_api_key, prompt_line};
use brain::io::model::GatewayClient;
use brain::io::session_store::SessionStore;
use brain::io::shell::HostShell;
use brain::io::telemetry::TelemetryReporter;
use brain::logging;
use brain::orchestrator::{MissingApiKey, Orchestrator, RunOutcome, RunRequest};
use brain::resume::{ResumeOutcome, resume_session};
use brain::ui;

#[derive(Parser)]
#[command(
    name = "brain",
    version,
    about = "Terminal coding agent: model-planned shell commands, run with your consent"
)]
struct Cli {
    /// Debug logging on stderr (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a prompt; without one on a terminal, start an interactive loop.
    Run {
        /// Prompt words. A leading mode name (e.g. `fix`) selects that mode.
        prompt: Vec<String>,
        /// Model id to use instead of `default_model`.
        #[arg(short, long)]
        model: Option<String>,
        /// Run blocks without per-block confirmation unless a command is dangerous.
        #[arg(short = 'y', long)]
        yolo: bool,
        /// Persona; overrides mode detection from the prompt.
        #[arg(long)]
        mode: Option<Mode>,
        /// Attach a file to the prompt (repeatable).
        #[arg(long = "context", value_name = "FILE")]
        context: Vec<PathBuf>,
    },
    /// Replay the pending blocks of a stored session.
    Resume { session_id: String },
    /// Prompt for an API key and save it to the config file.
    Auth,
    /// Print the effective configuration with the key masked.
    Config,
    /// List personas.
    Modes,
    /// List stored sessions, newest first.
    Sessions {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the event log of a stored session.
    Replay { session_id: String },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match dispatch(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn dispatch(command: Command) -> Result<i32> {
    let paths = BrainPaths::resolve()?;
    match command {
        Command::Run {
            prompt,
            model,
            yolo,
            mode,
            context,
        } => {
            let config = load_effective_config(&paths)?;
            let workdir = std::env::current_dir().context("read current directory")?;
            let agent = config.agent_config(&paths, workdir, model);
            cmd_run(&agent, prompt, mode, yolo, context)
        }
        Command::Resume { session_id } => {
            let config = load_effective_config(&paths)?;
            let workdir = std::env::current_dir().context("read current directory")?;
            cmd_resume(&config.agent_config(&paths, workdir, None), &session_id)
        }
        Command::Auth => cmd_auth(&paths),
        Command::Config => cmd_config(&paths),
        Command::Modes => {
            cmd_modes();
            Ok(exit_codes::OK)
        }
        Command::Sessions { limit } => cmd_sessions(&paths, limit),
        Command::Replay { session_id } => cmd_replay(&paths, &session_id),
    }
}

/// Config file plus the key from `BRAIN_API_KEY`, which wins when set.
fn load_effective_config(paths: &BrainPaths) -> Result<BrainConfig> {
    let mut config = load_config(&paths.config_path)?;
    config.apply_env_api_key(std::env::var(API_KEY_ENV).ok());
    Ok(config)
}

/// Collaborators for one invocation.
struct Runtime {
    store: SessionStore,
    model: GatewayClient,
    shell: HostShell,
    confirmer: TerminalConfirmer,
    telemetry: TelemetryReporter,
}

impl Runtime {
    fn new(agent: &AgentConfig, api_key: &str) -> Result<Self> {
        Ok(Self {
            store: SessionStore::new(&agent.sessions_dir),
            model: GatewayClient::new(&agent.api_base, api_key, agent.model_timeout)?,
            shell: HostShell {
                workdir: agent.workdir.clone(),
                timeout: agent.command_timeout,
                output_limit_bytes: agent.output_limit_bytes,
            },
            confirmer: TerminalConfirmer::new(),
            telemetry: TelemetryReporter::new(agent),
        })
    }

    fn orchestrator<'a>(
        &'a self,
        agent: &'a AgentConfig,
    ) -> Result<Orchestrator<'a, GatewayClient, HostShell, TerminalConfirmer>> {
        Orchestrator::new(
            agent,
            &self.store,
            &self.model,
            &self.shell,
            &self.confirmer,
            &self.telemetry,
        )
    }
}

fn cmd_run(
    agent: &AgentConfig,
    prompt: Vec<String>,
    mode: Option<Mode>,
    yolo: bool,
    context: Vec<PathBuf>,
) -> Result<i32> {
    let api_key = agent.api_key.clone().ok_or(MissingApiKey)?;
    let runtime = Runtime::new(agent, &api_key)?;
    let orch = runtime.orchestrator(agent)?;

    if !prompt.is_empty() {
        let outcome = orch.run(request(&prompt, mode, yolo, context))?;
        return Ok(settle(agent, outcome));
    }
    if !std::io::stdin().is_terminal() {
        bail!("no prompt given (pass one as arguments or run on a terminal)");
    }

    let mut code = exit_codes::OK;
    loop {
        let line = prompt_line("brain")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }
        let words: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        let outcome = orch.run(request(&words, mode, yolo, context.clone()))?;
        code = settle(agent, outcome);
    }
    Ok(code)
}

fn request(words: &[String], mode: Option<Mode>, yolo: bool, context: Vec<PathBuf>) -> RunRequest {
    let (detected, rest) = match mode {
        Some(mode) => (Some(mode), words),
        None => Mode::detect_from_prompt(words),
    };
    RunRequest {
        prompt: rest.join(" "),
        mode: detected.unwrap_or(Mode::Default),
        auto_execute: yolo,
        context_files: context,
    }
}

/// Give telemetry a bounded chance to finish, then map the final state.
fn settle(agent: &AgentConfig, outcome: RunOutcome) -> i32 {
    if let Some(mut handle) = outcome.telemetry {
        handle.wait(agent.telemetry_timeout);
    }
    exit_code_for(outcome.final_state)
}

fn exit_code_for(state: FsmState) -> i32 {
    match state {
        FsmState::Done => exit_codes::OK,
        FsmState::Aborted => exit_codes::ABORTED,
        _ => exit_codes::HALTED,
    }
}

fn cmd_resume(agent: &AgentConfig, session_id: &str) -> Result<i32> {
    // A replay needs no key; a recovery turn without one is rejected by the gateway.
    let api_key = agent.api_key.clone().unwrap_or_default();
    let runtime = Runtime::new(agent, &api_key)?;
    let session = runtime.store.load(session_id)?;
    let orch = runtime.orchestrator(agent)?;

    match resume_session(&orch, session)? {
        ResumeOutcome::NothingPending { state } => {
            println!("Nothing to resume: session is {state} with no pending commands.");
            Ok(exit_codes::OK)
        }
        ResumeOutcome::Declined => {
            println!("Resume declined; session left unchanged.");
            Ok(exit_codes::OK)
        }
        ResumeOutcome::Halted(outcome) => {
            settle(agent, outcome);
            Ok(exit_codes::HALTED)
        }
        ResumeOutcome::Finished(outcome) => Ok(settle(agent, outcome)),
    }
}

fn cmd_auth(paths: &BrainPaths) -> Result<i32> {
    let mut config = load_config(&paths.config_path)?;
    let key = prompt_api_key()?;
    if key.is_empty() {
        bail!("API key must not be empty");
    }
    config.api_key = Some(key);
    write_config(&paths.config_path, &config)?;
    println!(
        "Saved API key {} to {}",
        config.masked_api_key(),
        paths.config_path.display()
    );
    Ok(exit_codes::OK)
}

fn cmd_config(paths: &BrainPaths) -> Result<i32> {
    let config = load_effective_config(paths)?;
    println!("config file:      {}", paths.config_path.display());
    println!("api_key:          {}", config.masked_api_key());
    println!("api_base:         {}", config.api_base);
    println!("default_model:    {}", config.default_model);
    println!("telemetry:        {}", config.telemetry);
    println!("model_timeout:    {}s", config.model_timeout_secs);
    println!("command_timeout:  {}s", config.command_timeout_secs);
    println!("output_limit:     {} bytes", config.output_limit_bytes);
    println!("sessions_dir:     {}", config.sessions_dir(paths).display());
    Ok(exit_codes::OK)
}

fn cmd_modes() {
    for mode in Mode::ALL {
        let access = if mode.is_read_only() { "read-only" } else { "executes" };
        println!("{:<10} {:<10} {}", mode.as_str(), access, mode.label());
    }
}

fn cmd_sessions(paths: &BrainPaths, limit: usize) -> Result<i32> {
    let config = load_config(&paths.config_path)?;
    let store = SessionStore::new(config.sessions_dir(paths));
    let sessions = store.list()?;
    if sessions.is_empty() {
        println!("No sessions in {}", store.dir().display());
        return Ok(exit_codes::OK);
    }
    for summary in sessions.iter().take(limit) {
        ui::session_row(summary);
    }
    Ok(exit_codes::OK)
}

fn cmd_replay(paths: &BrainPaths, session_id: &str) -> Result<i32> {
    let config = load_config(&paths.config_path)?;
    let store = SessionStore::new(config.sessions_dir(paths));
    let session = store.load(session_id)?;
    println!(
        "session {}  mode={}  os={}  state={}",
        session.session_id, session.mode, session.os, session.current_state
    );
    println!("prompt: {}", session.prompt);
    for (index, event) in session.events.iter().enumerate() {
        ui::event_row(index, event);
    }
    if !session.pending_commands.is_empty() {
        println!("pending:");
        for line in session.pending_lines() {
            println!("  {line}");
        }
    }
    Ok(exit_codes::OK)
}
