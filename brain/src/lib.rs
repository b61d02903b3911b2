//! Terminal coding agent with a guarded execution loop.
//!
//! A prompt goes to a hosted model, shell commands are extracted from the
//! reply, screened by a safety guard and run only after the operator agrees.
//! Every step of a session is an FSM transition persisted to disk, so a
//! session can be audited, replayed and resumed. The layout keeps a strict
//! separation:
//!
//! - **[`core`]**: Pure logic (state machine, extraction, safety rules). No I/O.
//! - **[`io`]**: Side effects (config, model gateway, shell, session files,
//!   telemetry, terminal prompts). Each collaborator sits behind a trait so
//!   orchestration can be tested with scripted doubles.
//!
//! [`orchestrator`] and [`resume`] combine the two to implement `brain run`
//! and `brain resume`.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod resume;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod ui;
