//! Deterministic, pure logic shared by the agent.
//!
//! Core modules are free of I/O side effects except through the
//! [`fsm::SessionSink`] seam. They operate on in-memory data and return
//! deterministic outputs suitable for tests.

pub mod extract;
pub mod fsm;
pub mod safety;
pub mod session;
pub mod state;
pub mod types;
