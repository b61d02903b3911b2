//! I/O adapters: filesystem, processes, network and the terminal.

pub mod config;
pub mod confirm;
pub mod context;
pub mod model;
pub mod process;
pub mod prompt;
pub mod session_store;
pub mod shell;
pub mod telemetry;
