//! Locate a running daemon through run-directory conventions and talk to
//! its control endpoint.

mod client;
mod error;
mod paths;
mod server;

pub use client::{ControlClient, DEFAULT_CALL_TIMEOUT};
pub use error::{ControlError, Result};
pub use paths::{DEFAULT_RUN_DIR, RunDir};
pub use server::ControlServer;
