//! Headless match runner for CI verification.
//!
//! Runs a server and its predicting clients in one process, joined by
//! delayed in-memory links, and drives them from a RON scenario script:
//!
//! - **Scenario runs**: play a scripted match and summarize what the server
//!   and each client saw
//! - **Determinism checks**: repeat a scenario in parallel and compare hashes
//! - **Replay verification**: play a recorded server back against its
//!   checkpoints
//!
//! See [`scenario`] for the file format.

pub mod runner;
pub mod scenario;

pub use runner::{run_scenario, verify_scenario, RunReport, RunnerError};
pub use scenario::{Scenario, ScenarioError};
