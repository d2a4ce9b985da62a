//! # MOBA Test Utilities
//!
//! Shared testing utilities for all crates:
//! - Determinism test harness
//! - Fixture configs and matches
//! - A loopback link joining a server and predicting clients
//! - Property-based testing strategies

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod determinism;
pub mod fixtures;
pub mod netsim;

/// Re-export proptest for convenience.
pub use proptest;
