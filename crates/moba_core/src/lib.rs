//! # MOBA Core
//!
//! Predicted-state and reconciliation core for a client-predicted,
//! server-authoritative MOBA.
//!
//! This crate contains **only** deterministic logic:
//! - No rendering
//! - No IO besides replay and config files
//! - No randomness
//! - No floating-point math (uses fixed-point)
//!
//! The same stage list runs in the authoritative server world and in each
//! predicting client world. Clients resimulate from every snapshot, so every
//! stage must reach the same result when a tick is repeated.
//!
//! ## Crate Structure
//!
//! - [`tick`] - wrapping ticks, the tick clock and per-step time
//! - [`ring_buffer`] - per-entity tick-indexed history
//! - [`cooldown`] - rollback-safe cooldown gate
//! - [`ability`] - cast state machine
//! - [`damage`] - per-tick damage aggregation
//! - [`lifecycle`] - destroy handshake
//! - [`scheduler`] and [`match_flow`] - match start, respawns and minion waves
//! - [`replication`] and [`prediction`] - snapshots, predicted spawns, rewind
//! - [`simulation`] - stage list and step driver

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod ability;
pub mod archetype;
pub mod combat;
pub mod components;
pub mod config;
pub mod cooldown;
pub mod damage;
pub mod error;
pub mod lifecycle;
pub mod match_flow;
pub mod math;
pub mod movement;
pub mod prediction;
pub mod replay;
pub mod replication;
pub mod ring_buffer;
pub mod scheduler;
pub mod simulation;
pub mod spatial;
pub mod tick;
pub mod world;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::ability::{AbilityKind, CastState};
    pub use crate::components::*;
    pub use crate::config::SimConfig;
    pub use crate::error::{Result, SimError};
    pub use crate::match_flow::{MatchPhase, TeamRequest};
    pub use crate::math::{Fixed, Vec2Fixed};
    pub use crate::replication::{CommandFrame, ConnectionId, GhostId, GhostSnapshot};
    pub use crate::simulation::{SimEvent, Simulation};
    pub use crate::tick::Tick;
    pub use crate::world::{EntityHandle, World, WorldRole};
}
