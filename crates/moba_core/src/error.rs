//! Error types for the simulation core.
//!
//! Gameplay stages never return errors: a missing component skips the entity
//! for one step and is logged. These variants cover the fallible API surface
//! that hosts call directly (configuration, snapshots, replays, join requests).

use thiserror::Error;

use crate::world::EntityHandle;

/// Result type alias using [`SimError`].
pub type Result<T> = std::result::Result<T, SimError>;

/// Top-level error type for the simulation core.
#[derive(Debug, Error)]
pub enum SimError {
    /// Handle refers to an entity that no longer exists (or was recycled).
    #[error("Stale or unknown entity handle: {0}")]
    StaleHandle(EntityHandle),

    /// Entity exists but lacks a component the operation needs.
    #[error("Entity {entity} is missing component '{component}'")]
    MissingComponent {
        /// Entity the operation targeted.
        entity: EntityHandle,
        /// Name of the absent component.
        component: &'static str,
    },

    /// Configuration failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed.
    #[error("Failed to parse config '{path}': {message}")]
    ConfigParse {
        /// Path to the file that failed to parse.
        path: String,
        /// Error message.
        message: String,
    },

    /// A team has no free player slots.
    #[error("Team {team} is full ({capacity} players)")]
    TeamFull {
        /// Requested team name.
        team: String,
        /// Players allowed per team.
        capacity: u32,
    },

    /// Snapshot or replay (de)serialization failed.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Filesystem access failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid simulation state for the requested operation.
    #[error("Invalid simulation state: {0}")]
    InvalidState(String),

    /// Desync detected while verifying a replay or a resimulation.
    #[error("Desync detected at tick {tick}: expected hash {expected}, got {actual}")]
    DesyncDetected {
        /// Tick where the divergence was observed.
        tick: u32,
        /// Hash recorded by the reference run.
        expected: u64,
        /// Hash produced by this run.
        actual: u64,
    },
}
