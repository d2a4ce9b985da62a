//! Server-side replay log.
//!
//! A replay stores the server's initial state plus everything fed to it
//! between steps (joins, leaves and client command frames), tagged with the
//! tick the server had reached when it accepted them. Periodic hash
//! checkpoints let playback pin down the first tick that diverges.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::match_flow::TeamRequest;
use crate::replication::{CommandFrame, ConnectionId};
use crate::simulation::Simulation;
use crate::tick::Tick;

/// Replay file format version.
pub const REPLAY_VERSION: u32 = 1;

/// Something the host did to the server between steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayAction {
    /// A player joined.
    Join {
        /// Joining connection.
        connection: ConnectionId,
        /// Team asked for.
        request: TeamRequest,
    },
    /// A player left.
    Leave {
        /// Leaving connection.
        connection: ConnectionId,
    },
    /// A client frame arrived.
    Frame(CommandFrame),
}

/// One recorded action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayEntry {
    /// Server tick when the action was applied; it affects the next step.
    pub applied_at: Tick,
    /// The action.
    pub action: ReplayAction,
}

/// A recorded match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replay {
    /// Format version.
    pub version: u32,
    /// Scenario name.
    pub scenario_id: String,
    /// Serialized server state at the start of the recording.
    pub initial_state: Vec<u8>,
    /// Actions in the order they were applied.
    pub entries: Vec<ReplayEntry>,
    /// `(tick, state hash)` pairs taken during recording.
    pub checkpoints: Vec<(Tick, u64)>,
    /// Last recorded tick.
    pub final_tick: Tick,
    /// Hash at `final_tick`.
    pub final_hash: u64,
}

impl Replay {
    /// Start recording from `initial`'s current state.
    pub fn new(scenario_id: impl Into<String>, initial: &Simulation) -> Result<Self> {
        Ok(Self {
            version: REPLAY_VERSION,
            scenario_id: scenario_id.into(),
            initial_state: initial.save_state()?,
            entries: Vec::new(),
            checkpoints: Vec::new(),
            final_tick: initial.current_tick(),
            final_hash: initial.state_hash(),
        })
    }

    /// Record an action applied while the server stood at `applied_at`.
    pub fn record(&mut self, applied_at: Tick, action: ReplayAction) {
        self.entries.push(ReplayEntry { applied_at, action });
    }

    /// Record a state hash.
    pub fn checkpoint(&mut self, tick: Tick, hash: u64) {
        self.checkpoints.push((tick, hash));
    }

    /// Close the recording.
    pub fn finalize(&mut self, final_tick: Tick, final_hash: u64) {
        self.final_tick = final_tick;
        self.final_hash = final_hash;
    }

    /// Ticks between the start of the recording and its end.
    pub fn duration(&self) -> Result<u32> {
        let start = self.restore_initial_state()?.current_tick();
        Ok(self.final_tick.ticks_since(start).max(0) as u32)
    }

    /// Write the replay with bincode.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = bincode::serialize(self)
            .map_err(|e| SimError::Serialization(format!("failed to serialize replay: {e}")))?;
        std::fs::write(path.as_ref(), bytes)?;
        Ok(())
    }

    /// Read a replay written by [`save`](Self::save).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let replay: Self = bincode::deserialize(&bytes)
            .map_err(|e| SimError::Serialization(format!("failed to deserialize replay: {e}")))?;
        if replay.version != REPLAY_VERSION {
            return Err(SimError::InvalidState(format!(
                "replay version mismatch: expected {REPLAY_VERSION}, got {}",
                replay.version
            )));
        }
        Ok(replay)
    }

    /// Server state at the start of the recording.
    pub fn restore_initial_state(&self) -> Result<Simulation> {
        Simulation::load_state(&self.initial_state)
    }

    /// Actions applied at `tick`.
    #[must_use]
    pub fn entries_at(&self, tick: Tick) -> Vec<&ReplayEntry> {
        self.entries.iter().filter(|e| e.applied_at == tick).collect()
    }
}

/// Steps a restored server through a replay.
#[derive(Debug)]
pub struct ReplayPlayer {
    replay: Replay,
    simulation: Simulation,
    cursor: usize,
}

impl ReplayPlayer {
    /// Restore the initial state of `replay`.
    pub fn new(replay: Replay) -> Result<Self> {
        let simulation = replay.restore_initial_state()?;
        Ok(Self {
            replay,
            simulation,
            cursor: 0,
        })
    }

    /// Current server state.
    #[must_use]
    pub const fn simulation(&self) -> &Simulation {
        &self.simulation
    }

    /// `true` once `final_tick` is reached.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.simulation
            .current_tick()
            .is_at_or_after(self.replay.final_tick)
    }

    /// Apply the actions recorded at the current tick and step once.
    ///
    /// Returns `false` if the replay was already finished.
    pub fn advance(&mut self) -> Result<bool> {
        if self.is_finished() {
            return Ok(false);
        }
        let now = self.simulation.current_tick();
        while let Some(entry) = self.replay.entries.get(self.cursor) {
            if entry.applied_at != now {
                break;
            }
            match &entry.action {
                ReplayAction::Join {
                    connection,
                    request,
                } => {
                    self.simulation.join(*connection, *request)?;
                }
                ReplayAction::Leave { connection } => {
                    self.simulation.leave(*connection);
                }
                ReplayAction::Frame(frame) => {
                    self.simulation.receive_commands(frame);
                }
            }
            self.cursor += 1;
        }
        self.simulation.step();
        Ok(true)
    }

    /// Play to the end, checking every checkpoint and the final hash.
    ///
    /// # Errors
    ///
    /// [`SimError::DesyncDetected`] at the first tick whose hash differs.
    pub fn verify(&mut self) -> Result<()> {
        let mut checkpoints = self.replay.checkpoints.clone().into_iter().peekable();
        while self.advance()? {
            let tick = self.simulation.current_tick();
            while let Some(&(at, expected)) = checkpoints.peek() {
                if tick.is_newer_than(at) {
                    checkpoints.next();
                    continue;
                }
                if at != tick {
                    break;
                }
                let actual = self.simulation.state_hash();
                if actual != expected {
                    return Err(SimError::DesyncDetected {
                        tick: tick.get(),
                        expected,
                        actual,
                    });
                }
                checkpoints.next();
            }
        }
        let actual = self.simulation.state_hash();
        if actual != self.replay.final_hash {
            return Err(SimError::DesyncDetected {
                tick: self.simulation.current_tick().get(),
                expected: self.replay.final_hash,
                actual,
            });
        }
        tracing::info!(
            scenario = %self.replay.scenario_id,
            tick = %self.simulation.current_tick(),
            "replay verified"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::PlayerInput;
    use crate::config::SimConfig;
    use crate::math::Vec2Fixed;

    fn record(ticks: u32) -> (Replay, Simulation) {
        let mut config = SimConfig::default();
        config.rules.countdown_seconds = 1;
        let mut server = Simulation::server(config).unwrap();
        let mut replay = Replay::new("duel", &server).unwrap();

        for (id, request) in [(1, TeamRequest::Blue), (2, TeamRequest::Red)] {
            let connection = ConnectionId::new(id);
            server.join(connection, request).unwrap();
            replay.record(server.current_tick(), ReplayAction::Join { connection, request });
        }

        for _ in 0..ticks {
            let now = server.current_tick();
            let frame = CommandFrame {
                tick: now.add(1),
                connection: ConnectionId::new(1),
                input: PlayerInput {
                    move_target: Some(Vec2Fixed::from_ints(0, 0)),
                    ..PlayerInput::default()
                },
                records: Vec::new(),
            };
            server.receive_commands(&frame);
            replay.record(now, ReplayAction::Frame(frame));
            server.step();
            if server.current_tick().get() % 10 == 0 {
                replay.checkpoint(server.current_tick(), server.state_hash());
            }
        }
        replay.finalize(server.current_tick(), server.state_hash());
        (replay, server)
    }

    #[test]
    fn test_replay_reproduces_final_hash() {
        let (replay, server) = record(60);
        assert_eq!(replay.checkpoints.len(), 6);
        assert_eq!(replay.duration().unwrap(), 60);

        let mut player = ReplayPlayer::new(replay).unwrap();
        player.verify().unwrap();
        assert_eq!(player.simulation().state_hash(), server.state_hash());
        assert!(player.is_finished());
    }

    #[test]
    fn test_tampered_checkpoint_reports_tick() {
        let (mut replay, _) = record(30);
        replay.checkpoints[1].1 ^= 1;
        let mut player = ReplayPlayer::new(replay).unwrap();
        match player.verify() {
            Err(SimError::DesyncDetected { tick, .. }) => assert_eq!(tick, 20),
            other => panic!("expected desync, got {other:?}"),
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (replay, _) = record(5);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("duel.replay");
        replay.save(&path).unwrap();

        let loaded = Replay::load(&path).unwrap();
        assert_eq!(loaded.scenario_id, "duel");
        assert_eq!(loaded.entries.len(), replay.entries.len());
        assert_eq!(loaded.final_hash, replay.final_hash);
        assert_eq!(loaded.entries_at(Tick::ZERO).len(), 3);
    }
}
