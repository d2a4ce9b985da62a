//! Match admission, start countdown, respawns, minion waves and game over.
//!
//! The server owns all of this. Clients mirror [`MatchPhase`] from snapshots
//! so countdowns and the game-over screen read the same on every peer.

use serde::{Deserialize, Serialize};

use crate::archetype;
use crate::components::Team;
use crate::config::{grid_to_vec, SimConfig};
use crate::error::{Result, SimError};
use crate::math::Vec2Fixed;
use crate::replication::ConnectionId;
use crate::scheduler::countdown_seconds;
use crate::simulation::{SimEvent, StepContext};
use crate::tick::Tick;
use crate::world::{CommandBuffer, EntityHandle, World};

/// Payload of a scheduled match event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchEvent {
    /// Countdown finished.
    StartMatch,
    /// A destroyed champion comes back.
    Respawn {
        /// Player to respawn.
        connection: ConnectionId,
        /// Team to respawn on.
        team: Team,
    },
}

/// Where the match is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MatchPhase {
    /// Not enough players yet.
    #[default]
    WaitingForPlayers,
    /// Enough players; the match starts at `start_at`.
    Countdown {
        /// Tick the match starts.
        start_at: Tick,
    },
    /// Gameplay running.
    Playing {
        /// Tick the match started.
        since: Tick,
    },
    /// A match-ending structure fell.
    Over {
        /// Winning team.
        winner: Team,
        /// Tick the match ended.
        at: Tick,
    },
}

/// A joined player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerSlot {
    /// The player's connection.
    pub connection: ConnectionId,
    /// Team joined.
    pub team: Team,
    /// Index into the team's spawn offsets.
    pub slot: usize,
}

/// Progress of the current minion wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct WaveTimer {
    /// Tick the next wave starts.
    pub next_wave_at: Option<Tick>,
    /// Minions per lane still to spawn in the current wave.
    pub remaining: u32,
    /// Tick the next minion of the current wave spawns.
    pub next_minion_at: Option<Tick>,
}

/// Match phase, roster and wave progress.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MatchState {
    /// Current phase.
    pub phase: MatchPhase,
    /// Joined players in join order.
    pub roster: Vec<PlayerSlot>,
    /// Minion wave progress.
    pub waves: WaveTimer,
}

impl MatchState {
    /// `true` while gameplay runs.
    #[must_use]
    pub const fn is_playing(&self) -> bool {
        matches!(self.phase, MatchPhase::Playing { .. })
    }

    /// Winner, once the match is over.
    #[must_use]
    pub const fn winner(&self) -> Option<Team> {
        match self.phase {
            MatchPhase::Over { winner, .. } => Some(winner),
            _ => None,
        }
    }

    /// Players on `team`.
    #[must_use]
    pub fn team_size(&self, team: Team) -> u32 {
        self.roster.iter().filter(|p| p.team == team).count() as u32
    }

    /// Roster entry for `connection`.
    #[must_use]
    pub fn player(&self, connection: ConnectionId) -> Option<&PlayerSlot> {
        self.roster.iter().find(|p| p.connection == connection)
    }

    /// Whole seconds until the match starts, while counting down.
    #[must_use]
    pub fn countdown_remaining(&self, current: Tick, tick_rate: u32) -> Option<u32> {
        match self.phase {
            MatchPhase::Countdown { start_at } => Some(countdown_seconds(start_at, current, tick_rate)),
            _ => None,
        }
    }
}

/// Team a joining player asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TeamRequest {
    /// Join blue.
    Blue,
    /// Join red.
    Red,
    /// Join the smaller team (blue on a tie).
    AutoAssign,
}

/// Result of a successful join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    /// The player's champion.
    pub champion: EntityHandle,
    /// Team joined.
    pub team: Team,
    /// Spawn slot within the team.
    pub slot: usize,
    /// Start tick, if this join started the countdown.
    pub countdown_started: Option<Tick>,
}

/// Spawn every configured structure. Server only.
pub fn build_arena(world: &mut World, config: &SimConfig) -> Vec<EntityHandle> {
    config
        .structures
        .iter()
        .map(|layout| world.spawn(archetype::structure(config, layout)))
        .collect()
}

/// Admit `connection` to the match and spawn its champion.
///
/// # Errors
///
/// [`SimError::InvalidState`] on a client world, for a duplicate join or once
/// the match is over; [`SimError::TeamFull`] if the requested team has no
/// free slot.
pub fn join(
    world: &mut World,
    config: &SimConfig,
    connection: ConnectionId,
    request: TeamRequest,
    tick: Tick,
) -> Result<JoinOutcome> {
    if !world.is_server() {
        return Err(SimError::InvalidState("only the server admits players".into()));
    }
    if world.match_state.player(connection).is_some() {
        return Err(SimError::InvalidState(format!("{connection} already joined")));
    }
    if let MatchPhase::Over { .. } = world.match_state.phase {
        return Err(SimError::InvalidState("match is over".into()));
    }

    let capacity = config.rules.max_players_per_team;
    let team = match request {
        TeamRequest::Blue => Team::Blue,
        TeamRequest::Red => Team::Red,
        TeamRequest::AutoAssign => {
            let blue = world.match_state.team_size(Team::Blue);
            let red = world.match_state.team_size(Team::Red);
            if red < blue {
                Team::Red
            } else {
                Team::Blue
            }
        }
    };
    if world.match_state.team_size(team) >= capacity {
        return Err(SimError::TeamFull {
            team: team.to_string(),
            capacity,
        });
    }

    let slot = (0..capacity as usize)
        .find(|slot| {
            !world
                .match_state
                .roster
                .iter()
                .any(|p| p.team == team && p.slot == *slot)
        })
        .ok_or_else(|| SimError::TeamFull {
            team: team.to_string(),
            capacity,
        })?;

    let position = config.slot_spawn(team, slot);
    let champion = world.spawn(archetype::champion(config, team, position, connection));
    world.match_state.roster.push(PlayerSlot {
        connection,
        team,
        slot,
    });
    tracing::info!(%connection, %team, slot, "player joined");

    let mut countdown_started = None;
    let joined = world.match_state.roster.len() as u32;
    if world.match_state.phase == MatchPhase::WaitingForPlayers
        && joined >= config.rules.min_players_to_start
    {
        let start_at = tick.add(config.whole_seconds_to_ticks(config.rules.countdown_seconds));
        world.match_state.phase = MatchPhase::Countdown { start_at };
        world.scheduler.schedule(start_at, MatchEvent::StartMatch);
        tracing::info!(%start_at, players = joined, "start countdown");
        countdown_started = Some(start_at);
    }

    Ok(JoinOutcome {
        champion,
        team,
        slot,
        countdown_started,
    })
}

/// Remove `connection` from the match along with its champion and pending
/// respawn. Returns `false` if it never joined.
pub fn leave(world: &mut World, connection: ConnectionId, tick: Tick) -> bool {
    let before = world.match_state.roster.len();
    world.match_state.roster.retain(|p| p.connection != connection);
    if world.match_state.roster.len() == before {
        return false;
    }
    world.scheduler.cancel_where(|event| {
        matches!(event, MatchEvent::Respawn { connection: c, .. } if *c == connection)
    });
    if let Some(champion) = world.entities.champion_of(connection) {
        world.despawn(champion, tick);
    }
    world.inputs.remove(&connection);
    tracing::info!(%connection, "player left");
    true
}

/// Record `winner` and stop gameplay. Later calls are ignored.
pub fn end_match(world: &mut World, winner: Team, tick: Tick) {
    if let MatchPhase::Over { .. } = world.match_state.phase {
        return;
    }
    world.match_state.phase = MatchPhase::Over { winner, at: tick };
    tracing::info!(%winner, %tick, "match over");
    world.emit(SimEvent::GameOver { winner, tick });
}

/// Fire due match events.
pub fn scheduler_stage(world: &mut World, ctx: &StepContext<'_>, _commands: &mut CommandBuffer) {
    if !ctx.time.is_first_full_tick() {
        return;
    }
    let tick = ctx.time.server_tick;
    for event in world.scheduler.drain_due(tick) {
        match event {
            MatchEvent::StartMatch => {
                if let MatchPhase::Countdown { .. } = world.match_state.phase {
                    world.match_state.phase = MatchPhase::Playing { since: tick };
                    world.match_state.waves = WaveTimer {
                        next_wave_at: Some(tick),
                        ..WaveTimer::default()
                    };
                    tracing::info!(%tick, "match started");
                    world.emit(SimEvent::MatchStarted { tick });
                }
            }
            MatchEvent::Respawn { connection, team } => {
                if !ctx.is_server() {
                    continue;
                }
                let Some(slot) = world.match_state.player(connection).map(|p| p.slot) else {
                    tracing::debug!(%connection, "respawn dropped: player left");
                    continue;
                };
                let position = ctx.config.slot_spawn(team, slot);
                let champion = world.spawn(archetype::champion(ctx.config, team, position, connection));
                tracing::debug!(%connection, entity = %champion, "respawned");
                world.emit(SimEvent::Respawned {
                    connection,
                    entity: champion,
                });
            }
        }
    }
}

/// Lane waypoints for `team`; red walks blue's lanes in reverse.
#[must_use]
pub fn lane_waypoints(config: &SimConfig, lane: usize, team: Team) -> Vec<Vec2Fixed> {
    let Some(points) = config.waves.lanes.get(lane) else {
        return Vec::new();
    };
    let mut waypoints: Vec<Vec2Fixed> = points.iter().copied().map(grid_to_vec).collect();
    if team == Team::Red {
        waypoints.reverse();
    }
    waypoints
}

/// Spawn minion waves on the server while the match runs.
pub fn minion_wave_stage(world: &mut World, ctx: &StepContext<'_>, commands: &mut CommandBuffer) {
    if !ctx.is_server() || !ctx.time.is_first_full_tick() || !world.match_state.is_playing() {
        return;
    }
    let tick = ctx.time.server_tick;
    let tuning = &ctx.config.waves;
    let waves = &mut world.match_state.waves;

    if waves.remaining == 0 {
        match waves.next_wave_at {
            Some(at) if tick.is_at_or_after(at) => {
                waves.remaining = tuning.minions_per_wave;
                waves.next_minion_at = Some(tick);
                tracing::debug!(%tick, "minion wave started");
            }
            _ => return,
        }
    }
    let Some(at) = waves.next_minion_at else {
        return;
    };
    if !tick.is_at_or_after(at) || waves.remaining == 0 {
        return;
    }

    waves.remaining -= 1;
    if waves.remaining == 0 {
        waves.next_minion_at = None;
        let interval = ctx.config.whole_seconds_to_ticks(tuning.wave_interval_seconds);
        waves.next_wave_at = Some(tick.add(interval));
    } else {
        waves.next_minion_at = Some(tick.add(tuning.minion_spacing_ticks));
    }

    for lane in 0..tuning.lanes.len() {
        for team in [Team::Blue, Team::Red] {
            let waypoints = lane_waypoints(ctx.config, lane, team);
            commands.spawn(archetype::minion(ctx.config, team, waypoints));
        }
    }
}
