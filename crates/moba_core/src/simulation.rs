//! Step driver.
//!
//! One [`Simulation`] owns one world: the authoritative server world or a
//! predicting client world. Every pass runs the same statically ordered
//! [`STAGES`] list; structural changes recorded by a stage are played back
//! before the next stage runs.
//!
//! # Determinism
//!
//! - Fixed-point math only (see [`crate::math`])
//! - Entities are visited in slot order and spatial results are sorted
//! - No randomness and no wall-clock reads
//! - The same inputs and command records reproduce the same [`Simulation::state_hash`]
//!
//! # Example
//!
//! ```
//! use moba_core::config::SimConfig;
//! use moba_core::match_flow::TeamRequest;
//! use moba_core::replication::ConnectionId;
//! use moba_core::simulation::Simulation;
//!
//! let mut server = Simulation::server(SimConfig::default()).unwrap();
//! server.join(ConnectionId::new(1), TeamRequest::AutoAssign).unwrap();
//! server.step();
//! assert_eq!(server.current_tick().get(), 1);
//! ```

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::ability::{self, AbilityKind, CastState};
use crate::combat;
use crate::components::{EntityKind, PlayerInput, Team};
use crate::config::SimConfig;
use crate::cooldown;
use crate::damage;
use crate::error::{Result, SimError};
use crate::lifecycle;
use crate::match_flow::{self, JoinOutcome, TeamRequest};
use crate::math::Fixed;
use crate::movement;
use crate::prediction::{self, PredictionHistory};
use crate::replication::{self, CommandFrame, ConnectionId, GhostSnapshot, ReconcileReport};
use crate::spatial::{SpatialIndex, SpatialQuery};
use crate::tick::{NetworkTime, Tick, TickClock};
use crate::world::{CommandBuffer, EntityHandle, World, WorldRole};

/// Something that happened during a step, for hosts and presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimEvent {
    /// An entity was inserted.
    Spawned {
        /// New entity.
        entity: EntityHandle,
        /// Its kind.
        kind: EntityKind,
    },
    /// An entity was deleted.
    Removed {
        /// Deleted entity.
        entity: EntityHandle,
        /// Its kind.
        kind: EntityKind,
    },
    /// The server resolved a destruction.
    Destroyed {
        /// Destroyed entity.
        entity: EntityHandle,
        /// Its kind.
        kind: EntityKind,
    },
    /// Damage was charged against hit points.
    Damaged {
        /// Damaged entity.
        entity: EntityHandle,
        /// Total for the tick.
        amount: i32,
        /// Hit points left.
        remaining: i32,
        /// Tick of the damage.
        tick: Tick,
    },
    /// A cast committed.
    AbilityCommitted {
        /// Casting champion.
        caster: EntityHandle,
        /// Ability.
        kind: AbilityKind,
        /// Commit tick.
        tick: Tick,
    },
    /// The countdown finished.
    MatchStarted {
        /// Start tick.
        tick: Tick,
    },
    /// A match-ending structure fell.
    GameOver {
        /// Winning team.
        winner: Team,
        /// Tick of the win.
        tick: Tick,
    },
    /// A champion came back.
    Respawned {
        /// Owning player.
        connection: ConnectionId,
        /// New champion.
        entity: EntityHandle,
    },
}

/// Everything a stage may read besides the world.
pub struct StepContext<'a> {
    /// Server or client.
    pub role: WorldRole,
    /// Tick being simulated and whether this is its first full pass.
    pub time: NetworkTime,
    /// Tuning.
    pub config: &'a SimConfig,
    /// Spatial queries against the world as it was when the stage began.
    pub spatial: &'a dyn SpatialQuery,
    /// The predicting player, on clients.
    pub local_connection: Option<ConnectionId>,
}

impl<'a> StepContext<'a> {
    /// Bundle the per-stage context.
    #[must_use]
    pub fn new(
        role: WorldRole,
        time: NetworkTime,
        config: &'a SimConfig,
        spatial: &'a dyn SpatialQuery,
        local_connection: Option<ConnectionId>,
    ) -> Self {
        Self {
            role,
            time,
            config,
            spatial,
            local_connection,
        }
    }

    /// `true` in the authoritative world.
    #[must_use]
    pub fn is_server(&self) -> bool {
        self.role == WorldRole::Server
    }

    /// `true` if `owner` is the local player.
    #[must_use]
    pub fn is_local(&self, owner: Option<ConnectionId>) -> bool {
        owner.is_some() && owner == self.local_connection
    }
}

/// Signature shared by every stage.
pub type StageFn = fn(&mut World, &StepContext<'_>, &mut CommandBuffer);

/// One entry of the stage list.
#[derive(Clone, Copy)]
pub struct Stage {
    /// Name used in logs.
    pub name: &'static str,
    /// Stage body.
    pub run: StageFn,
    /// Rebuild the spatial index before running.
    pub queries_space: bool,
}

const fn stage(name: &'static str, run: StageFn, queries_space: bool) -> Stage {
    Stage {
        name,
        run,
        queries_space,
    }
}

/// Stage order for every pass.
pub const STAGES: [Stage; 16] = [
    stage("apply_inputs", movement::apply_inputs_stage, false),
    stage("cast", ability::cast_stage, false),
    stage("auto_attack", combat::auto_attack_stage, false),
    stage("npc_target", combat::npc_target_stage, true),
    stage("npc_attack", combat::npc_attack_stage, false),
    stage("champion_move", movement::champion_move_stage, false),
    stage("dash", movement::dash_stage, false),
    stage("projectile_move", movement::projectile_move_stage, false),
    stage("minion_move", movement::minion_move_stage, false),
    stage("damage_on_trigger", combat::damage_on_trigger_stage, true),
    stage("minion_waves", match_flow::minion_wave_stage, false),
    stage("aggregate_damage", damage::aggregate_damage_stage, false),
    stage("apply_damage", damage::apply_damage_stage, false),
    stage("destroy_on_timer", lifecycle::destroy_on_timer_stage, false),
    stage("destroy", lifecycle::destroy_stage, false),
    stage("scheduler", match_flow::scheduler_stage, false),
];

/// Run every stage once over `world` for `time`.
pub fn run_stages(world: &mut World, config: &SimConfig, time: NetworkTime, local: Option<ConnectionId>) {
    let mut commands = CommandBuffer::new();
    let empty = SpatialIndex::empty();
    for stage in &STAGES {
        let built;
        let spatial: &dyn SpatialQuery = if stage.queries_space {
            built = SpatialIndex::build(world);
            &built
        } else {
            &empty
        };
        let ctx = StepContext::new(world.role(), time, config, spatial, local);
        (stage.run)(world, &ctx, &mut commands);
        if !commands.is_empty() {
            tracing::trace!(stage = stage.name, commands = commands.len(), "playback");
            commands.playback(world, time.server_tick);
        }
    }
}

/// A server or client simulation.
///
/// The server steps authoritatively and produces snapshots. A client
/// predicts its own champion one tick at a time and reconciles against
/// snapshots by resimulating from the snapshot tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Simulation {
    config: SimConfig,
    world: World,
    clock: TickClock,
    local: Option<ConnectionId>,
    history: PredictionHistory,
    /// Server: last snapshot tick each connection acknowledged.
    acknowledged: BTreeMap<ConnectionId, Tick>,
    /// Client: tick of the newest snapshot applied.
    last_snapshot: Option<Tick>,
}

impl Simulation {
    /// Authoritative world with the arena's structures in place.
    pub fn server(config: SimConfig) -> Result<Self> {
        config.validate()?;
        let mut world = World::new(WorldRole::Server);
        let structures = match_flow::build_arena(&mut world, &config);
        world.drain_events();
        tracing::info!(structures = structures.len(), "server world ready");
        Ok(Self::with_world(config, world, None))
    }

    /// Predicting world for `local`, starting at `start`.
    ///
    /// The world stays empty until the first snapshot arrives.
    pub fn client(config: SimConfig, local: ConnectionId, start: Tick) -> Result<Self> {
        config.validate()?;
        let mut sim = Self::with_world(config, World::new(WorldRole::Client), Some(local));
        sim.clock = TickClock::starting_at(start);
        Ok(sim)
    }

    fn with_world(config: SimConfig, world: World, local: Option<ConnectionId>) -> Self {
        let history = PredictionHistory::with_capacity(config.history_capacity);
        Self {
            config,
            world,
            clock: TickClock::starting_at(Tick::ZERO),
            local,
            history,
            acknowledged: BTreeMap::new(),
            last_snapshot: None,
        }
    }

    /// Tuning in use.
    #[must_use]
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// The world.
    #[must_use]
    pub fn world(&self) -> &World {
        &self.world
    }

    /// The world, mutably. For hosts that script state directly.
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// Last simulated tick.
    #[must_use]
    pub const fn current_tick(&self) -> Tick {
        self.clock.current()
    }

    /// Server or client.
    #[must_use]
    pub const fn role(&self) -> WorldRole {
        self.world.role()
    }

    /// The predicting player, on clients.
    #[must_use]
    pub const fn local_connection(&self) -> Option<ConnectionId> {
        self.local
    }

    /// Tick of the newest snapshot applied, on clients.
    #[must_use]
    pub const fn last_snapshot_tick(&self) -> Option<Tick> {
        self.last_snapshot
    }

    /// Admit a player. Server only.
    pub fn join(&mut self, connection: ConnectionId, request: TeamRequest) -> Result<JoinOutcome> {
        match_flow::join(&mut self.world, &self.config, connection, request, self.clock.current())
    }

    /// Remove a player. Returns `false` if it never joined.
    pub fn leave(&mut self, connection: ConnectionId) -> bool {
        match_flow::leave(&mut self.world, connection, self.clock.current())
    }

    /// Record `input` for `connection` at `tick`.
    pub fn submit_input(&mut self, connection: ConnectionId, tick: Tick, input: PlayerInput) {
        self.world
            .record_input(connection, tick, input, self.config.history_capacity);
    }

    /// Accept a client's frame: its input and its command records. Server
    /// side.
    ///
    /// Input for a tick that already ran is stored but has no effect.
    pub fn receive_commands(&mut self, frame: &CommandFrame) -> usize {
        let current = self.clock.current();
        if !frame.tick.is_newer_than(current) {
            tracing::debug!(
                connection = %frame.connection,
                tick = %frame.tick,
                %current,
                "late command frame"
            );
        }
        self.submit_input(frame.connection, frame.tick, frame.input);
        replication::apply_command_records(&mut self.world, frame.connection, &frame.records)
    }

    /// Advance one tick and return the events it produced.
    pub fn step(&mut self) -> Vec<SimEvent> {
        self.step_batch(1)
    }

    /// Advance `ticks` ticks in a single pass, as a host running behind does.
    ///
    /// Cooldown gates look back across the skipped ticks.
    pub fn step_batch(&mut self, ticks: u32) -> Vec<SimEvent> {
        let tick = self.clock.advance_batch(ticks);
        let time = self.clock.network_time(true);
        run_stages(&mut self.world, &self.config, time, self.local);

        if self.world.is_server() {
            self.world
                .prune_removal_log(tick, self.config.history_capacity as u32);
        } else {
            self.history.record(&self.world, tick);
        }

        #[cfg(debug_assertions)]
        {
            let hash = self.state_hash();
            tracing::trace!(%tick, state_hash = hash, "step state hash");
        }

        self.world.drain_events()
    }

    /// Predict one tick with the local player's `input` and return the frame
    /// to send to the server. Client side.
    pub fn predict(&mut self, input: PlayerInput) -> Result<(CommandFrame, Vec<SimEvent>)> {
        let Some(local) = self.local else {
            return Err(SimError::InvalidState("only clients predict".into()));
        };
        let tick = self.clock.current().add(1);
        self.submit_input(local, tick, input);
        let events = self.step();
        let frame = CommandFrame {
            tick,
            connection: local,
            input,
            records: self.world.take_outgoing(),
        };
        Ok((frame, events))
    }

    /// Build the snapshot for `connection` at the current tick. Server side.
    #[must_use]
    pub fn snapshot_for(&self, connection: ConnectionId) -> GhostSnapshot {
        let since = self.acknowledged.get(&connection).copied();
        replication::snapshot_for(&self.world, self.clock.current(), connection, since)
    }

    /// Record that `connection` applied the snapshot for `tick`.
    pub fn acknowledge(&mut self, connection: ConnectionId, tick: Tick) {
        let entry = self.acknowledged.entry(connection).or_insert(tick);
        if tick.is_newer_than(*entry) {
            *entry = tick;
        }
    }

    /// Apply a snapshot and resimulate up to the current tick. Client side.
    ///
    /// Snapshots older than one already applied are ignored. A snapshot ahead
    /// of the client moves its clock forward without resimulating.
    pub fn reconcile(&mut self, snapshot: &GhostSnapshot) -> Result<Option<ReconcileReport>> {
        let Some(local) = self.local else {
            return Err(SimError::InvalidState("only clients reconcile".into()));
        };
        if self
            .last_snapshot
            .is_some_and(|last| !snapshot.tick.is_newer_than(last))
        {
            tracing::debug!(tick = %snapshot.tick, "stale snapshot ignored");
            return Ok(None);
        }
        self.last_snapshot = Some(snapshot.tick);

        let report = replication::apply_snapshot(&mut self.world, snapshot, &self.config, local);
        let current = self.clock.current();
        if !current.is_newer_than(snapshot.tick) {
            self.clock = TickClock::starting_at(snapshot.tick);
            self.history.record(&self.world, snapshot.tick);
            self.world.drain_events();
            return Ok(Some(report));
        }

        let rewound = self.history.rewind(&mut self.world, snapshot.tick, &report.overlaid);
        let resimulated = self.resimulate(snapshot.tick, current);
        tracing::trace!(
            snapshot = %snapshot.tick,
            %current,
            rewound,
            resimulated,
            "reconciled"
        );
        Ok(Some(report))
    }

    /// Repeat the ticks after `from` up to and including `to`, without
    /// re-running prediction-only logic. Returns the number of ticks
    /// repeated.
    ///
    /// A span longer than `max_resimulation_ticks` repeats only the newest
    /// ticks of it.
    pub fn resimulate(&mut self, from: Tick, to: Tick) -> u32 {
        let span = to.ticks_since(from);
        if span <= 0 {
            return 0;
        }
        let mut span = span as u32;
        let limit = self.config.max_resimulation_ticks;
        if span > limit {
            tracing::warn!(%from, %to, span, limit, "resimulation window clamped");
            span = limit;
        }
        let first = to.subtract(span - 1);
        for offset in 0..span {
            let tick = first.add(offset);
            prediction::freeze_unborn(&mut self.world, tick);
            run_stages(&mut self.world, &self.config, NetworkTime::repeat(tick), self.local);
            self.history.record(&self.world, tick);
        }
        prediction::thaw(&mut self.world);
        self.world.drain_events();
        span
    }

    /// Hash of the gameplay-relevant state.
    ///
    /// Equal worlds hash equally on every peer and every run.
    #[must_use]
    pub fn state_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.clock.current().hash(&mut hasher);
        self.world.match_state.phase.hash(&mut hasher);
        self.world.entities.len().hash(&mut hasher);
        for entity in self.world.entities.iter() {
            entity.handle().hash(&mut hasher);
            entity.kind.hash(&mut hasher);
            entity.lifecycle.hash(&mut hasher);
            entity.team.hash(&mut hasher);
            entity.ghost.hash(&mut hasher);
            entity.transform.hash(&mut hasher);
            entity.hit_points.hash(&mut hasher);
            entity.dash.hash(&mut hasher);
            entity.move_target.hash(&mut hasher);
            entity.motion.hash(&mut hasher);
            entity.destroy_at.hash(&mut hasher);
            if let Some(loadout) = &entity.abilities {
                loadout.states.hash(&mut hasher);
                loadout.history.latest().hash(&mut hasher);
            }
            if let Some(npc) = &entity.npc {
                npc.target.hash(&mut hasher);
            }
        }
        hasher.finish()
    }

    /// Serialize the whole simulation with bincode.
    pub fn save_state(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| SimError::Serialization(format!("failed to save simulation: {e}")))
    }

    /// Restore a simulation saved with [`save_state`](Self::save_state).
    pub fn load_state(bytes: &[u8]) -> Result<Self> {
        let sim: Self = bincode::deserialize(bytes)
            .map_err(|e| SimError::Serialization(format!("failed to load simulation: {e}")))?;
        sim.config.validate()?;
        Ok(sim)
    }

    /// The local player's champion, on clients.
    #[must_use]
    pub fn local_champion(&self) -> Option<EntityHandle> {
        self.world.entities.champion_of(self.local?)
    }

    /// Remaining cooldown of `kind` on `entity` as a fill fraction.
    pub fn cooldown_fraction(&self, entity: EntityHandle, kind: AbilityKind) -> Result<Fixed> {
        let loadout = self.loadout(entity)?;
        Ok(cooldown::remaining_fraction(
            &loadout.history,
            self.clock.current(),
            kind,
            loadout.cooldown_ticks.get(kind),
        ))
    }

    /// Cast state of `kind` on `entity`.
    pub fn cast_state(&self, entity: EntityHandle, kind: AbilityKind) -> Result<CastState> {
        Ok(self.loadout(entity)?.states.get(kind))
    }

    /// Remaining hit points of `entity` as a fraction.
    pub fn hit_point_fraction(&self, entity: EntityHandle) -> Result<Fixed> {
        let record = self
            .world
            .entities
            .get(entity)
            .ok_or(SimError::StaleHandle(entity))?;
        record
            .hit_points
            .map(|hp| hp.fraction())
            .ok_or(SimError::MissingComponent {
                entity,
                component: "hit_points",
            })
    }

    /// Whole seconds until the match starts, while counting down.
    #[must_use]
    pub fn countdown_seconds(&self) -> Option<u32> {
        self.world
            .match_state
            .countdown_remaining(self.clock.current(), self.config.tick_rate)
    }

    fn loadout(&self, entity: EntityHandle) -> Result<&ability::AbilityLoadout> {
        let record = self
            .world
            .entities
            .get(entity)
            .ok_or(SimError::StaleHandle(entity))?;
        record.abilities.as_ref().ok_or(SimError::MissingComponent {
            entity,
            component: "abilities",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::InputEvent;
    use crate::match_flow::MatchPhase;
    use crate::math::Vec2Fixed;

    fn started_server() -> (Simulation, EntityHandle, EntityHandle) {
        let mut config = SimConfig::default();
        config.rules.countdown_seconds = 0;
        let mut server = Simulation::server(config).unwrap();
        let blue = server.join(ConnectionId::new(1), TeamRequest::Blue).unwrap();
        let red = server.join(ConnectionId::new(2), TeamRequest::Red).unwrap();
        server.step();
        (server, blue.champion, red.champion)
    }

    fn press(event: &mut InputEvent) {
        event.set();
    }

    #[test]
    fn test_server_starts_match_after_countdown() {
        let (server, _, _) = started_server();
        assert!(server.world().match_state.is_playing());
    }

    #[test]
    fn test_area_ability_cooldown_on_server() {
        let (mut server, blue, _) = started_server();
        let conn = ConnectionId::new(1);
        let mut input = PlayerInput::default();
        press(&mut input.abilities.area);
        let tick = server.current_tick().add(1);
        server.submit_input(conn, tick, input);

        let events = server.step();
        assert!(events.iter().any(|e| matches!(
            e,
            SimEvent::AbilityCommitted { caster, kind: AbilityKind::Area, .. } if *caster == blue
        )));
        assert!(matches!(
            server.cast_state(blue, AbilityKind::Area),
            Ok(CastState::Committed { .. })
        ));
    }

    #[test]
    fn test_champion_walks_on_server() {
        let (mut server, blue, _) = started_server();
        let start = server.world().entities.get(blue).and_then(|e| e.position()).unwrap();
        let input = PlayerInput {
            move_target: Some(start + Vec2Fixed::from_ints(0, 10)),
            ..PlayerInput::default()
        };
        let tick = server.current_tick().add(1);
        server.submit_input(ConnectionId::new(1), tick, input);
        for _ in 0..5 {
            server.step();
        }
        let end = server.world().entities.get(blue).and_then(|e| e.position()).unwrap();
        assert!(end.y > start.y);
        assert_eq!(end.x, start.x);
    }

    #[test]
    fn test_save_and_load_preserves_hash() {
        let (mut server, _, _) = started_server();
        for _ in 0..10 {
            server.step();
        }
        let bytes = server.save_state().unwrap();
        let restored = Simulation::load_state(&bytes).unwrap();
        assert_eq!(restored.state_hash(), server.state_hash());
        assert_eq!(restored.current_tick(), server.current_tick());
    }

    #[test]
    fn test_identical_servers_hash_equally() {
        let (mut a, _, _) = started_server();
        let (mut b, _, _) = started_server();
        for _ in 0..60 {
            a.step();
            b.step();
        }
        assert_eq!(a.state_hash(), b.state_hash());
    }

    #[test]
    fn test_client_adopts_first_snapshot_tick() {
        let (server, _, _) = started_server();
        let conn = ConnectionId::new(1);
        let mut client = Simulation::client(SimConfig::default(), conn, Tick::ZERO).unwrap();

        let snapshot = server.snapshot_for(conn);
        let report = client.reconcile(&snapshot).unwrap().unwrap();
        assert!(report.created > 0);
        assert_eq!(client.current_tick(), server.current_tick());
        assert!(client.local_champion().is_some());
        assert!(matches!(client.world().match_state.phase, MatchPhase::Playing { .. }));

        // Replaying the same snapshot is a no-op.
        assert!(client.reconcile(&snapshot).unwrap().is_none());
    }

    #[test]
    fn test_server_rejects_predict() {
        let (mut server, _, _) = started_server();
        assert!(server.predict(PlayerInput::default()).is_err());
    }

    #[test]
    fn test_presentation_queries_report_stale_handles() {
        let (mut server, blue, _) = started_server();
        server.world_mut().despawn(blue, Tick::new(1));
        assert!(matches!(
            server.hit_point_fraction(blue),
            Err(SimError::StaleHandle(_))
        ));
    }
}
