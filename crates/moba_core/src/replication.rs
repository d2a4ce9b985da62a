//! Boundary with the transport layer.
//!
//! Servers produce a [`GhostSnapshot`] per connection; clients apply it with
//! [`apply_snapshot`], which overlays the replicated fields, unifies
//! predicted spawns with their authoritative ghosts and confirms removals.
//! Clients send [`CommandFrame`]s carrying their input and the command data
//! (cooldown expiries) that only the predicting client writes.
//!
//! Bytes on the wire are the transport's business; [`GhostSnapshot::encode`]
//! and [`CommandFrame::encode`] exist for loopback links and tests.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ability::PredictedSpawnTag;
use crate::archetype;
use crate::components::{DashState, EntityKind, PlayerInput, Team, Transform};
use crate::config::SimConfig;
use crate::cooldown::CooldownTargets;
use crate::damage::HitPoints;
use crate::error::{Result, SimError};
use crate::lifecycle::{self, Lifecycle};
use crate::match_flow::MatchPhase;
use crate::ring_buffer::RingEntry;
use crate::tick::Tick;
use crate::world::{Entity, EntityHandle, World};

/// Replication id the server assigns to every entity it creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GhostId(u32);

impl GhostId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw id.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for GhostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ghost#{}", self.0)
    }
}

/// A connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u32);

impl ConnectionId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw id.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Command data a client writes for its champion and forwards to the
/// server, which stores it as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandRecord {
    /// Ability expiries.
    AbilityCooldowns(RingEntry<CooldownTargets>),
    /// Auto-attack expiry.
    AutoAttackCooldown(RingEntry<Option<Tick>>),
}

/// One tick of client input plus any command records produced while
/// predicting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFrame {
    /// Tick the input is for.
    pub tick: Tick,
    /// Sending connection.
    pub connection: ConnectionId,
    /// Player input.
    pub input: PlayerInput,
    /// Command records written while predicting up to `tick`.
    pub records: Vec<CommandRecord>,
}

impl CommandFrame {
    /// Serialize with bincode.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| SimError::Serialization(e.to_string()))
    }

    /// Deserialize from bincode.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| SimError::Serialization(e.to_string()))
    }
}

/// Replicated fields of one ghost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GhostState {
    /// Ghost id.
    pub ghost: GhostId,
    /// Archetype.
    pub kind: EntityKind,
    /// Team.
    pub team: Option<Team>,
    /// Owning connection.
    pub owner: Option<ConnectionId>,
    /// Position and facing.
    pub transform: Option<Transform>,
    /// Hit points, including the last tick damage was charged for.
    pub hit_points: Option<HitPoints>,
    /// Active dash.
    pub dash: Option<DashState>,
    /// Latest damage record. Omitted for entities the receiver owns, whose
    /// own predicted records must not be overwritten.
    pub damage_this_tick: Option<RingEntry<i32>>,
    /// Spawn identity for unifying with a client prediction.
    pub predicted_spawn: Option<PredictedSpawnTag>,
}

/// Server state as of one tick, tailored to one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GhostSnapshot {
    /// Tick the state is from.
    pub tick: Tick,
    /// Every live ghost.
    pub ghosts: Vec<GhostState>,
    /// Ghosts removed since the receiver's last acknowledged snapshot.
    pub removed: Vec<GhostId>,
    /// Match phase.
    pub match_phase: MatchPhase,
}

impl GhostSnapshot {
    /// Serialize with bincode.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| SimError::Serialization(e.to_string()))
    }

    /// Deserialize from bincode.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| SimError::Serialization(e.to_string()))
    }

    /// State of `ghost`, if present.
    #[must_use]
    pub fn ghost(&self, ghost: GhostId) -> Option<&GhostState> {
        self.ghosts.iter().find(|state| state.ghost == ghost)
    }
}

/// Build the snapshot `connection` receives for `tick`.
///
/// `since` is the tick of the last snapshot the connection acknowledged;
/// removals after it are listed.
#[must_use]
pub fn snapshot_for(world: &World, tick: Tick, connection: ConnectionId, since: Option<Tick>) -> GhostSnapshot {
    let ghosts = world
        .entities
        .iter()
        .filter(|entity| entity.is_active())
        .filter_map(|entity| {
            let ghost = entity.ghost?;
            let owned = entity.owner == Some(connection);
            Some(GhostState {
                ghost,
                kind: entity.kind,
                team: entity.team,
                owner: entity.owner,
                transform: entity.transform,
                hit_points: entity.hit_points,
                dash: entity.dash,
                damage_this_tick: if owned {
                    None
                } else {
                    entity
                        .damage
                        .as_ref()
                        .and_then(|buffers| buffers.this_tick.latest().copied())
                },
                predicted_spawn: entity.predicted_spawn,
            })
        })
        .collect();

    GhostSnapshot {
        tick,
        ghosts,
        removed: world.removed_since(since),
        match_phase: world.match_state.phase,
    }
}

/// Store command records from `connection` on its champion. Server side.
///
/// Returns how many were stored.
pub fn apply_command_records(world: &mut World, connection: ConnectionId, records: &[CommandRecord]) -> usize {
    if records.is_empty() {
        return 0;
    }
    let Some(champion) = world
        .entities
        .champion_of(connection)
        .and_then(|handle| world.entities.get_mut(handle))
    else {
        tracing::warn!(%connection, count = records.len(), "command records dropped: no champion");
        return 0;
    };

    let mut stored = 0;
    for record in records {
        match record {
            CommandRecord::AbilityCooldowns(entry) => {
                if let Some(loadout) = champion.abilities.as_mut() {
                    loadout.history.write(entry.tick, entry.value);
                    stored += 1;
                }
            }
            CommandRecord::AutoAttackCooldown(entry) => {
                if let Some(attack) = champion.auto_attack.as_mut() {
                    attack.cooldown.write(entry.tick, entry.value);
                    stored += 1;
                }
            }
        }
    }
    stored
}

/// What [`apply_snapshot`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Snapshot tick.
    pub snapshot_tick: Tick,
    /// Entities whose replicated fields were overwritten.
    pub overlaid: Vec<EntityHandle>,
    /// Ghosts seen for the first time.
    pub created: usize,
    /// Predicted spawns unified with their ghost.
    pub matched: usize,
    /// Removals confirmed.
    pub removed: usize,
    /// Predicted spawns the server never confirmed.
    pub dropped: usize,
    /// Predicted destructions the server disagreed with.
    pub reverted: usize,
}

/// Apply `snapshot` to a client world whose local player is `local`.
pub fn apply_snapshot(
    world: &mut World,
    snapshot: &GhostSnapshot,
    config: &SimConfig,
    local: ConnectionId,
) -> ReconcileReport {
    let tick = snapshot.tick;
    let mut report = ReconcileReport {
        snapshot_tick: tick,
        ..ReconcileReport::default()
    };

    for ghost in &snapshot.removed {
        if let Some(handle) = world.entities.find_ghost(*ghost) {
            if lifecycle::confirm_removal(world, handle, tick).is_some() {
                report.removed += 1;
            }
        }
    }

    let mut present = BTreeSet::new();
    for state in &snapshot.ghosts {
        let handle = if let Some(handle) = world.entities.find_ghost(state.ghost) {
            handle
        } else if let Some(handle) = claim_prediction(world, state, local) {
            report.matched += 1;
            handle
        } else {
            report.created += 1;
            world.spawn(instantiate(state, config, local))
        };
        present.insert(handle);

        let Some(entity) = world.entities.get_mut(handle) else {
            continue;
        };
        overlay(entity, state);
        if let Lifecycle::MarkedForDestruction { since } = entity.lifecycle {
            if tick.is_at_or_after(since.add(config.max_resimulation_ticks)) {
                entity.lifecycle = Lifecycle::Alive;
                report.reverted += 1;
                tracing::debug!(entity = %handle, ghost = %state.ghost, "predicted destruction reverted");
            }
        }
        report.overlaid.push(handle);
    }

    // Full snapshots list every live ghost; anything else with a ghost id is
    // gone on the server even if its removal fell out of the log.
    let vanished: Vec<EntityHandle> = world
        .entities
        .iter()
        .filter(|entity| entity.ghost.is_some() && !present.contains(&entity.handle()))
        .map(Entity::handle)
        .collect();
    for handle in vanished {
        if lifecycle::confirm_removal(world, handle, tick).is_some() {
            report.removed += 1;
        }
    }

    let horizon = config.max_resimulation_ticks;
    let unconfirmed: Vec<EntityHandle> = world
        .entities
        .iter()
        .filter(|entity| entity.ghost.is_none())
        .filter(|entity| {
            entity
                .predicted_spawn
                .is_some_and(|tag| tick.is_newer_than(tag.spawn_tick.add(horizon)))
        })
        .map(Entity::handle)
        .collect();
    for handle in unconfirmed {
        world.despawn(handle, tick);
        report.dropped += 1;
        tracing::debug!(entity = %handle, "unconfirmed prediction dropped");
    }

    world.match_state.phase = snapshot.match_phase;
    tracing::trace!(
        %tick,
        created = report.created,
        matched = report.matched,
        removed = report.removed,
        "snapshot applied"
    );
    report
}

fn claim_prediction(world: &mut World, state: &GhostState, local: ConnectionId) -> Option<EntityHandle> {
    let tag = state.predicted_spawn?;
    if tag.owner_id != local {
        return None;
    }
    let entity = world
        .entities
        .iter_mut()
        .find(|entity| entity.ghost.is_none() && entity.predicted_spawn == Some(tag))?;
    entity.ghost = Some(state.ghost);
    tracing::trace!(entity = %entity.handle(), ghost = %state.ghost, "prediction matched");
    Some(entity.handle())
}

fn instantiate(state: &GhostState, config: &SimConfig, local: ConnectionId) -> Entity {
    let mut entity = match (state.kind, state.team, state.owner) {
        (EntityKind::Champion, Some(team), Some(owner)) if owner == local => {
            let position = state.transform.map(|t| t.position).unwrap_or_default();
            archetype::champion(config, team, position, owner)
        }
        (kind, _, _) => archetype::ghost_shell(kind, config),
    };
    entity.ghost = Some(state.ghost);
    entity.predicted_spawn = state.predicted_spawn;
    entity
}

fn overlay(entity: &mut Entity, state: &GhostState) {
    entity.team = state.team;
    entity.owner = state.owner;
    entity.transform = state.transform;
    entity.hit_points = state.hit_points;
    entity.dash = state.dash;
    if let (Some(motion), Some(transform)) = (entity.motion.as_mut(), state.transform) {
        motion.previous_position = transform.position;
    }
    if let (Some(record), Some(buffers)) = (state.damage_this_tick, entity.damage.as_mut()) {
        buffers.this_tick.write(record.tick, record.value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ability::AbilityKind;
    use crate::math::Vec2Fixed;
    use crate::world::WorldRole;

    fn tag(tick: u32) -> PredictedSpawnTag {
        PredictedSpawnTag {
            spawn_tick: Tick::new(tick),
            owner_id: ConnectionId::new(1),
            kind: EntityKind::Ability(AbilityKind::SkillShot),
        }
    }

    fn effect_entity(tag: PredictedSpawnTag) -> Entity {
        let mut entity = Entity::new(tag.kind);
        entity.team = Some(Team::Blue);
        entity.predicted_spawn = Some(tag);
        entity.transform = Some(Transform::at(Vec2Fixed::ZERO));
        entity
    }

    #[test]
    fn test_snapshot_omits_own_damage_record() {
        let config = SimConfig::default();
        let mut server = World::new(WorldRole::Server);
        let mine = server.spawn(archetype::champion(&config, Team::Blue, Vec2Fixed::ZERO, ConnectionId::new(1)));
        let theirs = server.spawn(archetype::champion(&config, Team::Red, Vec2Fixed::ZERO, ConnectionId::new(2)));
        for handle in [mine, theirs] {
            if let Some(buffers) = server.entities.get_mut(handle).and_then(|e| e.damage.as_mut()) {
                buffers.this_tick.write(Tick::new(4), 12);
            }
        }

        let snapshot = snapshot_for(&server, Tick::new(4), ConnectionId::new(1), None);
        let ghost_of = |h| server.entities.get(h).and_then(|e| e.ghost).unwrap();
        assert_eq!(snapshot.ghost(ghost_of(mine)).unwrap().damage_this_tick, None);
        assert_eq!(
            snapshot.ghost(ghost_of(theirs)).unwrap().damage_this_tick,
            Some(RingEntry::new(Tick::new(4), 12))
        );
    }

    #[test]
    fn test_predicted_spawn_claims_ghost() {
        let config = SimConfig::default();
        let mut server = World::new(WorldRole::Server);
        let mut client = World::new(WorldRole::Client);
        server.spawn(effect_entity(tag(10)));
        let predicted = client.spawn(effect_entity(tag(10)));

        let snapshot = snapshot_for(&server, Tick::new(11), ConnectionId::new(1), None);
        let report = apply_snapshot(&mut client, &snapshot, &config, ConnectionId::new(1));

        assert_eq!(report.matched, 1);
        assert_eq!(report.created, 0);
        assert_eq!(client.entities.len(), 1);
        assert_eq!(client.entities.get(predicted).and_then(|e| e.ghost), Some(GhostId::new(1)));
    }

    #[test]
    fn test_foreign_ghost_is_interpolated() {
        let config = SimConfig::default();
        let mut server = World::new(WorldRole::Server);
        let mut client = World::new(WorldRole::Client);
        server.spawn(archetype::champion(&config, Team::Red, Vec2Fixed::ZERO, ConnectionId::new(2)));
        server.spawn(archetype::champion(&config, Team::Blue, Vec2Fixed::ZERO, ConnectionId::new(1)));

        let snapshot = snapshot_for(&server, Tick::new(1), ConnectionId::new(1), None);
        apply_snapshot(&mut client, &snapshot, &config, ConnectionId::new(1));

        let remote = client.entities.iter().find(|e| e.owner == Some(ConnectionId::new(2))).unwrap();
        let local = client.entities.iter().find(|e| e.owner == Some(ConnectionId::new(1))).unwrap();
        assert!(remote.interpolated);
        assert!(!local.interpolated);
        assert!(local.abilities.is_some());
    }

    #[test]
    fn test_unconfirmed_prediction_dropped_after_horizon() {
        let config = SimConfig::default();
        let server = World::new(WorldRole::Server);
        let mut client = World::new(WorldRole::Client);
        let orphan = client.spawn(effect_entity(tag(10)));

        let early = snapshot_for(&server, Tick::new(40), ConnectionId::new(1), None);
        assert_eq!(apply_snapshot(&mut client, &early, &config, ConnectionId::new(1)).dropped, 0);

        let late = snapshot_for(&server, Tick::new(43), ConnectionId::new(1), None);
        assert_eq!(apply_snapshot(&mut client, &late, &config, ConnectionId::new(1)).dropped, 1);
        assert!(!client.entities.contains(orphan));
    }

    #[test]
    fn test_removal_confirmed() {
        let config = SimConfig::default();
        let mut server = World::new(WorldRole::Server);
        let mut client = World::new(WorldRole::Client);
        let doomed = server.spawn(effect_entity(tag(1)));

        let first = snapshot_for(&server, Tick::new(2), ConnectionId::new(7), None);
        apply_snapshot(&mut client, &first, &config, ConnectionId::new(7));
        assert_eq!(client.entities.len(), 1);

        server.despawn(doomed, Tick::new(3));
        let second = snapshot_for(&server, Tick::new(3), ConnectionId::new(7), Some(Tick::new(2)));
        assert_eq!(second.removed, vec![GhostId::new(1)]);
        let report = apply_snapshot(&mut client, &second, &config, ConnectionId::new(7));
        assert_eq!(report.removed, 1);
        assert!(client.entities.is_empty());
    }

    #[test]
    fn test_command_records_land_on_champion() {
        let config = SimConfig::default();
        let mut server = World::new(WorldRole::Server);
        let conn = ConnectionId::new(3);
        let champ = server.spawn(archetype::champion(&config, Team::Blue, Vec2Fixed::ZERO, conn));
        let targets = CooldownTargets {
            area: Some(Tick::new(190)),
            ..CooldownTargets::default()
        };
        let records = [
            CommandRecord::AbilityCooldowns(RingEntry::new(Tick::new(101), targets)),
            CommandRecord::AutoAttackCooldown(RingEntry::new(Tick::new(101), Some(Tick::new(130)))),
        ];
        assert_eq!(apply_command_records(&mut server, conn, &records), 2);

        let entity = server.entities.get(champ).unwrap();
        let history = &entity.abilities.as_ref().unwrap().history;
        assert_eq!(history.read_as_of(Tick::new(150)).map(|e| e.value), Some(targets));
        assert_eq!(apply_command_records(&mut server, ConnectionId::new(99), &records), 0);
    }

    #[test]
    fn test_frame_roundtrip_through_bincode() {
        let frame = CommandFrame {
            tick: Tick::new(8),
            connection: ConnectionId::new(2),
            input: PlayerInput::default(),
            records: Vec::new(),
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(CommandFrame::decode(&bytes).unwrap(), frame);
    }
}
