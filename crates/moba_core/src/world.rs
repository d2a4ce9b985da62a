//! Entity storage for one simulation world.
//!
//! Entities are records of optional components, stored in generational slots.
//! Every cross-entity reference is an [`EntityHandle`]; a handle whose slot has
//! been recycled no longer resolves, so stale targets are detected instead of
//! silently aliasing a new entity.
//!
//! Structural changes made while iterating go through a [`CommandBuffer`]
//! that the step driver plays back between stages.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ability::{AbilityLoadout, PredictedSpawnTag};
use crate::components::{
    AimIndicator, AutoAttack, DashState, EntityKind, MinionPath, Motion, MoveSpeed, NpcAttack,
    PlayerInput, Team, Transform,
};
use crate::damage::{DamageBuffers, DamageOnTrigger, HitPoints};
use crate::lifecycle::{self, Lifecycle};
use crate::match_flow::{MatchEvent, MatchState};
use crate::math::{fixed_serde, Fixed, Vec2Fixed};
use crate::replication::{CommandRecord, ConnectionId, GhostId};
use crate::ring_buffer::CommandRing;
use crate::scheduler::Scheduler;
use crate::simulation::SimEvent;
use crate::tick::Tick;

/// Which side of the connection a world simulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorldRole {
    /// Authoritative world. Destroys immediately and assigns ghost ids.
    Server,
    /// Predicting world. Defers destruction until the server confirms it.
    Client,
}

/// Generational reference to an entity slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityHandle {
    index: u32,
    generation: u32,
}

impl EntityHandle {
    /// Slot index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Slot generation at the time the handle was issued.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Placeholder for entities that have not been inserted yet.
    pub(crate) const DANGLING: Self = Self {
        index: u32::MAX,
        generation: u32::MAX,
    };
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// An entity with optional components.
///
/// Only components that are `Some` are active. Stages skip entities that lack
/// what they need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    handle: EntityHandle,
    /// Archetype.
    pub kind: EntityKind,
    /// Alive or waiting for removal.
    pub lifecycle: Lifecycle,
    /// Owning team.
    pub team: Option<Team>,
    /// Replicated id, once assigned by the server.
    pub ghost: Option<GhostId>,
    /// Connection whose input drives this entity.
    pub owner: Option<ConnectionId>,
    /// Client-side entity whose state comes only from snapshots.
    pub interpolated: bool,
    /// Collision radius.
    #[serde(with = "fixed_serde")]
    pub body_radius: Fixed,
    /// Position and facing.
    pub transform: Option<Transform>,
    /// Current and maximum hit points.
    pub hit_points: Option<HitPoints>,
    /// Pending damage and per-tick damage history.
    pub damage: Option<DamageBuffers>,
    /// Deals damage to enemies it touches.
    pub damage_on_trigger: Option<DamageOnTrigger>,
    /// Walk and dash tuning.
    pub move_speed: Option<MoveSpeed>,
    /// Walk destination.
    pub move_target: Option<Vec2Fixed>,
    /// Input applied this tick.
    pub input: Option<PlayerInput>,
    /// Cast states and cooldown history.
    pub abilities: Option<AbilityLoadout>,
    /// Auto-attack tuning and cooldown history.
    pub auto_attack: Option<AutoAttack>,
    /// Active dash.
    pub dash: Option<DashState>,
    /// Champion a charge effect belongs to.
    pub charge_owner: Option<EntityHandle>,
    /// Projectile movement.
    pub motion: Option<Motion>,
    /// Autonomous targeting and attacks.
    pub npc: Option<NpcAttack>,
    /// Lane walking.
    pub minion_path: Option<MinionPath>,
    /// Tick at which the entity expires.
    pub destroy_at: Option<Tick>,
    /// Destroying this entity ends the match.
    pub ends_match_on_destroy: bool,
    /// Spawn identity used to match predicted spawns.
    pub predicted_spawn: Option<PredictedSpawnTag>,
    /// Client-local aim indicator.
    pub aim_indicator: Option<AimIndicator>,
    /// Held still during a resimulation pass for a tick before its spawn.
    #[serde(skip)]
    pub(crate) frozen: bool,
}

impl Entity {
    /// Create a new entity of `kind` with no components.
    #[must_use]
    pub fn new(kind: EntityKind) -> Self {
        Self {
            handle: EntityHandle::DANGLING,
            kind,
            lifecycle: Lifecycle::Alive,
            team: None,
            ghost: None,
            owner: None,
            interpolated: false,
            body_radius: Fixed::ZERO,
            transform: None,
            hit_points: None,
            damage: None,
            damage_on_trigger: None,
            move_speed: None,
            move_target: None,
            input: None,
            abilities: None,
            auto_attack: None,
            dash: None,
            charge_owner: None,
            motion: None,
            npc: None,
            minion_path: None,
            destroy_at: None,
            ends_match_on_destroy: false,
            predicted_spawn: None,
            aim_indicator: None,
            frozen: false,
        }
    }

    /// Handle this entity is stored under.
    #[must_use]
    pub const fn handle(&self) -> EntityHandle {
        self.handle
    }

    /// `true` while the entity takes part in gameplay.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.lifecycle.is_alive()
    }

    /// `true` if gameplay stages should simulate this entity locally.
    #[must_use]
    pub fn is_simulated(&self) -> bool {
        self.is_active() && !self.interpolated && !self.frozen
    }

    /// Position, if the entity has a transform.
    #[must_use]
    pub fn position(&self) -> Option<Vec2Fixed> {
        self.transform.map(|t| t.position)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Slot {
    generation: u32,
    entity: Option<Entity>,
}

/// Generational slot storage.
///
/// Iteration is always in slot order, which keeps every stage deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStorage {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl EntityStorage {
    /// Create empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entity and return its handle.
    pub fn insert(&mut self, mut entity: Entity) -> EntityHandle {
        let handle = if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let handle = EntityHandle {
                index,
                generation: slot.generation,
            };
            entity.handle = handle;
            slot.entity = Some(entity);
            handle
        } else {
            let handle = EntityHandle {
                index: self.slots.len() as u32,
                generation: 0,
            };
            entity.handle = handle;
            self.slots.push(Slot {
                generation: 0,
                entity: Some(entity),
            });
            handle
        };
        self.live += 1;
        handle
    }

    /// Remove an entity. Its slot's generation advances so outstanding
    /// handles stop resolving.
    pub fn remove(&mut self, handle: EntityHandle) -> Option<Entity> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entity = slot.entity.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        Some(entity)
    }

    /// Resolve a handle.
    #[must_use]
    pub fn get(&self, handle: EntityHandle) -> Option<&Entity> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entity.as_ref()
    }

    /// Resolve a handle mutably.
    pub fn get_mut(&mut self, handle: EntityHandle) -> Option<&mut Entity> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entity.as_mut()
    }

    /// `true` if the handle still refers to a stored entity.
    #[must_use]
    pub fn contains(&self, handle: EntityHandle) -> bool {
        self.get(handle).is_some()
    }

    /// `true` if the handle resolves to an entity that is not marked for
    /// destruction.
    #[must_use]
    pub fn is_active(&self, handle: EntityHandle) -> bool {
        self.get(handle).is_some_and(Entity::is_active)
    }

    /// Number of stored entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    /// `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Handles of every stored entity in slot order.
    #[must_use]
    pub fn handles(&self) -> Vec<EntityHandle> {
        self.iter().map(Entity::handle).collect()
    }

    /// Iterate in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.slots.iter().filter_map(|slot| slot.entity.as_ref())
    }

    /// Iterate mutably in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entity> {
        self.slots.iter_mut().filter_map(|slot| slot.entity.as_mut())
    }

    /// Find the entity carrying `ghost`.
    #[must_use]
    pub fn find_ghost(&self, ghost: GhostId) -> Option<EntityHandle> {
        self.iter()
            .find(|entity| entity.ghost == Some(ghost))
            .map(Entity::handle)
    }

    /// Champion driven by `connection`, if one exists.
    #[must_use]
    pub fn champion_of(&self, connection: ConnectionId) -> Option<EntityHandle> {
        self.iter()
            .find(|entity| entity.kind == EntityKind::Champion && entity.owner == Some(connection))
            .map(Entity::handle)
    }
}

/// A structural change recorded during a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorldCommand {
    /// Insert a new entity.
    Spawn(Box<Entity>),
    /// Move an entity to `MarkedForDestruction`.
    MarkForDestruction(EntityHandle),
    /// Delete an entity outright.
    Remove(EntityHandle),
}

/// Deferred structural changes, applied in recording order.
#[derive(Debug, Clone, Default)]
pub struct CommandBuffer {
    commands: Vec<WorldCommand>,
}

impl CommandBuffer {
    /// Empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an entity for insertion.
    pub fn spawn(&mut self, entity: Entity) {
        self.commands.push(WorldCommand::Spawn(Box::new(entity)));
    }

    /// Queue a destruction mark.
    pub fn mark_for_destruction(&mut self, handle: EntityHandle) {
        self.commands.push(WorldCommand::MarkForDestruction(handle));
    }

    /// Queue a removal.
    pub fn remove(&mut self, handle: EntityHandle) {
        self.commands.push(WorldCommand::Remove(handle));
    }

    /// Number of queued commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Apply every queued command to `world` and empty the buffer.
    ///
    /// Commands that target stale handles are skipped.
    pub fn playback(&mut self, world: &mut World, tick: Tick) -> Vec<EntityHandle> {
        let mut spawned = Vec::new();
        for command in self.commands.drain(..) {
            match command {
                WorldCommand::Spawn(entity) => spawned.push(world.spawn(*entity)),
                WorldCommand::MarkForDestruction(handle) => {
                    if let Some(entity) = world.entities.get_mut(handle) {
                        lifecycle::mark_for_destruction(entity, tick);
                    }
                }
                WorldCommand::Remove(handle) => {
                    world.despawn(handle, tick);
                }
            }
        }
        spawned
    }
}

/// A ghost the server removed, kept so later snapshots can report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemovedGhost {
    /// Tick of removal.
    pub tick: Tick,
    /// Removed ghost.
    pub ghost: GhostId,
}

/// Everything one simulation world owns: entities plus match-level resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct World {
    role: WorldRole,
    /// Entity records.
    pub entities: EntityStorage,
    /// Pending match-start and respawn events.
    pub scheduler: Scheduler<MatchEvent>,
    /// Match phase, roster and wave timer.
    pub match_state: MatchState,
    /// Recorded input per connection.
    pub inputs: BTreeMap<ConnectionId, CommandRing<PlayerInput>>,
    removal_log: Vec<RemovedGhost>,
    next_ghost: u32,
    #[serde(skip)]
    outgoing: Vec<CommandRecord>,
    #[serde(skip)]
    events: Vec<SimEvent>,
}

impl World {
    /// Empty world for `role`.
    #[must_use]
    pub fn new(role: WorldRole) -> Self {
        Self {
            role,
            entities: EntityStorage::new(),
            scheduler: Scheduler::new(),
            match_state: MatchState::default(),
            inputs: BTreeMap::new(),
            removal_log: Vec::new(),
            next_ghost: 1,
            outgoing: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Role this world plays.
    #[must_use]
    pub const fn role(&self) -> WorldRole {
        self.role
    }

    /// `true` for the authoritative world.
    #[must_use]
    pub fn is_server(&self) -> bool {
        self.role == WorldRole::Server
    }

    /// Insert an entity. The server assigns a ghost id to every entity it
    /// creates; clients only receive ghost ids through replication.
    pub fn spawn(&mut self, mut entity: Entity) -> EntityHandle {
        if self.is_server() && entity.ghost.is_none() {
            entity.ghost = Some(GhostId::new(self.next_ghost));
            self.next_ghost += 1;
        }
        let kind = entity.kind;
        let handle = self.entities.insert(entity);
        tracing::trace!(entity = %handle, ?kind, "spawned");
        self.events.push(SimEvent::Spawned { entity: handle, kind });
        handle
    }

    /// Remove an entity now. Server removals of replicated entities are logged
    /// for snapshots.
    pub fn despawn(&mut self, handle: EntityHandle, tick: Tick) -> Option<Entity> {
        let entity = self.entities.remove(handle)?;
        if self.is_server() {
            if let Some(ghost) = entity.ghost {
                self.removal_log.push(RemovedGhost { tick, ghost });
            }
        }
        self.events.push(SimEvent::Removed {
            entity: handle,
            kind: entity.kind,
        });
        Some(entity)
    }

    /// Ghosts removed after `since` (all of them when `since` is `None`).
    #[must_use]
    pub fn removed_since(&self, since: Option<Tick>) -> Vec<GhostId> {
        self.removal_log
            .iter()
            .filter(|removed| since.map_or(true, |s| removed.tick.is_newer_than(s)))
            .map(|removed| removed.ghost)
            .collect()
    }

    /// Forget removals older than `horizon` ticks before `now`.
    pub fn prune_removal_log(&mut self, now: Tick, horizon: u32) {
        let cutoff = now.subtract(horizon);
        self.removal_log
            .retain(|removed| removed.tick.is_at_or_after(cutoff));
    }

    /// Record an event for the host.
    pub fn emit(&mut self, event: SimEvent) {
        self.events.push(event);
    }

    /// Take every event recorded since the last call.
    pub fn drain_events(&mut self) -> Vec<SimEvent> {
        std::mem::take(&mut self.events)
    }

    /// Queue command records for the server. Only clients produce them.
    pub fn queue_outgoing(&mut self, records: impl IntoIterator<Item = CommandRecord>) {
        self.outgoing.extend(records);
    }

    /// Take every queued command record.
    pub fn take_outgoing(&mut self) -> Vec<CommandRecord> {
        std::mem::take(&mut self.outgoing)
    }

    /// Input recorded for `connection` at exactly `tick`, or the previous
    /// input carried forward with its edge events cleared.
    #[must_use]
    pub fn input_for(&self, connection: ConnectionId, tick: Tick) -> Option<PlayerInput> {
        let ring = self.inputs.get(&connection)?;
        match ring.read_as_of(tick) {
            Some(entry) if entry.tick == tick => Some(entry.value),
            Some(entry) => Some(entry.value.carried_forward()),
            None => None,
        }
    }

    /// Input covering the `span` ticks ending at `tick`.
    ///
    /// Every entry recorded in `(tick - span, tick]` is merged oldest first,
    /// so a press at a skipped tick of a batched step still fires. With no
    /// entry in the window this is [`Self::input_for`].
    #[must_use]
    pub fn input_over(&self, connection: ConnectionId, tick: Tick, span: u32) -> Option<PlayerInput> {
        if span <= 1 {
            return self.input_for(connection, tick);
        }
        let ring = self.inputs.get(&connection)?;
        let window_start = tick.subtract(span);
        let merged = ring
            .entries_after(window_start)
            .filter(|entry| !entry.tick.is_newer_than(tick))
            .fold(None, |acc: Option<PlayerInput>, entry| match acc {
                Some(mut input) => {
                    input.merge_later(&entry.value);
                    Some(input)
                }
                None => Some(entry.value),
            });
        merged.or_else(|| self.input_for(connection, tick))
    }

    /// Record input for `connection` at `tick`.
    pub fn record_input(
        &mut self,
        connection: ConnectionId,
        tick: Tick,
        input: PlayerInput,
        capacity: usize,
    ) {
        self.inputs
            .entry(connection)
            .or_insert_with(|| CommandRing::with_capacity(capacity))
            .write(tick, input);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_handle_does_not_resolve() {
        let mut storage = EntityStorage::new();
        let first = storage.insert(Entity::new(EntityKind::Minion));
        assert!(storage.remove(first).is_some());

        let second = storage.insert(Entity::new(EntityKind::Champion));
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        assert!(storage.get(first).is_none());
        assert_eq!(storage.get(second).map(|e| e.kind), Some(EntityKind::Champion));
        assert!(storage.remove(first).is_none());
    }

    #[test]
    fn test_iteration_is_slot_ordered() {
        let mut storage = EntityStorage::new();
        let a = storage.insert(Entity::new(EntityKind::Minion));
        let b = storage.insert(Entity::new(EntityKind::Minion));
        let c = storage.insert(Entity::new(EntityKind::Minion));
        storage.remove(b);
        let d = storage.insert(Entity::new(EntityKind::Structure));

        assert_eq!(storage.handles(), vec![a, d, c]);
        assert_eq!(storage.len(), 3);
    }

    #[test]
    fn test_server_assigns_ghost_ids_client_does_not() {
        let mut server = World::new(WorldRole::Server);
        let mut client = World::new(WorldRole::Client);

        let s = server.spawn(Entity::new(EntityKind::Minion));
        let c = client.spawn(Entity::new(EntityKind::Minion));

        assert_eq!(server.entities.get(s).and_then(|e| e.ghost), Some(GhostId::new(1)));
        assert_eq!(client.entities.get(c).and_then(|e| e.ghost), None);
    }

    #[test]
    fn test_removal_log_reports_newer_removals() {
        let mut world = World::new(WorldRole::Server);
        let a = world.spawn(Entity::new(EntityKind::Minion));
        let b = world.spawn(Entity::new(EntityKind::Minion));
        world.despawn(a, Tick::new(5));
        world.despawn(b, Tick::new(9));

        assert_eq!(world.removed_since(Some(Tick::new(5))), vec![GhostId::new(2)]);
        assert_eq!(world.removed_since(None).len(), 2);

        world.prune_removal_log(Tick::new(20), 12);
        assert_eq!(world.removed_since(None), vec![GhostId::new(2)]);
    }

    #[test]
    fn test_command_buffer_playback() {
        let mut world = World::new(WorldRole::Server);
        let target = world.spawn(Entity::new(EntityKind::Minion));

        let mut commands = CommandBuffer::new();
        commands.spawn(Entity::new(EntityKind::Structure));
        commands.mark_for_destruction(target);
        let spawned = commands.playback(&mut world, Tick::new(3));

        assert_eq!(spawned.len(), 1);
        assert!(commands.is_empty());
        assert!(!world.entities.is_active(target));
        assert!(world.entities.contains(target));
    }

    #[test]
    fn test_missing_input_is_carried_forward() {
        let mut world = World::new(WorldRole::Server);
        let conn = ConnectionId::new(1);
        let mut input = PlayerInput {
            move_target: Some(Vec2Fixed::from_ints(1, 2)),
            ..PlayerInput::default()
        };
        input.abilities.area.set();
        world.record_input(conn, Tick::new(10), input, 16);

        assert_eq!(world.input_for(conn, Tick::new(10)), Some(input));
        let carried = world.input_for(conn, Tick::new(11)).expect("carried input");
        assert!(carried.abilities.is_empty());
        assert_eq!(carried.move_target, input.move_target);
        assert_eq!(world.input_for(conn, Tick::new(9)), None);
    }

    #[test]
    fn test_input_over_merges_skipped_ticks() {
        let mut world = World::new(WorldRole::Server);
        let conn = ConnectionId::new(1);
        let walk = PlayerInput {
            move_target: Some(Vec2Fixed::from_ints(5, 0)),
            ..PlayerInput::default()
        };
        let mut press = PlayerInput::default();
        press.abilities.area.set();
        world.record_input(conn, Tick::new(10), walk, 16);
        world.record_input(conn, Tick::new(12), press, 16);
        world.record_input(conn, Tick::new(13), PlayerInput::default(), 16);

        let merged = world
            .input_over(conn, Tick::new(13), 3)
            .expect("input in window");
        assert!(merged.abilities.area.is_set());
        assert_eq!(merged.move_target, None);

        let wide = world
            .input_over(conn, Tick::new(13), 4)
            .expect("input in window");
        assert_eq!(wide.move_target, walk.move_target);
        assert_eq!(wide.abilities.area.count(), 1);

        // Nothing recorded in (13, 15]: carry tick 13 forward.
        let empty = world
            .input_over(conn, Tick::new(15), 2)
            .expect("carried input");
        assert!(empty.abilities.is_empty());
        assert_eq!(world.input_over(conn, Tick::new(12), 1), Some(press));
    }
}
