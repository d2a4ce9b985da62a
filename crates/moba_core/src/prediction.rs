//! Client-side prediction bookkeeping for resimulation.
//!
//! A snapshot only carries state for ghosts the server already knows about.
//! Predicted entities outside it (spawns not yet matched, or spawned after
//! the snapshot tick) are rewound from the per-tick backups kept here, and an
//! entity spawned at tick `T` is frozen during replay passes for ticks up to
//! and including `T` so it is not moved twice.

use serde::{Deserialize, Serialize};

use crate::components::{DashState, Motion, Transform};
use crate::math::Vec2Fixed;
use crate::ring_buffer::CommandRing;
use crate::tick::Tick;
use crate::world::{EntityHandle, World};

/// Kinematic state of one predicted entity at the end of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PredictedState {
    /// Position and facing.
    pub transform: Option<Transform>,
    /// Projectile motion.
    pub motion: Option<Motion>,
    /// Active dash.
    pub dash: Option<DashState>,
    /// Walk destination.
    pub move_target: Option<Vec2Fixed>,
}

/// End-of-tick backups of every predicted entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionHistory {
    frames: CommandRing<Vec<(EntityHandle, PredictedState)>>,
}

impl PredictionHistory {
    /// History retaining `capacity` ticks.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: CommandRing::with_capacity(capacity),
        }
    }

    /// Number of ticks retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// `true` if nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Back up every predicted entity at the end of `tick`. Frozen entities
    /// are included so their spawn-tick state survives a replay pass.
    pub fn record(&mut self, world: &World, tick: Tick) {
        let frame = world
            .entities
            .iter()
            .filter(|entity| entity.is_active() && !entity.interpolated)
            .map(|entity| {
                (
                    entity.handle(),
                    PredictedState {
                        transform: entity.transform,
                        motion: entity.motion,
                        dash: entity.dash,
                        move_target: entity.move_target,
                    },
                )
            })
            .collect();
        self.frames.write(tick, frame);
    }

    /// Backup of `handle` at the end of exactly `tick`.
    #[must_use]
    pub fn state_at(&self, handle: EntityHandle, tick: Tick) -> Option<&PredictedState> {
        self.frames
            .entry_at(tick)?
            .value
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, state)| state)
    }

    /// Rewind predicted entities the snapshot did not cover to their state at
    /// `snapshot_tick`, or at their spawn tick if they were spawned later.
    ///
    /// Overlaid entities only get their walk destination back, which
    /// snapshots do not carry. Returns how many entities were fully restored.
    pub fn rewind(&self, world: &mut World, snapshot_tick: Tick, overlaid: &[EntityHandle]) -> usize {
        let mut restored = 0;
        for entity in world.entities.iter_mut() {
            if entity.interpolated || !entity.is_active() {
                continue;
            }
            if overlaid.contains(&entity.handle()) {
                if let Some(state) = self.state_at(entity.handle(), snapshot_tick) {
                    entity.move_target = state.move_target;
                }
                continue;
            }
            let base = match entity.predicted_spawn {
                Some(tag) if tag.spawn_tick.is_newer_than(snapshot_tick) => tag.spawn_tick,
                _ => snapshot_tick,
            };
            let Some(state) = self.state_at(entity.handle(), base).copied() else {
                continue;
            };
            entity.transform = state.transform;
            entity.motion = state.motion;
            entity.dash = state.dash;
            entity.move_target = state.move_target;
            restored += 1;
        }
        restored
    }
}

/// Freeze predicted spawns that did not exist before the end of `tick`.
pub fn freeze_unborn(world: &mut World, tick: Tick) {
    for entity in world.entities.iter_mut() {
        entity.frozen = entity
            .predicted_spawn
            .is_some_and(|tag| tag.spawn_tick.is_at_or_after(tick));
    }
}

/// Clear every freeze.
pub fn thaw(world: &mut World) {
    for entity in world.entities.iter_mut() {
        entity.frozen = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ability::{AbilityKind, PredictedSpawnTag};
    use crate::components::EntityKind;
    use crate::replication::ConnectionId;
    use crate::world::{Entity, WorldRole};

    fn predicted(world: &mut World, spawn_tick: u32, x: i32) -> EntityHandle {
        let mut entity = Entity::new(EntityKind::Ability(AbilityKind::SkillShot));
        entity.transform = Some(Transform::at(Vec2Fixed::from_ints(x, 0)));
        entity.predicted_spawn = Some(PredictedSpawnTag {
            spawn_tick: Tick::new(spawn_tick),
            owner_id: ConnectionId::new(1),
            kind: entity.kind,
        });
        world.spawn(entity)
    }

    fn set_x(world: &mut World, handle: EntityHandle, x: i32) {
        if let Some(entity) = world.entities.get_mut(handle) {
            entity.transform = Some(Transform::at(Vec2Fixed::from_ints(x, 0)));
        }
    }

    fn x_of(world: &World, handle: EntityHandle) -> Option<Vec2Fixed> {
        world.entities.get(handle).and_then(|e| e.position())
    }

    #[test]
    fn test_rewind_to_snapshot_or_spawn_tick() {
        let mut world = World::new(WorldRole::Client);
        let mut history = PredictionHistory::with_capacity(16);
        let old = predicted(&mut world, 3, 0);
        history.record(&world, Tick::new(5));
        let young = predicted(&mut world, 6, 100);
        history.record(&world, Tick::new(6));

        set_x(&mut world, old, 9);
        set_x(&mut world, young, 109);

        assert_eq!(history.rewind(&mut world, Tick::new(5), &[]), 2);
        assert_eq!(x_of(&world, old), Some(Vec2Fixed::from_ints(0, 0)));
        assert_eq!(x_of(&world, young), Some(Vec2Fixed::from_ints(100, 0)));
    }

    #[test]
    fn test_overlaid_entities_untouched() {
        let mut world = World::new(WorldRole::Client);
        let mut history = PredictionHistory::with_capacity(16);
        let handle = predicted(&mut world, 1, 0);
        history.record(&world, Tick::new(2));
        set_x(&mut world, handle, 7);

        assert_eq!(history.rewind(&mut world, Tick::new(2), &[handle]), 0);
        assert_eq!(x_of(&world, handle), Some(Vec2Fixed::from_ints(7, 0)));
    }

    #[test]
    fn test_freeze_covers_spawn_tick() {
        let mut world = World::new(WorldRole::Client);
        let handle = predicted(&mut world, 6, 0);

        freeze_unborn(&mut world, Tick::new(6));
        assert!(!world.entities.get(handle).expect("entity stored").is_simulated());
        freeze_unborn(&mut world, Tick::new(7));
        assert!(world.entities.get(handle).expect("entity stored").is_simulated());

        freeze_unborn(&mut world, Tick::new(2));
        thaw(&mut world);
        assert!(world.entities.get(handle).expect("entity stored").is_simulated());
    }
}
