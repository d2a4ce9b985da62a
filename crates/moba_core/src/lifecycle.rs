//! Entity destruction handshake.
//!
//! `Alive -> MarkedForDestruction -> Removed`. Any stage that detects a
//! terminal condition marks the entity. The server deletes marked entities in
//! the same step. A client keeps them inert (skipped by every gameplay stage,
//! hidden from presentation, position untouched) until a snapshot confirms the
//! server removed the matching ghost. Removing predictively would let the
//! client's index space drift from the server's.

use serde::{Deserialize, Serialize};

use crate::components::EntityKind;
use crate::match_flow::{self, MatchEvent};
use crate::simulation::{SimEvent, StepContext};
use crate::tick::Tick;
use crate::world::{CommandBuffer, Entity, EntityHandle, World};

/// Destruction state of an entity that is still stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Lifecycle {
    /// Participates in gameplay.
    #[default]
    Alive,
    /// Waiting for removal. Inert.
    MarkedForDestruction {
        /// Tick the mark was set.
        since: Tick,
    },
}

impl Lifecycle {
    /// `true` if not marked.
    #[must_use]
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Alive)
    }

    /// `true` once marked.
    #[must_use]
    pub const fn is_marked(self) -> bool {
        !self.is_alive()
    }
}

/// Mark `entity` for destruction. Returns `true` only on the first call.
pub fn mark_for_destruction(entity: &mut Entity, tick: Tick) -> bool {
    if entity.lifecycle.is_marked() {
        return false;
    }
    entity.lifecycle = Lifecycle::MarkedForDestruction { since: tick };
    // An entity that dies mid-aim loses its aim indicator with the cast.
    entity.aim_indicator = None;
    if let Some(loadout) = entity.abilities.as_mut() {
        loadout.cancel_aiming();
    }
    tracing::debug!(entity = %entity.handle(), ?tick, "marked for destruction");
    true
}

/// Mark entities whose `destroy_at` tick has been reached.
pub fn destroy_on_timer_stage(world: &mut World, ctx: &StepContext<'_>, commands: &mut CommandBuffer) {
    let tick = ctx.time.server_tick;
    for entity in world.entities.iter() {
        if !entity.is_simulated() {
            continue;
        }
        if let Some(at) = entity.destroy_at {
            if tick.is_at_or_after(at) {
                commands.mark_for_destruction(entity.handle());
            }
        }
    }
}

/// Resolve marked entities.
///
/// Runs once per tick (first full pass only). On the server a destroyed
/// match-ending structure ends the match, a destroyed champion schedules its
/// respawn, and the record is deleted. On a client the record stays until
/// [`confirm_removal`] is called for its ghost; client-only predicted entities
/// that never received a ghost are dropped by reconciliation instead.
pub fn destroy_stage(world: &mut World, ctx: &StepContext<'_>, commands: &mut CommandBuffer) {
    if !ctx.time.is_first_full_tick() {
        return;
    }
    let tick = ctx.time.server_tick;

    let marked: Vec<(EntityHandle, EntityKind)> = world
        .entities
        .iter()
        .filter(|entity| entity.lifecycle.is_marked())
        .map(|entity| (entity.handle(), entity.kind))
        .collect();

    for (handle, kind) in marked {
        if !ctx.is_server() {
            continue;
        }
        let Some(entity) = world.entities.get(handle) else {
            continue;
        };
        let team = entity.team;
        let ends_match = entity.ends_match_on_destroy;
        let owner = entity.owner;

        if ends_match {
            if let Some(team) = team {
                match_flow::end_match(world, team.opponent(), tick);
            }
        }
        if kind == EntityKind::Champion {
            if let (Some(connection), Some(team)) = (owner, team) {
                let delay = ctx.config.whole_seconds_to_ticks(ctx.config.rules.respawn_seconds);
                let respawn_at = tick.add(delay);
                world
                    .scheduler
                    .schedule(respawn_at, MatchEvent::Respawn { connection, team });
                tracing::debug!(%connection, %respawn_at, "respawn scheduled");
            }
        }
        world.emit(SimEvent::Destroyed { entity: handle, kind });
        commands.remove(handle);
    }
}

/// Client side of the handshake: the server confirmed `handle`'s ghost is gone.
///
/// Returns the removed entity, if it was still stored.
pub fn confirm_removal(world: &mut World, handle: EntityHandle, tick: Tick) -> Option<Entity> {
    let removed = world.despawn(handle, tick)?;
    tracing::trace!(entity = %handle, ghost = ?removed.ghost, "removal confirmed");
    Some(removed)
}
