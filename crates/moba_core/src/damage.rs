//! Per-tick damage aggregation.
//!
//! Hits land in an entity's pending list during the tick. The aggregate stage
//! folds them into one `DamageThisTick` record keyed by the tick, and the
//! apply stage subtracts that record from hit points. A repeated pass over a
//! tick finds the record already written and the hit points already charged
//! for it, so rollback never double-counts.

use serde::{Deserialize, Serialize};

use crate::math::{fixed_serde, Fixed};
use crate::ring_buffer::CommandRing;
use crate::simulation::{SimEvent, StepContext};
use crate::tick::Tick;
use crate::world::{CommandBuffer, EntityHandle, World};

/// One hit waiting to be aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DamageEvent {
    /// Damage dealt.
    pub amount: i32,
    /// Entity that dealt it.
    pub source: EntityHandle,
}

/// Current and maximum hit points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HitPoints {
    /// Remaining hit points.
    pub current: i32,
    /// Maximum hit points.
    pub max: i32,
    /// Last tick whose damage record was subtracted.
    pub last_applied: Option<Tick>,
}

impl HitPoints {
    /// Full health.
    #[must_use]
    pub const fn full(max: i32) -> Self {
        Self {
            current: max,
            max,
            last_applied: None,
        }
    }

    /// `true` at zero or below.
    #[must_use]
    pub const fn is_depleted(&self) -> bool {
        self.current <= 0
    }

    /// Remaining fraction in `[0, 1]`, for health bars.
    #[must_use]
    pub fn fraction(&self) -> Fixed {
        if self.max <= 0 {
            return Fixed::ZERO;
        }
        (Fixed::from_num(self.current.max(0)) / Fixed::from_num(self.max)).min(Fixed::ONE)
    }
}

/// Pending hits and the per-tick damage history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DamageBuffers {
    /// Hits received this tick.
    pub pending: Vec<DamageEvent>,
    /// One committed total per tick.
    pub this_tick: CommandRing<i32>,
}

impl DamageBuffers {
    /// Empty buffers retaining `capacity` ticks of history.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: Vec::new(),
            this_tick: CommandRing::with_capacity(capacity),
        }
    }

    /// Queue a hit.
    pub fn push(&mut self, amount: i32, source: EntityHandle) {
        self.pending.push(DamageEvent { amount, source });
    }
}

/// Deals damage to enemies that touch the entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DamageOnTrigger {
    /// Damage per target.
    pub damage: i32,
    /// Contact radius.
    #[serde(with = "fixed_serde")]
    pub radius: Fixed,
    /// Mark the entity for destruction after its first hit.
    pub destroy_on_hit: bool,
    /// Every target already hit. Never rolled back, so a resimulated tick
    /// cannot hit the same target twice.
    pub already_damaged: Vec<EntityHandle>,
}

impl DamageOnTrigger {
    /// Trigger with no hits recorded.
    #[must_use]
    pub const fn new(damage: i32, radius: Fixed, destroy_on_hit: bool) -> Self {
        Self {
            damage,
            radius,
            destroy_on_hit,
            already_damaged: Vec::new(),
        }
    }

    /// `true` if `target` was already hit.
    #[must_use]
    pub fn has_damaged(&self, target: EntityHandle) -> bool {
        self.already_damaged.contains(&target)
    }
}

/// Fold pending hits into the record for `tick` and return the committed
/// total.
///
/// Pending hits overwrite the record with their sum. With nothing pending, a
/// zero is written unless a record for exactly `tick` already exists.
pub fn aggregate_damage(buffers: &mut DamageBuffers, tick: Tick) -> i32 {
    if buffers.pending.is_empty() {
        if let Some(existing) = buffers.this_tick.entry_at(tick) {
            return existing.value;
        }
        buffers.this_tick.write(tick, 0);
        return 0;
    }
    let total = buffers
        .pending
        .drain(..)
        .fold(0_i32, |sum, event| sum.saturating_add(event.amount));
    buffers.this_tick.write(tick, total);
    total
}

/// Outcome of [`apply_damage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    /// Damage subtracted this call.
    pub amount: i32,
    /// Hit points reached zero or below.
    pub depleted: bool,
}

/// Subtract the record for exactly `tick`, once.
///
/// Returns `None` if there is no record for `tick`, it is zero, or it was
/// already applied.
pub fn apply_damage(hit_points: &mut HitPoints, buffers: &DamageBuffers, tick: Tick) -> Option<Applied> {
    let record = buffers.this_tick.read_as_of(tick)?;
    if record.tick != tick || record.value <= 0 {
        return None;
    }
    if hit_points
        .last_applied
        .is_some_and(|applied| applied.is_at_or_after(tick))
    {
        return None;
    }
    hit_points.current = hit_points.current.saturating_sub(record.value);
    hit_points.last_applied = Some(tick);
    Some(Applied {
        amount: record.value,
        depleted: hit_points.is_depleted(),
    })
}

/// Aggregate pending hits on every simulated damageable entity.
pub fn aggregate_damage_stage(world: &mut World, ctx: &StepContext<'_>, _commands: &mut CommandBuffer) {
    let tick = ctx.time.server_tick;
    for entity in world.entities.iter_mut() {
        if !entity.is_simulated() {
            continue;
        }
        if let Some(buffers) = entity.damage.as_mut() {
            let total = aggregate_damage(buffers, tick);
            if total > 0 {
                tracing::trace!(entity = %entity.handle(), total, %tick, "damage aggregated");
            }
        }
    }
}

/// Charge each entity's record for this tick against its hit points and mark
/// depleted entities.
pub fn apply_damage_stage(world: &mut World, ctx: &StepContext<'_>, commands: &mut CommandBuffer) {
    let tick = ctx.time.server_tick;
    let mut damaged = Vec::new();
    for entity in world.entities.iter_mut() {
        if !entity.is_simulated() {
            continue;
        }
        let handle = entity.handle();
        let (Some(hit_points), Some(buffers)) = (entity.hit_points.as_mut(), entity.damage.as_ref()) else {
            continue;
        };
        let Some(applied) = apply_damage(hit_points, buffers, tick) else {
            continue;
        };
        tracing::debug!(
            entity = %handle,
            amount = applied.amount,
            remaining = hit_points.current,
            %tick,
            "damage applied"
        );
        if applied.depleted {
            commands.mark_for_destruction(handle);
        }
        damaged.push((handle, applied.amount, hit_points.current));
    }
    if ctx.time.is_first_full_tick() {
        for (entity, amount, remaining) in damaged {
            world.emit(SimEvent::Damaged {
                entity,
                amount,
                remaining,
                tick,
            });
        }
    }
}
