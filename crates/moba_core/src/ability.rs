//! Ability cast state machine.
//!
//! Each champion carries three independent casts (area, skill-shot, charge),
//! each moving `Idle -> Aiming -> Committed` and back to idle once the cooldown
//! gate reports it usable again. The area ability has no aim phase. Casts do
//! not exclude each other: if several fire in one tick they resolve in
//! [`AbilityKind::PRIORITY`] order.
//!
//! Commits and cooldown writes are prediction-only logic and run only on the
//! first full pass over a tick. Cooldown records are written by the client,
//! one tick ahead (two for the charge, whose dash starts on the following
//! tick), and forwarded to the server as command data; the server never writes
//! cooldowns itself.

use serde::{Deserialize, Serialize};

use crate::archetype;
use crate::components::{AimIndicator, DashState, EntityKind};
use crate::config::SimConfig;
use crate::cooldown::{is_on_cooldown, CooldownTargets, CooldownTicks};
use crate::math::{fixed_serde, Fixed, Vec2Fixed};
use crate::replication::{CommandRecord, ConnectionId};
use crate::ring_buffer::{CommandRing, RingEntry};
use crate::simulation::{SimEvent, StepContext};
use crate::tick::Tick;
use crate::world::{CommandBuffer, Entity, World};

/// The three champion abilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AbilityKind {
    /// Instant area burst at the caster.
    Area,
    /// Aimed projectile.
    SkillShot,
    /// Aimed dash that damages on contact.
    Charge,
}

impl AbilityKind {
    /// Resolution order when several casts fire in the same tick.
    pub const PRIORITY: [Self; 3] = [Self::Area, Self::SkillShot, Self::Charge];

    /// `true` if the ability commits on the press itself.
    #[must_use]
    pub const fn commits_immediately(self) -> bool {
        matches!(self, Self::Area)
    }

    /// Ticks between the commit and the tick its cooldown record is written
    /// for.
    #[must_use]
    pub const fn cooldown_record_delay(self) -> u32 {
        match self {
            Self::Charge => 2,
            Self::Area | Self::SkillShot => 1,
        }
    }
}

/// Kind-specific payload of an ability effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbilityEffect {
    /// Stationary damage zone.
    Area {
        /// Damage per target.
        damage: i32,
        /// Zone radius.
        #[serde(with = "fixed_serde")]
        radius: Fixed,
        /// Ticks until the zone expires.
        lifetime_ticks: u32,
    },
    /// Straight projectile destroyed on first hit.
    SkillShot {
        /// Damage on hit.
        damage: i32,
        /// Hit radius.
        #[serde(with = "fixed_serde")]
        radius: Fixed,
        /// Units per second.
        #[serde(with = "fixed_serde")]
        speed: Fixed,
        /// Ticks until the projectile expires.
        lifetime_ticks: u32,
    },
    /// Contact zone carried along by the dashing caster.
    Charge {
        /// Damage per target.
        damage: i32,
        /// Contact radius.
        #[serde(with = "fixed_serde")]
        radius: Fixed,
        /// Dash speed, units per second.
        #[serde(with = "fixed_serde")]
        dash_speed: Fixed,
        /// Dash length.
        #[serde(with = "fixed_serde")]
        dash_distance: Fixed,
    },
}

impl AbilityEffect {
    /// Payload for `kind` from the configured tuning.
    #[must_use]
    pub fn from_config(kind: AbilityKind, config: &SimConfig) -> Self {
        let tuning = &config.abilities;
        match kind {
            AbilityKind::Area => Self::Area {
                damage: tuning.area_damage,
                radius: tuning.area_radius,
                lifetime_ticks: config.seconds_to_ticks(tuning.area_lifetime_seconds),
            },
            AbilityKind::SkillShot => Self::SkillShot {
                damage: tuning.skill_shot_damage,
                radius: tuning.skill_shot_radius,
                speed: tuning.skill_shot_speed,
                lifetime_ticks: config.seconds_to_ticks(tuning.skill_shot_lifetime_seconds),
            },
            AbilityKind::Charge => Self::Charge {
                damage: tuning.charge_damage,
                radius: tuning.charge_radius,
                dash_speed: config.champion.dash_speed,
                dash_distance: config.champion.dash_distance,
            },
        }
    }

    /// Ability this payload belongs to.
    #[must_use]
    pub const fn kind(&self) -> AbilityKind {
        match self {
            Self::Area { .. } => AbilityKind::Area,
            Self::SkillShot { .. } => AbilityKind::SkillShot,
            Self::Charge { .. } => AbilityKind::Charge,
        }
    }
}

/// Where one ability is in its cast sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CastState {
    /// Ready for input (subject to cooldown).
    #[default]
    Idle,
    /// Aim indicator shown, waiting for confirm.
    Aiming {
        /// Tick aiming began.
        since: Tick,
    },
    /// Effect spawned. Treated as idle once the cooldown elapses.
    Committed {
        /// Tick of the commit.
        at: Tick,
    },
}

/// Cast state of each ability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CastStates {
    /// Area ability.
    pub area: CastState,
    /// Skill-shot.
    pub skill_shot: CastState,
    /// Charge.
    pub charge: CastState,
}

impl CastStates {
    /// State of `kind`.
    #[must_use]
    pub const fn get(&self, kind: AbilityKind) -> CastState {
        match kind {
            AbilityKind::Area => self.area,
            AbilityKind::SkillShot => self.skill_shot,
            AbilityKind::Charge => self.charge,
        }
    }

    /// Replace the state of `kind`.
    pub fn set(&mut self, kind: AbilityKind, state: CastState) {
        match kind {
            AbilityKind::Area => self.area = state,
            AbilityKind::SkillShot => self.skill_shot = state,
            AbilityKind::Charge => self.charge = state,
        }
    }
}

/// A champion's casts and their cooldown history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AbilityLoadout {
    /// Cooldown length per ability.
    pub cooldown_ticks: CooldownTicks,
    /// Expiry records, one per tick written.
    pub history: CommandRing<CooldownTargets>,
    /// Current cast states.
    pub states: CastStates,
    /// Dashes started by charge commits, keyed by commit tick. Repeated
    /// passes replay these instead of committing again.
    pub charge_starts: CommandRing<DashState>,
}

impl AbilityLoadout {
    /// Loadout with the configured cooldowns and an empty history.
    #[must_use]
    pub fn from_config(config: &SimConfig) -> Self {
        let tuning = &config.abilities;
        Self {
            cooldown_ticks: CooldownTicks {
                area: config.seconds_to_ticks(tuning.area_cooldown_seconds),
                skill_shot: config.seconds_to_ticks(tuning.skill_shot_cooldown_seconds),
                charge: config.seconds_to_ticks(tuning.charge_cooldown_seconds),
            },
            history: CommandRing::with_capacity(config.history_capacity),
            states: CastStates::default(),
            charge_starts: CommandRing::with_capacity(config.history_capacity),
        }
    }

    /// Drop every cast that is still aiming.
    pub fn cancel_aiming(&mut self) {
        for kind in AbilityKind::PRIORITY {
            if matches!(self.states.get(kind), CastState::Aiming { .. }) {
                self.states.set(kind, CastState::Idle);
            }
        }
    }

    /// Write a cooldown record for `kind` committed at `tick` and return it.
    ///
    /// The record lands `cooldown_record_delay` ticks ahead and keeps the
    /// other abilities' expiries as of that tick.
    pub fn record_cooldown(&mut self, kind: AbilityKind, tick: Tick) -> RingEntry<CooldownTargets> {
        let record_tick = tick.add(kind.cooldown_record_delay());
        let mut targets = self.history.value_as_of(record_tick);
        targets.set(kind, Some(tick.add(self.cooldown_ticks.get(kind))));
        self.history.write(record_tick, targets);
        RingEntry::new(record_tick, targets)
    }
}

/// Identity of a spawn made by a predicting client.
///
/// The server stamps the same tag on its authoritative spawn, which lets
/// replication unify the two instead of showing a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PredictedSpawnTag {
    /// Tick of the spawn.
    pub spawn_tick: Tick,
    /// Connection whose input caused it.
    pub owner_id: ConnectionId,
    /// Entity kind spawned.
    pub kind: EntityKind,
}

/// Drive every champion's casts for this tick.
///
/// Repeated passes only replay the dash a charge commit started on the
/// caster at this tick.
pub fn cast_stage(world: &mut World, ctx: &StepContext<'_>, commands: &mut CommandBuffer) {
    if !world.match_state.is_playing() {
        return;
    }
    let tick = ctx.time.server_tick;
    if !ctx.time.is_first_full_tick() {
        replay_charge_starts(world, tick);
        return;
    }
    let lookback = ctx.config.lookback_for(ctx.time.batch_size);

    for handle in world.entities.handles() {
        let mut committed = Vec::new();
        let mut outgoing = Vec::new();
        {
            let Some(caster) = world.entities.get_mut(handle) else {
                continue;
            };
            if !caster.is_simulated() || caster.abilities.is_none() {
                continue;
            }
            let Some(input) = caster.input else {
                continue;
            };

            for kind in AbilityKind::PRIORITY {
                match advance_cast(caster, kind, &input.abilities, input.aim, ctx, lookback, commands) {
                    CastOutcome::Committed => {
                        committed.push(kind);
                        if !ctx.is_server() {
                            if let Some(loadout) = caster.abilities.as_mut() {
                                let record = loadout.record_cooldown(kind, tick);
                                outgoing.push(CommandRecord::AbilityCooldowns(record));
                            }
                        }
                    }
                    CastOutcome::Unchanged | CastOutcome::StartedAiming => {}
                }
            }
        }
        for kind in committed {
            world.emit(SimEvent::AbilityCommitted {
                caster: handle,
                kind,
                tick,
            });
        }
        world.queue_outgoing(outgoing);
    }
}

fn replay_charge_starts(world: &mut World, tick: Tick) {
    for caster in world.entities.iter_mut() {
        if !caster.is_simulated() {
            continue;
        }
        let Some(dash) = caster
            .abilities
            .as_ref()
            .and_then(|loadout| loadout.charge_starts.entry_at(tick))
            .map(|entry| entry.value)
        else {
            continue;
        };
        caster.dash = Some(dash);
        caster.move_target = Some(dash.target);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CastOutcome {
    Unchanged,
    StartedAiming,
    Committed,
}

fn advance_cast(
    caster: &mut Entity,
    kind: AbilityKind,
    input: &crate::components::AbilityInput,
    aim: Vec2Fixed,
    ctx: &StepContext<'_>,
    lookback: u32,
    commands: &mut CommandBuffer,
) -> CastOutcome {
    let tick = ctx.time.server_tick;
    let Some(loadout) = caster.abilities.as_ref() else {
        return CastOutcome::Unchanged;
    };

    match loadout.states.get(kind) {
        CastState::Idle | CastState::Committed { .. } => {
            let pressed = match kind {
                AbilityKind::Area => input.area,
                AbilityKind::SkillShot => input.skill_shot,
                AbilityKind::Charge => input.charge,
            };
            if !pressed.is_set() {
                return CastOutcome::Unchanged;
            }
            if caster.transform.is_none() {
                tracing::warn!(entity = %caster.handle(), ?kind, "cast skipped: no transform");
                return CastOutcome::Unchanged;
            }
            if is_on_cooldown(&loadout.history, tick, kind, lookback) {
                tracing::trace!(entity = %caster.handle(), ?kind, %tick, "on cooldown");
                return CastOutcome::Unchanged;
            }
            if kind.commits_immediately() {
                return commit(caster, kind, aim, ctx, commands);
            }
            if let Some(loadout) = caster.abilities.as_mut() {
                loadout.states.set(kind, CastState::Aiming { since: tick });
            }
            if !ctx.is_server() && ctx.is_local(caster.owner) {
                caster.aim_indicator = Some(AimIndicator { kind, since: tick });
            }
            tracing::debug!(entity = %caster.handle(), ?kind, %tick, "aiming");
            CastOutcome::StartedAiming
        }
        CastState::Aiming { .. } => {
            let confirmed = match kind {
                AbilityKind::SkillShot => input.confirm_skill_shot,
                AbilityKind::Charge => input.confirm_charge,
                AbilityKind::Area => input.area,
            };
            if !confirmed.is_set() {
                return CastOutcome::Unchanged;
            }
            if kind == AbilityKind::Charge && caster.dash.is_some() {
                return CastOutcome::Unchanged;
            }
            commit(caster, kind, aim, ctx, commands)
        }
    }
}

fn commit(
    caster: &mut Entity,
    kind: AbilityKind,
    aim: Vec2Fixed,
    ctx: &StepContext<'_>,
    commands: &mut CommandBuffer,
) -> CastOutcome {
    let tick = ctx.time.server_tick;
    let handle = caster.handle();

    let Some(transform) = caster.transform else {
        tracing::warn!(entity = %handle, ?kind, "commit aborted: no transform");
        return CastOutcome::Unchanged;
    };
    let Some(team) = caster.team else {
        tracing::warn!(entity = %handle, ?kind, "commit aborted: no team");
        return CastOutcome::Unchanged;
    };
    let Some(owner) = caster.owner else {
        tracing::warn!(entity = %handle, ?kind, "commit aborted: no owning connection");
        return CastOutcome::Unchanged;
    };

    let effect = AbilityEffect::from_config(kind, ctx.config);
    let tag = PredictedSpawnTag {
        spawn_tick: tick,
        owner_id: owner,
        kind: EntityKind::Ability(kind),
    };

    match effect {
        AbilityEffect::Charge {
            dash_speed,
            dash_distance,
            ..
        } => {
            if caster.move_speed.is_none() {
                tracing::warn!(entity = %handle, "charge aborted: no move speed");
                return CastOutcome::Unchanged;
            }
            let dash_target = transform.position + transform.facing.scale(dash_distance);
            let dash = DashState {
                target: dash_target,
                remaining: dash_distance,
                speed: dash_speed,
            };
            caster.dash = Some(dash);
            caster.move_target = Some(dash_target);
            if let Some(loadout) = caster.abilities.as_mut() {
                loadout.charge_starts.write(tick, dash);
            }
            commands.spawn(archetype::charge_effect(
                effect, transform, team, handle, tag,
            ));
        }
        AbilityEffect::SkillShot { .. } => {
            let direction = aim.normalize_or(transform.facing);
            commands.spawn(archetype::ability_effect(
                effect,
                transform.position,
                direction,
                team,
                tag,
                tick,
            ));
        }
        AbilityEffect::Area { .. } => {
            commands.spawn(archetype::ability_effect(
                effect,
                transform.position,
                transform.facing,
                team,
                tag,
                tick,
            ));
        }
    }

    if let Some(loadout) = caster.abilities.as_mut() {
        loadout.states.set(kind, CastState::Committed { at: tick });
    }
    if caster.aim_indicator.is_some_and(|indicator| indicator.kind == kind) {
        caster.aim_indicator = None;
    }
    tracing::debug!(entity = %handle, ?kind, %tick, "ability committed");
    CastOutcome::Committed
}
