//! Entity builders for every archetype.
//!
//! The server and predicting clients build entities through the same
//! functions, so a predicted spawn and its authoritative twin start with
//! identical components.

use crate::ability::{AbilityEffect, AbilityLoadout, PredictedSpawnTag};
use crate::components::{
    AutoAttack, EntityKind, MinionPath, Motion, MoveSpeed, Mover, NpcAttack, Team, Transform,
};
use crate::config::{grid_to_vec, NpcTuning, SimConfig, StructureLayout};
use crate::damage::{DamageBuffers, DamageOnTrigger, HitPoints};
use crate::math::{Fixed, Vec2Fixed};
use crate::replication::ConnectionId;
use crate::ring_buffer::CommandRing;
use crate::tick::Tick;
use crate::world::{Entity, EntityHandle};

/// Hit radius of auto-attack and NPC attack projectiles.
fn projectile_radius() -> Fixed {
    Fixed::from_num(1) / Fixed::from_num(2)
}

fn damageable(entity: &mut Entity, hit_points: i32, config: &SimConfig) {
    entity.hit_points = Some(HitPoints::full(hit_points));
    entity.damage = Some(DamageBuffers::with_capacity(config.history_capacity));
}

fn npc_attack(tuning: &NpcTuning, config: &SimConfig) -> NpcAttack {
    NpcAttack {
        target_radius: tuning.target_radius,
        cooldown_ticks: config.seconds_to_ticks(tuning.attack_cooldown_seconds),
        damage: tuning.attack_damage,
        projectile_speed: tuning.projectile_speed,
        fire_point_offset: grid_to_vec(tuning.fire_point_offset),
        target: None,
        cooldown: CommandRing::with_capacity(config.history_capacity),
    }
}

/// Player champion.
#[must_use]
pub fn champion(config: &SimConfig, team: Team, position: Vec2Fixed, owner: ConnectionId) -> Entity {
    let tuning = &config.champion;
    let mut entity = Entity::new(EntityKind::Champion);
    entity.team = Some(team);
    entity.owner = Some(owner);
    entity.body_radius = tuning.body_radius;
    entity.transform = Some(Transform::at(position));
    damageable(&mut entity, tuning.hit_points, config);
    entity.move_speed = Some(MoveSpeed {
        walk: tuning.move_speed,
        dash: tuning.dash_speed,
        dash_distance: tuning.dash_distance,
    });
    entity.abilities = Some(AbilityLoadout::from_config(config));
    entity.auto_attack = Some(AutoAttack {
        range: tuning.auto_attack_range,
        cooldown_ticks: config.seconds_to_ticks(tuning.auto_attack_cooldown_seconds),
        damage: tuning.auto_attack_damage,
        projectile_speed: tuning.auto_attack_speed,
        fire_point_offset: tuning.fire_point_offset,
        cooldown: CommandRing::with_capacity(config.history_capacity),
    });
    entity
}

/// Lane minion walking `waypoints`.
#[must_use]
pub fn minion(config: &SimConfig, team: Team, waypoints: Vec<Vec2Fixed>) -> Entity {
    let start = waypoints.first().copied().unwrap_or(Vec2Fixed::ZERO);
    let heading = waypoints
        .get(1)
        .map_or(Vec2Fixed::FORWARD, |next| *next - start);

    let mut entity = Entity::new(EntityKind::Minion);
    entity.team = Some(team);
    entity.body_radius = config.minion.body_radius;
    entity.transform = Some(Transform::looking(start, heading));
    damageable(&mut entity, config.minion.hit_points, config);
    entity.move_speed = Some(MoveSpeed {
        walk: config.waves.minion_move_speed,
        dash: Fixed::ZERO,
        dash_distance: Fixed::ZERO,
    });
    entity.npc = Some(npc_attack(&config.minion, config));
    entity.minion_path = Some(MinionPath {
        waypoints,
        index: 1,
    });
    entity
}

/// Tower or base.
#[must_use]
pub fn structure(config: &SimConfig, layout: &StructureLayout) -> Entity {
    let mut entity = Entity::new(EntityKind::Structure);
    entity.team = Some(layout.team);
    entity.body_radius = config.tower.body_radius;
    entity.transform = Some(Transform::at(grid_to_vec(layout.position)));
    damageable(&mut entity, config.tower.hit_points, config);
    entity.npc = Some(npc_attack(&config.tower, config));
    entity.ends_match_on_destroy = layout.ends_match;
    entity
}

/// Area or skill-shot effect spawned at `position`.
///
/// The charge effect follows its caster and is built by [`charge_effect`].
#[must_use]
pub fn ability_effect(
    effect: AbilityEffect,
    position: Vec2Fixed,
    direction: Vec2Fixed,
    team: Team,
    tag: PredictedSpawnTag,
    tick: Tick,
) -> Entity {
    let mut entity = Entity::new(EntityKind::Ability(effect.kind()));
    entity.team = Some(team);
    entity.owner = Some(tag.owner_id);
    entity.predicted_spawn = Some(tag);
    entity.transform = Some(Transform::looking(position, direction));

    match effect {
        AbilityEffect::Area {
            damage,
            radius,
            lifetime_ticks,
        } => {
            entity.body_radius = radius;
            entity.damage_on_trigger = Some(DamageOnTrigger::new(damage, radius, false));
            entity.motion = Some(Motion::new(Mover::Stationary, position));
            entity.destroy_at = Some(tick.add(lifetime_ticks));
        }
        AbilityEffect::SkillShot {
            damage,
            radius,
            speed,
            lifetime_ticks,
        } => {
            entity.body_radius = radius;
            entity.damage_on_trigger = Some(DamageOnTrigger::new(damage, radius, true));
            entity.motion = Some(Motion::new(Mover::Straight { direction, speed }, position));
            entity.destroy_at = Some(tick.add(lifetime_ticks));
        }
        AbilityEffect::Charge { damage, radius, .. } => {
            entity.body_radius = radius;
            entity.damage_on_trigger = Some(DamageOnTrigger::new(damage, radius, false));
        }
    }
    entity
}

/// Contact zone that rides along with a dashing champion.
#[must_use]
pub fn charge_effect(
    effect: AbilityEffect,
    caster: Transform,
    team: Team,
    owner: EntityHandle,
    tag: PredictedSpawnTag,
) -> Entity {
    let mut entity = ability_effect(effect, caster.position, caster.facing, team, tag, tag.spawn_tick);
    entity.charge_owner = Some(owner);
    entity
}

/// Homing auto-attack projectile.
#[must_use]
pub fn auto_attack(
    attack: &AutoAttack,
    caster: Transform,
    target: EntityHandle,
    team: Team,
    tag: PredictedSpawnTag,
) -> Entity {
    let origin = caster.position + caster.facing.scale(attack.fire_point_offset);
    let mut entity = Entity::new(EntityKind::AutoAttack);
    entity.team = Some(team);
    entity.owner = Some(tag.owner_id);
    entity.predicted_spawn = Some(tag);
    entity.body_radius = projectile_radius();
    entity.transform = Some(Transform::looking(origin, caster.facing));
    entity.motion = Some(Motion::new(
        Mover::Homing {
            target,
            speed: attack.projectile_speed,
        },
        origin,
    ));
    entity.damage_on_trigger = Some(DamageOnTrigger::new(attack.damage, projectile_radius(), true));
    entity
}

/// Homing projectile fired by a minion or tower.
#[must_use]
pub fn npc_projectile(npc: &NpcAttack, attacker: Vec2Fixed, target: EntityHandle, team: Team) -> Entity {
    let origin = attacker + npc.fire_point_offset;
    let mut entity = Entity::new(EntityKind::NpcAttack);
    entity.team = Some(team);
    entity.body_radius = projectile_radius();
    entity.transform = Some(Transform::at(origin));
    entity.motion = Some(Motion::new(
        Mover::Homing {
            target,
            speed: npc.projectile_speed,
        },
        origin,
    ));
    entity.damage_on_trigger = Some(DamageOnTrigger::new(npc.damage, projectile_radius(), true));
    entity
}

/// Bare entity of `kind` for a ghost a client has not predicted.
///
/// Only the fields snapshots overwrite are set up; everything else is left
/// empty because interpolated entities are never simulated.
#[must_use]
pub fn ghost_shell(kind: EntityKind, config: &SimConfig) -> Entity {
    let mut entity = Entity::new(kind);
    entity.interpolated = true;
    entity.body_radius = match kind {
        EntityKind::Champion => config.champion.body_radius,
        EntityKind::Minion => config.minion.body_radius,
        EntityKind::Structure => config.tower.body_radius,
        EntityKind::Ability(ability) => {
            match AbilityEffect::from_config(ability, config) {
                AbilityEffect::Area { radius, .. }
                | AbilityEffect::SkillShot { radius, .. }
                | AbilityEffect::Charge { radius, .. } => radius,
            }
        }
        EntityKind::AutoAttack | EntityKind::NpcAttack => projectile_radius(),
    };
    if kind.is_damageable() {
        entity.damage = Some(DamageBuffers::with_capacity(config.history_capacity));
    }
    entity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ability::AbilityKind;

    #[test]
    fn test_champion_has_full_loadout() {
        let config = SimConfig::default();
        let champ = champion(&config, Team::Blue, Vec2Fixed::ZERO, ConnectionId::new(1));
        assert_eq!(champ.hit_points, Some(HitPoints::full(500)));
        assert!(champ.abilities.is_some());
        assert_eq!(champ.auto_attack.as_ref().map(|a| a.cooldown_ticks), Some(30));
        assert_eq!(champ.owner, Some(ConnectionId::new(1)));
    }

    #[test]
    fn test_minion_faces_first_leg() {
        let config = SimConfig::default();
        let waypoints = vec![Vec2Fixed::from_ints(0, 0), Vec2Fixed::from_ints(10, 0)];
        let minion = minion(&config, Team::Red, waypoints);
        let facing = minion.transform.map(|t| t.facing).unwrap_or_default();
        assert!(facing.x > Fixed::from_num(0.99));
        assert_eq!(facing.y, Fixed::ZERO);
        assert_eq!(minion.minion_path.map(|p| p.index), Some(1));
    }

    #[test]
    fn test_skill_shot_expires_and_dies_on_hit() {
        let config = SimConfig::default();
        let effect = AbilityEffect::from_config(AbilityKind::SkillShot, &config);
        let tag = PredictedSpawnTag {
            spawn_tick: Tick::new(10),
            owner_id: ConnectionId::new(2),
            kind: EntityKind::Ability(AbilityKind::SkillShot),
        };
        let shot = ability_effect(effect, Vec2Fixed::ZERO, Vec2Fixed::FORWARD, Team::Blue, tag, Tick::new(10));
        assert_eq!(shot.destroy_at, Some(Tick::new(70)));
        assert_eq!(shot.damage_on_trigger.map(|d| d.destroy_on_hit), Some(true));
        assert_eq!(shot.predicted_spawn, Some(tag));
    }
}
