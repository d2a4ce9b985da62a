//! Movement stages.
//!
//! All speeds are configured per second and converted to per-tick steps with
//! [`SimConfig::per_tick`](crate::config::SimConfig::per_tick). Movement
//! stages run whether or not the match is playing; champions can walk around
//! during the countdown.

use crate::components::{Mover, Transform};
use crate::math::{Fixed, Vec2Fixed};
use crate::simulation::StepContext;
use crate::world::{CommandBuffer, EntityHandle, World};

/// Champions closer than this to their destination stop walking.
fn arrival_threshold() -> Fixed {
    Fixed::from_num(1) / Fixed::from_num(10)
}

/// Copy each player's input for this tick onto their champion.
///
/// Runs on every pass, including repeated ones, so resimulation replays the
/// recorded inputs. A batched step merges the input of every tick it covers.
pub fn apply_inputs_stage(world: &mut World, ctx: &StepContext<'_>, _commands: &mut CommandBuffer) {
    let tick = ctx.time.server_tick;
    let span = ctx.time.batch_size;
    let updates: Vec<_> = world
        .entities
        .iter()
        .filter(|entity| entity.is_simulated())
        .filter_map(|entity| {
            let owner = entity.owner?;
            entity.abilities.as_ref()?;
            Some((entity.handle(), world.input_over(owner, tick, span)))
        })
        .collect();

    for (handle, input) in updates {
        let Some(entity) = world.entities.get_mut(handle) else {
            continue;
        };
        entity.input = input;
        if let Some(target) = input.and_then(|i| i.move_target) {
            if entity.dash.is_none() {
                entity.move_target = Some(target);
            }
        }
    }
}

/// Walk champions toward their move target.
pub fn champion_move_stage(world: &mut World, ctx: &StepContext<'_>, _commands: &mut CommandBuffer) {
    for entity in world.entities.iter_mut() {
        if !entity.is_simulated() || entity.dash.is_some() || entity.minion_path.is_some() {
            continue;
        }
        let (Some(speed), Some(target), Some(transform)) =
            (entity.move_speed, entity.move_target, entity.transform.as_mut())
        else {
            continue;
        };
        if transform.position.distance(target) < arrival_threshold() {
            continue;
        }
        let heading = (target - transform.position).normalize();
        let (position, _) = transform
            .position
            .step_toward(target, ctx.config.per_tick(speed.walk));
        *transform = Transform {
            position,
            facing: heading.normalize_or(transform.facing),
        };
    }
}

/// Advance dashes, then carry each charge effect along with its caster.
///
/// A dash ends once its distance is covered. A charge effect whose caster is
/// gone or no longer dashing is marked for destruction.
pub fn dash_stage(world: &mut World, ctx: &StepContext<'_>, commands: &mut CommandBuffer) {
    for entity in world.entities.iter_mut() {
        if !entity.is_simulated() || entity.charge_owner.is_some() {
            continue;
        }
        let (Some(dash), Some(transform)) = (entity.dash.as_mut(), entity.transform.as_mut()) else {
            continue;
        };
        let step = ctx.config.per_tick(dash.speed).min(dash.remaining);
        let (position, travelled) = transform.position.step_toward(dash.target, step);
        transform.position = position;
        dash.remaining -= travelled;
        if dash.remaining <= Fixed::ZERO || position == dash.target {
            tracing::trace!(entity = %entity.handle(), "dash finished");
            entity.dash = None;
        }
    }

    let effects: Vec<(EntityHandle, EntityHandle)> = world
        .entities
        .iter()
        .filter(|entity| entity.is_simulated())
        .filter_map(|entity| entity.charge_owner.map(|owner| (entity.handle(), owner)))
        .collect();
    for (effect, owner) in effects {
        let carrier = world
            .entities
            .get(owner)
            .filter(|caster| caster.is_active() && caster.dash.is_some())
            .and_then(|caster| caster.transform);
        match carrier {
            Some(caster) => {
                if let Some(entity) = world.entities.get_mut(effect) {
                    entity.transform = Some(caster);
                }
            }
            None => commands.mark_for_destruction(effect),
        }
    }
}

/// Move projectiles and ability effects.
///
/// Homing projectiles whose target no longer resolves are marked for
/// destruction.
pub fn projectile_move_stage(world: &mut World, ctx: &StepContext<'_>, commands: &mut CommandBuffer) {
    let targets: Vec<(EntityHandle, Option<Vec2Fixed>)> = world
        .entities
        .iter()
        .filter(|entity| entity.is_simulated())
        .filter_map(|entity| match entity.motion?.mover {
            Mover::Homing { target, .. } => {
                let position = world
                    .entities
                    .get(target)
                    .filter(|t| t.is_active())
                    .and_then(|t| t.position());
                Some((entity.handle(), position))
            }
            Mover::Straight { .. } | Mover::Stationary => None,
        })
        .collect();

    for entity in world.entities.iter_mut() {
        if !entity.is_simulated() {
            continue;
        }
        let handle = entity.handle();
        let (Some(motion), Some(transform)) = (entity.motion.as_mut(), entity.transform.as_mut()) else {
            continue;
        };
        motion.previous_position = transform.position;
        match motion.mover {
            Mover::Stationary => {}
            Mover::Straight { direction, speed } => {
                transform.position = transform.position + direction.scale(ctx.config.per_tick(speed));
            }
            Mover::Homing { speed, .. } => {
                let target = targets
                    .iter()
                    .find(|(h, _)| *h == handle)
                    .and_then(|(_, position)| *position);
                let Some(target) = target else {
                    tracing::trace!(entity = %handle, "homing target gone");
                    commands.mark_for_destruction(handle);
                    continue;
                };
                let heading = (target - transform.position).normalize_or(transform.facing);
                let (position, _) = transform
                    .position
                    .step_toward(target, ctx.config.per_tick(speed));
                transform.position = position;
                transform.facing = heading;
            }
        }
    }
}

/// Walk minions along their lane, halting while they have a target.
pub fn minion_move_stage(world: &mut World, ctx: &StepContext<'_>, _commands: &mut CommandBuffer) {
    let reach = ctx.config.waves.waypoint_reach_radius;
    for entity in world.entities.iter_mut() {
        if !entity.is_simulated() {
            continue;
        }
        if entity.npc.as_ref().is_some_and(|npc| npc.target.is_some()) {
            continue;
        }
        let (Some(path), Some(speed), Some(transform)) =
            (entity.minion_path.as_mut(), entity.move_speed, entity.transform.as_mut())
        else {
            continue;
        };
        let Some(mut waypoint) = path.waypoints.get(path.index).copied() else {
            continue;
        };
        if transform.position.distance(waypoint) <= reach {
            if path.index + 1 >= path.waypoints.len() {
                continue;
            }
            path.index += 1;
            waypoint = path.waypoints[path.index];
        }
        let heading = (waypoint - transform.position).normalize();
        transform.position = transform.position + heading.scale(ctx.config.per_tick(speed.walk));
        transform.facing = heading.normalize_or(transform.facing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archetype;
    use crate::components::{DashState, Motion, Team};
    use crate::config::SimConfig;
    use crate::replication::ConnectionId;
    use crate::spatial::SpatialIndex;
    use crate::tick::{NetworkTime, Tick};
    use crate::world::{Entity, WorldRole};

    fn run(world: &mut World, stage: fn(&mut World, &StepContext<'_>, &mut CommandBuffer)) -> CommandBuffer {
        let config = SimConfig::default();
        let spatial = SpatialIndex::empty();
        let ctx = StepContext::new(WorldRole::Server, NetworkTime::full(Tick::new(1)), &config, &spatial, None);
        let mut commands = CommandBuffer::new();
        stage(world, &ctx, &mut commands);
        commands
    }

    #[test]
    fn test_champion_walks_one_step() {
        let config = SimConfig::default();
        let mut world = World::new(WorldRole::Server);
        let mut champ = archetype::champion(&config, Team::Blue, Vec2Fixed::ZERO, ConnectionId::new(1));
        champ.move_target = Some(Vec2Fixed::from_ints(0, 10));
        let handle = world.spawn(champ);

        run(&mut world, champion_move_stage);
        let position = world
            .entities
            .get(handle)
            .and_then(|e| e.position())
            .expect("entity positioned");
        assert_eq!(position.x, Fixed::ZERO);
        // 6 units per second at 30 Hz.
        assert!((position.y - Fixed::from_num(0.2)).abs() < Fixed::from_num(0.0001));
    }

    #[test]
    fn test_dash_ends_after_distance() {
        let config = SimConfig::default();
        let mut world = World::new(WorldRole::Server);
        let mut champ = archetype::champion(&config, Team::Blue, Vec2Fixed::ZERO, ConnectionId::new(1));
        champ.dash = Some(DashState {
            target: Vec2Fixed::from_ints(0, 8),
            remaining: Fixed::from_num(8),
            speed: Fixed::from_num(24),
        });
        let handle = world.spawn(champ);

        let mut ticks = 0;
        while world.entities.get(handle).is_some_and(|e| e.dash.is_some()) {
            run(&mut world, dash_stage);
            ticks += 1;
            assert!(ticks < 20, "dash never ended");
        }
        // 8 units at 0.8 per tick, plus at most one rounding step.
        assert!((10..=11).contains(&ticks), "took {ticks} ticks");
        let end = world
            .entities
            .get(handle)
            .and_then(|e| e.position())
            .expect("entity positioned");
        assert!(end.distance(Vec2Fixed::from_ints(0, 8)) < Fixed::from_num(0.001));
    }

    #[test]
    fn test_homing_without_target_is_marked() {
        let mut world = World::new(WorldRole::Server);
        let mut shot = Entity::new(crate::components::EntityKind::NpcAttack);
        shot.transform = Some(Transform::at(Vec2Fixed::ZERO));
        shot.motion = Some(Motion::new(
            Mover::Homing {
                target: EntityHandle::DANGLING,
                speed: Fixed::from_num(10),
            },
            Vec2Fixed::ZERO,
        ));
        let handle = world.spawn(shot);

        let mut commands = run(&mut world, projectile_move_stage);
        commands.playback(&mut world, Tick::new(1));
        assert!(!world.entities.is_active(handle));
    }

    #[test]
    fn test_minion_advances_waypoint() {
        let config = SimConfig::default();
        let mut world = World::new(WorldRole::Server);
        let waypoints = vec![
            Vec2Fixed::from_ints(0, 0),
            Vec2Fixed::from_ints(0, 1),
            Vec2Fixed::from_ints(10, 1),
        ];
        let handle = world.spawn(archetype::minion(&config, Team::Blue, waypoints));

        run(&mut world, minion_move_stage);
        let entity = world.entities.get(handle).expect("entity stored");
        assert_eq!(entity.minion_path.as_ref().map(|p| p.index), Some(2));
        assert!(entity.position().expect("entity positioned").x > Fixed::ZERO);
    }
}
