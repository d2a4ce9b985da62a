//! Auto-attacks, NPC targeting and attacks, and contact damage.

use rayon::prelude::*;

use crate::ability::PredictedSpawnTag;
use crate::archetype;
use crate::components::{EntityKind, Team, Transform};
use crate::cooldown::attack_ready;
use crate::math::{Fixed, Vec2Fixed};
use crate::replication::{CommandRecord, ConnectionId};
use crate::ring_buffer::RingEntry;
use crate::simulation::StepContext;
use crate::spatial::{LayerMask, SpatialHit};
use crate::tick::Tick;
use crate::world::{CommandBuffer, EntityHandle, World};

/// Fire champion auto-attacks at the ghost each player has targeted.
///
/// The target must be an active enemy within range and the attack must be off
/// cooldown. Clients write the new expiry one tick ahead and forward it as
/// command data; the server stores what it receives.
pub fn auto_attack_stage(world: &mut World, ctx: &StepContext<'_>, commands: &mut CommandBuffer) {
    if !ctx.time.is_first_full_tick() || !world.match_state.is_playing() {
        return;
    }
    let tick = ctx.time.server_tick;
    let mut outgoing = Vec::new();

    for handle in world.entities.handles() {
        let Some(shot) = plan_auto_attack(world, handle, tick) else {
            continue;
        };
        let Some(caster) = world.entities.get_mut(handle) else {
            continue;
        };
        let Some(attack) = caster.auto_attack.as_mut() else {
            continue;
        };

        let tag = PredictedSpawnTag {
            spawn_tick: tick,
            owner_id: shot.owner,
            kind: EntityKind::AutoAttack,
        };
        let aim = Transform::looking(shot.origin, shot.direction);
        commands.spawn(archetype::auto_attack(attack, aim, shot.target, shot.team, tag));
        tracing::debug!(entity = %handle, target = %shot.target, %tick, "auto-attack");

        if !ctx.is_server() {
            let record = RingEntry::new(tick.add(1), Some(tick.add(attack.cooldown_ticks)));
            attack.cooldown.write(record.tick, record.value);
            outgoing.push(CommandRecord::AutoAttackCooldown(record));
        }
    }
    world.queue_outgoing(outgoing);
}

struct PlannedShot {
    owner: ConnectionId,
    team: Team,
    origin: Vec2Fixed,
    direction: Vec2Fixed,
    target: EntityHandle,
}

fn plan_auto_attack(world: &World, handle: EntityHandle, tick: Tick) -> Option<PlannedShot> {
    let caster = world.entities.get(handle)?;
    if !caster.is_simulated() {
        return None;
    }
    let attack = caster.auto_attack.as_ref()?;
    let ghost = caster.input?.attack_target?;
    let transform = caster.transform?;
    let (Some(team), Some(owner)) = (caster.team, caster.owner) else {
        tracing::warn!(entity = %handle, "auto-attack skipped: no team or owner");
        return None;
    };

    let Some(target_handle) = world.entities.find_ghost(ghost) else {
        tracing::trace!(entity = %handle, %ghost, "auto-attack target unknown");
        return None;
    };
    let target = world.entities.get(target_handle)?;
    if !target.is_active() || !target.kind.is_damageable() || target.team == Some(team) {
        return None;
    }
    let target_position = target.position()?;
    if transform.position.distance(target_position) > attack.range {
        return None;
    }
    if !attack_ready(&attack.cooldown, tick) {
        return None;
    }

    Some(PlannedShot {
        owner,
        team,
        origin: transform.position,
        direction: (target_position - transform.position).normalize_or(transform.facing),
        target: target_handle,
    })
}

/// Pick the closest enemy in range for every NPC.
///
/// Scans run in parallel against the read-only spatial index; results are
/// written back serially in entity order.
pub fn npc_target_stage(world: &mut World, ctx: &StepContext<'_>, _commands: &mut CommandBuffer) {
    let scans: Vec<(EntityHandle, Vec2Fixed, Fixed, Team)> = world
        .entities
        .iter()
        .filter(|entity| entity.is_simulated())
        .filter_map(|entity| {
            let npc = entity.npc.as_ref()?;
            Some((entity.handle(), entity.position()?, npc.target_radius, entity.team?))
        })
        .collect();

    let spatial = ctx.spatial;
    let found: Vec<(EntityHandle, Option<EntityHandle>)> = scans
        .par_iter()
        .map(|&(handle, position, radius, team)| {
            let target = spatial
                .overlap_sphere(position, radius, LayerMask::TARGETABLE)
                .into_iter()
                .find(|hit| is_enemy(hit, handle, team))
                .map(|hit| hit.entity);
            (handle, target)
        })
        .collect();

    for (handle, target) in found {
        if let Some(npc) = world.entities.get_mut(handle).and_then(|e| e.npc.as_mut()) {
            npc.target = target;
        }
    }
}

fn is_enemy(hit: &SpatialHit, scanner: EntityHandle, team: Team) -> bool {
    hit.entity != scanner && hit.team.is_some_and(|other| other != team)
}

/// Fire NPC projectiles at current targets. Server only.
pub fn npc_attack_stage(world: &mut World, ctx: &StepContext<'_>, commands: &mut CommandBuffer) {
    if !ctx.is_server() || !ctx.time.is_first_full_tick() || !world.match_state.is_playing() {
        return;
    }
    let tick = ctx.time.server_tick;

    let live_targets: Vec<EntityHandle> = world
        .entities
        .iter()
        .filter_map(|entity| entity.npc.as_ref()?.target)
        .filter(|target| world.entities.is_active(*target))
        .collect();

    for entity in world.entities.iter_mut() {
        if !entity.is_simulated() {
            continue;
        }
        let (Some(position), Some(team)) = (entity.position(), entity.team) else {
            continue;
        };
        let handle = entity.handle();
        let Some(npc) = entity.npc.as_mut() else {
            continue;
        };
        let Some(target) = npc.target.filter(|t| live_targets.contains(t)) else {
            continue;
        };
        if !attack_ready(&npc.cooldown, tick) {
            continue;
        }
        commands.spawn(archetype::npc_projectile(npc, position, target, team));
        npc.cooldown.write(tick, Some(tick.add(npc.cooldown_ticks)));
        tracing::trace!(entity = %handle, %target, %tick, "npc attack");
    }
}

/// Deal contact damage.
///
/// Moving triggers sweep from their previous position so fast projectiles
/// cannot tunnel through a target in one tick. Each target is hit at most
/// once per trigger. Hits only queue damage on targets this world
/// simulates; interpolated ghosts take their hit points from snapshots.
pub fn damage_on_trigger_stage(world: &mut World, ctx: &StepContext<'_>, commands: &mut CommandBuffer) {
    if !world.match_state.is_playing() {
        return;
    }

    let triggers: Vec<(EntityHandle, Vec2Fixed, Vec2Fixed, Fixed, Team)> = world
        .entities
        .iter()
        .filter(|entity| entity.is_simulated())
        .filter_map(|entity| {
            let trigger = entity.damage_on_trigger.as_ref()?;
            let position = entity.position()?;
            let from = entity.motion.map_or(position, |m| m.previous_position);
            Some((entity.handle(), from, position, trigger.radius, entity.team?))
        })
        .collect();

    for (handle, from, to, radius, team) in triggers {
        let hits = if from == to {
            ctx.spatial.overlap_sphere(to, radius, LayerMask::TARGETABLE)
        } else {
            ctx.spatial.cast_ray(from, to, radius, LayerMask::TARGETABLE)
        };

        for hit in hits {
            if !is_enemy(&hit, handle, team) {
                continue;
            }
            let Some(trigger) = world
                .entities
                .get_mut(handle)
                .and_then(|e| e.damage_on_trigger.as_mut())
            else {
                break;
            };
            if trigger.has_damaged(hit.entity) {
                continue;
            }
            trigger.already_damaged.push(hit.entity);
            let amount = trigger.damage;
            let destroy_on_hit = trigger.destroy_on_hit;

            if let Some(target) = world.entities.get_mut(hit.entity) {
                if target.is_simulated() {
                    if let Some(buffers) = target.damage.as_mut() {
                        buffers.push(amount, handle);
                    }
                }
            }
            tracing::trace!(trigger = %handle, target = %hit.entity, amount, "contact hit");

            if destroy_on_hit {
                commands.mark_for_destruction(handle);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::damage::DamageOnTrigger;
    use crate::match_flow::MatchPhase;
    use crate::components::PlayerInput;
    use crate::replication::GhostId;
    use crate::spatial::SpatialIndex;
    use crate::tick::NetworkTime;
    use crate::world::{Entity, WorldRole};

    fn playing(role: WorldRole) -> World {
        let mut world = World::new(role);
        world.match_state.phase = MatchPhase::Playing { since: Tick::ZERO };
        world
    }

    fn run(
        world: &mut World,
        tick: u32,
        stage: fn(&mut World, &StepContext<'_>, &mut CommandBuffer),
    ) -> CommandBuffer {
        let config = SimConfig::default();
        let spatial = SpatialIndex::build(world);
        let ctx = StepContext::new(world.role(), NetworkTime::full(Tick::new(tick)), &config, &spatial, None);
        let mut commands = CommandBuffer::new();
        stage(world, &ctx, &mut commands);
        commands
    }

    fn minion_at(world: &mut World, team: Team, x: i32) -> EntityHandle {
        let config = SimConfig::default();
        let mut minion = archetype::minion(&config, team, vec![Vec2Fixed::from_ints(x, 0)]);
        minion.minion_path = None;
        world.spawn(minion)
    }

    #[test]
    fn test_npc_targets_closest_enemy() {
        let mut world = playing(WorldRole::Server);
        let scanner = minion_at(&mut world, Team::Blue, 0);
        minion_at(&mut world, Team::Blue, 1);
        let far = minion_at(&mut world, Team::Red, 5);
        let near = minion_at(&mut world, Team::Red, 3);

        run(&mut world, 1, npc_target_stage);
        let target = world.entities.get(scanner).and_then(|e| e.npc.as_ref()).and_then(|n| n.target);
        assert_eq!(target, Some(near));
        let reverse = world.entities.get(far).and_then(|e| e.npc.as_ref()).and_then(|n| n.target);
        assert!(reverse.is_some());
    }

    #[test]
    fn test_npc_attack_respects_cooldown() {
        let config = SimConfig::default();
        let mut world = playing(WorldRole::Server);
        minion_at(&mut world, Team::Blue, 0);
        world.spawn(archetype::champion(
            &config,
            Team::Red,
            Vec2Fixed::from_ints(3, 0),
            ConnectionId::new(1),
        ));
        run(&mut world, 1, npc_target_stage);

        let mut first = run(&mut world, 1, npc_attack_stage);
        assert_eq!(first.len(), 1);
        first.playback(&mut world, Tick::new(1));

        // 1 s cooldown at 30 Hz expires at tick 31; ready strictly after.
        assert!(run(&mut world, 31, npc_attack_stage).is_empty());
        assert_eq!(run(&mut world, 32, npc_attack_stage).len(), 1);
    }

    #[test]
    fn test_client_skips_npc_attacks() {
        let mut world = playing(WorldRole::Client);
        minion_at(&mut world, Team::Blue, 0);
        minion_at(&mut world, Team::Red, 3);
        run(&mut world, 1, npc_target_stage);
        assert!(run(&mut world, 1, npc_attack_stage).is_empty());
    }

    #[test]
    fn test_trigger_hits_each_enemy_once() {
        let mut world = playing(WorldRole::Server);
        let enemy = minion_at(&mut world, Team::Red, 2);
        let friend = minion_at(&mut world, Team::Blue, -2);
        let mut zone = Entity::new(EntityKind::Ability(crate::ability::AbilityKind::Area));
        zone.team = Some(Team::Blue);
        zone.transform = Some(Transform::at(Vec2Fixed::ZERO));
        zone.damage_on_trigger = Some(DamageOnTrigger::new(40, Fixed::from_num(4), false));
        world.spawn(zone);

        run(&mut world, 1, damage_on_trigger_stage);
        run(&mut world, 2, damage_on_trigger_stage);

        let pending = |h| world.entities.get(h).and_then(|e| e.damage.as_ref()).map(|d| d.pending.len());
        assert_eq!(pending(enemy), Some(1));
        assert_eq!(pending(friend), Some(0));
    }

    #[test]
    fn test_client_auto_attack_writes_cooldown_ahead() {
        let config = SimConfig::default();
        let mut world = playing(WorldRole::Client);
        let target = minion_at(&mut world, Team::Red, 4);
        if let Some(entity) = world.entities.get_mut(target) {
            entity.ghost = Some(GhostId::new(9));
        }
        let mut champ = archetype::champion(&config, Team::Blue, Vec2Fixed::ZERO, ConnectionId::new(1));
        champ.input = Some(PlayerInput {
            attack_target: Some(GhostId::new(9)),
            ..PlayerInput::default()
        });
        let handle = world.spawn(champ);

        assert_eq!(run(&mut world, 100, auto_attack_stage).len(), 1);
        let cooldown = &world
            .entities
            .get(handle)
            .and_then(|e| e.auto_attack.as_ref())
            .expect("attacker stored")
            .cooldown;
        assert_eq!(
            cooldown.entry_at(Tick::new(101)).map(|e| e.value),
            Some(Some(Tick::new(130)))
        );
        assert_eq!(world.take_outgoing().len(), 1);

        // Still cooling down on the next tick.
        assert!(run(&mut world, 101, auto_attack_stage).is_empty());
    }

    #[test]
    fn test_auto_attack_out_of_range() {
        let config = SimConfig::default();
        let mut world = playing(WorldRole::Server);
        let target = minion_at(&mut world, Team::Red, 40);
        let ghost = world.entities.get(target).and_then(|e| e.ghost);
        let mut champ = archetype::champion(&config, Team::Blue, Vec2Fixed::ZERO, ConnectionId::new(1));
        champ.input = Some(PlayerInput {
            attack_target: ghost,
            ..PlayerInput::default()
        });
        world.spawn(champ);

        assert!(run(&mut world, 5, auto_attack_stage).is_empty());
    }
}
