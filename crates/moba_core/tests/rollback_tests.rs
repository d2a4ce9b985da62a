//! Rollback-safety tests.
//!
//! These drive the stage list directly on bare worlds and check that
//! repeating a tick never changes what the first pass decided.

use moba_core::ability::AbilityKind;
use moba_core::archetype;
use moba_core::components::{EntityKind, Team};
use moba_core::config::SimConfig;
use moba_core::cooldown::{is_on_cooldown, CooldownTargets};
use moba_core::lifecycle::{self, Lifecycle};
use moba_core::replication::ConnectionId;
use moba_core::ring_buffer::CommandRing;
use moba_core::scheduler::{countdown_seconds, Scheduler};
use moba_core::simulation::run_stages;
use moba_core::tick::{NetworkTime, Tick};
use moba_core::world::{EntityHandle, World, WorldRole};
use proptest::prelude::*;

const LOCAL: ConnectionId = ConnectionId::new(1);

fn spawn_minion(world: &mut World, config: &SimConfig) -> EntityHandle {
    world.spawn(archetype::minion(config, Team::Red, Vec::new()))
}

fn queue_hits(world: &mut World, handle: EntityHandle, amounts: &[i32]) {
    let buffers = world
        .entities
        .get_mut(handle)
        .and_then(|entity| entity.damage.as_mut())
        .expect("minion has damage buffers");
    for &amount in amounts {
        buffers.push(amount, handle);
    }
}

fn hit_points(world: &World, handle: EntityHandle) -> i32 {
    world
        .entities
        .get(handle)
        .and_then(|entity| entity.hit_points)
        .map(|hp| hp.current)
        .expect("minion has hit points")
}

fn damage_record(world: &World, handle: EntityHandle, tick: u32) -> Option<i32> {
    world
        .entities
        .get(handle)
        .and_then(|entity| entity.damage.as_ref())
        .and_then(|buffers| buffers.this_tick.entry_at(Tick::new(tick)))
        .map(|entry| entry.value)
}

// =============================================================================
// Damage
// =============================================================================

#[test]
fn hits_in_one_tick_commit_once() {
    let config = SimConfig::default();
    let mut world = World::new(WorldRole::Client);
    let minion = spawn_minion(&mut world, &config);

    queue_hits(&mut world, minion, &[5, 3, 2]);
    run_stages(&mut world, &config, NetworkTime::full(Tick::new(10)), Some(LOCAL));
    assert_eq!(damage_record(&world, minion, 10), Some(10));
    assert_eq!(hit_points(&world, minion), 110);

    run_stages(&mut world, &config, NetworkTime::full(Tick::new(11)), Some(LOCAL));
    assert_eq!(damage_record(&world, minion, 11), Some(0));
    assert_eq!(hit_points(&world, minion), 110);
}

#[test]
fn repeating_a_tick_is_idempotent() {
    let config = SimConfig::default();
    let mut world = World::new(WorldRole::Client);
    let minion = spawn_minion(&mut world, &config);

    queue_hits(&mut world, minion, &[7, 8]);
    run_stages(&mut world, &config, NetworkTime::full(Tick::new(20)), Some(LOCAL));
    let first = world.entities.get(minion).cloned().expect("minion");

    for _ in 0..2 {
        run_stages(&mut world, &config, NetworkTime::repeat(Tick::new(20)), Some(LOCAL));
        let repeated = world.entities.get(minion).expect("minion");
        assert_eq!(repeated.hit_points, first.hit_points);
        assert_eq!(
            repeated.damage.as_ref().map(|d| d.this_tick.latest().copied()),
            first.damage.as_ref().map(|d| d.this_tick.latest().copied())
        );
    }
    assert_eq!(hit_points(&world, minion), 105);
}

// =============================================================================
// Destroy handshake
// =============================================================================

#[test]
fn server_removes_depleted_entity_in_the_same_step() {
    let config = SimConfig::default();
    let mut world = World::new(WorldRole::Server);
    let minion = spawn_minion(&mut world, &config);

    queue_hits(&mut world, minion, &[config.minion.hit_points]);
    run_stages(&mut world, &config, NetworkTime::full(Tick::new(5)), None);

    assert!(world.entities.get(minion).is_none());
    assert_eq!(world.removed_since(Some(Tick::new(4))).len(), 1);
}

#[test]
fn client_keeps_depleted_entity_inert_until_confirmed() {
    let config = SimConfig::default();
    let mut world = World::new(WorldRole::Client);
    let minion = spawn_minion(&mut world, &config);
    let start = world.entities.get(minion).and_then(|e| e.position());

    queue_hits(&mut world, minion, &[config.minion.hit_points]);
    run_stages(&mut world, &config, NetworkTime::full(Tick::new(5)), Some(LOCAL));
    run_stages(&mut world, &config, NetworkTime::full(Tick::new(6)), Some(LOCAL));

    let entity = world.entities.get(minion).expect("kept until confirmed");
    assert_eq!(entity.lifecycle, Lifecycle::MarkedForDestruction { since: Tick::new(5) });
    assert!(!entity.is_simulated());
    assert_eq!(entity.position(), start);

    let removed = lifecycle::confirm_removal(&mut world, minion, Tick::new(7));
    assert_eq!(removed.map(|e| e.kind), Some(EntityKind::Minion));
    assert!(world.entities.get(minion).is_none());
}

// =============================================================================
// Cooldowns and scheduling
// =============================================================================

#[test]
fn area_used_at_100_is_blocked_until_190() {
    let mut history = CommandRing::with_capacity(64);
    let mut targets = CooldownTargets::default();
    targets.set(AbilityKind::Area, Some(Tick::new(190)));
    history.write(Tick::new(101), targets);

    assert!(!is_on_cooldown(&history, Tick::new(100), AbilityKind::Area, 1));
    assert!(is_on_cooldown(&history, Tick::new(101), AbilityKind::Area, 1));
    assert!(is_on_cooldown(&history, Tick::new(189), AbilityKind::Area, 1));
    assert!(!is_on_cooldown(&history, Tick::new(190), AbilityKind::Area, 1));
}

#[test]
fn scheduled_event_counts_down_and_fires_once() {
    let mut scheduler = Scheduler::new();
    scheduler.schedule(Tick::new(50), "start");

    assert_eq!(countdown_seconds(Tick::new(50), Tick::new(48), 30), 1);
    assert!(scheduler.drain_due(Tick::new(48)).is_empty());
    assert!(scheduler.drain_due(Tick::new(49)).is_empty());
    assert_eq!(scheduler.drain_due(Tick::new(50)), vec!["start"]);
    assert!(scheduler.drain_due(Tick::new(51)).is_empty());
    assert!(scheduler.is_empty());
}

proptest! {
    #[test]
    fn prop_read_as_of_finds_greatest_earlier_tick(
        ticks in prop::collection::btree_set(0u32..500, 1..40),
        probe in 0u32..600,
    ) {
        let mut ring = CommandRing::with_capacity(64);
        for &tick in &ticks {
            ring.write(Tick::new(tick), tick);
        }
        let expected = ticks.iter().rev().find(|&&t| t <= probe).copied();
        prop_assert_eq!(ring.read_as_of(Tick::new(probe)).map(|e| e.value), expected);
    }

    #[test]
    fn prop_cooldown_queries_do_not_mutate(
        expiries in prop::collection::vec((0u32..300, 0u32..400), 1..20),
        probe in 0u32..400,
        lookback in 0u32..6,
    ) {
        let mut ring = CommandRing::with_capacity(64);
        for (tick, expiry) in expiries {
            let mut targets = CooldownTargets::default();
            targets.set(AbilityKind::SkillShot, Some(Tick::new(expiry)));
            ring.write(Tick::new(tick), targets);
        }
        let before = ring.clone();
        let first = is_on_cooldown(&ring, Tick::new(probe), AbilityKind::SkillShot, lookback);
        let second = is_on_cooldown(&ring, Tick::new(probe), AbilityKind::SkillShot, lookback);
        prop_assert_eq!(first, second);
        prop_assert_eq!(ring, before);
    }
}
