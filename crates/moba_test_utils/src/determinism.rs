//! Determinism testing utilities.
//!
//! Server and client worlds only stay in agreement if every peer reaches the
//! same state from the same inputs, and a client only reconciles cleanly if
//! repeating a tick reproduces it.
//!
//! # Sources of non-determinism
//!
//! - **Floating-point math**: we use fixed-point arithmetic via
//!   [`moba_core::math::Fixed`] throughout.
//! - **Iteration order**: entities are visited in slot order and spatial
//!   results are sorted by distance then handle.
//! - **Parallel scans**: NPC target scans run on rayon but are collected in
//!   entity order before anything is written.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::thread;

use moba_core::simulation::Simulation;

/// Result of a determinism test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeterminismResult {
    /// Whether all runs produced identical results.
    pub is_deterministic: bool,
    /// Hashes from each run.
    pub hashes: Vec<u64>,
    /// Number of ticks simulated.
    pub ticks: u32,
}

impl DeterminismResult {
    /// Get all unique hashes (should be 1 for deterministic simulation).
    #[must_use]
    pub fn unique_hashes(&self) -> Vec<u64> {
        let mut unique: Vec<u64> = self.hashes.clone();
        unique.sort_unstable();
        unique.dedup();
        unique
    }

    /// Assert that the simulation was deterministic, with a detailed error message.
    ///
    /// # Panics
    ///
    /// Panics if the simulation produced different hashes across runs.
    pub fn assert_deterministic(&self) {
        if !self.is_deterministic {
            let unique = self.unique_hashes();
            panic!(
                "Simulation is non-deterministic!\n\
                 Runs: {}\n\
                 Ticks: {}\n\
                 Unique hashes: {} (expected 1)\n\
                 All hashes: {:?}",
                self.hashes.len(),
                self.ticks,
                unique.len(),
                self.hashes
            );
        }
    }
}

/// Run a setup `runs` times, advancing each `ticks` times, and compare the
/// final hashes.
pub fn verify_determinism<S, Setup, Step, HashFn>(
    runs: usize,
    ticks: u32,
    setup: Setup,
    step: Step,
    hash: HashFn,
) -> DeterminismResult
where
    Setup: Fn() -> S,
    Step: Fn(&mut S, u32),
    HashFn: Fn(&S) -> u64,
{
    let mut hashes = Vec::with_capacity(runs);

    for _ in 0..runs {
        let mut state = setup();
        for tick in 0..ticks {
            step(&mut state, tick);
        }
        hashes.push(hash(&state));
    }

    let is_deterministic = hashes.windows(2).all(|w| w[0] == w[1]);
    DeterminismResult {
        is_deterministic,
        hashes,
        ticks,
    }
}

/// Run `num_sims` copies of a server on scoped threads and collect their
/// final hashes.
pub fn run_parallel_simulations<F>(setup_fn: F, num_sims: usize, num_ticks: u32) -> DeterminismResult
where
    F: Fn() -> Simulation + Sync,
{
    let hashes: Vec<u64> = thread::scope(|s| {
        let handles: Vec<_> = (0..num_sims)
            .map(|_| {
                s.spawn(|| {
                    let mut sim = setup_fn();
                    for _ in 0..num_ticks {
                        sim.step();
                    }
                    sim.state_hash()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("simulation thread panicked"))
            .collect()
    });

    DeterminismResult {
        is_deterministic: hashes.windows(2).all(|w| w[0] == w[1]),
        hashes,
        ticks: num_ticks,
    }
}

/// Step two copies of a server side by side and return the first tick whose
/// hashes differ.
pub fn find_first_divergence<F>(setup_fn: F, num_ticks: u32) -> Option<u32>
where
    F: Fn() -> Simulation,
{
    let mut a = setup_fn();
    let mut b = setup_fn();
    if a.state_hash() != b.state_hash() {
        return Some(a.current_tick().get());
    }
    for _ in 0..num_ticks {
        a.step();
        b.step();
        if a.state_hash() != b.state_hash() {
            return Some(a.current_tick().get());
        }
    }
    None
}

/// `true` if saving and loading after `num_ticks` keeps the hash, and both
/// copies still agree `num_ticks` later.
pub fn verify_save_load_determinism<F>(setup_fn: F, num_ticks: u32) -> bool
where
    F: Fn() -> Simulation,
{
    let mut sim = setup_fn();
    for _ in 0..num_ticks {
        sim.step();
    }
    let Ok(bytes) = sim.save_state() else {
        return false;
    };
    let Ok(mut restored) = Simulation::load_state(&bytes) else {
        return false;
    };
    if restored.state_hash() != sim.state_hash() {
        return false;
    }
    for _ in 0..num_ticks {
        sim.step();
        restored.step();
    }
    restored.state_hash() == sim.state_hash()
}

/// Compute a simple hash for any hashable value.
pub fn compute_hash<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Proptest strategies for simulation inputs.
pub mod strategies {
    use moba_core::components::{AbilityInput, InputEvent, PlayerInput};
    use moba_core::math::{Fixed, Vec2Fixed};
    use proptest::prelude::*;

    /// Coordinate inside the arena.
    pub fn arb_coordinate() -> impl Strategy<Value = Fixed> {
        (-60i32..60i32).prop_map(Fixed::from_num)
    }

    /// Position inside the arena.
    pub fn arb_vec2_position() -> impl Strategy<Value = Vec2Fixed> {
        (arb_coordinate(), arb_coordinate()).prop_map(|(x, y)| Vec2Fixed::new(x, y))
    }

    /// Aim direction, possibly zero.
    pub fn arb_aim() -> impl Strategy<Value = Vec2Fixed> {
        (-3i32..=3i32, -3i32..=3i32).prop_map(|(x, y)| Vec2Fixed::from_ints(x, y))
    }

    /// Edge event that fired with probability one in four.
    pub fn arb_event() -> impl Strategy<Value = InputEvent> {
        prop::bool::weighted(0.25).prop_map(|fired| {
            let mut event = InputEvent::default();
            if fired {
                event.set();
            }
            event
        })
    }

    /// Ability button events.
    pub fn arb_ability_input() -> impl Strategy<Value = AbilityInput> {
        (arb_event(), arb_event(), arb_event(), arb_event(), arb_event()).prop_map(
            |(area, skill_shot, confirm_skill_shot, charge, confirm_charge)| AbilityInput {
                area,
                skill_shot,
                confirm_skill_shot,
                charge,
                confirm_charge,
            },
        )
    }

    /// Position within `radius` units of the origin on both axes.
    pub fn arb_vec2_within(radius: i32) -> impl Strategy<Value = Vec2Fixed> {
        (-radius..=radius, -radius..=radius).prop_map(|(x, y)| Vec2Fixed::from_ints(x, y))
    }

    /// Walk-only input toward a point within `radius` of the origin.
    pub fn arb_move_input(radius: i32) -> impl Strategy<Value = PlayerInput> {
        arb_vec2_within(radius).prop_map(|target| PlayerInput {
            move_target: Some(target),
            ..PlayerInput::default()
        })
    }

    /// Full input with ability events and no auto-attack target.
    pub fn arb_player_input() -> impl Strategy<Value = PlayerInput> {
        (
            prop::option::of(arb_vec2_position()),
            arb_aim(),
            arb_ability_input(),
        )
            .prop_map(|(move_target, aim, abilities)| PlayerInput {
                move_target,
                aim,
                attack_target: None,
                abilities,
            })
    }

    /// Per-tick input script.
    pub fn arb_input_script(
        len: usize,
        input: impl Strategy<Value = PlayerInput>,
    ) -> impl Strategy<Value = Vec<PlayerInput>> {
        prop::collection::vec(input, len)
    }
}
