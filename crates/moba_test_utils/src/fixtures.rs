//! Test fixtures and helpers.
//!
//! Pre-built configs and matches for consistent testing.

use fixed::types::I32F32;
use moba_core::config::SimConfig;
use moba_core::match_flow::TeamRequest;
use moba_core::replication::ConnectionId;
use moba_core::simulation::Simulation;

/// Create a fixed-point number from an integer.
#[must_use]
pub fn fixed(n: i32) -> I32F32 {
    I32F32::from_num(n)
}

/// Create a fixed-point number from a float (for tests only).
///
/// Note: In real simulation code, never use floats.
/// This is only for convenient test setup.
#[must_use]
pub fn fixed_f(n: f64) -> I32F32 {
    I32F32::from_num(n)
}

/// Blue player in two-player fixtures.
pub const BLUE: ConnectionId = ConnectionId::new(1);
/// Red player in two-player fixtures.
pub const RED: ConnectionId = ConnectionId::new(2);

/// Blue and red joining their own teams.
#[must_use]
pub fn duel_players() -> [(ConnectionId, TeamRequest); 2] {
    [(BLUE, TeamRequest::Blue), (RED, TeamRequest::Red)]
}

/// One-on-one config: champions spawn five units apart in the middle of the
/// map, the match starts one second after both join and no minions spawn.
#[must_use]
pub fn duel_config() -> SimConfig {
    let mut config = SimConfig::default();
    config.rules.countdown_seconds = 1;
    config.rules.blue_spawn = (0, 0);
    config.rules.red_spawn = (5, 0);
    config.waves.minions_per_wave = 0;
    config
}

/// Server running [`duel_config`] with [`BLUE`] and [`RED`] joined, stepped
/// until the match is playing.
///
/// # Panics
///
/// Panics if the fixture config is invalid or the match never starts.
#[must_use]
pub fn started_duel() -> Simulation {
    let mut server = Simulation::server(duel_config()).expect("duel config is valid");
    server.join(BLUE, TeamRequest::Blue).expect("blue joins");
    server.join(RED, TeamRequest::Red).expect("red joins");
    for _ in 0..120 {
        if server.world().match_state.is_playing() {
            return server;
        }
        server.step();
    }
    panic!("duel never started");
}

/// Server running the default config with a full lane of minion waves and
/// two players, stepped `ticks` ticks.
///
/// # Panics
///
/// Panics if the default config is invalid.
#[must_use]
pub fn lane_match(ticks: u32) -> Simulation {
    let mut config = SimConfig::default();
    config.rules.countdown_seconds = 0;
    let mut server = Simulation::server(config).expect("default config is valid");
    server.join(BLUE, TeamRequest::AutoAssign).expect("first join");
    server.join(RED, TeamRequest::AutoAssign).expect("second join");
    for _ in 0..ticks {
        server.step();
    }
    server
}
