//! Scenario execution over an in-process link.
//!
//! A run joins every scenario player to a server, pairs each with a
//! predicting client, and drives them through the scenario's script. The
//! summary it produces is what the CLI prints as JSON.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use moba_core::ability::AbilityKind;
use moba_core::error::SimError;
use moba_core::match_flow::MatchPhase;
use moba_core::replay::{Replay, ReplayPlayer};
use moba_core::simulation::{SimEvent, Simulation};
use moba_test_utils::determinism::compute_hash;
use moba_test_utils::netsim::{LinkedClient, LinkedMatch};
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::scenario::{Scenario, ScenarioError};

/// Errors from running scenarios and replays.
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Scenario could not be loaded.
    #[error(transparent)]
    Scenario(#[from] ScenarioError),
    /// Simulation rejected an operation.
    #[error("simulation error: {0}")]
    Sim(#[from] SimError),
    /// Writing output failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Report could not be encoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Counts of what happened on one side of the link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventTally {
    /// Entities inserted.
    pub spawned: usize,
    /// Destructions resolved.
    pub destroyed: usize,
    /// Damage events.
    pub hits: usize,
    /// Sum of all damage.
    pub total_damage: i64,
    /// Committed casts per ability.
    pub commits: BTreeMap<AbilityKind, usize>,
    /// Champions that respawned.
    pub respawns: usize,
}

impl EventTally {
    /// Count `events`.
    #[must_use]
    pub fn from_events(events: &[SimEvent]) -> Self {
        let mut tally = Self::default();
        for event in events {
            match event {
                SimEvent::Spawned { .. } => tally.spawned += 1,
                SimEvent::Destroyed { .. } => tally.destroyed += 1,
                SimEvent::Damaged { amount, .. } => {
                    tally.hits += 1;
                    tally.total_damage += i64::from(*amount);
                }
                SimEvent::AbilityCommitted { kind, .. } => {
                    *tally.commits.entry(*kind).or_default() += 1;
                }
                SimEvent::Respawned { .. } => tally.respawns += 1,
                SimEvent::Removed { .. } | SimEvent::MatchStarted { .. } | SimEvent::GameOver { .. } => {}
            }
        }
        tally
    }
}

/// Per-client summary.
#[derive(Debug, Clone, Serialize)]
pub struct ClientReport {
    /// Connection id.
    pub connection: u32,
    /// Team the server placed the player on.
    pub team: Option<String>,
    /// Client tick at the end of the run.
    pub tick: u32,
    /// Client state hash.
    pub state_hash: u64,
    /// Snapshots applied.
    pub snapshots_applied: usize,
    /// Entity overlays across all snapshots.
    pub overlaid: usize,
    /// Ghosts created.
    pub created: usize,
    /// Predicted spawns unified with their ghost.
    pub matched: usize,
    /// Predicted spawns dropped unconfirmed.
    pub dropped: usize,
    /// Removals confirmed.
    pub removed: usize,
    /// Predicted destructions reverted.
    pub reverted: usize,
    /// Events from predicted ticks, resimulations excluded.
    pub predicted: EventTally,
}

impl ClientReport {
    fn new(client: &LinkedClient, server: &Simulation) -> Self {
        let reports = &client.reports;
        let sum = |field: fn(&moba_core::replication::ReconcileReport) -> usize| -> usize {
            reports.iter().map(field).sum()
        };
        Self {
            connection: client.connection.get(),
            team: server
                .world()
                .match_state
                .player(client.connection)
                .map(|slot| slot.team.to_string()),
            tick: client.sim.current_tick().get(),
            state_hash: client.sim.state_hash(),
            snapshots_applied: reports.len(),
            overlaid: sum(|r| r.overlaid.len()),
            created: sum(|r| r.created),
            matched: sum(|r| r.matched),
            dropped: sum(|r| r.dropped),
            removed: sum(|r| r.removed),
            reverted: sum(|r| r.reverted),
            predicted: EventTally::from_events(&client.events),
        }
    }
}

/// Summary of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Scenario name.
    pub scenario: String,
    /// One-way link delay.
    pub latency: u32,
    /// Host steps taken.
    pub host_steps: u64,
    /// Server tick at the end of the run.
    pub server_tick: u32,
    /// Match phase at the end of the run.
    pub phase: String,
    /// Winning team, if the match ended.
    pub winner: Option<String>,
    /// Server state hash.
    pub state_hash: u64,
    /// Authoritative events.
    pub server: EventTally,
    /// One entry per client, in join order.
    pub clients: Vec<ClientReport>,
    /// Wall-clock run time.
    pub duration_ms: u64,
}

impl RunReport {
    fn new(scenario: &Scenario, linked: &LinkedMatch, started: Instant) -> Self {
        let state = &linked.server.world().match_state;
        let phase = match state.phase {
            MatchPhase::WaitingForPlayers => "waiting",
            MatchPhase::Countdown { .. } => "countdown",
            MatchPhase::Playing { .. } => "playing",
            MatchPhase::Over { .. } => "over",
        };
        Self {
            scenario: scenario.name.clone(),
            latency: scenario.latency,
            host_steps: linked.steps(),
            server_tick: linked.server.current_tick().get(),
            phase: phase.to_string(),
            winner: state.winner().map(|team| team.to_string()),
            state_hash: linked.server.state_hash(),
            server: EventTally::from_events(&linked.server_events),
            clients: linked
                .clients
                .iter()
                .map(|client| ClientReport::new(client, &linked.server))
                .collect(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Hash over the server and every client.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let clients: Vec<u64> = self.clients.iter().map(|c| c.state_hash).collect();
        compute_hash(&(self.state_hash, clients))
    }
}

/// A finished run and its recording, if one was asked for.
#[derive(Debug)]
pub struct RunOutcome {
    /// Summary.
    pub report: RunReport,
    /// Server-side recording.
    pub replay: Option<Replay>,
}

/// Run `scenario` to its last tick.
pub fn run_scenario(scenario: &Scenario, record: bool) -> Result<RunOutcome, RunnerError> {
    let started = Instant::now();
    let config = scenario.config()?;
    let mut linked = LinkedMatch::new(config, &scenario.roster(), scenario.latency)?;
    if record {
        linked.start_recording(&scenario.name, scenario.checkpoint_interval)?;
    }

    info!(
        scenario = %scenario.name,
        ticks = scenario.ticks,
        latency = scenario.latency,
        players = scenario.players.len(),
        "Running scenario"
    );
    linked.run(scenario.ticks, |connection, tick, sim| {
        scenario.input_for(connection, tick, sim)
    })?;

    let replay = linked.finish_recording();
    let report = RunReport::new(scenario, &linked, started);
    debug!(
        server_tick = report.server_tick,
        state_hash = report.state_hash,
        phase = %report.phase,
        "Scenario finished"
    );
    Ok(RunOutcome { report, replay })
}

/// Result of running one scenario several times.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    /// Scenario name.
    pub scenario: String,
    /// Runs compared.
    pub runs: usize,
    /// Fingerprint of each run.
    pub fingerprints: Vec<u64>,
    /// `true` if every run agreed.
    pub deterministic: bool,
}

/// Run `scenario` `runs` times in parallel and compare the outcomes.
pub fn verify_scenario(scenario: &Scenario, runs: usize) -> Result<VerifyReport, RunnerError> {
    let fingerprints = (0..runs.max(1))
        .into_par_iter()
        .map(|_| run_scenario(scenario, false).map(|outcome| outcome.report.fingerprint()))
        .collect::<Result<Vec<u64>, RunnerError>>()?;

    let deterministic = fingerprints.windows(2).all(|w| w[0] == w[1]);
    if !deterministic {
        warn!(scenario = %scenario.name, ?fingerprints, "Runs disagree");
    }
    Ok(VerifyReport {
        scenario: scenario.name.clone(),
        runs: fingerprints.len(),
        fingerprints,
        deterministic,
    })
}

/// Summary of a replay played back.
#[derive(Debug, Clone, Serialize)]
pub struct ReplaySummary {
    /// Scenario the replay was recorded from.
    pub scenario: String,
    /// Recorded actions.
    pub entries: usize,
    /// Hash checkpoints.
    pub checkpoints: usize,
    /// Last recorded tick.
    pub final_tick: u32,
    /// Hash at the last tick.
    pub final_hash: u64,
    /// Whether playback matched every checkpoint. `None` if not checked.
    pub verified: Option<bool>,
}

/// Load a replay, optionally playing it back against its checkpoints.
pub fn inspect_replay<P: AsRef<Path>>(path: P, verify: bool) -> Result<ReplaySummary, RunnerError> {
    let replay = Replay::load(path)?;
    let mut summary = ReplaySummary {
        scenario: replay.scenario_id.clone(),
        entries: replay.entries.len(),
        checkpoints: replay.checkpoints.len(),
        final_tick: replay.final_tick.get(),
        final_hash: replay.final_hash,
        verified: None,
    };
    if verify {
        let outcome = ReplayPlayer::new(replay)?.verify();
        if let Err(err) = &outcome {
            warn!(%err, "Replay diverged");
        }
        summary.verified = Some(outcome.is_ok());
    }
    Ok(summary)
}

/// Write `value` as pretty JSON.
pub fn save_json<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> Result<(), RunnerError> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path.as_ref(), json)?;
    info!(path = %path.as_ref().display(), "Saved report");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{Action, ScriptedAction};
    use moba_core::components::EntityKind;
    use moba_core::world::{Entity, World, WorldRole};

    fn short_duel() -> Scenario {
        let mut scenario = Scenario::duel();
        scenario.ticks = 120;
        scenario
    }

    #[test]
    fn test_tally_counts_events() {
        let mut world = World::new(WorldRole::Server);
        let handle = world.spawn(Entity::new(EntityKind::Minion));
        let tick = moba_core::tick::Tick::new(3);
        let events = [
            SimEvent::Damaged { entity: handle, amount: 20, remaining: 480, tick },
            SimEvent::Damaged { entity: handle, amount: 5, remaining: 475, tick },
            SimEvent::AbilityCommitted { caster: handle, kind: AbilityKind::Area, tick },
            SimEvent::MatchStarted { tick },
        ];
        let tally = EventTally::from_events(&events);
        assert_eq!(tally.hits, 2);
        assert_eq!(tally.total_damage, 25);
        assert_eq!(tally.commits.get(&AbilityKind::Area), Some(&1));
        assert_eq!(tally.spawned, 0);
    }

    #[test]
    fn test_run_reports_every_client() {
        let outcome = run_scenario(&short_duel(), false).unwrap();
        let report = outcome.report;
        assert!(outcome.replay.is_none());
        assert_eq!(report.host_steps, 120);
        assert_eq!(report.clients.len(), 2);
        assert_eq!(report.clients[0].team.as_deref(), Some("blue"));
        assert_eq!(report.clients[1].team.as_deref(), Some("red"));
        for client in &report.clients {
            assert_eq!(client.tick, report.server_tick + report.latency + 1);
            assert!(client.snapshots_applied > 0);
        }
        assert_eq!(report.phase, "playing");
    }

    #[test]
    fn test_recorded_run_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("duel.replay");
        let outcome = run_scenario(&short_duel(), true).unwrap();
        let replay = outcome.replay.unwrap();
        assert_eq!(replay.final_hash, outcome.report.state_hash);
        replay.save(&path).unwrap();

        let summary = inspect_replay(&path, true).unwrap();
        assert_eq!(summary.scenario, "duel");
        assert_eq!(summary.verified, Some(true));
        assert!(summary.entries > 0);
    }

    #[test]
    fn test_verify_agrees_across_runs() {
        let mut scenario = short_duel();
        scenario.players[0]
            .script
            .push(ScriptedAction { at: 10, action: Action::MoveTo((4, 4)) });
        let report = verify_scenario(&scenario, 3).unwrap();
        assert_eq!(report.runs, 3);
        assert!(report.deterministic);
    }

    #[test]
    fn test_save_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let report = run_scenario(&short_duel(), false).unwrap().report;
        save_json(&report, &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["scenario"], "duel");
        assert_eq!(value["clients"].as_array().map(Vec::len), Some(2));
    }
}
