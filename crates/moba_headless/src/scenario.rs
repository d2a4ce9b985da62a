//! Scenario loading and configuration.
//!
//! A scenario names the players, how long to run, the link latency, and a
//! script of actions per player. Tuning comes from the default config, an
//! optional config RON file, and a few inline overrides, in that order.

use std::path::{Path, PathBuf};

use moba_core::components::{EntityKind, InputEvent, PlayerInput};
use moba_core::config::{GridPoint, SimConfig};
use moba_core::error::SimError;
use moba_core::match_flow::TeamRequest;
use moba_core::math::Vec2Fixed;
use moba_core::replication::{ConnectionId, GhostId};
use moba_core::simulation::Simulation;
use moba_core::tick::Tick;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for scenario operations.
#[derive(Error, Debug)]
pub enum ScenarioError {
    /// File not found.
    #[error("Scenario file not found: {0}")]
    FileNotFound(String),
    /// Failed to read file.
    #[error("Failed to read scenario file: {0}")]
    ReadError(#[from] std::io::Error),
    /// Failed to parse RON.
    #[error("Failed to parse scenario: {0}")]
    ParseError(#[from] ron::error::SpannedError),
    /// Referenced config failed to load or validate.
    #[error("Scenario config rejected: {0}")]
    Config(#[from] SimError),
    /// Scenario is self-inconsistent.
    #[error("Invalid scenario: {0}")]
    Invalid(String),
}

/// A complete scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Host steps to run.
    pub ticks: u32,
    /// One-way link delay in host steps.
    #[serde(default)]
    pub latency: u32,
    /// Config RON file, relative to the scenario file.
    #[serde(default)]
    pub config_file: Option<String>,
    /// Inline tuning changes applied last.
    #[serde(default)]
    pub overrides: ConfigOverrides,
    /// Players in join order.
    pub players: Vec<PlayerSetup>,
    /// Server ticks between replay hash checkpoints.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

fn default_checkpoint_interval() -> u32 {
    30
}

/// Inline tuning overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverrides {
    /// Countdown before the match starts.
    #[serde(default)]
    pub countdown_seconds: Option<u32>,
    /// Players needed to start the countdown.
    #[serde(default)]
    pub min_players_to_start: Option<u32>,
    /// Minions per lane per wave.
    #[serde(default)]
    pub minions_per_wave: Option<u32>,
    /// Blue spawn point.
    #[serde(default)]
    pub blue_spawn: Option<GridPoint>,
    /// Red spawn point.
    #[serde(default)]
    pub red_spawn: Option<GridPoint>,
}

impl ConfigOverrides {
    fn apply(&self, config: &mut SimConfig) {
        if let Some(seconds) = self.countdown_seconds {
            config.rules.countdown_seconds = seconds;
        }
        if let Some(players) = self.min_players_to_start {
            config.rules.min_players_to_start = players;
        }
        if let Some(count) = self.minions_per_wave {
            config.waves.minions_per_wave = count;
        }
        if let Some(spawn) = self.blue_spawn {
            config.rules.blue_spawn = spawn;
        }
        if let Some(spawn) = self.red_spawn {
            config.rules.red_spawn = spawn;
        }
    }
}

/// One player and their script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSetup {
    /// Connection id.
    pub connection: u32,
    /// Team asked for on join.
    pub team: TeamRequest,
    /// Actions keyed by the tick the client predicts them for.
    #[serde(default)]
    pub script: Vec<ScriptedAction>,
}

/// An action starting at a client tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptedAction {
    /// Client tick the action starts on.
    pub at: u32,
    /// What to do.
    pub action: Action,
}

/// Player actions a script can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Walk to a grid point.
    MoveTo(GridPoint),
    /// Auto-attack the closest enemy champion for `ticks` ticks.
    AttackNearest {
        /// Ticks to keep the target.
        ticks: u32,
    },
    /// Press the area ability.
    Area,
    /// Press the skill-shot and confirm it next tick toward `aim`.
    SkillShot {
        /// Aim direction.
        aim: GridPoint,
    },
    /// Press the charge and confirm it next tick toward `aim`.
    Charge {
        /// Aim direction.
        aim: GridPoint,
    },
}

impl Scenario {
    /// Load a scenario from a RON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ScenarioError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ScenarioError::FileNotFound(path.display().to_string()));
        }
        let contents = std::fs::read_to_string(path)?;
        let mut scenario = Self::from_ron_str(&contents)?;
        scenario.base_dir = path.parent().map(Path::to_path_buf);
        Ok(scenario)
    }

    /// Load from a RON string (useful for embedded scenarios).
    pub fn from_ron_str(ron: &str) -> Result<Self, ScenarioError> {
        let scenario: Scenario = ron::from_str(ron)?;
        scenario.check()?;
        Ok(scenario)
    }

    /// Standard one-on-one duel: champions a few units apart, no minions.
    #[must_use]
    pub fn duel() -> Self {
        Self {
            name: "duel".to_string(),
            description: "Two champions trading auto-attacks and abilities".to_string(),
            ticks: 300,
            latency: 3,
            config_file: None,
            overrides: ConfigOverrides {
                countdown_seconds: Some(1),
                min_players_to_start: None,
                minions_per_wave: Some(0),
                blue_spawn: Some((0, 0)),
                red_spawn: Some((6, 0)),
            },
            players: vec![
                PlayerSetup {
                    connection: 1,
                    team: TeamRequest::Blue,
                    script: vec![
                        ScriptedAction { at: 40, action: Action::AttackNearest { ticks: 10 } },
                        ScriptedAction { at: 80, action: Action::SkillShot { aim: (1, 0) } },
                        ScriptedAction { at: 120, action: Action::MoveTo((3, 4)) },
                        ScriptedAction { at: 160, action: Action::Area },
                    ],
                },
                PlayerSetup {
                    connection: 2,
                    team: TeamRequest::Red,
                    script: vec![
                        ScriptedAction { at: 60, action: Action::Charge { aim: (-1, 0) } },
                        ScriptedAction { at: 140, action: Action::MoveTo((8, 6)) },
                    ],
                },
            ],
            checkpoint_interval: default_checkpoint_interval(),
            base_dir: None,
        }
    }

    /// Resolve the tuning: defaults, then the config file, then overrides.
    pub fn config(&self) -> Result<SimConfig, ScenarioError> {
        let mut config = match &self.config_file {
            Some(file) => {
                let path = match &self.base_dir {
                    Some(dir) => dir.join(file),
                    None => PathBuf::from(file),
                };
                SimConfig::load(path)?
            }
            None => SimConfig::default(),
        };
        self.overrides.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// `(connection, team)` for every player, in join order.
    #[must_use]
    pub fn roster(&self) -> Vec<(ConnectionId, TeamRequest)> {
        self.players
            .iter()
            .map(|player| (ConnectionId::new(player.connection), player.team))
            .collect()
    }

    /// Input `connection` sends for `tick`, given its client's world.
    #[must_use]
    pub fn input_for(&self, connection: ConnectionId, tick: Tick, client: &Simulation) -> PlayerInput {
        let mut input = PlayerInput::default();
        let Some(player) = self.players.iter().find(|p| p.connection == connection.get()) else {
            return input;
        };
        let now = tick.get();
        for scripted in &player.script {
            let Some(offset) = now.checked_sub(scripted.at) else {
                continue;
            };
            match scripted.action {
                Action::MoveTo(point) if offset == 0 => {
                    input.move_target = Some(Vec2Fixed::from_ints(point.0, point.1));
                }
                Action::AttackNearest { ticks } if offset < ticks => {
                    input.attack_target = nearest_enemy_champion(client);
                }
                Action::Area if offset == 0 => input.abilities.area = InputEvent::fired(),
                Action::SkillShot { aim } => match offset {
                    0 => input.abilities.skill_shot = InputEvent::fired(),
                    1 => {
                        input.aim = Vec2Fixed::from_ints(aim.0, aim.1);
                        input.abilities.confirm_skill_shot = InputEvent::fired();
                    }
                    _ => {}
                },
                Action::Charge { aim } => match offset {
                    0 => input.abilities.charge = InputEvent::fired(),
                    1 => {
                        input.aim = Vec2Fixed::from_ints(aim.0, aim.1);
                        input.abilities.confirm_charge = InputEvent::fired();
                    }
                    _ => {}
                },
                _ => {}
            }
        }
        input
    }

    fn check(&self) -> Result<(), ScenarioError> {
        if self.players.is_empty() {
            return Err(ScenarioError::Invalid("scenario has no players".into()));
        }
        let mut ids: Vec<u32> = self.players.iter().map(|p| p.connection).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.players.len() {
            return Err(ScenarioError::Invalid("duplicate connection id".into()));
        }
        Ok(())
    }
}

impl Default for Scenario {
    fn default() -> Self {
        Self::duel()
    }
}

fn nearest_enemy_champion(client: &Simulation) -> Option<GhostId> {
    let me = client.world().entities.get(client.local_champion()?)?;
    let (team, position) = (me.team?, me.position()?);
    client
        .world()
        .entities
        .iter()
        .filter(|e| e.is_active() && e.team == Some(team.opponent()))
        .filter(|e| e.kind == EntityKind::Champion)
        .filter_map(|e| Some((e.position()?.distance_squared(position), e.ghost?)))
        .min_by_key(|&(distance, ghost)| (distance, ghost))
        .map(|(_, ghost)| ghost)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scenario() {
        let scenario = Scenario::default();
        assert_eq!(scenario.players.len(), 2);
        assert_eq!(scenario.roster()[0], (ConnectionId::new(1), TeamRequest::Blue));
        let config = scenario.config().unwrap();
        assert_eq!(config.rules.countdown_seconds, 1);
        assert_eq!(config.waves.minions_per_wave, 0);
    }

    #[test]
    fn test_parse_from_ron() {
        let ron = r#"
            Scenario(
                name: "Test",
                ticks: 90,
                latency: 2,
                overrides: ConfigOverrides(countdown_seconds: Some(0)),
                players: [
                    PlayerSetup(
                        connection: 7,
                        team: AutoAssign,
                        script: [ScriptedAction(at: 5, action: MoveTo((2, 3)))],
                    ),
                ],
            )
        "#;
        let scenario = Scenario::from_ron_str(ron).unwrap();
        assert_eq!(scenario.name, "Test");
        assert_eq!(scenario.checkpoint_interval, 30);
        assert_eq!(scenario.config().unwrap().rules.countdown_seconds, 0);
        assert_eq!(scenario.players[0].script[0].action, Action::MoveTo((2, 3)));
    }

    #[test]
    fn test_rejects_duplicate_connections() {
        let ron = r#"
            Scenario(
                name: "dup",
                ticks: 10,
                players: [
                    PlayerSetup(connection: 1, team: Blue),
                    PlayerSetup(connection: 1, team: Red),
                ],
            )
        "#;
        assert!(matches!(Scenario::from_ron_str(ron), Err(ScenarioError::Invalid(_))));
    }

    #[test]
    fn test_script_expands_two_step_casts() {
        let scenario = Scenario::duel();
        let client = Simulation::client(scenario.config().unwrap(), ConnectionId::new(1), Tick::ZERO).unwrap();
        let blue = ConnectionId::new(1);

        let press = scenario.input_for(blue, Tick::new(80), &client);
        assert!(press.abilities.skill_shot.is_set());
        let confirm = scenario.input_for(blue, Tick::new(81), &client);
        assert!(confirm.abilities.confirm_skill_shot.is_set());
        assert_eq!(confirm.aim, Vec2Fixed::from_ints(1, 0));
        assert_eq!(scenario.input_for(blue, Tick::new(82), &client), PlayerInput::default());

        let walk = scenario.input_for(blue, Tick::new(120), &client);
        assert_eq!(walk.move_target, Some(Vec2Fixed::from_ints(3, 4)));
    }

    #[test]
    fn test_bundled_scenarios_parse() {
        let duel = Scenario::from_ron_str(include_str!("../scenarios/duel.ron")).unwrap();
        assert_eq!(duel.players[0].script, Scenario::duel().players[0].script);
        let push = Scenario::from_ron_str(include_str!("../scenarios/lane_push.ron")).unwrap();
        assert_eq!(push.roster()[1].1, TeamRequest::AutoAssign);
        assert!(push.config().unwrap().waves.minions_per_wave > 0);
    }

    #[test]
    fn test_config_file_is_relative_to_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let mut tuning = SimConfig::default();
        tuning.champion.auto_attack_damage = 35;
        std::fs::write(dir.path().join("tuning.ron"), tuning.to_ron_string().unwrap()).unwrap();
        std::fs::write(
            dir.path().join("custom.ron"),
            r#"Scenario(
                name: "custom",
                ticks: 10,
                config_file: Some("tuning.ron"),
                overrides: ConfigOverrides(countdown_seconds: Some(2)),
                players: [PlayerSetup(connection: 1, team: Blue)],
            )"#,
        )
        .unwrap();

        let scenario = Scenario::load(dir.path().join("custom.ron")).unwrap();
        let config = scenario.config().unwrap();
        assert_eq!(config.champion.auto_attack_damage, 35);
        assert_eq!(config.rules.countdown_seconds, 2);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Scenario::load("does/not/exist.ron"),
            Err(ScenarioError::FileNotFound(_))
        ));
    }
}
