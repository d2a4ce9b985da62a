//! Simulation configuration.
//!
//! One [`SimConfig`] is shared by the server world and every client world of a
//! match; both sides must load the same values or prediction will diverge.
//! Configs are authored in RON. Decimal tuning values are converted to
//! fixed-point once at load time.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::components::Team;
use crate::error::{Result, SimError};
use crate::math::{fixed_decimal_serde, Fixed, Vec2Fixed};
use crate::tick::Tick;

/// Integer ground-plane point as written in config files.
pub type GridPoint = (i32, i32);

/// Convert a config point into a simulation position.
#[must_use]
pub fn grid_to_vec(point: GridPoint) -> Vec2Fixed {
    Vec2Fixed::from_ints(point.0, point.1)
}

/// Top-level simulation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Simulation ticks per second.
    pub tick_rate: u32,
    /// Entries retained in every per-entity history ring.
    pub history_capacity: usize,
    /// Longest span a client may resimulate after a correction.
    pub max_resimulation_ticks: u32,
    /// Upper bound on ticks simulated in one batched pass. Also caps the
    /// cooldown look-back window.
    pub max_batch_size: u32,
    /// Team sizes, countdowns and spawn points.
    pub rules: MatchRules,
    /// Champion ability tuning.
    pub abilities: AbilityTuning,
    /// Champion stats and auto-attack tuning.
    pub champion: ChampionTuning,
    /// Minion stats.
    pub minion: NpcTuning,
    /// Tower stats.
    pub tower: NpcTuning,
    /// Minion wave timing and lanes.
    pub waves: WaveTuning,
    /// Static structures placed when the arena is built.
    pub structures: Vec<StructureLayout>,
}

/// Match admission, countdown and respawn rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchRules {
    /// Champions allowed per team.
    pub max_players_per_team: u32,
    /// Players needed before the start countdown begins.
    pub min_players_to_start: u32,
    /// Countdown length once enough players joined.
    pub countdown_seconds: u32,
    /// Delay between a champion's destruction and its respawn.
    pub respawn_seconds: u32,
    /// Blue team spawn point.
    pub blue_spawn: GridPoint,
    /// Red team spawn point.
    pub red_spawn: GridPoint,
    /// Per-slot offsets added to the team spawn point.
    pub spawn_offsets: Vec<GridPoint>,
}

/// Tuning for the three champion abilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbilityTuning {
    /// Area ability cooldown.
    #[serde(with = "fixed_decimal_serde")]
    pub area_cooldown_seconds: Fixed,
    /// Area ability damage per target.
    pub area_damage: i32,
    /// Area ability radius.
    #[serde(with = "fixed_decimal_serde")]
    pub area_radius: Fixed,
    /// Area effect lifetime.
    #[serde(with = "fixed_decimal_serde")]
    pub area_lifetime_seconds: Fixed,

    /// Skill-shot cooldown.
    #[serde(with = "fixed_decimal_serde")]
    pub skill_shot_cooldown_seconds: Fixed,
    /// Skill-shot damage.
    pub skill_shot_damage: i32,
    /// Skill-shot travel speed, units per second.
    #[serde(with = "fixed_decimal_serde")]
    pub skill_shot_speed: Fixed,
    /// Skill-shot hit radius.
    #[serde(with = "fixed_decimal_serde")]
    pub skill_shot_radius: Fixed,
    /// Skill-shot lifetime.
    #[serde(with = "fixed_decimal_serde")]
    pub skill_shot_lifetime_seconds: Fixed,

    /// Charge cooldown.
    #[serde(with = "fixed_decimal_serde")]
    pub charge_cooldown_seconds: Fixed,
    /// Charge contact damage.
    pub charge_damage: i32,
    /// Charge contact radius.
    #[serde(with = "fixed_decimal_serde")]
    pub charge_radius: Fixed,
}

/// Champion stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChampionTuning {
    /// Maximum hit points.
    pub hit_points: i32,
    /// Walking speed, units per second.
    #[serde(with = "fixed_decimal_serde")]
    pub move_speed: Fixed,
    /// Dash speed, units per second.
    #[serde(with = "fixed_decimal_serde")]
    pub dash_speed: Fixed,
    /// Distance covered by one dash.
    #[serde(with = "fixed_decimal_serde")]
    pub dash_distance: Fixed,
    /// Maximum distance to an auto-attack target.
    #[serde(with = "fixed_decimal_serde")]
    pub auto_attack_range: Fixed,
    /// Auto-attack cooldown.
    #[serde(with = "fixed_decimal_serde")]
    pub auto_attack_cooldown_seconds: Fixed,
    /// Auto-attack damage.
    pub auto_attack_damage: i32,
    /// Auto-attack projectile speed, units per second.
    #[serde(with = "fixed_decimal_serde")]
    pub auto_attack_speed: Fixed,
    /// Distance in front of the champion the projectile spawns at.
    #[serde(with = "fixed_decimal_serde")]
    pub fire_point_offset: Fixed,
    /// Collision radius for hits and spatial queries.
    #[serde(with = "fixed_decimal_serde")]
    pub body_radius: Fixed,
}

/// Stats shared by autonomous attackers (minions and towers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NpcTuning {
    /// Maximum hit points.
    pub hit_points: i32,
    /// Target acquisition radius.
    #[serde(with = "fixed_decimal_serde")]
    pub target_radius: Fixed,
    /// Time between attacks.
    #[serde(with = "fixed_decimal_serde")]
    pub attack_cooldown_seconds: Fixed,
    /// Damage per attack.
    pub attack_damage: i32,
    /// Attack projectile speed, units per second.
    #[serde(with = "fixed_decimal_serde")]
    pub projectile_speed: Fixed,
    /// Offset from the attacker's position where projectiles spawn.
    pub fire_point_offset: GridPoint,
    /// Collision radius for hits and spatial queries.
    #[serde(with = "fixed_decimal_serde")]
    pub body_radius: Fixed,
}

/// Minion wave timing and lane layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveTuning {
    /// Time between the end of one wave and the next.
    pub wave_interval_seconds: u32,
    /// Minions per lane per team in each wave.
    pub minions_per_wave: u32,
    /// Ticks between consecutive minions of a wave.
    pub minion_spacing_ticks: u32,
    /// Minion walking speed, units per second.
    #[serde(with = "fixed_decimal_serde")]
    pub minion_move_speed: Fixed,
    /// Distance at which a waypoint counts as reached.
    #[serde(with = "fixed_decimal_serde")]
    pub waypoint_reach_radius: Fixed,
    /// Lane waypoints, blue base to red base. Red minions walk them reversed.
    pub lanes: Vec<Vec<GridPoint>>,
}

/// A structure placed at arena setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureLayout {
    /// Owning team.
    pub team: Team,
    /// Position on the ground plane.
    pub position: GridPoint,
    /// Destroying this structure ends the match.
    pub ends_match: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tick_rate: 30,
            history_capacity: 64,
            max_resimulation_ticks: 32,
            max_batch_size: 4,
            rules: MatchRules::default(),
            abilities: AbilityTuning::default(),
            champion: ChampionTuning::default(),
            minion: NpcTuning::minion(),
            tower: NpcTuning::tower(),
            waves: WaveTuning::default(),
            structures: vec![
                StructureLayout {
                    team: Team::Blue,
                    position: (-40, -40),
                    ends_match: false,
                },
                StructureLayout {
                    team: Team::Blue,
                    position: (-55, -55),
                    ends_match: true,
                },
                StructureLayout {
                    team: Team::Red,
                    position: (40, 40),
                    ends_match: false,
                },
                StructureLayout {
                    team: Team::Red,
                    position: (55, 55),
                    ends_match: true,
                },
            ],
        }
    }
}

impl Default for MatchRules {
    fn default() -> Self {
        Self {
            max_players_per_team: 3,
            min_players_to_start: 2,
            countdown_seconds: 5,
            respawn_seconds: 5,
            blue_spawn: (-50, -50),
            red_spawn: (50, 50),
            spawn_offsets: vec![(0, 0), (3, 0), (0, 3)],
        }
    }
}

impl Default for AbilityTuning {
    fn default() -> Self {
        Self {
            area_cooldown_seconds: Fixed::from_num(3),
            area_damage: 40,
            area_radius: Fixed::from_num(4),
            area_lifetime_seconds: Fixed::from_num(1) / Fixed::from_num(2),
            skill_shot_cooldown_seconds: Fixed::from_num(4),
            skill_shot_damage: 60,
            skill_shot_speed: Fixed::from_num(20),
            skill_shot_radius: Fixed::from_num(1),
            skill_shot_lifetime_seconds: Fixed::from_num(2),
            charge_cooldown_seconds: Fixed::from_num(6),
            charge_damage: 30,
            charge_radius: Fixed::from_num(2),
        }
    }
}

impl Default for ChampionTuning {
    fn default() -> Self {
        Self {
            hit_points: 500,
            move_speed: Fixed::from_num(6),
            dash_speed: Fixed::from_num(24),
            dash_distance: Fixed::from_num(8),
            auto_attack_range: Fixed::from_num(8),
            auto_attack_cooldown_seconds: Fixed::from_num(1),
            auto_attack_damage: 20,
            auto_attack_speed: Fixed::from_num(18),
            fire_point_offset: Fixed::from_num(1),
            body_radius: Fixed::from_num(1),
        }
    }
}

impl NpcTuning {
    /// Default minion stats.
    #[must_use]
    pub fn minion() -> Self {
        Self {
            hit_points: 120,
            target_radius: Fixed::from_num(6),
            attack_cooldown_seconds: Fixed::from_num(1),
            attack_damage: 8,
            projectile_speed: Fixed::from_num(15),
            fire_point_offset: (0, 0),
            body_radius: Fixed::from_num(1) / Fixed::from_num(2),
        }
    }

    /// Default tower stats.
    #[must_use]
    pub fn tower() -> Self {
        Self {
            hit_points: 1500,
            target_radius: Fixed::from_num(10),
            attack_cooldown_seconds: Fixed::from_num(2),
            attack_damage: 50,
            projectile_speed: Fixed::from_num(20),
            fire_point_offset: (0, 1),
            body_radius: Fixed::from_num(2),
        }
    }
}

impl Default for NpcTuning {
    fn default() -> Self {
        Self::minion()
    }
}

impl Default for WaveTuning {
    fn default() -> Self {
        Self {
            wave_interval_seconds: 30,
            minions_per_wave: 3,
            minion_spacing_ticks: 15,
            minion_move_speed: Fixed::from_num(4),
            waypoint_reach_radius: Fixed::from_num(3) / Fixed::from_num(2),
            lanes: vec![
                vec![(-50, -45), (-50, 50), (45, 50)],
                vec![(-45, -45), (45, 45)],
                vec![(-45, -50), (50, -50), (50, 45)],
            ],
        }
    }
}

impl SimConfig {
    /// Load a config from a RON file and validate it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config: Self = ron::from_str(&contents).map_err(|e| SimError::ConfigParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a config from a RON string.
    pub fn from_ron_str(source: &str) -> Result<Self> {
        let config: Self = ron::from_str(source).map_err(|e| SimError::ConfigParse {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty RON.
    pub fn to_ron_string(&self) -> Result<String> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| SimError::Serialization(e.to_string()))
    }

    /// Reject settings the simulation cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.tick_rate == 0 {
            return Err(SimError::InvalidConfig("tick_rate must be positive".into()));
        }
        if self.max_batch_size == 0 {
            return Err(SimError::InvalidConfig(
                "max_batch_size must be positive".into(),
            ));
        }
        let window = self.max_resimulation_ticks.max(self.max_batch_size) as usize;
        if self.history_capacity <= window {
            return Err(SimError::InvalidConfig(format!(
                "history_capacity ({}) must exceed the resimulation window ({window})",
                self.history_capacity
            )));
        }
        if self.rules.max_players_per_team == 0 {
            return Err(SimError::InvalidConfig(
                "max_players_per_team must be positive".into(),
            ));
        }
        if (self.rules.spawn_offsets.len() as u32) < self.rules.max_players_per_team {
            return Err(SimError::InvalidConfig(format!(
                "{} spawn offsets configured for {} players per team",
                self.rules.spawn_offsets.len(),
                self.rules.max_players_per_team
            )));
        }
        if self.rules.min_players_to_start > self.rules.max_players_per_team * 2 {
            return Err(SimError::InvalidConfig(
                "min_players_to_start exceeds total team capacity".into(),
            ));
        }
        if self.waves.lanes.iter().any(Vec::is_empty) {
            return Err(SimError::InvalidConfig("lane without waypoints".into()));
        }
        if self.champion.hit_points <= 0 || self.minion.hit_points <= 0 || self.tower.hit_points <= 0 {
            return Err(SimError::InvalidConfig("hit points must be positive".into()));
        }
        for (name, seconds) in [
            ("countdown_seconds", self.rules.countdown_seconds),
            ("respawn_seconds", self.rules.respawn_seconds),
            ("wave_interval_seconds", self.waves.wave_interval_seconds),
        ] {
            let fits = seconds
                .checked_mul(self.tick_rate)
                .is_some_and(|ticks| ticks <= Tick::MAX_SPAN);
            if !fits {
                return Err(SimError::InvalidConfig(format!(
                    "{name} ({seconds}) is too long at {} ticks per second",
                    self.tick_rate
                )));
            }
        }
        Ok(())
    }

    /// Convert whole seconds to ticks, capped at [`Tick::MAX_SPAN`].
    #[must_use]
    pub fn whole_seconds_to_ticks(&self, seconds: u32) -> u32 {
        seconds
            .checked_mul(self.tick_rate)
            .map_or(Tick::MAX_SPAN, |ticks| ticks.min(Tick::MAX_SPAN))
    }

    /// Convert a duration to whole ticks, rounding to nearest.
    #[must_use]
    pub fn seconds_to_ticks(&self, seconds: Fixed) -> u32 {
        let ticks = seconds * Fixed::from_num(self.tick_rate);
        ticks.round().to_num::<i64>().max(0) as u32
    }

    /// Convert a per-second rate to a per-tick step.
    #[must_use]
    pub fn per_tick(&self, per_second: Fixed) -> Fixed {
        per_second / Fixed::from_num(self.tick_rate)
    }

    /// Spawn point for the given team.
    #[must_use]
    pub fn team_spawn(&self, team: Team) -> Vec2Fixed {
        match team {
            Team::Blue => grid_to_vec(self.rules.blue_spawn),
            Team::Red => grid_to_vec(self.rules.red_spawn),
        }
    }

    /// Spawn position for the `slot`-th player of `team`.
    #[must_use]
    pub fn slot_spawn(&self, team: Team, slot: usize) -> Vec2Fixed {
        let offset = self
            .rules
            .spawn_offsets
            .get(slot)
            .copied()
            .map_or(Vec2Fixed::ZERO, grid_to_vec);
        self.team_spawn(team) + offset
    }

    /// Cooldown look-back window for a pass covering `batch_size` ticks.
    #[must_use]
    pub fn lookback_for(&self, batch_size: u32) -> u32 {
        batch_size.clamp(1, self.max_batch_size)
    }
}
