//! Plain-data components attached to entities.
//!
//! Components that carry history or cross-module behaviour live next to the
//! logic that owns them: cooldown rings in [`crate::cooldown`], cast states in
//! [`crate::ability`], hit points and damage buffers in [`crate::damage`].

use serde::{Deserialize, Serialize};

use crate::math::{fixed_serde, Fixed, Vec2Fixed};
use crate::replication::GhostId;
use crate::ring_buffer::CommandRing;
use crate::tick::Tick;
use crate::world::EntityHandle;

/// Match side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Team {
    /// Starts in the south-west.
    Blue,
    /// Starts in the north-east.
    Red,
}

impl Team {
    /// The opposing team.
    #[must_use]
    pub const fn opponent(self) -> Self {
        match self {
            Self::Blue => Self::Red,
            Self::Red => Self::Blue,
        }
    }
}

impl std::fmt::Display for Team {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blue => write!(f, "blue"),
            Self::Red => write!(f, "red"),
        }
    }
}

/// What an entity is. Drives archetype construction and replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// Player-controlled hero.
    Champion,
    /// Lane creep.
    Minion,
    /// Tower or base.
    Structure,
    /// Effect entity created by a champion ability.
    Ability(crate::ability::AbilityKind),
    /// Champion auto-attack projectile.
    AutoAttack,
    /// Minion or tower attack projectile.
    NpcAttack,
}

impl EntityKind {
    /// Layer the entity occupies for spatial queries.
    #[must_use]
    pub const fn layer(self) -> crate::spatial::LayerMask {
        use crate::spatial::LayerMask;
        match self {
            Self::Champion => LayerMask::CHAMPIONS,
            Self::Minion => LayerMask::MINIONS,
            Self::Structure => LayerMask::STRUCTURES,
            Self::Ability(_) | Self::AutoAttack | Self::NpcAttack => LayerMask::EFFECTS,
        }
    }

    /// `true` for entities that take damage.
    #[must_use]
    pub const fn is_damageable(self) -> bool {
        matches!(self, Self::Champion | Self::Minion | Self::Structure)
    }
}

/// Position and facing on the ground plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Transform {
    /// World position.
    pub position: Vec2Fixed,
    /// Unit facing direction.
    pub facing: Vec2Fixed,
}

impl Transform {
    /// Transform at `position` facing the default direction.
    #[must_use]
    pub const fn at(position: Vec2Fixed) -> Self {
        Self {
            position,
            facing: Vec2Fixed::FORWARD,
        }
    }

    /// Transform at `position` facing `direction` (normalized, with the
    /// default facing for a zero direction).
    #[must_use]
    pub fn looking(position: Vec2Fixed, direction: Vec2Fixed) -> Self {
        Self {
            position,
            facing: direction.normalize_or(Vec2Fixed::FORWARD),
        }
    }
}

/// Walking and dash tuning for a mobile entity. Speeds are units per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MoveSpeed {
    /// Walking speed.
    #[serde(with = "fixed_serde")]
    pub walk: Fixed,
    /// Dash speed.
    #[serde(with = "fixed_serde")]
    pub dash: Fixed,
    /// Distance covered by one dash.
    #[serde(with = "fixed_serde")]
    pub dash_distance: Fixed,
}

/// An in-progress dash. Walking is suspended while it exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DashState {
    /// Point the dash heads toward.
    pub target: Vec2Fixed,
    /// Distance still to cover.
    #[serde(with = "fixed_serde")]
    pub remaining: Fixed,
    /// Dash speed, units per second.
    #[serde(with = "fixed_serde")]
    pub speed: Fixed,
}

/// How a non-character entity moves each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mover {
    /// Fixed direction at constant speed (skill-shots).
    Straight {
        /// Unit travel direction.
        direction: Vec2Fixed,
        /// Units per second.
        #[serde(with = "fixed_serde")]
        speed: Fixed,
    },
    /// Chase a live target (auto-attacks, NPC attacks).
    Homing {
        /// Entity being chased.
        target: EntityHandle,
        /// Units per second.
        #[serde(with = "fixed_serde")]
        speed: Fixed,
    },
    /// Does not move (area effects).
    Stationary,
}

/// Movement bookkeeping for swept hit detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Motion {
    /// Movement rule.
    pub mover: Mover,
    /// Position at the start of the last movement pass.
    pub previous_position: Vec2Fixed,
}

impl Motion {
    /// New motion starting at `position`.
    #[must_use]
    pub const fn new(mover: Mover, position: Vec2Fixed) -> Self {
        Self {
            mover,
            previous_position: position,
        }
    }
}

/// Lane waypoints a minion walks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MinionPath {
    /// Waypoints in walking order.
    pub waypoints: Vec<Vec2Fixed>,
    /// Index of the waypoint currently walked toward.
    pub index: usize,
}

/// Champion auto-attack tuning and its cooldown history.
///
/// The ring holds the tick the current cooldown expires at; `None` means the
/// attack was never used.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AutoAttack {
    /// Maximum target distance.
    #[serde(with = "fixed_serde")]
    pub range: Fixed,
    /// Ticks between attacks.
    pub cooldown_ticks: u32,
    /// Damage per hit.
    pub damage: i32,
    /// Projectile speed, units per second.
    #[serde(with = "fixed_serde")]
    pub projectile_speed: Fixed,
    /// Spawn distance in front of the champion.
    #[serde(with = "fixed_serde")]
    pub fire_point_offset: Fixed,
    /// Expiry history.
    pub cooldown: CommandRing<Option<Tick>>,
}

/// Autonomous attacker: target acquisition radius, attack tuning, current
/// target and cooldown history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NpcAttack {
    /// Acquisition radius.
    #[serde(with = "fixed_serde")]
    pub target_radius: Fixed,
    /// Ticks between attacks.
    pub cooldown_ticks: u32,
    /// Damage per attack.
    pub damage: i32,
    /// Projectile speed, units per second.
    #[serde(with = "fixed_serde")]
    pub projectile_speed: Fixed,
    /// Offset from the attacker where projectiles spawn.
    pub fire_point_offset: Vec2Fixed,
    /// Closest enemy found by the last target scan.
    pub target: Option<EntityHandle>,
    /// Expiry history.
    pub cooldown: CommandRing<Option<Tick>>,
}

/// Edge-triggered input event.
///
/// Counts presses merged into one tick so a press is never lost when several
/// frames feed the same tick. Consumers ask "did it fire", never "is it held".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct InputEvent {
    count: u32,
}

impl InputEvent {
    /// Record one press.
    pub fn set(&mut self) {
        self.count = self.count.saturating_add(1);
    }

    /// An event that fired once.
    #[must_use]
    pub const fn fired() -> Self {
        Self { count: 1 }
    }

    /// `true` if the event fired since it was last consumed.
    #[must_use]
    pub const fn is_set(self) -> bool {
        self.count > 0
    }

    /// Number of presses merged into this event.
    #[must_use]
    pub const fn count(self) -> u32 {
        self.count
    }

    /// Fold the presses of `other` into this event.
    pub fn merge(&mut self, other: Self) {
        self.count = self.count.saturating_add(other.count);
    }
}

/// Per-tick ability button events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AbilityInput {
    /// Area ability pressed.
    pub area: InputEvent,
    /// Skill-shot aim started.
    pub skill_shot: InputEvent,
    /// Skill-shot confirmed.
    pub confirm_skill_shot: InputEvent,
    /// Charge aim started.
    pub charge: InputEvent,
    /// Charge confirmed.
    pub confirm_charge: InputEvent,
}

impl AbilityInput {
    /// `true` if no event fired.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !(self.area.is_set()
            || self.skill_shot.is_set()
            || self.confirm_skill_shot.is_set()
            || self.charge.is_set()
            || self.confirm_charge.is_set())
    }

    /// Fold every event of `other` into this one.
    pub fn merge(&mut self, other: &Self) {
        self.area.merge(other.area);
        self.skill_shot.merge(other.skill_shot);
        self.confirm_skill_shot.merge(other.confirm_skill_shot);
        self.charge.merge(other.charge);
        self.confirm_charge.merge(other.confirm_charge);
    }
}

/// Everything a player's input source produces for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PlayerInput {
    /// Requested walk destination. Persists until replaced.
    pub move_target: Option<Vec2Fixed>,
    /// Aim direction for skill-shots.
    pub aim: Vec2Fixed,
    /// Replicated id of the auto-attack target.
    pub attack_target: Option<GhostId>,
    /// Ability button events.
    pub abilities: AbilityInput,
}

impl PlayerInput {
    /// Same intents with every edge event cleared. Used when a tick's input
    /// is missing and the last known input is carried forward.
    #[must_use]
    pub fn carried_forward(&self) -> Self {
        Self {
            abilities: AbilityInput::default(),
            ..*self
        }
    }

    /// Fold a later tick's input into this one.
    ///
    /// Edge events accumulate. Aim and attack target take the later value; a
    /// move target is replaced only when the later input names one.
    pub fn merge_later(&mut self, later: &Self) {
        if later.move_target.is_some() {
            self.move_target = later.move_target;
        }
        self.aim = later.aim;
        self.attack_target = later.attack_target;
        self.abilities.merge(&later.abilities);
    }
}

/// Client-local aim indicator. Never replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AimIndicator {
    /// Ability being aimed.
    pub kind: crate::ability::AbilityKind,
    /// Tick the indicator appeared.
    pub since: Tick,
}
