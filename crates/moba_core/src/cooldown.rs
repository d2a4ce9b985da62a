//! Ability cooldown gate.
//!
//! Cooldowns are stored as expiry ticks inside a [`CommandRing`], one record
//! per tick the client wrote, so "is this ability usable as of tick T" has the
//! same answer however many times T is resimulated. Querying never writes.

use serde::{Deserialize, Serialize};

use crate::ability::AbilityKind;
use crate::math::Fixed;
use crate::ring_buffer::CommandRing;
use crate::tick::Tick;

/// Expiry tick per ability. `None` means never used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CooldownTargets {
    /// Area ability expiry.
    pub area: Option<Tick>,
    /// Skill-shot expiry.
    pub skill_shot: Option<Tick>,
    /// Charge expiry.
    pub charge: Option<Tick>,
}

impl CooldownTargets {
    /// Expiry for `kind`.
    #[must_use]
    pub const fn get(&self, kind: AbilityKind) -> Option<Tick> {
        match kind {
            AbilityKind::Area => self.area,
            AbilityKind::SkillShot => self.skill_shot,
            AbilityKind::Charge => self.charge,
        }
    }

    /// Replace the expiry for `kind`.
    pub fn set(&mut self, kind: AbilityKind, expires_at: Option<Tick>) {
        match kind {
            AbilityKind::Area => self.area = expires_at,
            AbilityKind::SkillShot => self.skill_shot = expires_at,
            AbilityKind::Charge => self.charge = expires_at,
        }
    }
}

/// Cooldown length per ability, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CooldownTicks {
    /// Area ability cooldown.
    pub area: u32,
    /// Skill-shot cooldown.
    pub skill_shot: u32,
    /// Charge cooldown.
    pub charge: u32,
}

impl CooldownTicks {
    /// Cooldown for `kind`.
    #[must_use]
    pub const fn get(&self, kind: AbilityKind) -> u32 {
        match kind {
            AbilityKind::Area => self.area,
            AbilityKind::SkillShot => self.skill_shot,
            AbilityKind::Charge => self.charge,
        }
    }
}

/// `true` if `kind` is still cooling down at `current`.
///
/// Probes `current`, `current - 1`, ... for `lookback` ticks (zero counts as
/// one). A tick with no retained record counts as "never used" for that probe
/// only. The ability is on cooldown only if every probe finds an expiry
/// strictly after `current`; the first probe that finds none or an elapsed
/// one makes it usable. Scanning the batch window keeps a cooldown that lapsed
/// inside a batched pass from staying stuck.
#[must_use]
pub fn is_on_cooldown(
    history: &CommandRing<CooldownTargets>,
    current: Tick,
    kind: AbilityKind,
    lookback: u32,
) -> bool {
    (0..lookback.max(1)).all(|offset| {
        let probe = current.subtract(offset);
        let expires_at = history
            .read_as_of(probe)
            .and_then(|entry| entry.value.get(kind));
        expires_at.is_some_and(|expiry| expiry.is_newer_than(current))
    })
}

/// Fraction of the cooldown still remaining at `current`, in `[0, 1]`.
///
/// Presentation reads this to fill cooldown indicators.
#[must_use]
pub fn remaining_fraction(
    history: &CommandRing<CooldownTargets>,
    current: Tick,
    kind: AbilityKind,
    total_ticks: u32,
) -> Fixed {
    if total_ticks == 0 {
        return Fixed::ZERO;
    }
    let Some(expiry) = history
        .read_as_of(current)
        .and_then(|entry| entry.value.get(kind))
    else {
        return Fixed::ZERO;
    };
    let remaining = expiry.ticks_since(current);
    if remaining <= 0 {
        return Fixed::ZERO;
    }
    let fraction = Fixed::from_num(remaining) / Fixed::from_num(total_ticks);
    fraction.min(Fixed::ONE)
}

/// Single-expiry cooldown check used by auto-attacks and NPC attacks.
///
/// Off cooldown once `current` is strictly past the recorded expiry.
#[must_use]
pub fn attack_ready(history: &CommandRing<Option<Tick>>, current: Tick) -> bool {
    match history.read_as_of(current).and_then(|entry| entry.value) {
        None => true,
        Some(expiry) => current.is_newer_than(expiry),
    }
}
