//! Collision-layer spatial queries.
//!
//! Gameplay stages find targets through [`SpatialQuery`] instead of scanning
//! the world themselves. [`SpatialIndex`] is the built-in implementation: a
//! uniform grid rebuilt from the world before each stage runs. Results are
//! always sorted by distance, then by entity handle, so ties resolve the same
//! way on every peer.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::components::{EntityKind, Team};
use crate::math::{Fixed, Vec2Fixed};
use crate::world::{EntityHandle, World};

/// Bit set of collision layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LayerMask(u32);

impl LayerMask {
    /// No layers.
    pub const NONE: Self = Self(0);
    /// Champions.
    pub const CHAMPIONS: Self = Self(1 << 1);
    /// Minions.
    pub const MINIONS: Self = Self(1 << 2);
    /// Towers and bases.
    pub const STRUCTURES: Self = Self(1 << 4);
    /// Projectiles and ability effects.
    pub const EFFECTS: Self = Self(1 << 6);
    /// Everything that can take damage.
    pub const TARGETABLE: Self = Self(Self::CHAMPIONS.0 | Self::MINIONS.0 | Self::STRUCTURES.0);

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// `true` if any layer in `other` is also in `self`.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for LayerMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One query result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpatialHit {
    /// Entity hit.
    pub entity: EntityHandle,
    /// Its kind.
    pub kind: EntityKind,
    /// Its team, if any.
    pub team: Option<Team>,
    /// Distance from the query origin to the entity's centre (overlaps) or
    /// along the ray to the closest approach (casts).
    pub distance: Fixed,
}

/// Read-only spatial queries used by gameplay stages.
pub trait SpatialQuery: Send + Sync {
    /// Entities on `mask` whose body overlaps the circle at `center`.
    fn overlap_sphere(&self, center: Vec2Fixed, radius: Fixed, mask: LayerMask) -> Vec<SpatialHit>;

    /// Entities on `mask` touched by a circle of `radius` swept from `from`
    /// to `to`.
    fn cast_ray(&self, from: Vec2Fixed, to: Vec2Fixed, radius: Fixed, mask: LayerMask) -> Vec<SpatialHit>;
}

#[derive(Debug, Clone, Copy)]
struct Body {
    entity: EntityHandle,
    kind: EntityKind,
    team: Option<Team>,
    position: Vec2Fixed,
    radius: Fixed,
    layer: LayerMask,
}

type Cell = (i32, i32);

/// Uniform-grid index over every active entity with a transform.
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    cell_size: Fixed,
    bodies: Vec<Body>,
    cells: BTreeMap<Cell, Vec<usize>>,
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self::empty()
    }
}

impl SpatialIndex {
    /// Default grid cell edge length.
    pub const DEFAULT_CELL_SIZE: i32 = 8;

    /// An index with nothing in it.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            cell_size: Fixed::from_num(Self::DEFAULT_CELL_SIZE),
            bodies: Vec::new(),
            cells: BTreeMap::new(),
        }
    }

    /// Index every active entity in `world` that has a transform.
    ///
    /// Entities marked for destruction are left out so nothing targets them.
    #[must_use]
    pub fn build(world: &World) -> Self {
        let mut index = Self::empty();
        for entity in world.entities.iter() {
            if !entity.is_active() {
                continue;
            }
            let Some(position) = entity.position() else {
                continue;
            };
            index.insert(Body {
                entity: entity.handle(),
                kind: entity.kind,
                team: entity.team,
                position,
                radius: entity.body_radius,
                layer: entity.kind.layer(),
            });
        }
        index
    }

    /// Number of indexed bodies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    /// `true` if nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    fn insert(&mut self, body: Body) {
        let slot = self.bodies.len();
        let (min, max) = self.cell_range(body.position, body.position, body.radius);
        for x in min.0..=max.0 {
            for y in min.1..=max.1 {
                self.cells.entry((x, y)).or_default().push(slot);
            }
        }
        self.bodies.push(body);
    }

    fn cell_of(&self, point: Vec2Fixed) -> Cell {
        (
            (point.x / self.cell_size).floor().to_num::<i32>(),
            (point.y / self.cell_size).floor().to_num::<i32>(),
        )
    }

    fn cell_range(&self, a: Vec2Fixed, b: Vec2Fixed, pad: Fixed) -> (Cell, Cell) {
        let low = Vec2Fixed::new(a.x.min(b.x) - pad, a.y.min(b.y) - pad);
        let high = Vec2Fixed::new(a.x.max(b.x) + pad, a.y.max(b.y) + pad);
        (self.cell_of(low), self.cell_of(high))
    }

    /// Bodies on `mask` in cells touched by the padded box around `a`..`b`.
    fn candidates(&self, a: Vec2Fixed, b: Vec2Fixed, pad: Fixed, mask: LayerMask) -> Vec<&Body> {
        let (min, max) = self.cell_range(a, b, pad);
        let mut seen = BTreeSet::new();
        for x in min.0..=max.0 {
            for y in min.1..=max.1 {
                if let Some(slots) = self.cells.get(&(x, y)) {
                    seen.extend(slots.iter().copied());
                }
            }
        }
        seen.into_iter()
            .map(|slot| &self.bodies[slot])
            .filter(|body| body.layer.intersects(mask))
            .collect()
    }
}

fn sorted(mut hits: Vec<SpatialHit>) -> Vec<SpatialHit> {
    hits.sort_by(|a, b| a.distance.cmp(&b.distance).then(a.entity.cmp(&b.entity)));
    hits
}

fn hit(body: &Body, distance: Fixed) -> SpatialHit {
    SpatialHit {
        entity: body.entity,
        kind: body.kind,
        team: body.team,
        distance,
    }
}

impl SpatialQuery for SpatialIndex {
    fn overlap_sphere(&self, center: Vec2Fixed, radius: Fixed, mask: LayerMask) -> Vec<SpatialHit> {
        // Widest body radius is unknown up front; pad by one cell.
        let hits = self
            .candidates(center, center, radius + self.cell_size, mask)
            .into_iter()
            .filter_map(|body| {
                let reach = radius + body.radius;
                let distance_sq = center.distance_squared(body.position);
                (distance_sq <= reach * reach).then(|| hit(body, center.distance(body.position)))
            })
            .collect();
        sorted(hits)
    }

    fn cast_ray(&self, from: Vec2Fixed, to: Vec2Fixed, radius: Fixed, mask: LayerMask) -> Vec<SpatialHit> {
        let segment = to - from;
        let length_sq = segment.dot(segment);
        let length = segment.length();

        let hits = self
            .candidates(from, to, radius + self.cell_size, mask)
            .into_iter()
            .filter_map(|body| {
                let t = if length_sq == Fixed::ZERO {
                    Fixed::ZERO
                } else {
                    ((body.position - from).dot(segment) / length_sq).clamp(Fixed::ZERO, Fixed::ONE)
                };
                let closest = from + segment.scale(t);
                let reach = radius + body.radius;
                (closest.distance_squared(body.position) <= reach * reach)
                    .then(|| hit(body, length * t))
            })
            .collect();
        sorted(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::Transform;
    use crate::world::{Entity, WorldRole};

    fn place(world: &mut World, kind: EntityKind, team: Team, x: i32, y: i32) -> EntityHandle {
        let mut entity = Entity::new(kind);
        entity.team = Some(team);
        entity.body_radius = Fixed::ONE;
        entity.transform = Some(Transform::at(Vec2Fixed::from_ints(x, y)));
        world.spawn(entity)
    }

    #[test]
    fn test_overlap_sorted_by_distance_then_handle() {
        let mut world = World::new(WorldRole::Server);
        let far = place(&mut world, EntityKind::Minion, Team::Red, 5, 0);
        let near = place(&mut world, EntityKind::Minion, Team::Red, 2, 0);
        let tie = place(&mut world, EntityKind::Champion, Team::Red, -2, 0);
        place(&mut world, EntityKind::Minion, Team::Red, 40, 0);

        let index = SpatialIndex::build(&world);
        let hits = index.overlap_sphere(Vec2Fixed::ZERO, Fixed::from_num(5), LayerMask::TARGETABLE);
        let order: Vec<_> = hits.iter().map(|h| h.entity).collect();
        assert_eq!(order, vec![near, tie, far]);
    }

    #[test]
    fn test_layer_mask_filters() {
        let mut world = World::new(WorldRole::Server);
        place(&mut world, EntityKind::Minion, Team::Red, 1, 0);
        let champ = place(&mut world, EntityKind::Champion, Team::Red, 0, 1);

        let index = SpatialIndex::build(&world);
        let hits = index.overlap_sphere(Vec2Fixed::ZERO, Fixed::from_num(3), LayerMask::CHAMPIONS);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity, champ);
    }

    #[test]
    fn test_marked_entities_are_not_indexed() {
        let mut world = World::new(WorldRole::Server);
        let handle = place(&mut world, EntityKind::Minion, Team::Red, 0, 0);
        if let Some(entity) = world.entities.get_mut(handle) {
            crate::lifecycle::mark_for_destruction(entity, crate::tick::Tick::new(1));
        }
        assert!(SpatialIndex::build(&world).is_empty());
    }

    #[test]
    fn test_cast_ray_catches_tunnelling_projectile() {
        let mut world = World::new(WorldRole::Server);
        let target = place(&mut world, EntityKind::Minion, Team::Red, 10, 0);
        let index = SpatialIndex::build(&world);

        // Start and end points are both well clear of the target.
        let from = Vec2Fixed::from_ints(0, 0);
        let to = Vec2Fixed::from_ints(20, 0);
        assert!(index.overlap_sphere(to, Fixed::ONE, LayerMask::MINIONS).is_empty());

        let hits = index.cast_ray(from, to, Fixed::ONE, LayerMask::MINIONS);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity, target);
        assert!((hits[0].distance - Fixed::from_num(10)).abs() < Fixed::from_num(0.001));
    }

    #[test]
    fn test_cast_ray_misses_offset_body() {
        let mut world = World::new(WorldRole::Server);
        place(&mut world, EntityKind::Minion, Team::Red, 10, 5);
        let index = SpatialIndex::build(&world);
        let hits = index.cast_ray(
            Vec2Fixed::ZERO,
            Vec2Fixed::from_ints(20, 0),
            Fixed::ONE,
            LayerMask::MINIONS,
        );
        assert!(hits.is_empty());
    }
}
