//! Body integration and AABB collision resolution
//!
//! Resolution is axis-separated: the X move is resolved first, then the Y
//! move is tested at the already resolved X position. This keeps bodies from
//! tunnelling through block corners at the cost of an axis-priority bias
//! (a body sliding diagonally into a corner is stopped horizontally first).
//! The bias is intentional and matches the block-world feel.

use super::spatial::SpatialIndex;
use super::state::{Entity, Rect};

/// Grid coordinates of a static block
pub type BlockCell = (i64, i64);

/// Gravity and fall-speed settings shared by a room
#[derive(Debug, Clone, Copy)]
pub struct PhysicsEngine {
    /// Downward acceleration in px/s²
    pub gravity: f64,
    /// Terminal fall speed in px/s
    pub max_fall_speed: f64,
}

impl PhysicsEngine {
    pub fn new(gravity: f64, max_fall_speed: f64) -> Self {
        Self {
            gravity,
            max_fall_speed,
        }
    }

    /// Advance every entity by `dt` seconds against the static obstacle grid.
    ///
    /// Entities without a body move kinematically (no gravity, no collision).
    ///
    /// A body whose move produces a non-finite value is put back where it
    /// was and stopped.
    pub fn integrate<'a, I>(&self, entities: I, obstacles: &SpatialIndex<BlockCell>, dt: f64)
    where
        I: IntoIterator<Item = &'a mut Entity>,
    {
        for entity in entities {
            let (x, y) = (entity.x, entity.y);
            self.step(entity, obstacles, dt);
            if !entity.is_finite() {
                entity.x = x;
                entity.y = y;
                entity.vx = 0.0;
                entity.vy = 0.0;
                entity.scrub_non_finite();
            }
        }
    }

    fn step(&self, entity: &mut Entity, obstacles: &SpatialIndex<BlockCell>, dt: f64) {
        let Some(body) = entity.body else {
            entity.x += entity.vx * dt;
            entity.y += entity.vy * dt;
            return;
        };

        if body.gravity {
            entity.vy += self.gravity * dt;
            if entity.vy > self.max_fall_speed {
                entity.vy = self.max_fall_speed;
            }
        }
        entity.vx *= body.friction;
        entity.on_ground = false;

        // X axis
        let next_x = entity.x + entity.vx * dt;
        let swept = Rect::new(next_x, entity.y, entity.w, entity.h);
        let hits = obstacles.query_overlapping(&swept);
        if hits.is_empty() || entity.vx == 0.0 {
            entity.x = next_x;
        } else {
            // pin to the near edge on the approach side, never backwards
            entity.x = if entity.vx > 0.0 {
                let edge = hits.iter().map(|(_, r)| r.x).fold(f64::INFINITY, f64::min);
                (edge - entity.w).max(entity.x).min(next_x)
            } else {
                let edge = hits
                    .iter()
                    .map(|(_, r)| r.right())
                    .fold(f64::NEG_INFINITY, f64::max);
                edge.min(entity.x).max(next_x)
            };
            entity.vx = match body.restitution {
                Some(bounce) => -entity.vx * bounce,
                None => 0.0,
            };
        }

        // Y axis, tested at the resolved X
        let next_y = entity.y + entity.vy * dt;
        let swept = Rect::new(entity.x, next_y, entity.w, entity.h);
        let hits = obstacles.query_overlapping(&swept);
        if hits.is_empty() || entity.vy == 0.0 {
            entity.y = next_y;
        } else {
            entity.y = if entity.vy > 0.0 {
                // landing
                let edge = hits.iter().map(|(_, r)| r.y).fold(f64::INFINITY, f64::min);
                entity.on_ground = true;
                (edge - entity.h).max(entity.y).min(next_y)
            } else {
                // ceiling
                let edge = hits
                    .iter()
                    .map(|(_, r)| r.bottom())
                    .fold(f64::NEG_INFINITY, f64::max);
                edge.min(entity.y).max(next_y)
            };
            entity.vy = match body.restitution {
                Some(bounce) => -entity.vy * bounce,
                None => 0.0,
            };
        }
    }
}

/// Build the static obstacle grid from block cells
pub fn block_index<I>(blocks: I, block_size: f64, cell_size: f64) -> SpatialIndex<BlockCell>
where
    I: IntoIterator<Item = BlockCell>,
{
    let mut index = SpatialIndex::new(cell_size);
    for (bx, by) in blocks {
        let rect = Rect::new(
            bx as f64 * block_size,
            by as f64 * block_size,
            block_size,
            block_size,
        );
        index.insert((bx, by), rect);
    }
    index
}

/// Pairwise overlap between two groups using a disposable grid over `bs`.
///
/// `on_hit(a, b)` is called for each overlapping pair; returning `false`
/// consumes `a` (e.g. a projectile), which stops further checks for it.
/// Returns the consumed `a` items in the order they were consumed.
pub fn collide_groups<A, B, F>(as_: &[(A, Rect)], bs: &[(B, Rect)], cell_size: f64, mut on_hit: F) -> Vec<A>
where
    A: Copy,
    B: Copy,
    F: FnMut(A, B) -> bool,
{
    let mut grid = SpatialIndex::new(cell_size);
    for (b, rect) in bs {
        grid.insert(*b, *rect);
    }

    let mut consumed = Vec::new();
    for (a, rect) in as_ {
        for (b, _) in grid.query_overlapping(rect) {
            if !on_hit(*a, b) {
                consumed.push(*a);
                break;
            }
        }
    }
    consumed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::Body;

    fn body_at(x: f64, y: f64, vx: f64, vy: f64) -> Entity {
        Entity {
            id: 1,
            kind: "hero".into(),
            x,
            y,
            w: 30.0,
            h: 30.0,
            vx,
            vy,
            vars: Default::default(),
            channels_in: vec![],
            channels_out: vec![],
            on_ground: false,
            body: Some(Body::default()),
        }
    }

    fn platform() -> SpatialIndex<BlockCell> {
        // blocks (-2..=2, 0) => floor spanning x -80..120 at y 0..40
        block_index((-2..=2).map(|bx| (bx, 0)), 40.0, 64.0)
    }

    #[test]
    fn falling_body_lands_within_one_tick_of_contact() {
        let physics = PhysicsEngine::new(1800.0, 900.0);
        let obstacles = platform();
        let dt = 1.0 / 60.0;
        // bottom edge 2px above the floor, already falling
        let mut hero = body_at(0.0, -32.0, 0.0, 240.0);

        physics.integrate(std::iter::once(&mut hero), &obstacles, dt);

        assert_eq!(hero.vy, 0.0);
        assert!(hero.on_ground);
        assert!((hero.y - -30.0).abs() < 1e-9, "pinned on top, got {}", hero.y);
    }

    #[test]
    fn free_fall_is_clamped_to_terminal_speed() {
        let physics = PhysicsEngine::new(1800.0, 900.0);
        let empty = SpatialIndex::new(64.0);
        let mut hero = body_at(0.0, -5000.0, 0.0, 890.0);
        physics.integrate(std::iter::once(&mut hero), &empty, 1.0 / 60.0);
        assert_eq!(hero.vy, 900.0);
        assert!(!hero.on_ground);
    }

    #[test]
    fn wall_contact_pins_to_edge_and_stops() {
        let physics = PhysicsEngine::new(0.0, 900.0);
        let wall = block_index([(3, -1)], 40.0, 64.0); // x 120..160, y -40..0
        let mut hero = body_at(85.0, -35.0, 600.0, 0.0);
        physics.integrate(std::iter::once(&mut hero), &wall, 1.0 / 60.0);
        assert_eq!(hero.vx, 0.0);
        assert!((hero.x - 90.0).abs() < 1e-9);
    }

    #[test]
    fn restitution_reflects_velocity() {
        let physics = PhysicsEngine::new(0.0, 900.0);
        let wall = block_index([(3, -1)], 40.0, 64.0);
        let mut ball = body_at(85.0, -35.0, 600.0, 0.0);
        ball.body = Some(Body {
            restitution: Some(0.5),
            ..Body::default()
        });
        physics.integrate(std::iter::once(&mut ball), &wall, 1.0 / 60.0);
        assert_eq!(ball.vx, -300.0);
    }

    #[test]
    fn ceiling_hit_zeroes_upward_velocity() {
        let physics = PhysicsEngine::new(0.0, 900.0);
        let ceiling = block_index([(0, -3)], 40.0, 64.0); // y -120..-80
        let mut hero = body_at(0.0, -78.0, 0.0, -600.0);
        physics.integrate(std::iter::once(&mut hero), &ceiling, 1.0 / 60.0);
        assert_eq!(hero.vy, 0.0);
        assert!((hero.y - -80.0).abs() < 1e-9);
        assert!(!hero.on_ground);
    }

    #[test]
    fn bodiless_entities_move_kinematically() {
        let physics = PhysicsEngine::new(1800.0, 900.0);
        let mut ghost = body_at(0.0, -32.0, 60.0, 60.0);
        ghost.body = None;
        physics.integrate(std::iter::once(&mut ghost), &platform(), 0.5);
        assert_eq!((ghost.x, ghost.y), (30.0, -2.0));
    }

    #[test]
    fn runaway_velocity_leaves_the_body_in_place() {
        let physics = PhysicsEngine::new(1800.0, 900.0);
        let mut hero = body_at(12.0, -200.0, f64::INFINITY, 0.0);
        physics.integrate(std::iter::once(&mut hero), &platform(), 1.0 / 60.0);
        assert_eq!((hero.x, hero.y), (12.0, -200.0));
        assert_eq!((hero.vx, hero.vy), (0.0, 0.0));

        let mut ghost = body_at(0.0, 0.0, f64::NAN, 10.0);
        ghost.body = None;
        physics.integrate(std::iter::once(&mut ghost), &platform(), 1.0);
        assert_eq!((ghost.x, ghost.y, ghost.vy), (0.0, 0.0, 0.0));
    }

    #[test]
    fn collide_groups_consumes_projectiles_on_falsy_hit() {
        let bullets = [
            (1u64, Rect::new(0.0, 0.0, 4.0, 4.0)),
            (2u64, Rect::new(500.0, 500.0, 4.0, 4.0)),
        ];
        let enemies = [(10u64, Rect::new(2.0, 2.0, 20.0, 20.0)), (11u64, Rect::new(1.0, 1.0, 5.0, 5.0))];
        let mut pairs = Vec::new();
        let consumed = collide_groups(&bullets, &enemies, 32.0, |a, b| {
            pairs.push((a, b));
            false
        });
        // first hit consumes bullet 1, so it never reaches enemy 11
        assert_eq!(pairs, vec![(1, 10)]);
        assert_eq!(consumed, vec![1]);
    }
}
