//! Uniform-grid broad phase for AABB queries
//!
//! Cells are keyed by `floor(coord / cell_size)`. The grid is rebuilt from
//! scratch (`clear` + `insert`) once per tick for moving layers; there is no
//! incremental update path.
//!
//! Rectangles spanning more than `MAX_CELL_SPAN` cells on an axis (or with
//! non-finite bounds) are kept in an overflow list that every query scans,
//! and oversized queries fall back to a linear scan. Grid work per call is
//! therefore bounded regardless of the coordinates handed in.

use std::collections::HashMap;

use super::state::Rect;

/// Widest cell span walked per axis
const MAX_CELL_SPAN: f64 = 32.0;

/// Grid of item handles bucketed by the cells their rectangles span
#[derive(Debug, Clone)]
pub struct SpatialIndex<T> {
    cell_size: f64,
    items: Vec<(T, Rect)>,
    cells: HashMap<(i64, i64), Vec<usize>>,
    oversized: Vec<usize>,
}

impl<T: Copy> SpatialIndex<T> {
    pub fn new(cell_size: f64) -> Self {
        Self {
            cell_size: if cell_size > 0.0 { cell_size } else { 64.0 },
            items: Vec::new(),
            cells: HashMap::new(),
            oversized: Vec::new(),
        }
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop every item and cell
    pub fn clear(&mut self) {
        self.items.clear();
        self.cells.clear();
        self.oversized.clear();
    }

    /// Add an item under every cell its rectangle spans
    pub fn insert(&mut self, item: T, rect: Rect) {
        let slot = self.items.len();
        self.items.push((item, rect));
        let Some((min_cx, min_cy, max_cx, max_cy)) = self.cell_span(rect.x, rect.y, rect.w, rect.h)
        else {
            self.oversized.push(slot);
            return;
        };
        for cy in min_cy..=max_cy {
            for cx in min_cx..=max_cx {
                self.cells.entry((cx, cy)).or_default().push(slot);
            }
        }
    }

    /// Broad-phase query: every item sharing a cell with the rectangle,
    /// de-duplicated, in insertion order. A superset of the exact overlaps.
    pub fn query_rect(&self, x: f64, y: f64, w: f64, h: f64) -> Vec<T> {
        self.candidates(x, y, w, h)
            .into_iter()
            .map(|slot| self.items[slot].0)
            .collect()
    }

    /// Broad phase followed by the exact overlap test, with rectangles
    pub fn query_overlapping(&self, rect: &Rect) -> Vec<(T, Rect)> {
        self.candidates(rect.x, rect.y, rect.w, rect.h)
            .into_iter()
            .map(|slot| self.items[slot])
            .filter(|(_, other)| other.overlaps(rect))
            .collect()
    }

    /// Items whose rectangle lies within `r` of the point
    pub fn query_radius(&self, x: f64, y: f64, r: f64) -> Vec<T> {
        let r = r.max(0.0);
        self.candidates(x - r, y - r, r * 2.0, r * 2.0)
            .into_iter()
            .map(|slot| self.items[slot])
            .filter(|(_, rect)| rect.distance_to(x, y) <= r)
            .map(|(item, _)| item)
            .collect()
    }

    fn candidates(&self, x: f64, y: f64, w: f64, h: f64) -> Vec<usize> {
        let Some((min_cx, min_cy, max_cx, max_cy)) = self.cell_span(x, y, w, h) else {
            return (0..self.items.len()).collect();
        };
        let mut out = self.oversized.clone();
        for cy in min_cy..=max_cy {
            for cx in min_cx..=max_cx {
                if let Some(slots) = self.cells.get(&(cx, cy)) {
                    out.extend_from_slice(slots);
                }
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Cell range of a rectangle, `None` when it is too wide to walk
    fn cell_span(&self, x: f64, y: f64, w: f64, h: f64) -> Option<(i64, i64, i64, i64)> {
        let w = w.max(0.0);
        let h = h.max(0.0);
        let span = [
            (x / self.cell_size).floor(),
            (y / self.cell_size).floor(),
            ((x + w) / self.cell_size).floor(),
            ((y + h) / self.cell_size).floor(),
        ];
        let walkable = span.iter().all(|c| c.is_finite() && c.abs() < i64::MAX as f64)
            && span[2] - span[0] <= MAX_CELL_SPAN
            && span[3] - span[1] <= MAX_CELL_SPAN;
        walkable.then(|| {
            (
                span[0] as i64,
                span[1] as i64,
                span[2] as i64,
                span[3] as i64,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn query_rect_never_misses_an_exact_overlap() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut index = SpatialIndex::new(16.0);
        let mut rects = Vec::new();
        for i in 0..200usize {
            let rect = Rect::new(
                rng.gen_range(-300.0..300.0),
                rng.gen_range(-300.0..300.0),
                rng.gen_range(0.5..60.0),
                rng.gen_range(0.5..60.0),
            );
            index.insert(i, rect);
            rects.push(rect);
        }

        for _ in 0..200 {
            let query = Rect::new(
                rng.gen_range(-320.0..320.0),
                rng.gen_range(-320.0..320.0),
                rng.gen_range(0.0..90.0),
                rng.gen_range(0.0..90.0),
            );
            let broad = index.query_rect(query.x, query.y, query.w, query.h);
            for (i, rect) in rects.iter().enumerate() {
                if rect.overlaps(&query) {
                    assert!(broad.contains(&i), "item {i} overlaps {query:?} but was missed");
                }
            }
        }
    }

    #[test]
    fn spanning_item_is_reported_once() {
        let mut index = SpatialIndex::new(10.0);
        index.insert('a', Rect::new(0.0, 0.0, 35.0, 35.0));
        let hits = index.query_rect(-5.0, -5.0, 50.0, 50.0);
        assert_eq!(hits, vec!['a']);
    }

    #[test]
    fn radius_filters_by_true_distance() {
        let mut index = SpatialIndex::new(100.0);
        index.insert(1, Rect::new(10.0, 0.0, 1.0, 1.0));
        // same cell, but the closest corner is ~70.7 away
        index.insert(2, Rect::new(50.0, 50.0, 1.0, 1.0));
        assert_eq!(index.query_radius(0.0, 0.0, 20.0), vec![1]);
        assert_eq!(index.query_radius(0.0, 0.0, 75.0), vec![1, 2]);
    }

    #[test]
    fn huge_rectangles_stay_out_of_the_grid() {
        let mut index = SpatialIndex::new(10.0);
        index.insert('a', Rect::new(0.0, 0.0, 5.0, 5.0));
        index.insert('h', Rect::new(-1.0e9, -1.0e9, 2.0e9, 2.0e9));
        index.insert('n', Rect::new(f64::NAN, 0.0, 5.0, 5.0));
        assert!(index.cells.len() <= 1);
        assert_eq!(index.oversized.len(), 2);

        assert_eq!(index.query_rect(1.0, 1.0, 1.0, 1.0), vec!['a', 'h', 'n']);
        let near: Vec<char> = index
            .query_overlapping(&Rect::new(500.0, 500.0, 1.0, 1.0))
            .into_iter()
            .map(|(item, _)| item)
            .collect();
        assert_eq!(near, vec!['h']);

        // a query wider than the grid walks the item list instead
        assert_eq!(index.query_rect(0.0, 0.0, 1.0e7, 1.0e7).len(), 3);
        assert_eq!(index.query_radius(0.0, 0.0, 1.0e12), vec!['a', 'h']);
    }

    #[test]
    fn clear_forgets_everything() {
        let mut index = SpatialIndex::new(8.0);
        index.insert(3u64, Rect::new(0.0, 0.0, 4.0, 4.0));
        index.clear();
        assert!(index.is_empty());
        assert!(index.query_rect(0.0, 0.0, 10.0, 10.0).is_empty());
    }
}
