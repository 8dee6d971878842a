//! Incremental voxel map of accumulated world-frame points.
//!
//! The map is a hash grid with bounded per-voxel occupancy: each voxel keeps
//! at most `max_per_voxel` points, and no two stored points in a voxel are
//! closer than `min_distance`. This caps memory and keeps neighbor search
//! O(1) in the map size for a fixed search radius, while the min-distance
//! rule prevents dense regions from crowding out distant structure.

mod neighborhood;

pub use neighborhood::Neighborhood;

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::core::types::Point3D;

/// Integer voxel key.
///
/// Coordinates come from truncation toward zero of `p / voxel_size`, stored
/// as `i16`. Truncation maps both `[-voxel_size, 0)` and `[0, voxel_size)`
/// to key 0; this asymmetry around the origin is kept for bit-compatibility
/// with maps produced by the short-cast keying scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Voxel {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl Voxel {
    /// Key of the voxel containing `p` at the given grid size.
    #[inline]
    pub fn containing(p: &Vector3<f64>, voxel_size: f64) -> Self {
        Self {
            x: (p.x / voxel_size) as i16,
            y: (p.y / voxel_size) as i16,
            z: (p.z / voxel_size) as i16,
        }
    }
}

/// Hash-grid voxel map with bounded per-voxel occupancy.
///
/// The first point inserted into a voxel is its *anchor*: neighbor queries
/// return it first among that voxel's points and eviction measures distances
/// against it.
#[derive(Debug, Default)]
pub struct VoxelMap {
    voxels: HashMap<Voxel, Vec<Vector3<f64>>>,
}

impl VoxelMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the world-frame coordinates of `points`.
    ///
    /// A point is dropped when its voxel is full or when it lies closer than
    /// `min_distance` to any point already stored there. Dropping is silent;
    /// insertion order within a voxel is preserved.
    pub fn add(
        &mut self,
        points: &[Point3D],
        voxel_size: f64,
        max_per_voxel: usize,
        min_distance: f64,
    ) {
        for point in points {
            self.add_point(&point.pt, voxel_size, max_per_voxel, min_distance);
        }
    }

    /// Insert a single world-frame point.
    pub fn add_point(
        &mut self,
        p: &Vector3<f64>,
        voxel_size: f64,
        max_per_voxel: usize,
        min_distance: f64,
    ) {
        let key = Voxel::containing(p, voxel_size);
        match self.voxels.get_mut(&key) {
            None => {
                self.voxels.insert(key, vec![*p]);
            }
            Some(stored) => {
                if stored.len() >= max_per_voxel {
                    return;
                }
                let min_sq = min_distance * min_distance;
                if stored.iter().all(|q| (p - q).norm_squared() >= min_sq) {
                    stored.push(*p);
                }
            }
        }
    }

    /// Evict every voxel whose anchor lies farther than `max_distance` from
    /// `center`.
    pub fn remove(&mut self, center: &Vector3<f64>, max_distance: f64) {
        let max_sq = max_distance * max_distance;
        self.voxels
            .retain(|_, stored| (stored[0] - center).norm_squared() <= max_sq);
    }

    /// Collect up to `max_count` stored points nearest to `query`, sorted by
    /// ascending distance.
    ///
    /// Visits the cube of `(2 * nb_voxels_visited + 1)^3` voxels centered on
    /// the query's key. An empty result is valid.
    pub fn search_neighbors(
        &self,
        query: &Vector3<f64>,
        nb_voxels_visited: i32,
        voxel_size: f64,
        max_count: usize,
    ) -> Vec<Vector3<f64>> {
        let center = Voxel::containing(query, voxel_size);
        let (cx, cy, cz) = (center.x as i32, center.y as i32, center.z as i32);

        let mut candidates: Vec<(f64, Vector3<f64>)> = Vec::new();
        for kx in (cx - nb_voxels_visited)..=(cx + nb_voxels_visited) {
            for ky in (cy - nb_voxels_visited)..=(cy + nb_voxels_visited) {
                for kz in (cz - nb_voxels_visited)..=(cz + nb_voxels_visited) {
                    let (Ok(x), Ok(y), Ok(z)) =
                        (i16::try_from(kx), i16::try_from(ky), i16::try_from(kz))
                    else {
                        continue;
                    };
                    if let Some(stored) = self.voxels.get(&Voxel { x, y, z }) {
                        for p in stored {
                            candidates.push(((p - query).norm_squared(), *p));
                        }
                    }
                }
            }
        }

        candidates.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));
        candidates.truncate(max_count);
        candidates.into_iter().map(|(_, p)| p).collect()
    }

    /// Number of occupied voxels.
    pub fn num_voxels(&self) -> usize {
        self.voxels.len()
    }

    /// Total number of stored points.
    pub fn size(&self) -> usize {
        self.voxels.values().map(Vec::len).sum()
    }

    /// Iterate over every stored point.
    pub fn iter_points(&self) -> impl Iterator<Item = &Vector3<f64>> {
        self.voxels.values().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_points(coords: &[[f64; 3]]) -> Vec<Point3D> {
        coords
            .iter()
            .map(|c| {
                let v = Vector3::new(c[0], c[1], c[2]);
                let mut p = Point3D::new(v, 0.0, 0.0);
                p.pt = v;
                p
            })
            .collect()
    }

    #[test]
    fn occupancy_and_spacing_invariants() {
        let mut map = VoxelMap::new();
        // 30 points in one voxel, closer than allowed in pairs.
        let pts: Vec<[f64; 3]> = (0..30).map(|i| [0.01 * i as f64, 0.2, 0.2]).collect();
        map.add(&as_points(&pts), 1.0, 20, 0.05);

        assert_eq!(map.num_voxels(), 1);
        let stored: Vec<_> = map.iter_points().copied().collect();
        assert!(stored.len() <= 20);
        for (i, p) in stored.iter().enumerate() {
            for q in &stored[i + 1..] {
                assert!((p - q).norm() >= 0.05);
            }
        }
    }

    #[test]
    fn add_is_idempotent() {
        let mut map = VoxelMap::new();
        let pts = as_points(&[[0.2, 0.2, 0.2], [1.5, 0.3, 0.3], [-2.4, 0.1, 0.9]]);
        map.add(&pts, 1.0, 20, 0.1);
        let before = map.size();
        map.add(&pts, 1.0, 20, 0.1);
        assert_eq!(map.size(), before);
    }

    #[test]
    fn remove_measures_anchor_distance() {
        let mut map = VoxelMap::new();
        map.add(&as_points(&[[0.5, 0.0, 0.0], [10.5, 0.0, 0.0]]), 1.0, 20, 0.1);
        map.remove(&Vector3::zeros(), 5.0);
        assert_eq!(map.num_voxels(), 1);
        let remaining: Vec<_> = map.iter_points().copied().collect();
        assert!(remaining[0].x < 5.0);
    }

    #[test]
    fn search_returns_sorted_neighbors() {
        let mut map = VoxelMap::new();
        map.add(
            &as_points(&[[0.1, 0.0, 0.0], [0.9, 0.0, 0.0], [0.4, 0.0, 0.0], [3.5, 0.0, 0.0]]),
            1.0,
            20,
            0.01,
        );
        let found = map.search_neighbors(&Vector3::zeros(), 1, 1.0, 10);
        // The voxel at key 3 is outside the 3x3x3 cube around key 0.
        assert_eq!(found.len(), 3);
        for pair in found.windows(2) {
            assert!((pair[0] - Vector3::zeros()).norm() <= (pair[1] - Vector3::zeros()).norm());
        }
    }

    #[test]
    fn search_respects_max_count() {
        let mut map = VoxelMap::new();
        let pts: Vec<[f64; 3]> = (0..15).map(|i| [0.05 * i as f64, 0.0, 0.0]).collect();
        map.add(&as_points(&pts), 1.0, 20, 0.01);
        let found = map.search_neighbors(&Vector3::zeros(), 1, 1.0, 4);
        assert_eq!(found.len(), 4);
    }

    #[test]
    fn truncation_keys_straddle_origin() {
        // Both signs of a sub-voxel coordinate land in key 0.
        let a = Voxel::containing(&Vector3::new(-0.4, 0.0, 0.0), 1.0);
        let b = Voxel::containing(&Vector3::new(0.4, 0.0, 0.0), 1.0);
        assert_eq!(a, b);
        assert_eq!(a.x, 0);
    }

    #[test]
    fn empty_search_is_allowed() {
        let map = VoxelMap::new();
        assert!(map
            .search_neighbors(&Vector3::new(1.0, 2.0, 3.0), 2, 1.0, 10)
            .is_empty());
    }
}
