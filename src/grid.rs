use orion_common::Vec3;

/// Integer coordinates of a grid cell.
pub type CellKey = [i64; 3];

/// Relative padding of the cell edge over the query radius.
const CELL_SLACK: f64 = 1e-9;

/// Uniform spatial hash over a set of points.
///
/// Point indices are sorted by cell; `cell_starts[c]` and `cell_counts[c]` locate the
/// points of the `c`-th occupied cell inside `cell_particle_indices`. Only occupied
/// cells are stored, so unbounded coordinates cost nothing extra.
#[derive(Debug, Clone)]
pub struct SpatialGrid {
    inv_cell_size: f64,
    cell_keys: Vec<CellKey>,
    cell_starts: Vec<usize>,
    cell_counts: Vec<usize>,
    cell_particle_indices: Vec<usize>,
}

impl SpatialGrid {
    /// Grid whose 3x3x3 scan sees every pair of `positions` within `radius`.
    ///
    /// The edge is `radius` padded by the worst rounding of `floor(x / edge)` at the
    /// largest coordinate, so two points at most `radius` apart never land two cells
    /// apart. A zero radius uses unit cells.
    pub fn for_radius(positions: &[Vec3], radius: f64) -> Self {
        Self::build(positions, covering_cell_size(positions, radius))
    }

    /// Buckets `positions` into cubic cells of edge `cell_size` (> 0).
    pub fn build(positions: &[Vec3], cell_size: f64) -> Self {
        debug_assert!(cell_size > 0.0);
        let inv_cell_size = cell_size.recip();

        // 1. Cell key of every point.
        let keys: Vec<CellKey> = positions.iter().map(|&p| cell_key(p, inv_cell_size)).collect();

        // 2. Sort point indices by key. Stable, so indices stay ascending inside each cell.
        let mut cell_particle_indices: Vec<usize> = (0..positions.len()).collect();
        cell_particle_indices.sort_by_key(|&i| keys[i]);

        // 3. Run-length encode the sorted keys: one (key, start, count) entry per occupied
        //    cell. `cell_keys` comes out sorted, which `cell_members` relies on.
        let mut cell_keys = Vec::new();
        let mut cell_starts = Vec::new();
        let mut cell_counts: Vec<usize> = Vec::new();
        for (slot, &idx) in cell_particle_indices.iter().enumerate() {
            let key = keys[idx];
            if cell_keys.last() == Some(&key) {
                if let Some(count) = cell_counts.last_mut() {
                    *count += 1;
                }
            } else {
                cell_keys.push(key);
                cell_starts.push(slot);
                cell_counts.push(1);
            }
        }

        Self { inv_cell_size, cell_keys, cell_starts, cell_counts, cell_particle_indices }
    }

    pub fn occupied_cells(&self) -> usize {
        self.cell_keys.len()
    }

    pub fn cell_of(&self, pos: Vec3) -> CellKey {
        cell_key(pos, self.inv_cell_size)
    }

    /// Point indices stored in the cell `key`, ascending.
    pub fn cell_members(&self, key: CellKey) -> &[usize] {
        match self.cell_keys.binary_search(&key) {
            Ok(c) => {
                let start = self.cell_starts[c];
                &self.cell_particle_indices[start..start + self.cell_counts[c]]
            }
            Err(_) => &[],
        }
    }

    /// Calls `f` for every point within `sqrt(max_dist_sq)` of `pos` (inclusive), scanning
    /// the 3x3x3 block of cells around it. The point itself is reported too when it is
    /// part of the grid.
    ///
    /// Correct only when `sqrt(max_dist_sq)` does not exceed the cell size.
    pub fn for_each_neighbor<F>(&self, pos: Vec3, max_dist_sq: f64, positions: &[Vec3], mut f: F)
    where
        F: FnMut(usize),
    {
        let [cx, cy, cz] = self.cell_of(pos);
        for dz in -1..=1i64 {
            for dy in -1..=1i64 {
                for dx in -1..=1i64 {
                    let key = [cx.saturating_add(dx), cy.saturating_add(dy), cz.saturating_add(dz)];
                    for &neighbor_idx in self.cell_members(key) {
                        if pos.distance_squared(positions[neighbor_idx]) <= max_dist_sq {
                            f(neighbor_idx);
                        }
                    }
                }
            }
        }
    }

    /// For every point, the sorted indices of all points within `radius`, itself included.
    pub fn neighbors_within(&self, positions: &[Vec3], radius: f64) -> Vec<Vec<usize>> {
        let max_dist_sq = radius * radius;
        positions
            .iter()
            .map(|&pos| {
                let mut neighbors = Vec::new();
                self.for_each_neighbor(pos, max_dist_sq, positions, |j| neighbors.push(j));
                neighbors.sort_unstable();
                neighbors
            })
            .collect()
    }
}

/// Cell edge at which neighbors within `radius` are at most one cell apart after rounding.
pub fn covering_cell_size(positions: &[Vec3], radius: f64) -> f64 {
    if radius <= 0.0 {
        return 1.0;
    }
    let extent = positions
        .iter()
        .map(|p| p.x.abs().max(p.y.abs()).max(p.z.abs()))
        .fold(0.0, f64::max);
    // `x * (1 / edge)` is off by at most ~2 ulp of `x / edge` per point.
    radius * (1.0 + CELL_SLACK) + 8.0 * f64::EPSILON * extent
}

#[inline(always)]
fn cell_key(pos: Vec3, inv_cell_size: f64) -> CellKey {
    // `as` saturates, so far-away points share the outermost cells instead of wrapping.
    [
        (pos.x * inv_cell_size).floor() as i64,
        (pos.y * inv_cell_size).floor() as i64,
        (pos.z * inv_cell_size).floor() as i64,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn brute_force(positions: &[Vec3], radius: f64) -> Vec<Vec<usize>> {
        positions
            .iter()
            .map(|&p| {
                (0..positions.len())
                    .filter(|&j| p.distance_squared(positions[j]) <= radius * radius)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn matches_brute_force_on_random_points() {
        let mut rng = StdRng::seed_from_u64(7);
        let positions: Vec<Vec3> = (0..400)
            .map(|_| {
                Vec3::new(
                    rng.random_range(-50.0..50.0),
                    rng.random_range(-50.0..50.0),
                    rng.random_range(-5.0..5.0),
                )
            })
            .collect();
        for radius in [0.5, 3.0, 12.0] {
            let grid = SpatialGrid::build(&positions, radius);
            assert_eq!(grid.neighbors_within(&positions, radius), brute_force(&positions, radius));
        }
    }

    #[test]
    fn boundary_distance_is_inclusive() {
        let positions = vec![Vec3::zero(), Vec3::new(2.0, 0.0, 0.0), Vec3::new(4.5, 0.0, 0.0)];
        let grid = SpatialGrid::build(&positions, 2.0);
        let neighbors = grid.neighbors_within(&positions, 2.0);
        assert_eq!(neighbors[0], vec![0, 1]);
        assert_eq!(neighbors[1], vec![0, 1]);
        assert_eq!(neighbors[2], vec![2]);
    }

    #[test]
    fn pair_at_exactly_the_radius_is_found_despite_rounding() {
        let radius = 11039.311260583301;
        let positions = vec![Vec3::new(22078.622521166602, 0.0, 0.0), Vec3::new(33117.9337817499, 0.0, 0.0)];
        assert!(positions[0].distance_squared(positions[1]) <= radius * radius);

        let grid = SpatialGrid::for_radius(&positions, radius);
        let neighbors = grid.neighbors_within(&positions, radius);
        assert_eq!(neighbors[0], vec![0, 1]);
        assert_eq!(neighbors[1], vec![0, 1]);
    }

    #[test]
    fn covering_cell_size_pads_the_radius() {
        let positions = vec![Vec3::new(1e9, -2e9, 0.0)];
        let edge = covering_cell_size(&positions, 100.0);
        assert!(edge > 100.0);
        assert!(edge < 100.0 * (1.0 + 1e-6));
        assert_eq!(covering_cell_size(&positions, 0.0), 1.0);
    }

    #[test]
    fn matches_brute_force_on_lattice_spacings() {
        // Points on multiples of the radius sit on cell faces, the worst case for rounding.
        let radius = 0.1;
        let positions: Vec<Vec3> = (0..2000).map(|i| Vec3::new(i as f64 * radius, 0.0, 0.0)).collect();
        let grid = SpatialGrid::for_radius(&positions, radius);
        assert_eq!(grid.neighbors_within(&positions, radius), brute_force(&positions, radius));
    }

    #[test]
    fn coincident_points_share_a_cell() {
        let p = Vec3::new(-3.5, 1.25, 9.0);
        let positions = vec![p, p, Vec3::new(100.0, 0.0, 0.0)];
        let grid = SpatialGrid::build(&positions, 1.0);
        assert_eq!(grid.occupied_cells(), 2);
        assert_eq!(grid.cell_members(grid.cell_of(p)), &[0, 1]);
        assert_eq!(grid.neighbors_within(&positions, 0.0)[1], vec![0, 1]);
    }
}
