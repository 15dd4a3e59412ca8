//! Distributed-grid abstraction: a 2D map grid over the basin area and a 3D
//! layered grid stacked on top of it. Iteration is always expressed in
//! global indices; bounds checks are the caller's responsibility.
//!
//! The decomposition here is the one-subdomain realisation of the SPMD
//! design: the local (owned) range equals the global range, the ghost range
//! equals the local range, ghost exchange is the identity and the
//! collective reductions return their input. Call sites keep the collective
//! program order, so a multi-rank backend can be substituted without
//! touching them.

use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

use crate::error::SimulationError;

/// Owned corner ranges of the 2D map grid, global indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Corners2 {
    pub x_start: usize,
    pub y_start: usize,
    pub x_count: usize,
    pub y_count: usize,
}

/// Owned corner ranges of a 3D layered grid, global indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Corners3 {
    pub x_start: usize,
    pub y_start: usize,
    pub z_start: usize,
    pub x_count: usize,
    pub y_count: usize,
    pub z_count: usize,
}

/// Direction of a ghost exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeDirection {
    /// Owned values propagate outward into neighbouring ghost regions.
    LocalToGhost,
    /// Ghost contributions reduce back onto the owners.
    GhostToLocal,
}

/// The regular 2D map grid: node counts, origin and spacing.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MapGrid {
    pub nx: usize,
    pub ny: usize,
    pub origin_x: f64,
    pub origin_y: f64,
    pub delta_x: f64,
    pub delta_y: f64,
}

impl MapGrid {
    pub fn new(
        nx: usize,
        ny: usize,
        origin_x: f64,
        origin_y: f64,
        delta_x: f64,
        delta_y: f64,
    ) -> Result<Self, SimulationError> {
        if nx < 2 || ny < 2 {
            return Err(SimulationError::Grid(format!(
                "map grid needs at least 2x2 nodes, got {nx}x{ny}"
            )));
        }
        if delta_x <= 0.0 || delta_y <= 0.0 {
            return Err(SimulationError::Grid(format!(
                "map grid spacing must be positive, got ({delta_x}, {delta_y})"
            )));
        }
        Ok(MapGrid {
            nx,
            ny,
            origin_x,
            origin_y,
            delta_x,
            delta_y,
        })
    }

    pub fn x_coordinate(&self, i: usize) -> f64 {
        self.origin_x + i as f64 * self.delta_x
    }

    pub fn y_coordinate(&self, j: usize) -> f64 {
        self.origin_y + j as f64 * self.delta_y
    }

    pub fn local_corners(&self) -> Corners2 {
        Corners2 {
            x_start: 0,
            y_start: 0,
            x_count: self.nx,
            y_count: self.ny,
        }
    }

    pub fn ghost_corners(&self) -> Corners2 {
        self.local_corners()
    }

    /// Allocate a map vector, (ny, nx) indexed `[[j, i]]`.
    pub fn create_map_vector(&self) -> Array2<f64> {
        Array2::zeros((self.ny, self.nx))
    }

    pub fn create_map_vector_filled(&self, value: f64) -> Array2<f64> {
        Array2::from_elem((self.ny, self.nx), value)
    }

    /// Build a layered grid over this map grid with caller-supplied `nz`.
    pub fn layered(&self, nz: usize) -> Result<LayeredGrid, SimulationError> {
        LayeredGrid::new(*self, nz)
    }
}

/// A 3D grid: the map grid in (x, y), `nz` fully-local nodes in z.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LayeredGrid {
    pub map: MapGrid,
    pub nz: usize,
}

impl LayeredGrid {
    pub fn new(map: MapGrid, nz: usize) -> Result<Self, SimulationError> {
        if nz == 0 {
            return Err(SimulationError::Grid(
                "layered grid needs at least one z node".to_string(),
            ));
        }
        Ok(LayeredGrid { map, nz })
    }

    pub fn local_corners(&self) -> Corners3 {
        Corners3 {
            x_start: 0,
            y_start: 0,
            z_start: 0,
            x_count: self.map.nx,
            y_count: self.map.ny,
            z_count: self.nz,
        }
    }

    pub fn ghost_corners(&self) -> Corners3 {
        self.local_corners()
    }

    pub fn node_count(&self) -> usize {
        self.map.nx * self.map.ny * self.nz
    }

    /// Natural ordering of a node: x fastest, then y, then z.
    pub fn node_index(&self, i: usize, j: usize, k: usize) -> usize {
        i + self.map.nx * (j + self.map.ny * k)
    }

    /// Allocate a grid vector, (nz, ny, nx) indexed `[[k, j, i]]`.
    pub fn create_vector(&self) -> Array3<f64> {
        Array3::zeros((self.nz, self.map.ny, self.map.nx))
    }

    pub fn create_vector_filled(&self, value: f64) -> Array3<f64> {
        Array3::from_elem((self.nz, self.map.ny, self.map.nx), value)
    }

    pub fn create_dof_vector(&self) -> Array3<i64> {
        Array3::zeros((self.nz, self.map.ny, self.map.nx))
    }
}

/// Exchange ghost values of a map vector. Identity on one subdomain; the
/// call marks a collective suspension point.
pub fn exchange_map_ghosts(_grid: &MapGrid, _vector: &mut Array2<f64>, _dir: ExchangeDirection) {}

/// Exchange ghost values of a grid vector. Identity on one subdomain.
pub fn exchange_grid_ghosts(
    _grid: &LayeredGrid,
    _vector: &mut Array3<f64>,
    _dir: ExchangeDirection,
) {
}

/// Collective MAX reduction over all ranks.
pub fn all_reduce_max(local: f64) -> f64 {
    local
}

/// Collective MIN reduction over all ranks.
pub fn all_reduce_min(local: f64) -> f64 {
    local
}

/// Collective SUM reduction over all ranks.
pub fn all_reduce_sum(local: f64) -> f64 {
    local
}

/// Collective MIN over an int; used for AND-reducing convergence flags
/// (`true` maps to 1, any rank at 0 wins).
pub fn all_reduce_min_int(local: i32) -> i32 {
    local
}

/// Rank of this process within the collective.
pub fn rank() -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_grid_rejects_degenerate_extents() {
        assert!(MapGrid::new(1, 3, 0.0, 0.0, 100.0, 100.0).is_err());
        assert!(MapGrid::new(3, 3, 0.0, 0.0, 0.0, 100.0).is_err());
        assert!(MapGrid::new(3, 3, 0.0, 0.0, 100.0, 100.0).is_ok());
    }

    #[test]
    fn layered_grid_node_index_is_x_fastest() {
        let map = MapGrid::new(4, 3, 0.0, 0.0, 100.0, 100.0).unwrap();
        let grid = map.layered(5).unwrap();
        assert_eq!(grid.node_index(0, 0, 0), 0);
        assert_eq!(grid.node_index(1, 0, 0), 1);
        assert_eq!(grid.node_index(0, 1, 0), 4);
        assert_eq!(grid.node_index(0, 0, 1), 12);
        assert_eq!(grid.node_count(), 60);
    }

    #[test]
    fn local_and_ghost_corners_coincide_on_one_subdomain() {
        let map = MapGrid::new(6, 4, 0.0, 0.0, 50.0, 50.0).unwrap();
        assert_eq!(map.local_corners(), map.ghost_corners());
        let grid = map.layered(3).unwrap();
        assert_eq!(grid.local_corners(), grid.ghost_corners());
    }
}
