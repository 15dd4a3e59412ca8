//! Exact Jacobian preallocation from the DOF map and the stencil widths.
//!
//! Two phases over the same traversal: first count the nonzeros of every
//! owned row, then insert the structural zeros. Both phases obtain their
//! column lists from one shared routine so the skip conditions cannot
//! drift apart. Rows belonging to invalid columns or to phantom nodes in a
//! zero-thickness stack carry exactly one nonzero.

use ndarray::Array2;
use sprs::CsMat;

use crate::error::SimulationError;
use crate::mesh::FemGrid;

/// Per-row nonzero counts, split into owned (diagonal block) and non-owned
/// (off-diagonal block) columns. On one subdomain every column is owned.
#[derive(Clone, Debug)]
pub struct PreallocationCounts {
    pub diagonal: Vec<usize>,
    pub off_diagonal: Vec<usize>,
}

impl PreallocationCounts {
    pub fn row_total(&self, row: usize) -> usize {
        self.diagonal[row] + self.off_diagonal[row]
    }
}

/// The preallocated sparse Jacobian: CSR with a frozen nonzero pattern.
/// Assembly adds into existing entries only. The row pointers are kept
/// alongside the matrix for direct entry addressing.
pub struct Jacobian {
    mat: CsMat<f64>,
    row_pointers: Vec<usize>,
}

impl Jacobian {
    pub fn rows(&self) -> usize {
        self.mat.rows()
    }

    pub fn nnz(&self) -> usize {
        self.mat.nnz()
    }

    pub fn zero_entries(&mut self) {
        for value in self.mat.data_mut() {
            *value = 0.0;
        }
    }

    fn nnz_index(&self, row: usize, col: usize) -> Option<usize> {
        let start = self.row_pointers[row];
        let end = self.row_pointers[row + 1];
        let indices = &self.mat.indices()[start..end];
        indices.binary_search(&col).ok().map(|offset| start + offset)
    }

    /// Additive insertion; the structural pattern must contain the entry.
    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        match self.nnz_index(row, col) {
            Some(index) => self.mat.data_mut()[index] += value,
            None => debug_assert!(false, "entry ({row}, {col}) outside the preallocated pattern"),
        }
    }

    /// Overwriting insertion.
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        match self.nnz_index(row, col) {
            Some(index) => self.mat.data_mut()[index] = value,
            None => debug_assert!(false, "entry ({row}, {col}) outside the preallocated pattern"),
        }
    }

    pub fn matrix(&self) -> &CsMat<f64> {
        &self.mat
    }
}

/// Column list of one owned row. Shared by the counting and the insertion
/// phases; the two must remain identical, the runtime checks nothing.
fn stencil_columns(
    fem: &FemGrid,
    valid_needle: &Array2<bool>,
    s: usize,
    i: usize,
    j: usize,
    k: usize,
    cols: &mut Vec<usize>,
) {
    cols.clear();
    let nx = fem.grid.map.nx;
    let ny = fem.grid.map.ny;
    let nz = fem.nz();
    let grid = &fem.grid;
    let s = s as i64;

    if !valid_needle[[j, i]] || fem.dofs[[k, j, i]] != k as i64 {
        // Dirichlet-like row reflecting the node onto its DOF owner.
        cols.push(grid.node_index(i, j, k));
        return;
    }

    // Nearest self-owned DOF below this one; the collapse run widens the
    // stencil downwards.
    let mut k_start_self = k;
    loop {
        if k_start_self == 0 {
            break;
        }
        k_start_self -= 1;
        if fem.dofs[[k_start_self, j, i]] == k_start_self as i64 {
            break;
        }
    }

    let i_start = (-s).max(-(i as i64));
    let i_end = s.min((nx - i - 1) as i64);
    let j_start = (-s).max(-(j as i64));
    let j_end = s.min((ny - j - 1) as i64);
    let k_start = (-((k - k_start_self) as i64)).max(-(k as i64));
    let k_end = s.min((nz - k - 1) as i64);

    for ii in i_start..=i_end {
        for jj in j_start..=j_end {
            for kk in k_start..=k_end {
                let ni = (i as i64 + ii) as usize;
                let nj = (j as i64 + jj) as usize;
                let nk = (k as i64 + kk) as usize;
                if !valid_needle[[nj, ni]] {
                    let true_kk = kk;
                    cols.push(grid.node_index(ni, nj, (k as i64 + true_kk) as usize));
                } else {
                    // Box stencil: a phantom neighbour below duplicates an
                    // entry already produced by the collapse, skip it.
                    if fem.dofs[[nk, nj, ni]] != nk as i64 && kk < 0 {
                        continue;
                    }
                    let true_kk = fem.dofs[[nk, nj, ni]] - fem.dofs[[k, j, i]];
                    cols.push(grid.node_index(ni, nj, (k as i64 + true_kk) as usize));
                }
            }
        }
    }
    cols.sort_unstable();
    cols.dedup();
}

/// Phase one: exact per-row nonzero counts.
pub fn preallocation_counts(
    fem: &FemGrid,
    valid_needle: &Array2<bool>,
    stencil: usize,
) -> PreallocationCounts {
    let n = fem.node_count();
    let mut counts = PreallocationCounts {
        diagonal: vec![0; n],
        off_diagonal: vec![0; n],
    };
    let mut cols = Vec::new();
    let nx = fem.grid.map.nx;
    let ny = fem.grid.map.ny;
    for i in 0..nx {
        for j in 0..ny {
            for k in 0..fem.nz() {
                stencil_columns(fem, valid_needle, stencil, i, j, k, &mut cols);
                let row = fem.grid.node_index(i, j, k);
                // One subdomain: every column is in the diagonal block.
                counts.diagonal[row] = cols.len();
            }
        }
    }
    counts
}

/// Phase two on top of phase one: size the matrix exactly, then insert the
/// structural zeros through the same traversal.
pub fn create_matrix_structure(
    fem: &FemGrid,
    valid_needle: &Array2<bool>,
    stencil: usize,
) -> Result<Jacobian, SimulationError> {
    let n = fem.node_count();
    let counts = preallocation_counts(fem, valid_needle, stencil);

    let mut indptr = Vec::with_capacity(n + 1);
    indptr.push(0usize);
    let mut running = 0usize;
    for row in 0..n {
        running += counts.row_total(row);
        indptr.push(running);
    }
    let mut indices = vec![0usize; running];
    let data = vec![0.0f64; running];

    let mut cols = Vec::new();
    let nx = fem.grid.map.nx;
    let ny = fem.grid.map.ny;
    for i in 0..nx {
        for j in 0..ny {
            for k in 0..fem.nz() {
                stencil_columns(fem, valid_needle, stencil, i, j, k, &mut cols);
                let row = fem.grid.node_index(i, j, k);
                if cols.len() != counts.row_total(row) {
                    return Err(SimulationError::Grid(format!(
                        "preallocation mismatch on row {row}: counted {} but inserting {}",
                        counts.row_total(row),
                        cols.len()
                    )));
                }
                indices[indptr[row]..indptr[row + 1]].copy_from_slice(&cols);
            }
        }
    }

    let row_pointers = indptr.clone();
    let mat = CsMat::new((n, n), indptr, indices, data);
    Ok(Jacobian { mat, row_pointers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::MapGrid;
    use crate::layer::{FundamentalProperty, Layer, LayerKind};
    use crate::lithology::{CompoundLithology, FluidType, SimpleLithology};
    use crate::mesh::MeshScope;
    use ndarray::Array2;

    fn single_layer_mesh(collapse_column: Option<(usize, usize)>) -> (FemGrid, Array2<bool>) {
        let map = MapGrid::new(3, 3, 0.0, 0.0, 100.0, 100.0).unwrap();
        let valid = Array2::from_elem((3, 3), true);
        let mut layer = Layer::new(
            "Sand",
            LayerKind::Sediment,
            20.0,
            10.0,
            3,
            CompoundLithology::uniform(SimpleLithology::standard_sandstone()),
            FluidType::standard_water(),
            Array2::from_elem((3, 3), 150.0),
            &map,
        );
        layer.find_active_segments(0.0);
        for j in 0..3 {
            for i in 0..3 {
                for k in 0..=3 {
                    let depth = 50.0 * (3 - k) as f64;
                    layer.current.set(FundamentalProperty::Depth, k, j, i, depth);
                }
            }
        }
        if let Some((ci, cj)) = collapse_column {
            for k in 0..=3 {
                layer.current.set(FundamentalProperty::Depth, k, cj, ci, 0.0);
            }
        }
        let mut layers = vec![layer];
        let mut fem = FemGrid::build(&layers, MeshScope::SedimentsOnly, 0.0, &map).unwrap();
        fem.set_depths(&mut layers, &valid);
        fem.set_dofs(&valid);
        (fem, valid)
    }

    #[test]
    fn interior_row_of_a_regular_mesh_has_a_full_box_stencil() {
        let (fem, valid) = single_layer_mesh(None);
        let counts = preallocation_counts(&fem, &valid, 1);
        // Node (1,1,1): 3x3x3 box entirely inside the mesh.
        let row = fem.grid.node_index(1, 1, 1);
        assert_eq!(counts.diagonal[row], 27);
        assert_eq!(counts.off_diagonal[row], 0);
        // Corner node (0,0,0): 2x2x2 box.
        let corner = fem.grid.node_index(0, 0, 0);
        assert_eq!(counts.diagonal[corner], 8);
    }

    #[test]
    fn collapsed_rows_carry_exactly_one_nonzero() {
        let (fem, valid) = single_layer_mesh(Some((1, 1)));
        // Column (1,1) fully collapsed: nodes 0..=2 are phantoms.
        let counts = preallocation_counts(&fem, &valid, 1);
        for k in 0..3 {
            let row = fem.grid.node_index(1, 1, k);
            assert_eq!(counts.row_total(row), 1, "phantom row at k={k}");
        }
        // The DOF-owning node at the top still couples to neighbours.
        let owner = fem.grid.node_index(1, 1, 3);
        assert!(counts.row_total(owner) > 1);
    }

    #[test]
    fn invalid_columns_get_dirichlet_rows() {
        let (fem, mut valid) = single_layer_mesh(None);
        valid[[0, 2]] = false;
        let counts = preallocation_counts(&fem, &valid, 1);
        for k in 0..fem.nz() {
            let row = fem.grid.node_index(2, 0, k);
            assert_eq!(counts.row_total(row), 1);
        }
    }

    #[test]
    fn both_passes_agree_and_the_matrix_is_usable() {
        let (fem, valid) = single_layer_mesh(Some((1, 1)));
        let mut jacobian = create_matrix_structure(&fem, &valid, 1).unwrap();
        let counts = preallocation_counts(&fem, &valid, 1);
        let expected: usize = (0..fem.node_count()).map(|r| counts.row_total(r)).sum();
        assert_eq!(jacobian.nnz(), expected);

        // Entries inside the pattern are writable.
        let row = fem.grid.node_index(1, 1, 3);
        jacobian.set(row, row, 2.5);
        jacobian.add(row, row, 0.5);
        assert_eq!(jacobian.matrix().get(row, row), Some(&3.0));
        jacobian.zero_entries();
        assert_eq!(jacobian.matrix().get(row, row), Some(&0.0));
    }
}
