//! The per-time-step FEM grid: a collapsed 3D mesh spanning the active
//! layers, its depth and DOF vectors and, for the pressure grid, the
//! included-node flags.
//!
//! The grid is rebuilt fresh each time step by stacking the active segment
//! counts of every active layer and inserting one shared boundary node
//! between adjacent layers. Two grids coexist in coupled mode: the
//! pressure grid (sediments only) and the temperature grid (sediments and
//! basement).

use ndarray::{Array2, Array3};

use crate::error::SimulationError;
use crate::grid::{all_reduce_max, LayeredGrid, MapGrid};
use crate::layer::{
    layer_indices, ActivityFilter, Direction, FundamentalProperty, InsertMode, Layer, LayerRange,
};
use crate::DEPOSITING_THICKNESS_TOLERANCE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeshScope {
    SedimentsOnly,
    BasementAndSediments,
}

impl MeshScope {
    fn layer_range(self) -> LayerRange {
        match self {
            MeshScope::SedimentsOnly => LayerRange::SedimentsOnly,
            MeshScope::BasementAndSediments => LayerRange::BasementAndSediments,
        }
    }
}

/// The nodes a layer contributes to the global grid: its bottom node sits
/// at `k_start`, its top node at `k_start + segments`. Adjacent layers
/// share the boundary node.
#[derive(Clone, Copy, Debug)]
pub struct LayerSpan {
    pub layer_index: usize,
    pub k_start: usize,
    pub segments: usize,
}

pub struct FemGrid {
    pub grid: LayeredGrid,
    pub scope: MeshScope,
    /// Ascending from the bottom of the stack.
    pub spans: Vec<LayerSpan>,
    pub depths: Array3<f64>,
    /// DOF index per node. A node at the top of a zero-thickness stack
    /// carries the DOF of the top non-zero-thickness node above it.
    pub dofs: Array3<i64>,
    /// Pressure grid only: 1.0 where the node belongs to a normal element.
    pub node_included: Option<Array3<f64>>,
    /// Longest run of zero-thickness segments anywhere in the active mesh;
    /// widens the z stencil of the Jacobian.
    pub stencil_width: usize,
}

impl FemGrid {
    /// Stack the active layers into a fresh global grid. Fails when the
    /// basin has no active segments at this age.
    pub fn build(
        layers: &[Layer],
        scope: MeshScope,
        age: f64,
        map: &MapGrid,
    ) -> Result<FemGrid, SimulationError> {
        let indices = layer_indices(
            layers,
            Direction::Ascending,
            scope.layer_range(),
            ActivityFilter::ActiveOnly,
            age,
        );
        let mut spans = Vec::with_capacity(indices.len());
        let mut segment_total = 0usize;
        for index in indices {
            let segments = layers[index].nr_of_active_segments();
            spans.push(LayerSpan {
                layer_index: index,
                k_start: segment_total,
                segments,
            });
            segment_total += segments;
        }
        if segment_total == 0 {
            return Err(SimulationError::InputInconsistency(
                "no active segments".to_string(),
            ));
        }
        let grid = map.layered(segment_total + 1)?;
        let depths = grid.create_vector();
        let dofs = grid.create_dof_vector();
        Ok(FemGrid {
            grid,
            scope,
            spans,
            depths,
            dofs,
            node_included: None,
            stencil_width: 0,
        })
    }

    pub fn nz(&self) -> usize {
        self.grid.nz
    }

    /// Total number of nodes in the rectangular mesh. This may differ from
    /// the number of nodes of the true FEM mesh: collapsed stacks share
    /// DOFs.
    pub fn node_count(&self) -> usize {
        self.grid.node_count()
    }

    /// Map a global node to its owning layer and the layer-local k.
    /// Boundary nodes belong to the lower layer (its top node).
    pub fn node_to_span(&self, k: usize) -> (usize, usize) {
        for span in &self.spans {
            if k <= span.k_start + span.segments {
                return (span.layer_index, k - span.k_start);
            }
        }
        let last = self.spans.last().expect("fem grid has at least one span");
        (last.layer_index, last.segments)
    }

    /// Copy the depths from all active layers into the global depth
    /// vector. Used solely to enumerate the DOF array.
    pub fn set_depths(&mut self, layers: &mut [Layer], valid_needle: &Array2<bool>) {
        let (ny, nx) = valid_needle.dim();
        for span in &self.spans {
            let layer = &mut layers[span.layer_index];
            layer
                .current
                .activate(FundamentalProperty::Depth, InsertMode::Insert, false);
            for j in 0..ny {
                for i in 0..nx {
                    if !valid_needle[[j, i]] {
                        continue;
                    }
                    for k_local in 0..=span.segments {
                        self.depths[[span.k_start + k_local, j, i]] =
                            layer.current.value(FundamentalProperty::Depth, k_local, j, i);
                    }
                }
            }
            layer.current.restore(FundamentalProperty::Depth);
        }
    }

    /// Assign DOF numbers top-down, folding zero-thickness stacks onto the
    /// node above, and compute the stencil width as the all-reduced MAX of
    /// the worst collapse run.
    pub fn set_dofs(&mut self, valid_needle: &Array2<bool>) {
        let nz = self.nz();
        let (ny, nx) = valid_needle.dim();
        let mut max_collapsed: i64 = 0;
        for j in 0..ny {
            for i in 0..nx {
                if !valid_needle[[j, i]] {
                    for k in 0..nz {
                        self.dofs[[k, j, i]] = k as i64;
                    }
                    continue;
                }
                for k in (0..nz).rev() {
                    if k == nz - 1 {
                        self.dofs[[k, j, i]] = k as i64;
                    } else {
                        let dz = self.depths[[k, j, i]] - self.depths[[k + 1, j, i]];
                        if dz < DEPOSITING_THICKNESS_TOLERANCE {
                            self.dofs[[k, j, i]] = self.dofs[[k + 1, j, i]];
                            max_collapsed = max_collapsed.max(self.dofs[[k + 1, j, i]] - k as i64);
                        } else {
                            self.dofs[[k, j, i]] = k as i64;
                        }
                    }
                }
            }
        }
        self.stencil_width = all_reduce_max(max_collapsed as f64) as usize;
    }

    /// Walk the map elements of every active sediment layer and mark the
    /// DOFs of the corners of *normal* elements as included. An element is
    /// normal when at least one of its four vertical segments has positive
    /// solid thickness and the lithology has positive surface porosity. The
    /// included flag of a zero-thickness node is the flag of its shared DOF
    /// above, which is the node this walk marks.
    pub fn set_real_nodes(&mut self, layers: &mut [Layer], valid_needle: &Array2<bool>) {
        let (ny, nx) = valid_needle.dim();
        let mut included = self.grid.create_vector();
        for span in &self.spans {
            let layer = &mut layers[span.layer_index];
            if !layer.is_sediment() {
                continue;
            }
            layer
                .current
                .activate(FundamentalProperty::SolidThickness, InsertMode::Insert, true);
            // Loop over the elements of the active portion: segments, not
            // nodes, hence one fewer than the node count.
            for k_local in 0..span.segments {
                for ej in 0..ny.saturating_sub(1) {
                    for ei in 0..nx.saturating_sub(1) {
                        let corners = [(ei, ej), (ei + 1, ej), (ei + 1, ej + 1), (ei, ej + 1)];
                        if corners.iter().any(|&(ci, cj)| !valid_needle[[cj, ci]]) {
                            continue;
                        }
                        let lithology_porosity =
                            layer.lithology(corners[0].0, corners[0].1).surface_porosity();
                        let mut normal_element = false;
                        for &(ci, cj) in &corners {
                            let mut thickness = layer
                                .current
                                .value(FundamentalProperty::SolidThickness, k_local, cj, ci);
                            if thickness == crate::IBS_NO_DATA_VALUE {
                                thickness = 0.0;
                            }
                            normal_element = normal_element || thickness > 0.0;
                        }
                        normal_element = normal_element && lithology_porosity > 0.0;
                        if !normal_element {
                            continue;
                        }
                        for node in 0..8 {
                            // First four element corners are the top nodes.
                            let z = span.k_start + k_local + usize::from(node < 4);
                            let (ci, cj) = corners[node % 4];
                            let dof = self.dofs[[z, cj, ci]];
                            let z_owner = if dof == z as i64 { z } else { dof as usize };
                            included[[z_owner, cj, ci]] = 1.0;
                        }
                    }
                }
            }
            layer.current.restore(FundamentalProperty::SolidThickness);
        }
        self.node_included = Some(included);
    }

    /// Included flag of a node, resolved through its DOF owner.
    pub fn node_is_included(&self, k: usize, j: usize, i: usize) -> bool {
        match &self.node_included {
            Some(included) => {
                let dof = self.dofs[[k, j, i]] as usize;
                included[[dof, j, i]] > 0.0
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lithology::{CompoundLithology, FluidType, SimpleLithology};
    use crate::layer::LayerKind;
    use ndarray::Array2;

    fn build_two_layer_mesh(zero_column: Option<(usize, usize)>) -> (Vec<Layer>, FemGrid, Array2<bool>) {
        let map = MapGrid::new(3, 3, 0.0, 0.0, 100.0, 100.0).unwrap();
        let valid = Array2::from_elem((3, 3), true);
        let mut lower = Layer::new(
            "Lower",
            LayerKind::Sediment,
            30.0,
            20.0,
            2,
            CompoundLithology::uniform(SimpleLithology::standard_sandstone()),
            FluidType::standard_water(),
            Array2::from_elem((3, 3), 100.0),
            &map,
        );
        let mut upper = Layer::new(
            "Upper",
            LayerKind::Sediment,
            20.0,
            10.0,
            2,
            CompoundLithology::uniform(SimpleLithology::standard_sandstone()),
            FluidType::standard_water(),
            Array2::from_elem((3, 3), 100.0),
            &map,
        );
        lower.find_active_segments(0.0);
        upper.find_active_segments(0.0);

        // Hand-laid depths: 50 m per segment, surface at 0.
        for layer_state in [(&mut upper, 0.0), (&mut lower, 100.0)] {
            let (layer, top) = layer_state;
            for j in 0..3 {
                for i in 0..3 {
                    for k in 0..=2 {
                        // k = 0 bottom, k = 2 top of the layer.
                        let depth = top + 50.0 * (2 - k) as f64;
                        layer.current.set(FundamentalProperty::Depth, k, j, i, depth);
                        layer
                            .current
                            .set(FundamentalProperty::SolidThickness, k.min(1), j, i, 40.0);
                    }
                }
            }
        }
        if let Some((zi, zj)) = zero_column {
            // Collapse the lower formation at one column: its nodes all sit
            // at the depth of its top.
            for k in 0..=2 {
                lower
                    .current
                    .set(FundamentalProperty::Depth, k, zj, zi, 100.0);
                if k < 2 {
                    lower
                        .current
                        .set(FundamentalProperty::SolidThickness, k, zj, zi, 0.0);
                }
            }
        }

        let layers = vec![lower, upper];
        let mut fem = FemGrid::build(&layers, MeshScope::SedimentsOnly, 0.0, &map).unwrap();
        let mut layers = layers;
        fem.set_depths(&mut layers, &valid);
        fem.set_dofs(&valid);
        (layers, fem, valid)
    }

    #[test]
    fn spans_share_the_boundary_node() {
        let (_, fem, _) = build_two_layer_mesh(None);
        assert_eq!(fem.nz(), 5);
        assert_eq!(fem.spans[0].k_start, 0);
        assert_eq!(fem.spans[1].k_start, 2);
        assert_eq!(fem.node_to_span(2).0, fem.spans[0].layer_index);
    }

    #[test]
    fn dofs_are_identity_without_collapses() {
        let (_, fem, _) = build_two_layer_mesh(None);
        for k in 0..5 {
            assert_eq!(fem.dofs[[k, 1, 1]], k as i64);
        }
        assert_eq!(fem.stencil_width, 0);
    }

    #[test]
    fn zero_thickness_stack_shares_the_dof_above() {
        let (_, fem, _) = build_two_layer_mesh(Some((1, 1)));
        // Lower formation collapsed at (1,1): nodes 0..=2 all at 100 m, so
        // nodes 0 and 1 inherit the DOF of node 2.
        assert_eq!(fem.dofs[[2, 1, 1]], 2);
        assert_eq!(fem.dofs[[1, 1, 1]], 2);
        assert_eq!(fem.dofs[[0, 1, 1]], 2);
        // DOF idempotence: node 2 owns the whole run above it.
        assert_eq!(fem.stencil_width, 2);
        // Untouched column keeps identity DOFs.
        assert_eq!(fem.dofs[[0, 0, 0]], 0);
    }

    #[test]
    fn real_nodes_mark_corners_of_normal_elements() {
        let (mut layers, mut fem, valid) = build_two_layer_mesh(Some((1, 1)));
        fem.set_real_nodes(&mut layers, &valid);
        // Surface node of a normal element is included.
        assert!(fem.node_is_included(4, 0, 0));
        // Phantom node resolves through its shared DOF above.
        assert!(fem.node_is_included(0, 1, 1) == fem.node_is_included(2, 1, 1));
    }

    #[test]
    fn build_fails_with_no_active_segments() {
        let map = MapGrid::new(3, 3, 0.0, 0.0, 100.0, 100.0).unwrap();
        let mut layer = Layer::new(
            "Lower",
            LayerKind::Sediment,
            30.0,
            20.0,
            2,
            CompoundLithology::uniform(SimpleLithology::standard_sandstone()),
            FluidType::standard_water(),
            Array2::from_elem((3, 3), 100.0),
            &map,
        );
        layer.find_active_segments(40.0);
        let layers = vec![layer];
        assert!(FemGrid::build(&layers, MeshScope::SedimentsOnly, 40.0, &map).is_err());
    }
}
