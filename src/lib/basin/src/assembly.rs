//! Residual and Jacobian assembly for the overpressure and temperature
//! equations over the collapsed FEM grid.
//!
//! Assembly walks needles node by node. DOF-owning interior nodes get a
//! finite-volume balance: vertical Darcy (or Fourier) conductances to the
//! nearest distinct-DOF neighbours, lateral conductances across the map
//! stencil, a storage term against the previous time level and, for
//! temperature, the heat-production source. The lithostatic-load coupling
//! of the pressure equation lives entirely in the compaction integrators,
//! which rebuild the pressure chain from the overpressure iterate. Phantom
//! nodes in zero-thickness stacks get a single-entry reflection row onto
//! their DOF owner; invalid columns and boundary nodes get scaled
//! Dirichlet rows.

use nalgebra::DVector;
use ndarray::Array2;

use crate::grid::all_reduce_max;
use crate::layer::{FundamentalProperty, Layer};
use crate::mesh::FemGrid;
use crate::newton::NonlinearSystem;
use crate::prealloc::Jacobian;
use crate::project::{BottomBoundaryCondition, ProjectHandle};
use crate::{
    CAULDRON_NO_DATA_VALUE, DIRICHLET_SCALING_VALUE, ELEMENT_SCALING, MEGAPA_TO_PA,
    MILLIDARCY_TO_M2, SECONDS_PER_MA,
};

type Prop = FundamentalProperty;

fn null_to(value: f64, fallback: f64) -> f64 {
    if value == CAULDRON_NO_DATA_VALUE || value == crate::IBS_NO_DATA_VALUE {
        fallback
    } else {
        value
    }
}

/// Read a fundamental property at a global FEM node.
pub fn node_value(fem: &FemGrid, layers: &[Layer], prop: Prop, k: usize, j: usize, i: usize) -> f64 {
    let (layer_index, k_local) = fem.node_to_span(k);
    layers[layer_index].current.value(prop, k_local, j, i)
}

fn node_value_previous(
    fem: &FemGrid,
    layers: &[Layer],
    prop: Prop,
    k: usize,
    j: usize,
    i: usize,
) -> f64 {
    let (layer_index, k_local) = fem.node_to_span(k);
    layers[layer_index].previous.value(prop, k_local, j, i)
}

/// Scatter a solution vector into the given property of the layer books.
/// Phantom nodes receive their DOF owner's value, and the boundary node
/// shared by two adjacent layers is written into both: the top of the
/// lower and the bottom of the upper.
pub fn scatter_solution(
    fem: &FemGrid,
    layers: &mut [Layer],
    valid_needle: &Array2<bool>,
    prop: Prop,
    solution: &DVector<f64>,
) {
    let (ny, nx) = valid_needle.dim();
    for span in &fem.spans {
        let layer = &mut layers[span.layer_index];
        for j in 0..ny {
            for i in 0..nx {
                if !valid_needle[[j, i]] {
                    continue;
                }
                for k_local in 0..=span.segments {
                    let k = span.k_start + k_local;
                    let dof = fem.dofs[[k, j, i]] as usize;
                    let value = solution[fem.grid.node_index(i, j, dof)];
                    layer.current.set(prop, k_local, j, i, value);
                }
            }
        }
    }
}

/// Gather the given property of the layer books into a solution vector.
pub fn gather_solution(
    fem: &FemGrid,
    layers: &[Layer],
    valid_needle: &Array2<bool>,
    prop: Prop,
    fallback: f64,
) -> DVector<f64> {
    let mut solution = DVector::zeros(fem.node_count());
    let (ny, nx) = valid_needle.dim();
    for j in 0..ny {
        for i in 0..nx {
            for k in 0..fem.nz() {
                let index = fem.grid.node_index(i, j, k);
                if valid_needle[[j, i]] {
                    solution[index] = null_to(node_value(fem, layers, prop, k, j, i), fallback);
                } else {
                    solution[index] = fallback;
                }
            }
        }
    }
    solution
}

/// Maximum change of a property against the previous time level over the
/// whole basin (all-reduced MAX), optionally restricted to source rocks.
pub fn maximum_property_difference(
    layers: &[Layer],
    valid_needle: &Array2<bool>,
    prop: Prop,
    source_rocks_only: bool,
    age: f64,
) -> f64 {
    let mut local_max: f64 = 0.0;
    for layer in layers {
        if !layer.is_active(age) {
            continue;
        }
        if source_rocks_only && !layer.is_source_rock {
            continue;
        }
        let nz = layer.segment_count + 1;
        for ((j, i), &valid) in valid_needle.indexed_iter() {
            if !valid {
                continue;
            }
            for k in 0..nz {
                let current = layer.current.value(prop, k, j, i);
                let previous = layer.previous.value(prop, k, j, i);
                if current == CAULDRON_NO_DATA_VALUE || previous == CAULDRON_NO_DATA_VALUE {
                    continue;
                }
                local_max = local_max.max((current - previous).abs());
            }
        }
    }
    all_reduce_max(local_max)
}

/// Fill undefined temperatures with the standard-gradient estimate so the
/// first assembly of a step has a full field to linearise around.
pub fn estimate_temperature(
    layers: &mut [Layer],
    project: &ProjectHandle,
    valid_needle: &Array2<bool>,
    current_time: f64,
) {
    for layer in layers.iter_mut() {
        if !layer.is_active(current_time) {
            continue;
        }
        let nz = layer.segment_count + 1;
        for ((j, i), &valid) in valid_needle.indexed_iter() {
            if !valid {
                continue;
            }
            let surface_temperature = project.sea_bottom_temperature_at(i, j, current_time);
            let surface_depth = project.sea_bottom_depth_at(i, j, current_time);
            for k in 0..nz {
                let temperature = layer.current.value(Prop::Temperature, k, j, i);
                if temperature != CAULDRON_NO_DATA_VALUE {
                    continue;
                }
                let depth = layer.current.value(Prop::Depth, k, j, i);
                let depth = if depth == CAULDRON_NO_DATA_VALUE {
                    surface_depth
                } else {
                    depth
                };
                layer.current.set(
                    Prop::Temperature,
                    k,
                    j,
                    i,
                    project.estimate_temperature_at_depth(depth, surface_temperature, surface_depth),
                );
            }
        }
    }
}

/// Vertical geometry of a DOF-owning node: the nearest distinct-DOF
/// neighbours and the element heights towards them.
struct VerticalNeighbours {
    below: Option<(usize, f64)>,
    above: Option<(usize, f64)>,
}

fn vertical_neighbours(fem: &FemGrid, k: usize, j: usize, i: usize) -> VerticalNeighbours {
    let depth_self = fem.depths[[k, j, i]];
    let mut below = None;
    let mut kb = k;
    while kb > 0 {
        kb -= 1;
        if fem.dofs[[kb, j, i]] == kb as i64 {
            let dz = fem.depths[[kb, j, i]] - depth_self;
            if dz > crate::DEPOSITING_THICKNESS_TOLERANCE {
                below = Some((kb, dz));
            }
            break;
        }
    }
    let mut above = None;
    let mut ka = k;
    while ka + 1 < fem.nz() {
        ka += 1;
        let owner = fem.dofs[[ka, j, i]] as usize;
        if owner != k {
            let dz = depth_self - fem.depths[[owner, j, i]];
            if dz > crate::DEPOSITING_THICKNESS_TOLERANCE {
                above = Some((owner, dz));
            }
            break;
        }
    }
    VerticalNeighbours { below, above }
}

/// The overpressure system. `store_solution` pushes the iterate into the
/// layer books and re-runs the compaction integrator, which is what makes
/// the next assembly see the updated geometry.
pub struct PressureSystem<'a> {
    pub layers: &'a mut [Layer],
    pub fem: &'a FemGrid,
    pub valid_needle: &'a Array2<bool>,
    pub project: &'a ProjectHandle,
    pub previous_time: f64,
    pub current_time: f64,
    pub geometric_loop: bool,
}

impl PressureSystem<'_> {
    /// Fluid conductance between two nodes, m^3 per MPa per Ma.
    fn vertical_conductance(&self, k0: usize, k1: usize, j: usize, i: usize, dz: f64) -> f64 {
        let (l0, kl0) = self.fem.node_to_span(k0);
        let (l1, kl1) = self.fem.node_to_span(k1);
        let perm0 = null_to(self.layers[l0].permeability_normal[[kl0, j, i]], 0.0).max(0.0);
        let perm1 = null_to(self.layers[l1].permeability_normal[[kl1, j, i]], 0.0).max(0.0);
        let perm = if perm0 + perm1 > 0.0 {
            2.0 * perm0 * perm1 / (perm0 + perm1)
        } else {
            0.0
        };
        let temperature = null_to(
            node_value(self.fem, self.layers, Prop::Temperature, k0, j, i),
            30.0,
        );
        let viscosity = self.layers[l0].fluid.viscosity(temperature);
        let area = self.fem.grid.map.delta_x * self.fem.grid.map.delta_y;
        (perm * MILLIDARCY_TO_M2 / viscosity) * (area / dz) * MEGAPA_TO_PA * SECONDS_PER_MA
    }

    fn lateral_conductance(&self, k: usize, j: usize, i: usize, nj: usize, ni: usize, dz: f64) -> f64 {
        let (l0, kl0) = self.fem.node_to_span(k);
        let perm0 = null_to(self.layers[l0].permeability_planar[[kl0, j, i]], 0.0).max(0.0);
        let perm1 = null_to(self.layers[l0].permeability_planar[[kl0, nj, ni]], 0.0).max(0.0);
        let perm = if perm0 + perm1 > 0.0 {
            2.0 * perm0 * perm1 / (perm0 + perm1)
        } else {
            0.0
        };
        let temperature = null_to(
            node_value(self.fem, self.layers, Prop::Temperature, k, j, i),
            30.0,
        );
        let viscosity = self.layers[l0].fluid.viscosity(temperature);
        let distance = if ni != i {
            self.fem.grid.map.delta_x
        } else {
            self.fem.grid.map.delta_y
        };
        let breadth = if ni != i {
            self.fem.grid.map.delta_y
        } else {
            self.fem.grid.map.delta_x
        };
        (perm * MILLIDARCY_TO_M2 / viscosity) * (breadth * dz / distance) * MEGAPA_TO_PA * SECONDS_PER_MA
    }

    /// Node pore volume and its storage coefficient, m^3 per MPa.
    fn storage(&self, k: usize, j: usize, i: usize, dz_node: f64) -> f64 {
        let (layer_index, k_local) = self.fem.node_to_span(k);
        let layer = &self.layers[layer_index];
        let porosity = null_to(layer.porosity[[k_local, j, i]], 0.1).clamp(0.0, 1.0);
        let area = self.fem.grid.map.delta_x * self.fem.grid.map.delta_y;
        let compressibility = layer.fluid.compressibility; // 1/MPa
        area * dz_node * porosity * compressibility
    }

    fn node_height(&self, neighbours: &VerticalNeighbours) -> f64 {
        let below = neighbours.below.map(|(_, dz)| dz).unwrap_or(0.0);
        let above = neighbours.above.map(|(_, dz)| dz).unwrap_or(0.0);
        (0.5 * (below + above)).max(crate::DEPOSITING_THICKNESS_TOLERANCE)
    }
}

impl NonlinearSystem for PressureSystem<'_> {
    fn equation_name(&self) -> &'static str {
        "pressure"
    }

    fn initial_solution(&self) -> DVector<f64> {
        gather_solution(self.fem, self.layers, self.valid_needle, Prop::Overpressure, 0.0)
    }

    fn assemble(
        &mut self,
        mut jacobian: Option<&mut Jacobian>,
        residual: &mut DVector<f64>,
        solution: &DVector<f64>,
    ) {
        let dt = (self.previous_time - self.current_time).max(crate::MINIMUM_PRESSURE_TIME_STEP);
        let (ny, nx) = self.valid_needle.dim();
        let nz = self.fem.nz();

        for j in 0..ny {
            for i in 0..nx {
                for k in 0..nz {
                    let row = self.fem.grid.node_index(i, j, k);

                    if !self.valid_needle[[j, i]] {
                        residual[row] = solution[row];
                        if let Some(jacobian) = jacobian.as_deref_mut() {
                            jacobian.set(row, row, 1.0);
                        }
                        continue;
                    }
                    let dof = self.fem.dofs[[k, j, i]] as usize;
                    if dof != k {
                        // Reflection onto the DOF owner.
                        let owner = self.fem.grid.node_index(i, j, dof);
                        residual[row] = solution[row] - solution[owner];
                        if let Some(jacobian) = jacobian.as_deref_mut() {
                            jacobian.set(row, row, 1.0);
                        }
                        continue;
                    }

                    // Surface nodes and excluded nodes carry zero
                    // overpressure.
                    if k == nz - 1 || !self.fem.node_is_included(k, j, i) {
                        residual[row] = DIRICHLET_SCALING_VALUE * solution[row];
                        if let Some(jacobian) = jacobian.as_deref_mut() {
                            jacobian.set(row, row, DIRICHLET_SCALING_VALUE);
                        }
                        continue;
                    }

                    let neighbours = vertical_neighbours(self.fem, k, j, i);
                    let dz_node = self.node_height(&neighbours);
                    let storage = self.storage(k, j, i, dz_node) / dt;
                    let previous = null_to(
                        node_value_previous(self.fem, self.layers, Prop::Overpressure, k, j, i),
                        0.0,
                    );

                    let mut diagonal = storage;
                    let mut flux = storage * (solution[row] - previous);

                    for (kn, dz) in [neighbours.below, neighbours.above].into_iter().flatten() {
                        let conductance = self.vertical_conductance(k, kn, j, i, dz);
                        let col = self.fem.grid.node_index(i, j, kn);
                        flux += conductance * (solution[row] - solution[col]);
                        diagonal += conductance;
                        if let Some(jacobian) = jacobian.as_deref_mut() {
                            jacobian.add(row, col, -conductance * ELEMENT_SCALING);
                        }
                    }

                    let lateral: [(i64, i64); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];
                    for (di, dj) in lateral {
                        let ni = i as i64 + di;
                        let nj = j as i64 + dj;
                        if ni < 0 || nj < 0 || ni >= nx as i64 || nj >= ny as i64 {
                            continue;
                        }
                        let (ni, nj) = (ni as usize, nj as usize);
                        if !self.valid_needle[[nj, ni]] {
                            continue;
                        }
                        let neighbour_dof = self.fem.dofs[[k, nj, ni]] as usize;
                        let conductance = self.lateral_conductance(k, j, i, nj, ni, dz_node);
                        let col = self.fem.grid.node_index(ni, nj, neighbour_dof);
                        flux += conductance * (solution[row] - solution[col]);
                        diagonal += conductance;
                        if let Some(jacobian) = jacobian.as_deref_mut() {
                            jacobian.add(row, col, -conductance * ELEMENT_SCALING);
                        }
                    }

                    residual[row] = flux * ELEMENT_SCALING;
                    if let Some(jacobian) = jacobian.as_deref_mut() {
                        jacobian.add(row, row, diagonal * ELEMENT_SCALING);
                    }
                }
            }
        }
    }

    fn store_solution(&mut self, solution: &DVector<f64>) {
        scatter_solution(self.fem, self.layers, self.valid_needle, Prop::Overpressure, solution);
        if self.geometric_loop {
            crate::geometric::compute_dependent_properties(
                self.layers,
                self.project,
                self.valid_needle,
                self.previous_time,
                self.current_time,
            );
        } else {
            crate::nongeometric::compute_dependent_properties(
                self.layers,
                self.project,
                self.valid_needle,
                self.previous_time,
                self.current_time,
            );
        }
    }
}

/// The temperature system over the sediments-and-basement grid.
pub struct TemperatureSystem<'a> {
    pub layers: &'a mut [Layer],
    pub fem: &'a FemGrid,
    pub valid_needle: &'a Array2<bool>,
    pub project: &'a ProjectHandle,
    pub previous_time: f64,
    pub current_time: f64,
    /// Steady state drops the storage term: the basement preheat.
    pub steady_state: bool,
}

impl TemperatureSystem<'_> {
    fn node_conductivity(&self, k: usize, j: usize, i: usize) -> f64 {
        let (layer_index, k_local) = self.fem.node_to_span(k);
        let layer = &self.layers[layer_index];
        let porosity = null_to(layer.porosity[[k_local, j, i]], 0.0).clamp(0.0, 1.0);
        let temperature = null_to(layer.current.value(Prop::Temperature, k_local, j, i), 30.0);
        let (normal, _planar) = layer.lithology(i, j).bulk_thermal_conductivity_np(
            porosity,
            temperature,
            layer.fluid.thermal_conductivity,
        );
        normal
    }

    fn thermal_conductance(&self, k0: usize, k1: usize, j: usize, i: usize, dz: f64) -> f64 {
        let c0 = self.node_conductivity(k0, j, i);
        let c1 = self.node_conductivity(k1, j, i);
        let conductivity = if c0 + c1 > 0.0 { 2.0 * c0 * c1 / (c0 + c1) } else { 0.0 };
        let area = self.fem.grid.map.delta_x * self.fem.grid.map.delta_y;
        conductivity * area / dz * SECONDS_PER_MA
    }

    fn heat_capacity_volume(&self, k: usize, j: usize, i: usize, dz_node: f64) -> f64 {
        let (layer_index, k_local) = self.fem.node_to_span(k);
        let layer = &self.layers[layer_index];
        let porosity = null_to(layer.porosity[[k_local, j, i]], 0.0).clamp(0.0, 1.0);
        let lithology = layer.lithology(i, j);
        let solid = lithology.density() * lithology.heat_capacity();
        let fluid = layer.fluid.standard_density * layer.fluid.heat_capacity;
        let volumetric = porosity * fluid + (1.0 - porosity) * solid;
        let area = self.fem.grid.map.delta_x * self.fem.grid.map.delta_y;
        volumetric * area * dz_node
    }

    fn heat_production(&self, k: usize, j: usize, i: usize, dz_node: f64) -> f64 {
        let (layer_index, k_local) = self.fem.node_to_span(k);
        let layer = &self.layers[layer_index];
        let porosity = null_to(layer.porosity[[k_local, j, i]], 0.0).clamp(0.0, 1.0);
        let area = self.fem.grid.map.delta_x * self.fem.grid.map.delta_y;
        // uW/m^3 to J/Ma.
        layer.lithology(i, j).bulk_heat_production(porosity) * 1.0e-6 * area * dz_node * SECONDS_PER_MA
    }
}

impl NonlinearSystem for TemperatureSystem<'_> {
    fn equation_name(&self) -> &'static str {
        "temperature"
    }

    fn initial_solution(&self) -> DVector<f64> {
        gather_solution(self.fem, self.layers, self.valid_needle, Prop::Temperature, 0.0)
    }

    fn assemble(
        &mut self,
        mut jacobian: Option<&mut Jacobian>,
        residual: &mut DVector<f64>,
        solution: &DVector<f64>,
    ) {
        let dt = (self.previous_time - self.current_time).max(crate::MINIMUM_PRESSURE_TIME_STEP);
        let (ny, nx) = self.valid_needle.dim();
        let nz = self.fem.nz();
        let area = self.fem.grid.map.delta_x * self.fem.grid.map.delta_y;

        for j in 0..ny {
            for i in 0..nx {
                for k in 0..nz {
                    let row = self.fem.grid.node_index(i, j, k);

                    if !self.valid_needle[[j, i]] {
                        residual[row] = solution[row];
                        if let Some(jacobian) = jacobian.as_deref_mut() {
                            jacobian.set(row, row, 1.0);
                        }
                        continue;
                    }
                    let dof = self.fem.dofs[[k, j, i]] as usize;
                    if dof != k {
                        let owner = self.fem.grid.node_index(i, j, dof);
                        residual[row] = solution[row] - solution[owner];
                        if let Some(jacobian) = jacobian.as_deref_mut() {
                            jacobian.set(row, row, 1.0);
                        }
                        continue;
                    }

                    if k == nz - 1 {
                        // Surface Dirichlet: the sea-bottom temperature.
                        let surface =
                            self.project.sea_bottom_temperature_at(i, j, self.current_time);
                        residual[row] = DIRICHLET_SCALING_VALUE * (solution[row] - surface);
                        if let Some(jacobian) = jacobian.as_deref_mut() {
                            jacobian.set(row, row, DIRICHLET_SCALING_VALUE);
                        }
                        continue;
                    }

                    if k == 0 {
                        if let BottomBoundaryCondition::FixedTemperature(basal) =
                            self.project.bottom_boundary
                        {
                            residual[row] = DIRICHLET_SCALING_VALUE * (solution[row] - basal);
                            if let Some(jacobian) = jacobian.as_deref_mut() {
                                jacobian.set(row, row, DIRICHLET_SCALING_VALUE);
                            }
                            continue;
                        }
                    }

                    let neighbours = vertical_neighbours(self.fem, k, j, i);
                    let below = neighbours.below.map(|(_, dz)| dz).unwrap_or(0.0);
                    let above = neighbours.above.map(|(_, dz)| dz).unwrap_or(0.0);
                    let dz_node =
                        (0.5 * (below + above)).max(crate::DEPOSITING_THICKNESS_TOLERANCE);

                    let storage = if self.steady_state {
                        0.0
                    } else {
                        self.heat_capacity_volume(k, j, i, dz_node) / dt
                    };
                    let previous = null_to(
                        node_value_previous(self.fem, self.layers, Prop::Temperature, k, j, i),
                        solution[row],
                    );

                    let mut diagonal = storage;
                    let mut flux = storage * (solution[row] - previous)
                        - self.heat_production(k, j, i, dz_node);

                    if k == 0 {
                        if let BottomBoundaryCondition::FixedHeatFlow(milliwatts) =
                            self.project.bottom_boundary
                        {
                            // mW/m^2 into J/Ma over the element face.
                            flux -= milliwatts * 1.0e-3 * area * SECONDS_PER_MA;
                        }
                    }

                    for (kn, dz) in [neighbours.below, neighbours.above].into_iter().flatten() {
                        let conductance = self.thermal_conductance(k, kn, j, i, dz);
                        let col = self.fem.grid.node_index(i, j, kn);
                        flux += conductance * (solution[row] - solution[col]);
                        diagonal += conductance;
                        if let Some(jacobian) = jacobian.as_deref_mut() {
                            jacobian.add(row, col, -conductance);
                        }
                    }

                    let lateral: [(i64, i64); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];
                    for (di, dj) in lateral {
                        let ni = i as i64 + di;
                        let nj = j as i64 + dj;
                        if ni < 0 || nj < 0 || ni >= nx as i64 || nj >= ny as i64 {
                            continue;
                        }
                        let (ni, nj) = (ni as usize, nj as usize);
                        if !self.valid_needle[[nj, ni]] {
                            continue;
                        }
                        let neighbour_dof = self.fem.dofs[[k, nj, ni]] as usize;
                        let distance = if ni != i {
                            self.fem.grid.map.delta_x
                        } else {
                            self.fem.grid.map.delta_y
                        };
                        let breadth = if ni != i {
                            self.fem.grid.map.delta_y
                        } else {
                            self.fem.grid.map.delta_x
                        };
                        let conductance = self.node_conductivity(k, j, i) * breadth * dz_node
                            / distance
                            * SECONDS_PER_MA;
                        let col = self.fem.grid.node_index(ni, nj, neighbour_dof);
                        flux += conductance * (solution[row] - solution[col]);
                        diagonal += conductance;
                        if let Some(jacobian) = jacobian.as_deref_mut() {
                            jacobian.add(row, col, -conductance);
                        }
                    }

                    residual[row] = flux;
                    if let Some(jacobian) = jacobian.as_deref_mut() {
                        jacobian.add(row, row, diagonal);
                    }
                }
            }
        }
    }

    fn store_solution(&mut self, solution: &DVector<f64>) {
        scatter_solution(self.fem, self.layers, self.valid_needle, Prop::Temperature, solution);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::MapGrid;
    use crate::layer::{InsertMode, Layer, LayerKind};
    use crate::lithology::{CompoundLithology, FluidType, SimpleLithology};
    use crate::mesh::{FemGrid, MeshScope};
    use crate::newton::{solve_nonlinear, JacobianReusePolicy, NewtonConfig};
    use crate::output::BufferSink;
    use crate::prealloc::create_matrix_structure;
    use crate::project::{BottomBoundaryCondition, Snapshot, SnapshotKind};
    use crate::solver::LinearSolverConfig;
    use crate::CalculationMode;
    use ndarray::Array2;

    fn project(mode: CalculationMode) -> ProjectHandle {
        let map = MapGrid::new(3, 3, 0.0, 0.0, 100.0, 100.0).unwrap();
        let mut project = ProjectHandle::new(
            "assembly-test",
            map,
            mode,
            &[
                Snapshot {
                    age: 10.0,
                    kind: SnapshotKind::Major,
                },
                Snapshot {
                    age: 0.0,
                    kind: SnapshotKind::Major,
                },
            ],
        )
        .unwrap();
        project.bottom_boundary = BottomBoundaryCondition::FixedHeatFlow(60.0);
        project
    }

    fn prepared_layers(project: &ProjectHandle, valid: &Array2<bool>) -> Vec<Layer> {
        let map = project.map_grid;
        let mut layer = Layer::new(
            "Sand",
            LayerKind::Sediment,
            10.0,
            5.0,
            3,
            CompoundLithology::uniform(SimpleLithology::standard_sandstone()),
            FluidType::standard_water(),
            Array2::from_elem((3, 3), 300.0),
            &map,
        );
        layer.find_active_segments(0.0);
        let mut layers = vec![layer];
        crate::geometric::initialise_pressure_properties(&mut layers, valid, 10.0, 0.0);
        crate::geometric::compute_dependent_properties(&mut layers, project, valid, 10.0, 0.0);
        for layer in layers.iter_mut() {
            layer.copy_properties(valid);
        }
        layers
    }

    fn build_fem(layers: &mut Vec<Layer>, project: &ProjectHandle, valid: &Array2<bool>) -> FemGrid {
        let mut fem =
            FemGrid::build(layers, MeshScope::SedimentsOnly, 0.0, &project.map_grid).unwrap();
        fem.set_depths(layers, valid);
        fem.set_dofs(valid);
        fem.set_real_nodes(layers, valid);
        fem
    }

    #[test]
    fn pressure_system_relaxes_to_zero_overpressure_at_equilibrium() {
        let project = project(CalculationMode::Overpressure);
        let valid = Array2::from_elem((3, 3), true);
        let mut layers = prepared_layers(&project, &valid);
        let fem = build_fem(&mut layers, &project, &valid);
        let mut jacobian = create_matrix_structure(&fem, &valid, 1).unwrap();

        // The previous book equals the current and the previous
        // overpressure is zero, so storage and conduction balance at zero
        // overpressure.
        let mut system = PressureSystem {
            layers: &mut layers,
            fem: &fem,
            valid_needle: &valid,
            project: &project,
            previous_time: 5.0,
            current_time: 4.0,
            geometric_loop: true,
        };
        let config = NewtonConfig {
            tolerance: 1.0e-8,
            max_iterations: 12,
            reuse: JacobianReusePolicy {
                allow_reuse: true,
                reuse_count: 4,
            },
            linear: LinearSolverConfig::new(1.0e-10),
            linear_variant: false,
        };
        let mut sink = BufferSink::default();
        let report = solve_nonlinear(&mut system, &mut jacobian, &config, &mut sink);
        assert!(report.converged, "{report:?}");
        for k in 0..=3 {
            let po = layers[0].current.value(Prop::Overpressure, k, 1, 1);
            assert!(po.abs() < 1.0e-3, "overpressure {po} at k={k}");
        }
    }

    #[test]
    fn temperature_system_reproduces_a_conductive_gradient() {
        let project = project(CalculationMode::HydrostaticTemperature);
        let valid = Array2::from_elem((3, 3), true);
        let mut layers = prepared_layers(&project, &valid);
        let fem = build_fem(&mut layers, &project, &valid);
        let mut jacobian = create_matrix_structure(&fem, &valid, 1).unwrap();

        let mut system = TemperatureSystem {
            layers: &mut layers,
            fem: &fem,
            valid_needle: &valid,
            project: &project,
            previous_time: 5.0,
            current_time: 4.0,
            steady_state: true,
        };
        let config = NewtonConfig {
            tolerance: 1.0e-8,
            max_iterations: 15,
            reuse: JacobianReusePolicy {
                allow_reuse: false,
                reuse_count: 4,
            },
            linear: LinearSolverConfig::new(1.0e-11),
            linear_variant: false,
        };
        let mut sink = BufferSink::default();
        let report = solve_nonlinear(&mut system, &mut jacobian, &config, &mut sink);
        assert!(report.converged, "{report:?}");

        // Temperature increases downwards under a basal heat flow.
        let surface = layers[0].current.value(Prop::Temperature, 3, 1, 1);
        let bottom = layers[0].current.value(Prop::Temperature, 0, 1, 1);
        assert!((surface - 10.0).abs() < 0.1, "surface at {surface}");
        assert!(bottom > surface, "bottom {bottom} vs surface {surface}");
    }

    #[test]
    fn maximum_difference_ignores_invalid_and_null_nodes() {
        let project = project(CalculationMode::Overpressure);
        let valid = Array2::from_elem((3, 3), true);
        let mut layers = prepared_layers(&project, &valid);
        layers[0]
            .current
            .activate(Prop::Temperature, InsertMode::Insert, false);
        layers[0].current.set(Prop::Temperature, 0, 1, 1, 80.0);
        layers[0].previous.set(Prop::Temperature, 0, 1, 1, 60.0);
        layers[0].current.restore(Prop::Temperature);
        let diff =
            maximum_property_difference(&layers, &valid, Prop::Temperature, false, 0.0);
        assert!((diff - 20.0).abs() < 1.0e-9);
        // Source-rock restriction sees nothing: the layer is not flagged.
        let sr_diff =
            maximum_property_difference(&layers, &valid, Prop::Temperature, true, 0.0);
        assert_eq!(sr_diff, 0.0);
    }
}
