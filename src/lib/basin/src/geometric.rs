//! Geometric-loop compaction integrator and its FCT corrector.
//!
//! The geometric loop holds the per-segment solid thickness fixed within a
//! pressure march and integrates the compaction ODEs down each needle to
//! recover the real thickness and all pressures. The outer corrector then
//! compares the computed present-day thickness against the input
//! stratigraphy and rescales the solid-thickness history.

use ndarray::Array2;

use crate::grid::{all_reduce_max, all_reduce_min_int};
use crate::layer::{
    layer_indices, ActivityFilter, Direction, FundamentalProperty, InsertMode, Layer, LayerRange,
};
use crate::lithology::{CompoundLithology, CompoundProperty, FluidType};
use crate::project::ProjectHandle;
use crate::{
    CAULDRON_NO_DATA_VALUE, GRAVITY, IBS_NO_DATA_VALUE, MEGAPA_TO_PA, PA_TO_MEGAPA,
};

type Prop = FundamentalProperty;

/// Top-of-column state threaded from layer to layer while walking the
/// stack downwards.
pub struct TopColumn {
    pub depth: Array2<f64>,
    pub hydrostatic: Array2<f64>,
    pub pore: Array2<f64>,
    pub lithostatic: Array2<f64>,
    pub ves: Array2<f64>,
    pub max_ves: Array2<f64>,
}

impl TopColumn {
    /// Seed the column state at the sea bottom: the water column carries
    /// the hydrostatic pressure, the effective stress is zero.
    pub fn initialise(
        project: &ProjectHandle,
        fluid: &FluidType,
        current_time: f64,
        valid_needle: &Array2<bool>,
    ) -> Self {
        let (ny, nx) = valid_needle.dim();
        let mut top = TopColumn {
            depth: Array2::zeros((ny, nx)),
            hydrostatic: Array2::zeros((ny, nx)),
            pore: Array2::zeros((ny, nx)),
            lithostatic: Array2::zeros((ny, nx)),
            ves: Array2::zeros((ny, nx)),
            max_ves: Array2::zeros((ny, nx)),
        };
        for ((j, i), &valid) in valid_needle.indexed_iter() {
            if !valid {
                continue;
            }
            let surface_depth = project.sea_bottom_depth_at(i, j, current_time);
            let surface_temperature = project.sea_bottom_temperature_at(i, j, current_time);
            let hydrostatic = fluid.hydrostatic_pressure_at(surface_depth, surface_temperature);
            top.depth[[j, i]] = surface_depth;
            top.hydrostatic[[j, i]] = hydrostatic;
            top.pore[[j, i]] = hydrostatic;
            top.lithostatic[[j, i]] = hydrostatic;
            top.ves[[j, i]] = 0.0;
            top.max_ves[[j, i]] = 0.0;
        }
        top
    }
}

/// Running state of one segment integration. On entry the pressures hold
/// the values at the top of the segment; on exit the values at the bottom.
#[derive(Clone, Copy, Debug)]
pub struct SegmentState {
    pub ves: f64,
    pub max_ves: f64,
    pub porosity_bottom: f64,
    pub hydrostatic: f64,
    pub pore_top: f64,
    pub pore_bottom: f64,
    pub lithostatic: f64,
    pub fluid_density: f64,
    pub bulk_density: f64,
    pub real_thickness: f64,
}

/// Integrate one segment of fixed solid thickness through `steps`
/// substeps of constant solid thickness.
#[allow(clippy::too_many_arguments)]
pub fn compute_real_thickness(
    lithology: &CompoundLithology,
    fluid: &FluidType,
    include_chemical_compaction: bool,
    solid_thickness: f64,
    temperature_top: f64,
    temperature_bottom: f64,
    overpressure_top: f64,
    overpressure_bottom: f64,
    intermediate_max_ves_top: f64,
    intermediate_max_ves_bottom: f64,
    chemical_compaction: f64,
    steps: usize,
    state: &mut SegmentState,
) {
    let number_of_segments = steps.max(1);
    let h = solid_thickness / number_of_segments as f64;
    let solid_density = lithology.density();

    state.pore_bottom = state.pore_top;
    state.porosity_bottom = lithology.porosity(
        state.ves,
        state.max_ves,
        include_chemical_compaction,
        chemical_compaction,
    );
    state.real_thickness = 0.0;

    for i in 1..=number_of_segments {
        let weight_bottom = i as f64 / number_of_segments as f64;
        let weight_top = 1.0 - weight_bottom;
        let overpressure = overpressure_top * weight_top + overpressure_bottom * weight_bottom;
        let temperature = temperature_top * weight_top + temperature_bottom * weight_bottom;

        state.fluid_density = fluid.density(temperature, state.pore_bottom);

        let segment_real_thickness = h / (1.0 - state.porosity_bottom);

        state.bulk_density = state.porosity_bottom * state.fluid_density
            + (1.0 - state.porosity_bottom) * solid_density;

        let ice_branch = state.fluid_density > solid_density && fluid.switch_permafrost();

        // We assume the solid is ice in this case; the hydrostatic column
        // does not grow through it.
        if !ice_branch {
            state.hydrostatic +=
                segment_real_thickness * state.fluid_density * GRAVITY * PA_TO_MEGAPA;
        }

        state.lithostatic += segment_real_thickness * state.bulk_density * GRAVITY * PA_TO_MEGAPA;

        state.max_ves =
            intermediate_max_ves_top * weight_top + intermediate_max_ves_bottom * weight_bottom;

        if ice_branch {
            state.pore_bottom = state.lithostatic;
        } else {
            state.pore_bottom = (state.hydrostatic + overpressure).min(state.lithostatic);
        }

        state.ves = (state.lithostatic - state.pore_bottom) * MEGAPA_TO_PA;
        state.max_ves = state.max_ves.max(state.ves);

        state.porosity_bottom = lithology.porosity(
            state.ves,
            state.max_ves,
            include_chemical_compaction,
            chemical_compaction,
        );
        state.real_thickness += segment_real_thickness;
    }
}

fn null_to(value: f64, fallback: f64) -> f64 {
    if value == CAULDRON_NO_DATA_VALUE || value == IBS_NO_DATA_VALUE {
        fallback
    } else {
        value
    }
}

/// Copy the current-time input solid thickness into the property store for
/// every active sediment layer.
pub fn initialise_pressure_properties(
    layers: &mut [Layer],
    valid_needle: &Array2<bool>,
    _previous_time: f64,
    current_time: f64,
) {
    for index in layer_indices(
        layers,
        Direction::Ascending,
        LayerRange::SedimentsOnly,
        ActivityFilter::ActiveOnly,
        current_time,
    ) {
        let layer = &mut layers[index];
        let segments = layer.nr_of_active_segments();
        layer
            .current
            .activate(Prop::SolidThickness, InsertMode::Insert, false);
        for ((j, i), &valid) in valid_needle.indexed_iter() {
            if !valid {
                continue;
            }
            for k in 0..segments {
                let value = layer.segment_solid_thickness_at(i, j, k, current_time);
                let value = if value == IBS_NO_DATA_VALUE { 0.0 } else { value };
                layer.current.set(Prop::SolidThickness, k, j, i, value);
            }
        }
        layer.current.restore(Prop::SolidThickness);
    }
}

/// Walk every active sediment layer top-down and recompute depth, the
/// pressure chain, VES/MaxVES, porosity and the permeabilities from the
/// current solid thickness and the current overpressure iterate.
pub fn compute_dependent_properties(
    layers: &mut [Layer],
    project: &ProjectHandle,
    valid_needle: &Array2<bool>,
    previous_time: f64,
    current_time: f64,
) {
    let order = layer_indices(
        layers,
        Direction::Descending,
        LayerRange::SedimentsOnly,
        ActivityFilter::ActiveOnly,
        current_time,
    );
    let Some(&top_index) = order.first() else {
        return;
    };
    let top_fluid = layers[top_index].fluid.clone();
    let mut column = TopColumn::initialise(project, &top_fluid, current_time, valid_needle);

    for index in order {
        compute_layer(
            &mut layers[index],
            project,
            valid_needle,
            previous_time,
            current_time,
            &mut column,
        );
    }
}

fn compute_layer(
    layer: &mut Layer,
    project: &ProjectHandle,
    valid_needle: &Array2<bool>,
    _previous_time: f64,
    current_time: f64,
    column: &mut TopColumn,
) {
    let include_chemical_compaction =
        project.run_parameters.do_chemical_compaction && layer.is_sediment();
    let steps = project.run_parameters.compaction_equation_steps();
    let z_top = layer.nr_of_active_segments();
    let layer_is_mobile = layer.is_mobile;
    let mut porosity_mixture = CompoundProperty::default();

    for ((j, i), &valid) in valid_needle.indexed_iter() {
        if !valid {
            for k in (0..=z_top).rev() {
                layer.current.set(Prop::Depth, k, j, i, CAULDRON_NO_DATA_VALUE);
                layer
                    .current
                    .set(Prop::HydrostaticPressure, k, j, i, CAULDRON_NO_DATA_VALUE);
                layer
                    .current
                    .set(Prop::LithostaticPressure, k, j, i, CAULDRON_NO_DATA_VALUE);
                layer
                    .current
                    .set(Prop::PorePressure, k, j, i, CAULDRON_NO_DATA_VALUE);
                layer.current.set(Prop::Ves, k, j, i, CAULDRON_NO_DATA_VALUE);
                layer.current.set(Prop::MaxVes, k, j, i, CAULDRON_NO_DATA_VALUE);
                layer.porosity[[k, j, i]] = CAULDRON_NO_DATA_VALUE;
                layer.permeability_normal[[k, j, i]] = CAULDRON_NO_DATA_VALUE;
                layer.permeability_planar[[k, j, i]] = CAULDRON_NO_DATA_VALUE;
            }
            continue;
        }

        let lithology = layer.lithology(i, j).clone();
        let fluid = layer.fluid.clone();
        let solid_density = lithology.density();
        let surface_temperature = project.sea_bottom_temperature_at(i, j, current_time);
        let surface_depth = project.sea_bottom_depth_at(i, j, current_time);

        let mut depth_top = column.depth[[j, i]];
        let hydrostatic_top = column.hydrostatic[[j, i]];
        let lithostatic_top = column.lithostatic[[j, i]];
        // Pressure constrained here.
        let pore_top = column.pore[[j, i]].min(lithostatic_top);
        let ves_top = column.ves[[j, i]];

        let mut temperature_top = layer.current.value(Prop::Temperature, z_top, j, i);
        if temperature_top == CAULDRON_NO_DATA_VALUE {
            temperature_top =
                project.estimate_temperature_at_depth(depth_top, surface_temperature, surface_depth);
        }

        let topmost_segment = layer.current_topmost_segment(i, j);

        // MaxVES at the top of the layer; interpolated when a non-mobile
        // layer is eroding.
        let max_ves_top = if topmost_segment < 0 {
            // Should not really be in here; fall back to the top node.
            null_to(layer.previous.value(Prop::MaxVes, z_top, j, i), 0.0).max(ves_top)
        } else {
            let seg = topmost_segment as usize;
            let previous_solid =
                null_to(layer.previous.value(Prop::SolidThickness, seg, j, i), 0.0);
            let current_solid =
                null_to(layer.current.value(Prop::SolidThickness, seg, j, i), 0.0);

            if !layer_is_mobile && previous_solid > current_solid && previous_solid > 0.0 {
                // Layer is eroding: interpolate the MaxVES at the new top
                // between the previous top and bottom values.
                let max_ves_above =
                    null_to(layer.previous.value(Prop::MaxVes, seg + 1, j, i), 0.0).max(ves_top);
                let max_ves_below = null_to(layer.previous.value(Prop::MaxVes, seg, j, i), 0.0)
                    .max(null_to(layer.current.value(Prop::Ves, seg, j, i), 0.0));
                (max_ves_above - max_ves_below) * (current_solid / previous_solid) + max_ves_below
            } else {
                null_to(layer.previous.value(Prop::MaxVes, z_top, j, i), 0.0).max(ves_top)
            }
        };

        let chemical_compaction_top =
            null_to(layer.current.value(Prop::ChemicalCompaction, z_top, j, i), 0.0);
        let mut porosity_top = lithology.porosity(
            ves_top,
            max_ves_top,
            include_chemical_compaction,
            chemical_compaction_top,
        );

        lithology.get_porosity(
            ves_top,
            max_ves_top,
            include_chemical_compaction,
            chemical_compaction_top,
            &mut porosity_mixture,
        );
        let (permeability_normal, permeability_planar) =
            lithology.bulk_permeability_np(ves_top, max_ves_top, &porosity_mixture);

        // Initialise the top node (and any inactive nodes above the
        // topmost active segment) with the top-of-layer values.
        for k in ((topmost_segment + 1).max(0) as usize..=z_top).rev() {
            layer.current.set(Prop::Depth, k, j, i, depth_top);
            layer
                .current
                .set(Prop::HydrostaticPressure, k, j, i, hydrostatic_top);
            layer
                .current
                .set(Prop::LithostaticPressure, k, j, i, lithostatic_top);
            layer.current.set(Prop::PorePressure, k, j, i, pore_top);
            layer.current.set(Prop::Ves, k, j, i, ves_top);
            layer.current.set(Prop::MaxVes, k, j, i, max_ves_top);
            layer.current.set(Prop::Temperature, k, j, i, temperature_top);
            layer.porosity[[k, j, i]] = porosity_top;
            layer.permeability_normal[[k, j, i]] = permeability_normal;
            layer.permeability_planar[[k, j, i]] = permeability_planar;
        }

        let mut state = SegmentState {
            ves: ves_top,
            max_ves: max_ves_top,
            porosity_bottom: porosity_top,
            hydrostatic: hydrostatic_top,
            pore_top,
            pore_bottom: pore_top,
            lithostatic: lithostatic_top,
            fluid_density: fluid.density(temperature_top, pore_top),
            bulk_density: porosity_top * fluid.density(temperature_top, pore_top)
                + (1.0 - porosity_top) * solid_density,
            real_thickness: 0.0,
        };
        let mut temperature_above = temperature_top;
        let mut intermediate_max_ves_top = max_ves_top;

        // Bottom of every active segment, walking down.
        for k in (0..=topmost_segment.max(-1)).rev() {
            if k < 0 {
                break;
            }
            let k = k as usize;

            let intermediate_max_ves_bottom = null_to(layer.previous.value(Prop::MaxVes, k, j, i), 0.0);
            let solid_thickness = null_to(layer.current.value(Prop::SolidThickness, k, j, i), 0.0);

            let overpressure_top = null_to(layer.current.value(Prop::Overpressure, k + 1, j, i), 0.0);
            let overpressure_bottom = null_to(layer.current.value(Prop::Overpressure, k, j, i), 0.0);
            let chemical_compaction_bottom =
                null_to(layer.current.value(Prop::ChemicalCompaction, k, j, i), 0.0);

            let mut porosity_bottom = layer.porosity[[k, j, i]];
            if porosity_bottom == 0.0 || porosity_bottom == CAULDRON_NO_DATA_VALUE {
                porosity_bottom = porosity_top;
            }

            let mut temperature_bottom = layer.current.value(Prop::Temperature, k, j, i);
            if temperature_bottom == CAULDRON_NO_DATA_VALUE {
                let estimated_real_thickness = 0.5
                    * solid_thickness
                    * (1.0 / (1.0 - porosity_bottom) + 1.0 / (1.0 - porosity_top));
                temperature_bottom = project.estimate_temperature_at_depth(
                    depth_top + estimated_real_thickness,
                    surface_temperature,
                    surface_depth,
                );
            }

            state.porosity_bottom = porosity_bottom;
            state.pore_top = state.pore_bottom;
            compute_real_thickness(
                &lithology,
                &fluid,
                include_chemical_compaction,
                solid_thickness,
                temperature_above,
                temperature_bottom,
                overpressure_top,
                overpressure_bottom,
                intermediate_max_ves_top,
                intermediate_max_ves_bottom,
                chemical_compaction_bottom,
                steps,
                &mut state,
            );

            // Bottom values become the top of the next segment.
            temperature_above = temperature_bottom;
            porosity_top = state.porosity_bottom;
            intermediate_max_ves_top = state.max_ves;
            depth_top += state.real_thickness;

            layer.current.set(Prop::Depth, k, j, i, depth_top);
            layer
                .current
                .set(Prop::HydrostaticPressure, k, j, i, state.hydrostatic);
            layer
                .current
                .set(Prop::LithostaticPressure, k, j, i, state.lithostatic);
            layer.current.set(Prop::PorePressure, k, j, i, state.pore_bottom);
            layer.current.set(Prop::Ves, k, j, i, state.ves);
            layer.current.set(Prop::MaxVes, k, j, i, state.max_ves);
            layer
                .current
                .set(Prop::RealThickness, k, j, i, state.real_thickness);
            layer.porosity[[k, j, i]] = state.porosity_bottom;

            lithology.get_porosity(
                state.ves,
                state.max_ves,
                include_chemical_compaction,
                chemical_compaction_bottom,
                &mut porosity_mixture,
            );
            let (kn, kp) = lithology.bulk_permeability_np(state.ves, state.max_ves, &porosity_mixture);
            layer.permeability_normal[[k, j, i]] = kn;
            layer.permeability_planar[[k, j, i]] = kp;
        }

        // Save the bottom of this layer for the top of the next one down.
        column.depth[[j, i]] = depth_top;
        column.hydrostatic[[j, i]] = state.hydrostatic;
        column.pore[[j, i]] = state.pore_bottom;
        column.lithostatic[[j, i]] = state.lithostatic;
        column.ves[[j, i]] = state.ves;
        column.max_ves[[j, i]] = state.max_ves;
    }
}

/// Result of one geometric outer iteration.
#[derive(Clone, Copy, Debug)]
pub struct FctReport {
    pub geometry_has_converged: bool,
    pub maximum_relative_error: f64,
}

/// Compare computed against input thickness per needle and layer, rescale
/// the solid-thickness histories and decide convergence.
pub fn adjust_solid_thickness(
    layers: &mut [Layer],
    project: &ProjectHandle,
    valid_needle: &Array2<bool>,
    relative_thickness_tolerance: f64,
    absolute_thickness_tolerance: f64,
) -> FctReport {
    let scaling_weight = project.run_parameters.fct_correction_scaling_weight;
    let mut local_geometry_has_converged: i32 = 1;
    let mut local_max_error: f64 = -1.0;

    for index in layer_indices(
        layers,
        Direction::Descending,
        LayerRange::SedimentsOnly,
        ActivityFilter::ActiveOnly,
        0.0,
    ) {
        let layer = &mut layers[index];
        let z_top = layer.nr_of_active_segments();
        let mut layer_max_error: f64 = -1.0;

        layer.current.activate(Prop::Depth, InsertMode::Insert, true);
        for ((j, i), &valid) in valid_needle.indexed_iter() {
            if !valid {
                layer.fct_correction[[j, i]] = CAULDRON_NO_DATA_VALUE;
                layer.thickness_error[[j, i]] = CAULDRON_NO_DATA_VALUE;
                continue;
            }

            let bottom_depth = layer.current.value(Prop::Depth, 0, j, i);
            let top_depth = layer.current.value(Prop::Depth, z_top, j, i);
            let deposited = layer
                .computed_deposition_thickness
                .as_ref()
                .map(|m| m[[j, i]])
                .unwrap_or(bottom_depth - top_depth);

            // The input/computed selection is a contract of the corrector.
            let (input_thickness, computed_thickness) =
                if layer.present_day_eroded_thickness(i, j) > 0.1 {
                    (
                        layer.present_day_eroded_thickness(i, j),
                        bottom_depth - top_depth,
                    )
                } else if layer.present_day_thickness[[j, i]] > 0.1 {
                    (layer.present_day_thickness[[j, i]], deposited)
                } else {
                    (deposited, deposited)
                };

            let relative_error = if input_thickness != 0.0 {
                ((input_thickness - computed_thickness) / input_thickness).abs()
            } else {
                0.0
            };

            let fct_scaling =
                if input_thickness.abs() > 1.0e-10 && computed_thickness.abs() > 1.0e-10 {
                    1.0 - scaling_weight + scaling_weight * input_thickness / computed_thickness
                } else {
                    1.0
                };

            layer.fct_correction[[j, i]] *= fct_scaling;
            layer.thickness_error[[j, i]] = if input_thickness == 0.0 {
                0.0
            } else {
                relative_error * 100.0
            };
            layer.scale_solid_thickness_history(i, j, fct_scaling);

            layer_max_error = layer_max_error.max(relative_error);

            // A sub-needle that misses the tolerance spoils the layer.
            // Thin layers get the absolute test.
            if input_thickness < 100.0 {
                if input_thickness > 10.0
                    && (input_thickness - computed_thickness).abs() > absolute_thickness_tolerance
                {
                    local_geometry_has_converged = 0;
                }
            } else if relative_error > relative_thickness_tolerance {
                local_geometry_has_converged = 0;
            }
        }
        layer.current.restore(Prop::Depth);

        tracing::debug!(
            layer = %layer.name,
            max_error_percent = 100.0 * all_reduce_max(layer_max_error),
            "geometric iteration thickness error"
        );
        local_max_error = local_max_error.max(layer_max_error);
    }

    let geometry_has_converged = all_reduce_min_int(local_geometry_has_converged) == 1;
    FctReport {
        geometry_has_converged,
        maximum_relative_error: all_reduce_max(local_max_error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::MapGrid;
    use crate::layer::LayerKind;
    use crate::lithology::SimpleLithology;
    use crate::project::{Snapshot, SnapshotKind};
    use crate::CalculationMode;
    use approx::assert_relative_eq;

    fn test_project() -> ProjectHandle {
        let map = MapGrid::new(3, 3, 0.0, 0.0, 100.0, 100.0).unwrap();
        ProjectHandle::new(
            "test",
            map,
            CalculationMode::Overpressure,
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
        .unwrap()
    }

    fn sand_layer(thickness: f64) -> Layer {
        let map = MapGrid::new(3, 3, 0.0, 0.0, 100.0, 100.0).unwrap();
        let mut layer = Layer::new(
            "Sand",
            LayerKind::Sediment,
            10.0,
            5.0,
            2,
            CompoundLithology::uniform(SimpleLithology::standard_sandstone()),
            FluidType::standard_water(),
            Array2::from_elem((3, 3), thickness),
            &map,
        );
        layer.find_active_segments(0.0);
        layer
    }

    #[test]
    fn pressure_chain_holds_down_the_needle() {
        let project = test_project();
        let valid = Array2::from_elem((3, 3), true);
        let mut layers = vec![sand_layer(200.0)];
        initialise_pressure_properties(&mut layers, &valid, 10.0, 0.0);
        compute_dependent_properties(&mut layers, &project, &valid, 10.0, 0.0);

        let layer = &layers[0];
        for k in (0..=2).rev() {
            let hydro = layer.current.value(Prop::HydrostaticPressure, k, 1, 1);
            let pore = layer.current.value(Prop::PorePressure, k, 1, 1);
            let litho = layer.current.value(Prop::LithostaticPressure, k, 1, 1);
            let ves = layer.current.value(Prop::Ves, k, 1, 1);
            let max_ves = layer.current.value(Prop::MaxVes, k, 1, 1);
            assert!(litho >= pore - 1.0e-9, "litho >= pore at k={k}");
            assert!(pore >= hydro - 1.0e-9, "pore >= hydro at k={k}");
            assert!(ves >= 0.0);
            assert!(max_ves >= ves);
            assert_relative_eq!(ves, (litho - pore) * MEGAPA_TO_PA, max_relative = 1.0e-9);
        }
        // Depths increase downwards.
        let top = layer.current.value(Prop::Depth, 2, 1, 1);
        let bottom = layer.current.value(Prop::Depth, 0, 1, 1);
        assert!(bottom > top);
    }

    #[test]
    fn permafrost_branch_sets_pore_to_lithostatic_and_freezes_hydrostatic() {
        let mut ice = FluidType::standard_water();
        ice.permafrost = true;
        ice.frozen_density = 3000.0; // exceeds grain density
        let lithology = CompoundLithology::uniform(SimpleLithology::standard_sandstone());
        let mut state = SegmentState {
            ves: 0.0,
            max_ves: 0.0,
            porosity_bottom: 0.3,
            hydrostatic: 5.0,
            pore_top: 5.0,
            pore_bottom: 5.0,
            lithostatic: 5.0,
            fluid_density: 3000.0,
            bulk_density: 2000.0,
            real_thickness: 0.0,
        };
        compute_real_thickness(
            &lithology,
            &ice,
            false,
            50.0,
            -10.0,
            -5.0,
            0.0,
            0.0,
            0.0,
            0.0,
            0.0,
            4,
            &mut state,
        );
        // Hydrostatic was not incremented across the ice segment.
        assert_relative_eq!(state.hydrostatic, 5.0);
        // Pore pressure equals lithostatic exactly.
        assert_relative_eq!(state.pore_bottom, state.lithostatic);
        assert_eq!(state.ves, 0.0);
    }

    #[test]
    fn zero_solid_thickness_leaves_the_column_state_unchanged() {
        let fluid = FluidType::standard_water();
        let lithology = CompoundLithology::uniform(SimpleLithology::standard_sandstone());
        let mut state = SegmentState {
            ves: 1.0e6,
            max_ves: 2.0e6,
            porosity_bottom: 0.3,
            hydrostatic: 10.0,
            pore_top: 10.0,
            pore_bottom: 10.0,
            lithostatic: 12.0,
            fluid_density: 1000.0,
            bulk_density: 2000.0,
            real_thickness: 0.0,
        };
        compute_real_thickness(
            &lithology, &fluid, false, 0.0, 20.0, 20.0, 0.0, 0.0, 2.0e6, 2.0e6, 0.0, 4, &mut state,
        );
        assert_eq!(state.real_thickness, 0.0);
        assert_relative_eq!(state.hydrostatic, 10.0);
        assert_relative_eq!(state.lithostatic, 12.0);
    }

    #[test]
    fn fct_scaling_moves_computed_thickness_toward_input() {
        let project = test_project();
        let valid = Array2::from_elem((3, 3), true);
        let mut layers = vec![sand_layer(200.0)];
        initialise_pressure_properties(&mut layers, &valid, 10.0, 0.0);
        compute_dependent_properties(&mut layers, &project, &valid, 10.0, 0.0);

        // Record the deposition thickness as the corrector's computed value.
        let layer = &mut layers[0];
        let z_top = layer.nr_of_active_segments();
        let mut deposited = Array2::zeros((3, 3));
        for j in 0..3 {
            for i in 0..3 {
                deposited[[j, i]] = layer.current.value(Prop::Depth, 0, j, i)
                    - layer.current.value(Prop::Depth, z_top, j, i);
            }
        }
        layer.computed_deposition_thickness = Some(deposited.clone());

        let error_before =
            ((200.0 - deposited[[1, 1]]) / 200.0).abs();
        let report = adjust_solid_thickness(&mut layers, &project, &valid, 0.01, 1.0);
        assert!(report.maximum_relative_error >= 0.0);

        // Re-run the march with the rescaled history; thickness error must
        // contract (within round-off of the porosity feedback).
        initialise_pressure_properties(&mut layers, &valid, 10.0, 0.0);
        compute_dependent_properties(&mut layers, &project, &valid, 10.0, 0.0);
        let layer = &layers[0];
        let new_thickness = layer.current.value(Prop::Depth, 0, 1, 1)
            - layer.current.value(Prop::Depth, z_top, 1, 1);
        let error_after = ((200.0 - new_thickness) / 200.0).abs();
        assert!(
            error_after <= error_before + 1.0e-9,
            "error_after {error_after} vs error_before {error_before}"
        );
    }

    #[test]
    fn invalid_needles_receive_the_sentinel() {
        let project = test_project();
        let mut valid = Array2::from_elem((3, 3), true);
        valid[[0, 0]] = false;
        let mut layers = vec![sand_layer(200.0)];
        initialise_pressure_properties(&mut layers, &valid, 10.0, 0.0);
        compute_dependent_properties(&mut layers, &project, &valid, 10.0, 0.0);
        let layer = &layers[0];
        assert_eq!(
            layer.current.value(Prop::PorePressure, 0, 0, 0),
            CAULDRON_NO_DATA_VALUE
        );
        let report = adjust_solid_thickness(&mut layers, &project, &valid, 0.01, 1.0);
        let _ = report;
        assert_eq!(layers[0].fct_correction[[0, 0]], CAULDRON_NO_DATA_VALUE);
        assert_eq!(layers[0].thickness_error[[0, 0]], CAULDRON_NO_DATA_VALUE);
    }
}
