//! Non-geometric-loop compaction integrator.
//!
//! Drives the geometry directly by the input real thicknesses: the depth
//! column is laid out from the stratigraphic input, and the solid
//! thickness of every segment is back-solved by a Picard iteration on the
//! compaction ODE ds/dz = 1 - phi. Because the input real thicknesses are
//! authoritative, the corrector has nothing to converge and always
//! reports success.

use ndarray::Array2;

use crate::geometric::{FctReport, TopColumn};
use crate::layer::{
    layer_indices, ActivityFilter, Direction, FundamentalProperty, InsertMode, Layer, LayerRange,
};
use crate::lithology::{CompoundLithology, CompoundProperty, FluidType};
use crate::project::ProjectHandle;
use crate::{CAULDRON_NO_DATA_VALUE, GRAVITY, IBS_NO_DATA_VALUE, MEGAPA_TO_PA, PA_TO_MEGAPA};

type Prop = FundamentalProperty;

/// Convergence threshold of the inner Picard iteration on the solid
/// thickness; relative above the threshold, absolute below.
pub const GEOMETRIC_LOOP_THICKNESS_TOLERANCE: f64 = 1.0e-4;

const MAXIMUM_PICARD_ITERATIONS: usize = 100;

/// Running state of one segment. On entry the pressures and densities
/// hold the values at the top of the segment; on exit at the bottom.
#[derive(Clone, Copy, Debug)]
pub struct NglSegmentState {
    pub ves: f64,
    pub max_ves: f64,
    pub porosity_top: f64,
    pub porosity_bottom: f64,
    pub hydrostatic: f64,
    pub pore: f64,
    pub lithostatic: f64,
    pub fluid_density: f64,
    pub bulk_density: f64,
    pub solid_thickness: f64,
}

/// Back-solve the solid thickness of one segment of known real thickness.
#[allow(clippy::too_many_arguments)]
pub fn compute_solid_thickness(
    lithology: &CompoundLithology,
    fluid: &FluidType,
    include_chemical_compaction: bool,
    real_thickness: f64,
    lateral_stress_factor: f64,
    temperature_bottom: f64,
    overpressure_bottom: f64,
    intermediate_max_ves_bottom: f64,
    chemical_compaction_bottom: f64,
    state: &mut NglSegmentState,
) {
    let hydrostatic_top = state.hydrostatic;
    let pore_top = state.pore;
    let lithostatic_top = state.lithostatic;
    let fluid_density_top = state.fluid_density;
    let bulk_density_top = state.bulk_density;
    let solid_density = lithology.density();

    // Initial estimate from the currently stored bottom porosity.
    state.solid_thickness =
        0.5 * real_thickness * (2.0 - state.porosity_top - state.porosity_bottom);

    // Predict the fluid density (and with it the hydrostatic and pore
    // pressure) from the pore pressure at the top of the segment, then
    // correct it at the predicted pressure.
    state.fluid_density = fluid.density(temperature_bottom, pore_top);
    let hydrostatic_predicted = hydrostatic_top
        + 0.5 * GRAVITY * real_thickness * (fluid_density_top + state.fluid_density) * PA_TO_MEGAPA;
    let pore_predicted = hydrostatic_predicted + overpressure_bottom;

    state.fluid_density = fluid.density(temperature_bottom, pore_predicted);
    state.hydrostatic = hydrostatic_top
        + 0.5 * GRAVITY * real_thickness * (fluid_density_top + state.fluid_density) * PA_TO_MEGAPA;
    state.pore = state.hydrostatic + overpressure_bottom;

    let mut converged = false;
    let mut iteration_count = 0usize;
    while !converged && iteration_count < MAXIMUM_PICARD_ITERATIONS {
        state.bulk_density = state.porosity_bottom * state.fluid_density
            + (1.0 - state.porosity_bottom) * solid_density;

        // Trapezoid integration; both pressures are almost linear across
        // the height of a segment.
        state.lithostatic = lithostatic_top
            + 0.5 * GRAVITY * real_thickness * (bulk_density_top + state.bulk_density) * PA_TO_MEGAPA;

        state.ves = ((state.lithostatic - state.pore) * MEGAPA_TO_PA).max(0.0);
        state.max_ves = ((1.0 + lateral_stress_factor) * state.ves).max(intermediate_max_ves_bottom);

        state.porosity_bottom = lithology.porosity(
            state.ves,
            state.max_ves,
            include_chemical_compaction,
            chemical_compaction_bottom,
        );

        // ds/dz = 1 - phi, integrated with the trapezoid rule.
        let solid_thickness_new =
            0.5 * real_thickness * (2.0 - state.porosity_top - state.porosity_bottom);

        converged = if solid_thickness_new.abs() > GEOMETRIC_LOOP_THICKNESS_TOLERANCE {
            ((solid_thickness_new - state.solid_thickness) / solid_thickness_new).abs()
                < GEOMETRIC_LOOP_THICKNESS_TOLERANCE
        } else {
            (solid_thickness_new - state.solid_thickness).abs()
                < GEOMETRIC_LOOP_THICKNESS_TOLERANCE
        };

        state.solid_thickness = solid_thickness_new;
        iteration_count += 1;
    }
}

fn null_to(value: f64, fallback: f64) -> f64 {
    if value == CAULDRON_NO_DATA_VALUE || value == IBS_NO_DATA_VALUE {
        fallback
    } else {
        value
    }
}

/// Lay out the depth column from the input real thicknesses, surface down.
pub fn initialise_pressure_properties(
    layers: &mut [Layer],
    project: &ProjectHandle,
    valid_needle: &Array2<bool>,
    _previous_time: f64,
    current_time: f64,
) {
    let (ny, nx) = valid_needle.dim();
    let mut top_depth = Array2::zeros((ny, nx));
    for ((j, i), &valid) in valid_needle.indexed_iter() {
        if valid {
            top_depth[[j, i]] = project.sea_bottom_depth_at(i, j, current_time);
        }
    }

    for index in layer_indices(
        layers,
        Direction::Descending,
        LayerRange::SedimentsOnly,
        ActivityFilter::ActiveOnly,
        current_time,
    ) {
        let layer = &mut layers[index];
        let z_top = layer.nr_of_active_segments();
        layer.current.activate(Prop::Depth, InsertMode::Insert, false);
        for ((j, i), &valid) in valid_needle.indexed_iter() {
            if !valid {
                continue;
            }
            layer.current.set(Prop::Depth, z_top, j, i, top_depth[[j, i]]);
            for k in (0..z_top).rev() {
                let real_thickness = layer.segment_real_thickness_at(i, j, k, current_time);
                let below = layer.current.value(Prop::Depth, k + 1, j, i);
                let depth = if real_thickness != IBS_NO_DATA_VALUE {
                    below + real_thickness
                } else {
                    below
                };
                layer.current.set(Prop::Depth, k, j, i, depth);
                layer.current.set(
                    Prop::RealThickness,
                    k,
                    j,
                    i,
                    if real_thickness == IBS_NO_DATA_VALUE {
                        0.0
                    } else {
                        real_thickness
                    },
                );
            }
            top_depth[[j, i]] = layer.current.value(Prop::Depth, 0, j, i);
        }
        layer.current.restore(Prop::Depth);
    }
}

/// Walk every active sediment layer top-down and back-solve the solid
/// thickness, pressures, VES and porosity at the bottom of each segment.
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
    let lateral_stress_factor = project.lateral_stress_factor(current_time);
    let z_top = layer.nr_of_active_segments();
    let layer_is_mobile = layer.is_mobile;
    let mut porosity_mixture = CompoundProperty::default();

    for ((j, i), &valid) in valid_needle.indexed_iter() {
        if !valid {
            for k in (0..=z_top).rev() {
                layer.current.set(Prop::Depth, k, j, i, CAULDRON_NO_DATA_VALUE);
                layer
                    .current
                    .set(Prop::SolidThickness, k, j, i, CAULDRON_NO_DATA_VALUE);
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
        let surface_depth = project.sea_bottom_depth_at(i, j, current_time);
        let surface_temperature = project.sea_bottom_temperature_at(i, j, current_time);

        let mut depth_top = layer.current.value(Prop::Depth, z_top, j, i);
        let mut temperature_top = layer.current.value(Prop::Temperature, z_top, j, i);
        if temperature_top == CAULDRON_NO_DATA_VALUE {
            temperature_top =
                project.estimate_temperature_at_depth(depth_top, surface_temperature, surface_depth);
        }

        let hydrostatic_top = column.hydrostatic[[j, i]];
        let lithostatic_top = column.lithostatic[[j, i]];
        // Pressure constrained here.
        let pore_top = column.pore[[j, i]].min(lithostatic_top);
        let ves_top = column.ves[[j, i]];

        let topmost_segment = layer.current_topmost_segment(i, j);

        let max_ves_top = if topmost_segment < 0 {
            null_to(layer.previous.value(Prop::MaxVes, z_top, j, i), 0.0)
                .max((1.0 + lateral_stress_factor) * ves_top)
        } else {
            let seg = topmost_segment as usize;
            let previous_real = {
                let value = layer.previous.value(Prop::Depth, seg, j, i)
                    - layer.previous.value(Prop::Depth, seg + 1, j, i);
                if value < 0.0 || !value.is_finite() || value.abs() > 1.0e8 {
                    0.0
                } else {
                    value
                }
            };
            let current_real = {
                let value = layer.current.value(Prop::Depth, seg, j, i)
                    - layer.current.value(Prop::Depth, seg + 1, j, i);
                if value < 0.0 || !value.is_finite() || value.abs() > 1.0e8 {
                    0.0
                } else {
                    value
                }
            };

            if !layer_is_mobile && previous_real > current_real && previous_real > 0.0 {
                // Layer is eroding: interpolate the MaxVES at the new top.
                let eroded_real = previous_real - current_real;
                let max_ves_above = null_to(layer.previous.value(Prop::MaxVes, seg + 1, j, i), 0.0)
                    .max((1.0 + lateral_stress_factor) * ves_top);
                let max_ves_below = null_to(layer.previous.value(Prop::MaxVes, seg, j, i), 0.0)
                    .max(
                        (1.0 + lateral_stress_factor)
                            * null_to(layer.current.value(Prop::Ves, seg, j, i), 0.0),
                    );
                (max_ves_below - max_ves_above) * (eroded_real / previous_real) + max_ves_above
            } else {
                null_to(layer.previous.value(Prop::MaxVes, z_top, j, i), 0.0)
                    .max((1.0 + lateral_stress_factor) * ves_top)
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
        layer.porosity[[z_top, j, i]] = porosity_top;

        let fluid_density_top = fluid.density(temperature_top, pore_top);
        let bulk_density_top =
            porosity_top * fluid_density_top + (1.0 - porosity_top) * solid_density;

        lithology.get_porosity(
            ves_top,
            max_ves_top,
            include_chemical_compaction,
            chemical_compaction_top,
            &mut porosity_mixture,
        );
        let (kn_top, kp_top) = lithology.bulk_permeability_np(ves_top, max_ves_top, &porosity_mixture);
        layer.permeability_normal[[z_top, j, i]] = kn_top;
        layer.permeability_planar[[z_top, j, i]] = kp_top;

        // Inactive nodes above the topmost active segment take the
        // top-of-layer values; their segments have no solid thickness.
        for k in ((topmost_segment + 1).max(0) as usize..=z_top).rev() {
            if k < z_top {
                layer.current.set(Prop::SolidThickness, k, j, i, 0.0);
            }
            layer
                .current
                .set(Prop::HydrostaticPressure, k, j, i, hydrostatic_top);
            layer
                .current
                .set(Prop::LithostaticPressure, k, j, i, lithostatic_top);
            layer.current.set(Prop::PorePressure, k, j, i, pore_top);
            layer.current.set(Prop::Ves, k, j, i, ves_top);
            layer.current.set(Prop::MaxVes, k, j, i, max_ves_top);
            layer.porosity[[k, j, i]] = porosity_top;
        }

        let mut state = NglSegmentState {
            ves: ves_top,
            max_ves: max_ves_top,
            porosity_top,
            porosity_bottom: porosity_top,
            hydrostatic: hydrostatic_top,
            pore: pore_top,
            lithostatic: lithostatic_top,
            fluid_density: fluid_density_top,
            bulk_density: bulk_density_top,
            solid_thickness: 0.0,
        };

        for k in (0..=topmost_segment).rev() {
            if k < 0 {
                break;
            }
            let k = k as usize;

            let intermediate_max_ves_bottom = null_to(layer.previous.value(Prop::MaxVes, k, j, i), 0.0);
            let depth_bottom = layer.current.value(Prop::Depth, k, j, i);
            let mut temperature_bottom = layer.current.value(Prop::Temperature, k, j, i);
            let overpressure_bottom = null_to(layer.current.value(Prop::Overpressure, k, j, i), 0.0);
            let chemical_compaction_bottom =
                null_to(layer.current.value(Prop::ChemicalCompaction, k, j, i), 0.0);

            let real_thickness = depth_bottom - depth_top;

            // Only an initialisation; refined inside the Picard loop.
            state.porosity_bottom = lithology.porosity(
                intermediate_max_ves_bottom,
                intermediate_max_ves_bottom,
                include_chemical_compaction,
                chemical_compaction_bottom,
            );

            if temperature_bottom == CAULDRON_NO_DATA_VALUE {
                temperature_bottom = project.estimate_temperature_at_depth(
                    depth_bottom,
                    surface_temperature,
                    surface_depth,
                );
            }

            state.porosity_top = porosity_top;
            compute_solid_thickness(
                &lithology,
                &fluid,
                include_chemical_compaction,
                real_thickness,
                lateral_stress_factor,
                temperature_bottom,
                overpressure_bottom,
                intermediate_max_ves_bottom,
                chemical_compaction_bottom,
                &mut state,
            );

            // Bottom values become the top of the next segment.
            depth_top = depth_bottom;
            porosity_top = state.porosity_bottom;

            layer.current.set(Prop::SolidThickness, k, j, i, state.solid_thickness);
            layer
                .current
                .set(Prop::HydrostaticPressure, k, j, i, state.hydrostatic);
            layer
                .current
                .set(Prop::LithostaticPressure, k, j, i, state.lithostatic);
            layer.current.set(Prop::PorePressure, k, j, i, state.pore);
            layer.current.set(Prop::Ves, k, j, i, state.ves);
            layer.current.set(Prop::MaxVes, k, j, i, state.max_ves);
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

        column.depth[[j, i]] = depth_top;
        column.hydrostatic[[j, i]] = state.hydrostatic;
        column.pore[[j, i]] = state.pore;
        column.lithostatic[[j, i]] = state.lithostatic;
        column.ves[[j, i]] = state.ves;
        column.max_ves[[j, i]] = state.max_ves;
    }
}

/// The NGL corrector: pure bookkeeping. The computation is driven by the
/// input real thicknesses, so the final thicknesses are the input by
/// construction and the geometry always converges.
pub fn adjust_solid_thickness(
    layers: &mut [Layer],
    valid_needle: &Array2<bool>,
) -> FctReport {
    for index in layer_indices(
        layers,
        Direction::Descending,
        LayerRange::SedimentsOnly,
        ActivityFilter::ActiveOnly,
        0.0,
    ) {
        let layer = &mut layers[index];
        let segments = layer.nr_of_active_segments();
        layer
            .current
            .activate(Prop::SolidThickness, InsertMode::Insert, true);
        for ((j, i), &valid) in valid_needle.indexed_iter() {
            if !valid {
                layer.fct_correction[[j, i]] = CAULDRON_NO_DATA_VALUE;
                layer.thickness_error[[j, i]] = CAULDRON_NO_DATA_VALUE;
                continue;
            }
            let mut computed_solid_thickness = 0.0;
            let mut initial_fct = 0.0;
            for k in 0..segments.saturating_sub(1) {
                computed_solid_thickness += layer.current.value(Prop::SolidThickness, k, j, i);
                let segment_fct = layer.segment_solid_thickness_at(i, j, k, 0.0);
                if segment_fct != CAULDRON_NO_DATA_VALUE && segment_fct != IBS_NO_DATA_VALUE {
                    initial_fct += segment_fct;
                }
            }

            let fct_scaling = if initial_fct.abs() > 1.0e-10 && computed_solid_thickness.abs() > 1.0e-10
            {
                computed_solid_thickness / initial_fct
            } else {
                1.0
            };

            layer.fct_correction[[j, i]] *= fct_scaling;
            layer.thickness_error[[j, i]] = if computed_solid_thickness == 0.0 {
                0.0
            } else {
                ((initial_fct - computed_solid_thickness) / computed_solid_thickness).abs() * 100.0
            };
            layer.scale_solid_thickness_history(i, j, fct_scaling);
        }
        layer.current.restore(Prop::SolidThickness);
    }

    // The final thicknesses must be the input thicknesses.
    FctReport {
        geometry_has_converged: true,
        maximum_relative_error: 0.0,
    }
}
