//! Derived property evaluators: pure allocate/compute/drop trios over the
//! active layers, driven by the output filter. Each writes a grid into the
//! layer's `derived` slot; the driver saves it and drops it after the
//! snapshot.

use ndarray::{Array2, Array3};

use crate::layer::{layer_indices, ActivityFilter, Direction, FundamentalProperty, Layer, LayerRange};
use crate::project::{ProjectHandle, VelocityAlgorithm};
use crate::{CAULDRON_NO_DATA_VALUE, GARDNER_VELOCITY_CONSTANT};

type Prop = FundamentalProperty;

fn null_to(value: f64, fallback: f64) -> f64 {
    if value == CAULDRON_NO_DATA_VALUE || value == crate::IBS_NO_DATA_VALUE {
        fallback
    } else {
        value
    }
}

fn allocate(layer: &Layer, valid_needle: &Array2<bool>) -> Array3<f64> {
    let (ny, nx) = valid_needle.dim();
    Array3::from_elem((layer.segment_count + 1, ny, nx), CAULDRON_NO_DATA_VALUE)
}

/// Bulk density: porosity-weighted mixture of the fluid density at
/// (T, pore pressure) and the grain density.
pub fn compute_bulk_density(layers: &mut [Layer], valid_needle: &Array2<bool>, age: f64) {
    for index in layer_indices(
        layers,
        Direction::Descending,
        LayerRange::BasementAndSediments,
        ActivityFilter::ActiveOnly,
        age,
    ) {
        let layer = &mut layers[index];
        let mut grid = allocate(layer, valid_needle);
        let z_top = layer.nr_of_active_segments();
        for ((j, i), &valid) in valid_needle.indexed_iter() {
            if !valid {
                continue;
            }
            let solid_density = layer.lithology(i, j).density();
            for k in 0..=z_top {
                let porosity = null_to(layer.porosity[[k, j, i]], 0.0);
                let temperature = null_to(layer.current.value(Prop::Temperature, k, j, i), 30.0);
                let pore_pressure = null_to(layer.current.value(Prop::PorePressure, k, j, i), 0.1);
                let fluid_density = layer.fluid.density(temperature, pore_pressure);
                grid[[k, j, i]] = porosity * fluid_density + (1.0 - porosity) * solid_density;
            }
        }
        layer.derived.bulk_density = Some(grid);
    }
}

pub fn delete_bulk_density(layers: &mut [Layer]) {
    for layer in layers {
        layer.derived.bulk_density = None;
    }
}

/// Seismic velocity: Gardner's velocity-density relation or Wyllie's time
/// average, as the project selects.
pub fn compute_velocity(layers: &mut [Layer], project: &ProjectHandle, valid_needle: &Array2<bool>, age: f64) {
    let algorithm = project.run_parameters.velocity_algorithm;
    let indices = layer_indices(
        layers,
        Direction::Descending,
        LayerRange::BasementAndSediments,
        ActivityFilter::ActiveOnly,
        age,
    );
    for index in indices {
        let layer = &mut layers[index];
        if layer.derived.bulk_density.is_none() {
            compute_bulk_density(std::slice::from_mut(layer), valid_needle, age);
        }
        let bulk_density = layer.derived.bulk_density.clone().expect("bulk density computed");
        let mut grid = allocate(layer, valid_needle);
        let z_top = layer.nr_of_active_segments();
        for ((j, i), &valid) in valid_needle.indexed_iter() {
            if !valid {
                continue;
            }
            let matrix_velocity = layer.lithology(i, j).seismic_velocity();
            let fluid_velocity = layer.fluid.seismic_velocity;
            for k in 0..=z_top {
                let velocity = match algorithm {
                    VelocityAlgorithm::GardnersVelocityDensity => {
                        let rho = null_to(bulk_density[[k, j, i]], 0.0);
                        if rho <= 0.0 {
                            continue;
                        }
                        (rho / GARDNER_VELOCITY_CONSTANT).powi(4)
                    }
                    VelocityAlgorithm::WylliesTimeAverage => {
                        let porosity = null_to(layer.porosity[[k, j, i]], 0.0).clamp(0.0, 1.0);
                        let slowness =
                            porosity / fluid_velocity + (1.0 - porosity) / matrix_velocity;
                        1.0 / slowness
                    }
                };
                grid[[k, j, i]] = velocity;
            }
        }
        layer.derived.velocity = Some(grid);
    }
}

pub fn delete_velocity(layers: &mut [Layer]) {
    for layer in layers {
        layer.derived.velocity = None;
    }
}

/// Reflectivity at the boundary between the bottom of the layer above and
/// the top of this layer: (Z_above - Z_below) over the impedance sum. The
/// upper surface of the top layer is 0.
pub fn compute_reflectivity(layers: &mut [Layer], project: &ProjectHandle, valid_needle: &Array2<bool>, age: f64) {
    let indices = layer_indices(
        layers,
        Direction::Descending,
        LayerRange::BasementAndSediments,
        ActivityFilter::ActiveOnly,
        age,
    );
    let (ny, nx) = valid_needle.dim();
    // Impedance at the bottom of the layer above, surface first.
    let mut impedance_above: Option<Array2<f64>> = None;

    for index in indices {
        {
            let layer = &mut layers[index];
            if layer.derived.velocity.is_none() {
                compute_velocity(std::slice::from_mut(layer), project, valid_needle, age);
            }
        }
        let layer = &mut layers[index];
        let velocity = layer.derived.velocity.clone().expect("velocity computed");
        let bulk_density = layer.derived.bulk_density.clone().expect("bulk density computed");
        let z_top = layer.nr_of_active_segments();
        let mut grid = allocate(layer, valid_needle);
        let mut impedance_bottom = Array2::from_elem((ny, nx), CAULDRON_NO_DATA_VALUE);

        for ((j, i), &valid) in valid_needle.indexed_iter() {
            if !valid {
                continue;
            }
            let impedance_top = null_to(velocity[[z_top, j, i]], 0.0)
                * null_to(bulk_density[[z_top, j, i]], 0.0);
            grid[[z_top, j, i]] = match &impedance_above {
                Some(above) => {
                    let upper = null_to(above[[j, i]], 0.0);
                    if upper + impedance_top > 0.0 {
                        (upper - impedance_top) / (impedance_top + upper)
                    } else {
                        0.0
                    }
                }
                // Upper surface.
                None => 0.0,
            };
            grid[[0, j, i]] = 0.0;
            impedance_bottom[[j, i]] =
                null_to(velocity[[0, j, i]], 0.0) * null_to(bulk_density[[0, j, i]], 0.0);
        }
        layer.derived.reflectivity = Some(grid);
        impedance_above = Some(impedance_bottom);
    }
}

pub fn delete_reflectivity(layers: &mut [Layer]) {
    for layer in layers {
        layer.derived.reflectivity = None;
    }
}

/// Sonic slowness, microseconds per meter: 1e6 / velocity.
pub fn compute_sonic(layers: &mut [Layer], project: &ProjectHandle, valid_needle: &Array2<bool>, age: f64) {
    let indices = layer_indices(
        layers,
        Direction::Descending,
        LayerRange::BasementAndSediments,
        ActivityFilter::ActiveOnly,
        age,
    );
    for index in indices {
        {
            let layer = &mut layers[index];
            if layer.derived.velocity.is_none() {
                compute_velocity(std::slice::from_mut(layer), project, valid_needle, age);
            }
        }
        let layer = &mut layers[index];
        let velocity = layer.derived.velocity.clone().expect("velocity computed");
        let mut grid = allocate(layer, valid_needle);
        let z_top = layer.nr_of_active_segments();
        for ((j, i), &valid) in valid_needle.indexed_iter() {
            if !valid {
                continue;
            }
            for k in 0..=z_top {
                let v = velocity[[k, j, i]];
                if v != CAULDRON_NO_DATA_VALUE && v > 0.0 {
                    grid[[k, j, i]] = 1.0e6 / v;
                }
            }
        }
        layer.derived.sonic = Some(grid);
    }
}

pub fn delete_sonic(layers: &mut [Layer]) {
    for layer in layers {
        layer.derived.sonic = None;
    }
}

/// Thermal conductivity normal and planar to bedding. Sediments evaluate
/// at the pore pressure, basement at the lithostatic pressure.
pub fn compute_thermal_conductivity(layers: &mut [Layer], valid_needle: &Array2<bool>, age: f64) {
    for index in layer_indices(
        layers,
        Direction::Descending,
        LayerRange::BasementAndSediments,
        ActivityFilter::ActiveOnly,
        age,
    ) {
        let layer = &mut layers[index];
        let mut normal = allocate(layer, valid_needle);
        let mut planar = allocate(layer, valid_needle);
        let z_top = layer.nr_of_active_segments();
        let pressure_property = if layer.is_sediment() {
            Prop::PorePressure
        } else {
            Prop::LithostaticPressure
        };
        for ((j, i), &valid) in valid_needle.indexed_iter() {
            if !valid {
                continue;
            }
            for k in 0..=z_top {
                let porosity = null_to(layer.porosity[[k, j, i]], 0.0).clamp(0.0, 1.0);
                let temperature = null_to(layer.current.value(Prop::Temperature, k, j, i), 30.0);
                let _pressure = null_to(layer.current.value(pressure_property, k, j, i), 0.1);
                let (kn, kp) = layer.lithology(i, j).bulk_thermal_conductivity_np(
                    porosity,
                    temperature,
                    layer.fluid.thermal_conductivity,
                );
                normal[[k, j, i]] = kn;
                planar[[k, j, i]] = kp;
            }
        }
        layer.derived.thermal_conductivity_normal = Some(normal);
        layer.derived.thermal_conductivity_planar = Some(planar);
    }
}

pub fn delete_thermal_conductivity(layers: &mut [Layer]) {
    for layer in layers {
        layer.derived.thermal_conductivity_normal = None;
        layer.derived.thermal_conductivity_planar = None;
    }
}

/// Thermal diffusivity: normal conductivity over volumetric heat capacity.
pub fn compute_diffusivity(layers: &mut [Layer], valid_needle: &Array2<bool>, age: f64) {
    let indices = layer_indices(
        layers,
        Direction::Descending,
        LayerRange::BasementAndSediments,
        ActivityFilter::ActiveOnly,
        age,
    );
    for index in indices {
        {
            let layer = &mut layers[index];
            if layer.derived.thermal_conductivity_normal.is_none() {
                compute_thermal_conductivity(std::slice::from_mut(layer), valid_needle, age);
            }
            if layer.derived.bulk_density.is_none() {
                compute_bulk_density(std::slice::from_mut(layer), valid_needle, age);
            }
        }
        let layer = &mut layers[index];
        let conductivity = layer
            .derived
            .thermal_conductivity_normal
            .clone()
            .expect("conductivity computed");
        let bulk_density = layer.derived.bulk_density.clone().expect("bulk density computed");
        let mut grid = allocate(layer, valid_needle);
        let z_top = layer.nr_of_active_segments();
        for ((j, i), &valid) in valid_needle.indexed_iter() {
            if !valid {
                continue;
            }
            let heat_capacity = layer.lithology(i, j).heat_capacity();
            for k in 0..=z_top {
                let kn = null_to(conductivity[[k, j, i]], 0.0);
                let rho = null_to(bulk_density[[k, j, i]], 0.0);
                if rho > 0.0 && heat_capacity > 0.0 {
                    grid[[k, j, i]] = kn / (rho * heat_capacity);
                }
            }
        }
        layer.derived.diffusivity = Some(grid);
    }
}

pub fn delete_diffusivity(layers: &mut [Layer]) {
    for layer in layers {
        layer.derived.diffusivity = None;
    }
}

/// Present thickness of the layer: bottom minus top depth, at the column
/// top only.
pub fn compute_thickness(layers: &mut [Layer], valid_needle: &Array2<bool>, age: f64) {
    for index in layer_indices(
        layers,
        Direction::Descending,
        LayerRange::BasementAndSediments,
        ActivityFilter::ActiveOnly,
        age,
    ) {
        let layer = &mut layers[index];
        let (ny, nx) = valid_needle.dim();
        let mut grid = Array2::from_elem((ny, nx), CAULDRON_NO_DATA_VALUE);
        let z_top = layer.nr_of_active_segments();
        for ((j, i), &valid) in valid_needle.indexed_iter() {
            if !valid {
                continue;
            }
            let bottom = layer.current.value(Prop::Depth, 0, j, i);
            let top = layer.current.value(Prop::Depth, z_top, j, i);
            if bottom != CAULDRON_NO_DATA_VALUE && top != CAULDRON_NO_DATA_VALUE {
                grid[[j, i]] = bottom - top;
            }
        }
        layer.derived.thickness = Some(grid);
    }
}

pub fn delete_thickness(layers: &mut [Layer]) {
    for layer in layers {
        layer.derived.thickness = None;
    }
}

/// Per-element geological provenance maps consumed by the property output
/// layer: whether the column is being eroded at this age, whether it sits
/// on a fault, and whether an allochthonous body has replaced the
/// lithology. Faulting and allochthonous emplacement are not modelled
/// here; their maps are identically zero on valid columns.
pub fn compute_provenance_maps(layers: &mut [Layer], valid_needle: &Array2<bool>, age: f64) {
    for index in layer_indices(
        layers,
        Direction::Descending,
        LayerRange::SedimentsOnly,
        ActivityFilter::ActiveOnly,
        age,
    ) {
        let layer = &mut layers[index];
        let (ny, nx) = valid_needle.dim();
        let mut erosion_factor = Array2::from_elem((ny, nx), CAULDRON_NO_DATA_VALUE);
        let mut fault_elements = Array2::from_elem((ny, nx), CAULDRON_NO_DATA_VALUE);
        let mut allochthonous = Array2::from_elem((ny, nx), CAULDRON_NO_DATA_VALUE);
        for ((j, i), &valid) in valid_needle.indexed_iter() {
            if !valid {
                continue;
            }
            let eroding = match &layer.erosion {
                Some(event) => {
                    age < event.start_age
                        && age > event.end_age
                        && event.eroded_solid_thickness[[j, i]] > 0.0
                }
                None => false,
            };
            erosion_factor[[j, i]] = if eroding { 1.0 } else { 0.0 };
            fault_elements[[j, i]] = 0.0;
            allochthonous[[j, i]] = 0.0;
        }
        layer.derived.erosion_factor = Some(erosion_factor);
        layer.derived.fault_elements = Some(fault_elements);
        layer.derived.allochthonous_lithology = Some(allochthonous);
    }
}

pub fn delete_provenance_maps(layers: &mut [Layer]) {
    for layer in layers {
        layer.derived.erosion_factor = None;
        layer.derived.fault_elements = None;
        layer.derived.allochthonous_lithology = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::MapGrid;
    use crate::layer::LayerKind;
    use crate::lithology::{CompoundLithology, FluidType, SimpleLithology};
    use crate::project::{Snapshot, SnapshotKind};
    use crate::CalculationMode;
    use approx::assert_relative_eq;

    fn setup() -> (ProjectHandle, Vec<Layer>, Array2<bool>) {
        let map = MapGrid::new(3, 3, 0.0, 0.0, 100.0, 100.0).unwrap();
        let project = ProjectHandle::new(
            "derived-test",
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
        .unwrap();
        let valid = Array2::from_elem((3, 3), true);
        let mut shale = Layer::new(
            "Shale",
            LayerKind::Sediment,
            10.0,
            7.0,
            2,
            CompoundLithology::uniform(SimpleLithology::standard_shale()),
            FluidType::standard_water(),
            Array2::from_elem((3, 3), 150.0),
            &map,
        );
        let mut sand = Layer::new(
            "Sand",
            LayerKind::Sediment,
            7.0,
            4.0,
            2,
            CompoundLithology::uniform(SimpleLithology::standard_sandstone()),
            FluidType::standard_water(),
            Array2::from_elem((3, 3), 150.0),
            &map,
        );
        shale.find_active_segments(0.0);
        sand.find_active_segments(0.0);
        let mut layers = vec![shale, sand];
        crate::geometric::initialise_pressure_properties(&mut layers, &valid, 10.0, 0.0);
        crate::geometric::compute_dependent_properties(&mut layers, &project, &valid, 10.0, 0.0);
        (project, layers, valid)
    }

    #[test]
    fn bulk_density_sits_between_fluid_and_grain_density() {
        let (_, mut layers, valid) = setup();
        compute_bulk_density(&mut layers, &valid, 0.0);
        for layer in &layers {
            let grid = layer.derived.bulk_density.as_ref().unwrap();
            for k in 0..=layer.nr_of_active_segments() {
                let rho = grid[[k, 1, 1]];
                assert!(rho > 1000.0 && rho < 2800.0, "rho={rho}");
            }
        }
        delete_bulk_density(&mut layers);
        assert!(layers[0].derived.bulk_density.is_none());
    }

    #[test]
    fn sonic_is_the_reciprocal_of_velocity() {
        let (project, mut layers, valid) = setup();
        compute_velocity(&mut layers, &project, &valid, 0.0);
        compute_sonic(&mut layers, &project, &valid, 0.0);
        let layer = &layers[1];
        let velocity = layer.derived.velocity.as_ref().unwrap()[[1, 1, 1]];
        let sonic = layer.derived.sonic.as_ref().unwrap()[[1, 1, 1]];
        assert_relative_eq!(sonic, 1.0e6 / velocity, max_relative = 1.0e-12);
    }

    #[test]
    fn reflectivity_is_zero_at_the_surface_and_finite_at_the_boundary() {
        let (project, mut layers, valid) = setup();
        compute_reflectivity(&mut layers, &project, &valid, 0.0);
        // Top (youngest) layer: surface value 0.
        let sand = &layers[1];
        let sand_top = sand.nr_of_active_segments();
        assert_eq!(sand.derived.reflectivity.as_ref().unwrap()[[sand_top, 1, 1]], 0.0);
        // Boundary into the shale below: impedance contrast present.
        let shale = &layers[0];
        let shale_top = shale.nr_of_active_segments();
        let r = shale.derived.reflectivity.as_ref().unwrap()[[shale_top, 1, 1]];
        assert!(r.abs() <= 1.0 && r != CAULDRON_NO_DATA_VALUE);
    }

    #[test]
    fn diffusivity_combines_conductivity_and_heat_capacity() {
        let (_, mut layers, valid) = setup();
        compute_diffusivity(&mut layers, &valid, 0.0);
        let layer = &layers[0];
        let d = layer.derived.diffusivity.as_ref().unwrap()[[1, 1, 1]];
        // Rock thermal diffusivity is of order 1e-6 m^2/s.
        assert!(d > 1.0e-8 && d < 1.0e-4, "diffusivity={d}");
    }

    #[test]
    fn thickness_map_is_bottom_minus_top() {
        let (_, mut layers, valid) = setup();
        compute_thickness(&mut layers, &valid, 0.0);
        let layer = &layers[1];
        let z_top = layer.nr_of_active_segments();
        let expected = layer.current.value(Prop::Depth, 0, 1, 1)
            - layer.current.value(Prop::Depth, z_top, 1, 1);
        assert_relative_eq!(
            layer.derived.thickness.as_ref().unwrap()[[1, 1]],
            expected,
            max_relative = 1.0e-12
        );
    }
}
