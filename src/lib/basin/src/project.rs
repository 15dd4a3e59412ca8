//! The project context: snapshots, run parameters, boundary-condition
//! histories, the output-property filter and the persisted run-status
//! field. The driver borrows this; no global state.

use serde::{Deserialize, Serialize};

use crate::error::SimulationError;
use crate::grid::MapGrid;
use crate::{ages_equal, CalculationMode, MINIMUM_PRESSURE_TIME_STEP, STANDARD_SURFACE_TEMPERATURE};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotKind {
    /// Required output time.
    Major,
    /// Optional intermediate output time.
    Minor,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Age in Ma.
    pub age: f64,
    pub kind: SnapshotKind,
}

/// The ordered snapshot sequence, oldest first, ending at present day.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SnapshotSequence {
    majors: Vec<f64>,
    minors: Vec<f64>,
    /// True when the minor snapshots were prescribed by the project (from a
    /// previous run) rather than collected on the fly.
    pub prescribes_minor_snapshots: bool,
}

impl SnapshotSequence {
    pub fn new(snapshots: &[Snapshot]) -> Result<Self, SimulationError> {
        let mut majors: Vec<f64> = snapshots
            .iter()
            .filter(|s| s.kind == SnapshotKind::Major)
            .map(|s| s.age)
            .collect();
        let mut minors: Vec<f64> = snapshots
            .iter()
            .filter(|s| s.kind == SnapshotKind::Minor)
            .map(|s| s.age)
            .collect();
        if majors.is_empty() {
            return Err(SimulationError::InputInconsistency(
                "no snapshot times present".to_string(),
            ));
        }
        majors.sort_by(|a, b| b.total_cmp(a));
        minors.sort_by(|a, b| b.total_cmp(a));
        if !ages_equal(*majors.last().unwrap(), 0.0) {
            return Err(SimulationError::InputInconsistency(
                "snapshot sequence must end at present day (0 Ma)".to_string(),
            ));
        }
        let prescribes_minor_snapshots = !minors.is_empty();
        Ok(SnapshotSequence {
            majors,
            minors,
            prescribes_minor_snapshots,
        })
    }

    pub fn majors(&self) -> &[f64] {
        &self.majors
    }

    pub fn minors(&self) -> &[f64] {
        &self.minors
    }

    pub fn oldest(&self) -> f64 {
        self.majors[0]
    }

    pub fn valid_minor(&self, index: usize) -> bool {
        index < self.minors.len()
    }

    /// Advance the minor iterator past every minor snapshot at or older
    /// than the current time.
    pub fn advance_minor_iterator(&self, current_time: f64, index: &mut usize) {
        while *index < self.minors.len() && self.minors[*index] >= current_time {
            *index += 1;
        }
    }

    /// True when `time` lies within `fraction` of the step of the minor
    /// snapshot at `index`.
    pub fn is_almost_snapshot(
        &self,
        time: f64,
        time_step: f64,
        index: usize,
        fraction: f64,
    ) -> bool {
        self.valid_minor(index) && (time - self.minors[index]).abs() < fraction * time_step
    }

    /// True when `age` is a minor snapshot time (float-epsilon comparison).
    pub fn is_minor_snapshot(&self, age: f64) -> bool {
        self.minors.iter().any(|&m| ages_equal(age, m))
    }
}

/// Bottom thermal boundary condition.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum BottomBoundaryCondition {
    /// Fixed heat flow into the base, mW/m^2.
    FixedHeatFlow(f64),
    /// Fixed temperature at the base of the mantle, C.
    FixedTemperature(f64),
}

/// A (possibly time-dependent) surface over the map grid. Constant surfaces
/// cover most projects; a history interpolates piecewise-linearly in age.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SurfaceHistory {
    Constant(f64),
    /// (age, value) knots, oldest first.
    History(Vec<(f64, f64)>),
}

impl SurfaceHistory {
    pub fn value_at(&self, _i: usize, _j: usize, age: f64) -> f64 {
        match self {
            SurfaceHistory::Constant(v) => *v,
            SurfaceHistory::History(knots) => {
                if knots.is_empty() {
                    return 0.0;
                }
                if age >= knots[0].0 {
                    return knots[0].1;
                }
                for pair in knots.windows(2) {
                    let (a0, v0) = pair[0];
                    let (a1, v1) = pair[1];
                    if age <= a0 && age >= a1 {
                        let w = if (a0 - a1).abs() > 0.0 {
                            (a0 - age) / (a0 - a1)
                        } else {
                            0.0
                        };
                        return v0 + w * (v1 - v0);
                    }
                }
                knots.last().unwrap().1
            }
        }
    }
}

/// Permafrost time-stepping parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PermafrostParameters {
    /// When positive, overrides every other time-step prediction.
    pub fixed_time_step: f64,
    /// Refined step used near the switch ages.
    pub time_step: f64,
    /// Ages (Ma) at which permafrost switches on or off.
    pub switch_ages: Vec<f64>,
}

impl PermafrostParameters {
    /// True when the current age is within one refined step of a switch.
    pub fn switch_time_step(&self, current_time: f64) -> bool {
        self.switch_ages
            .iter()
            .any(|&a| (current_time - a).abs() <= self.time_step)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VelocityAlgorithm {
    GardnersVelocityDensity,
    WylliesTimeAverage,
}

/// Project-wide numerical parameters. Defaults reproduce a mid
/// optimisation-level run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunParameters {
    pub optimisation_level: usize,
    pub initial_time_step: f64,
    pub minimum_time_step: f64,
    pub maximum_time_step: f64,
    pub time_step_increase_factor: f64,
    pub time_step_decrease_factor: f64,
    /// Optimal maximum overpressure change per step, MPa.
    pub optimal_pressure_difference: f64,
    /// Optimal maximum temperature change per step, C.
    pub optimal_temperature_difference: f64,
    /// Optimal maximum temperature change per step in source rocks, C.
    pub optimal_sr_temperature_difference: f64,
    pub cfl_time_stepping: bool,
    /// Cap on the geometric-loop outer iterations.
    pub max_number_of_run_overpressure: usize,
    /// Damping weight w in the FCT correction scale 1 - w + w*input/computed.
    pub fct_correction_scaling_weight: f64,
    /// Drive by input real thicknesses instead of the geometric loop.
    pub non_geometric_loop: bool,
    pub allow_pressure_jacobian_reuse: bool,
    pub pressure_jacobian_reuse_count: usize,
    /// Newton (true) or single linear solve (false) for temperature.
    pub nonlinear_temperature: bool,
    pub do_chemical_compaction: bool,
    /// Integrate the source-rock kinetics alongside temperature.
    pub integrate_genex: bool,
    /// Advanced-lithosphere-calculation basement model.
    pub is_alc: bool,
    pub permafrost: Option<PermafrostParameters>,
    pub velocity_algorithm: VelocityAlgorithm,
}

impl Default for RunParameters {
    fn default() -> Self {
        RunParameters {
            optimisation_level: 2,
            initial_time_step: 0.5,
            minimum_time_step: MINIMUM_PRESSURE_TIME_STEP,
            maximum_time_step: 5.0,
            time_step_increase_factor: 1.5,
            time_step_decrease_factor: 0.7,
            optimal_pressure_difference: 1.0,
            optimal_temperature_difference: 5.0,
            optimal_sr_temperature_difference: 2.0,
            cfl_time_stepping: false,
            max_number_of_run_overpressure: 5,
            fct_correction_scaling_weight: 1.0,
            non_geometric_loop: false,
            allow_pressure_jacobian_reuse: true,
            pressure_jacobian_reuse_count: 4,
            nonlinear_temperature: true,
            do_chemical_compaction: false,
            integrate_genex: false,
            is_alc: false,
            permafrost: None,
            velocity_algorithm: VelocityAlgorithm::GardnersVelocityDensity,
        }
    }
}

impl RunParameters {
    fn level(&self) -> usize {
        self.optimisation_level.min(crate::NUMBER_OF_OPTIMISATION_LEVELS - 1)
    }

    /// Inner substep count of the geometric-loop compaction equation.
    pub fn compaction_equation_steps(&self) -> usize {
        const STEPS: [usize; 5] = [2, 3, 4, 5, 8];
        STEPS[self.level()]
    }

    /// Newton iteration cap for the pressure equation.
    pub fn maximum_pressure_nonlinear_iterations(&self) -> usize {
        const CAPS: [usize; 5] = [8, 10, 15, 20, 30];
        CAPS[self.level()]
    }

    /// Newton iteration cap for the temperature equation.
    pub fn maximum_temperature_nonlinear_iterations(&self) -> usize {
        20
    }

    /// Newton tolerance for the pressure equation. The early geometric
    /// iterations only need a rough solve: the thicknesses will be rescaled
    /// anyway, so the tolerance is relaxed by a decade per outstanding
    /// iteration, at most two decades.
    pub fn pressure_newton_tolerance(
        &self,
        is_geometric_loop: bool,
        geometric_iteration: usize,
    ) -> f64 {
        const BASE: [f64; 5] = [1.0e-5, 1.0e-5, 1.0e-6, 1.0e-6, 1.0e-7];
        let base = BASE[self.level()];
        if is_geometric_loop && geometric_iteration < 3 {
            base * 10f64.powi((3 - geometric_iteration as i32).min(2))
        } else {
            base
        }
    }

    pub fn temperature_newton_tolerance(&self) -> f64 {
        1.0e-6
    }

    /// Linear-solver tolerance for either equation.
    pub fn linear_solver_tolerance(&self) -> f64 {
        const TOL: [f64; 5] = [1.0e-6, 1.0e-7, 1.0e-8, 1.0e-9, 1.0e-10];
        TOL[self.level()]
    }

    /// Geometric-loop relative thickness tolerance.
    pub fn relative_thickness_tolerance(&self) -> f64 {
        const TOL: [f64; 5] = [0.05, 0.04, 0.03, 0.02, 0.01];
        TOL[self.level()]
    }

    /// Geometric-loop absolute thickness tolerance, m. Applied to layers
    /// thinner than 100 m.
    pub fn absolute_thickness_tolerance(&self) -> f64 {
        const TOL: [f64; 5] = [2.0, 1.0, 1.0, 0.5, 0.5];
        TOL[self.level()]
    }

    pub fn initial_time_step_at(&self, _current_time: f64) -> f64 {
        self.initial_time_step
    }
}

/// Which output properties are selected. An empty filter selects nothing.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OutputFilter {
    selected: Vec<String>,
    pub select_all: bool,
}

impl OutputFilter {
    pub fn all() -> Self {
        OutputFilter {
            selected: Vec::new(),
            select_all: true,
        }
    }

    pub fn with(names: &[&str]) -> Self {
        OutputFilter {
            selected: names.iter().map(|s| s.to_string()).collect(),
            select_all: false,
        }
    }

    pub fn selects(&self, name: &str) -> bool {
        self.select_all || self.selected.iter().any(|s| s == name)
    }
}

/// The process-wide project handle: owns the snapshot sequence and the
/// simulation-wide inputs; the driver borrows it.
#[derive(Clone, Debug)]
pub struct ProjectHandle {
    pub name: String,
    pub map_grid: MapGrid,
    pub calculation_mode: CalculationMode,
    pub run_parameters: RunParameters,
    pub snapshots: SnapshotSequence,
    pub sea_bottom_depth: SurfaceHistory,
    pub sea_bottom_temperature: SurfaceHistory,
    /// Time-dependent lateral stress factor alpha in MaxVES = (1+alpha)*VES.
    pub lateral_stress: SurfaceHistory,
    pub bottom_boundary: BottomBoundaryCondition,
    pub output_filter: OutputFilter,
    /// Run-status field persisted at the start of a calculation.
    pub run_status: Option<String>,
}

impl ProjectHandle {
    pub fn new(
        name: &str,
        map_grid: MapGrid,
        calculation_mode: CalculationMode,
        snapshots: &[Snapshot],
    ) -> Result<Self, SimulationError> {
        Ok(ProjectHandle {
            name: name.to_string(),
            map_grid,
            calculation_mode,
            run_parameters: RunParameters::default(),
            snapshots: SnapshotSequence::new(snapshots)?,
            sea_bottom_depth: SurfaceHistory::Constant(0.0),
            sea_bottom_temperature: SurfaceHistory::Constant(STANDARD_SURFACE_TEMPERATURE),
            lateral_stress: SurfaceHistory::Constant(0.0),
            bottom_boundary: BottomBoundaryCondition::FixedHeatFlow(60.0),
            output_filter: OutputFilter::all(),
            run_status: None,
        })
    }

    pub fn sea_bottom_depth_at(&self, i: usize, j: usize, age: f64) -> f64 {
        self.sea_bottom_depth.value_at(i, j, age)
    }

    pub fn sea_bottom_temperature_at(&self, i: usize, j: usize, age: f64) -> f64 {
        self.sea_bottom_temperature.value_at(i, j, age)
    }

    pub fn lateral_stress_factor(&self, age: f64) -> f64 {
        self.lateral_stress.value_at(0, 0, age)
    }

    /// Age of the basin: the oldest snapshot time.
    pub fn age_of_basin(&self) -> f64 {
        self.snapshots.oldest()
    }

    /// Persist the run-status spelling for the current mode.
    pub fn initialise_run_status(&mut self) {
        self.run_status = self.calculation_mode.run_status_str().map(str::to_string);
    }

    /// First temperature estimate at depth, from the sea-bottom boundary
    /// and the standard gradient.
    pub fn estimate_temperature_at_depth(
        &self,
        depth: f64,
        surface_temperature: f64,
        surface_depth: f64,
    ) -> f64 {
        surface_temperature
            + crate::STANDARD_TEMPERATURE_GRADIENT * ((depth - surface_depth).max(0.0)) / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshots(ages: &[f64]) -> Vec<Snapshot> {
        ages.iter()
            .map(|&age| Snapshot {
                age,
                kind: SnapshotKind::Major,
            })
            .collect()
    }

    #[test]
    fn snapshot_sequence_orders_oldest_first_and_requires_present_day() {
        let seq = SnapshotSequence::new(&snapshots(&[0.0, 50.0, 10.0])).unwrap();
        assert_eq!(seq.majors(), &[50.0, 10.0, 0.0]);
        assert!(SnapshotSequence::new(&snapshots(&[50.0, 10.0])).is_err());
        assert!(SnapshotSequence::new(&[]).is_err());
    }

    #[test]
    fn minor_iterator_advances_past_older_times() {
        let mut all = snapshots(&[20.0, 0.0]);
        all.push(Snapshot {
            age: 15.0,
            kind: SnapshotKind::Minor,
        });
        all.push(Snapshot {
            age: 5.0,
            kind: SnapshotKind::Minor,
        });
        let seq = SnapshotSequence::new(&all).unwrap();
        let mut index = 0;
        seq.advance_minor_iterator(12.0, &mut index);
        assert_eq!(index, 1);
        assert!(seq.valid_minor(index));
        assert_eq!(seq.minors()[index], 5.0);
    }

    #[test]
    fn surface_history_interpolates_in_age() {
        let history = SurfaceHistory::History(vec![(100.0, 0.0), (50.0, 200.0), (0.0, 100.0)]);
        assert_eq!(history.value_at(0, 0, 120.0), 0.0);
        assert_eq!(history.value_at(0, 0, 75.0), 100.0);
        assert_eq!(history.value_at(0, 0, 25.0), 150.0);
        assert_eq!(history.value_at(0, 0, 0.0), 100.0);
    }

    #[test]
    fn pressure_tolerance_relaxes_on_early_geometric_iterations() {
        let params = RunParameters::default();
        let first = params.pressure_newton_tolerance(true, 1);
        let later = params.pressure_newton_tolerance(true, 4);
        assert!(first > later);
        assert_eq!(later, params.pressure_newton_tolerance(false, 0));
    }

    #[test]
    fn output_filter_select_all_and_named() {
        assert!(OutputFilter::all().selects("Porosity"));
        let filter = OutputFilter::with(&["Depth", "Temperature"]);
        assert!(filter.selects("Depth"));
        assert!(!filter.selects("Porosity"));
    }
}
