//! The snapshot/simulation driver: the three top-level entry points
//! (pressure-only, temperature-only, coupled), the per-snapshot march,
//! the geometric outer loop and the per-time-step resource lifecycle.

use std::time::Instant;

use ndarray::Array2;

use crate::assembly::{
    estimate_temperature, maximum_property_difference, PressureSystem, TemperatureSystem,
};
use crate::error::{RunSummary, SimulationError};
use crate::geometric;
use crate::grid::all_reduce_min;
use crate::layer::{
    layer_indices, ActivityFilter, Direction, FundamentalProperty, Layer, LayerRange,
};
use crate::massbalance::MassBalance;
use crate::mesh::{FemGrid, MeshScope};
use crate::newton::{solve_nonlinear, JacobianReusePolicy, NewtonConfig, NewtonReport};
use crate::nongeometric;
use crate::output::{ConsoleSink, InMemoryOutput, LineSink, PropertyOutput};
use crate::prealloc::create_matrix_structure;
use crate::project::ProjectHandle;
use crate::solver::LinearSolverConfig;
use crate::timestep::{
    determine_next_coupled_time_step, determine_next_pressure_time_step,
    determine_next_temperature_time_step, step_forward_with_cursor, SnapshotCursor,
};
use crate::{ages_equal, CalculationMode, GRAVITY, IBS_NO_DATA_VALUE, PA_TO_MEGAPA};

type Prop = FundamentalProperty;

/// Wall-clock accumulators of the march stages.
#[derive(Clone, Copy, Debug, Default)]
pub struct StageTimings {
    pub system_assembly: f64,
    pub system_solve: f64,
    pub property_calculation: f64,
}

struct StepOutcome {
    newton: NewtonReport,
    maximum_pressure_difference: f64,
    maximum_temperature_difference: f64,
    maximum_sr_temperature_difference: f64,
    /// Raised by the Darcy transport kernel; nothing in this crate sets
    /// it, but the driver aggregates it like the other fatal channels.
    error_in_darcy: bool,
}

/// The simulator: owns the project context, the layer registry and the
/// output seams; drives one complete forward simulation.
pub struct Simulator {
    pub project: ProjectHandle,
    pub layers: Vec<Layer>,
    pub valid_needle: Array2<bool>,
    sink: Box<dyn LineSink>,
    mass_balance_sink: Box<dyn LineSink>,
    output: Box<dyn PropertyOutput>,
    mass_balance: MassBalance,
    saved_minor_snapshot_times: Vec<f64>,
    pub timings: StageTimings,
    time_steps: usize,
}

impl Simulator {
    pub fn new(project: ProjectHandle, layers: Vec<Layer>) -> Result<Self, SimulationError> {
        Self::with_sinks(
            project,
            layers,
            Box::new(ConsoleSink),
            Box::new(ConsoleSink),
            Box::new(InMemoryOutput::default()),
        )
    }

    pub fn with_sinks(
        project: ProjectHandle,
        layers: Vec<Layer>,
        sink: Box<dyn LineSink>,
        mass_balance_sink: Box<dyn LineSink>,
        output: Box<dyn PropertyOutput>,
    ) -> Result<Self, SimulationError> {
        if layers.is_empty() {
            return Err(SimulationError::InputInconsistency(
                "no formations defined".to_string(),
            ));
        }
        for pair in layers.windows(2) {
            if pair[0].deposition_age < pair[1].deposition_age {
                return Err(SimulationError::InputInconsistency(format!(
                    "formations must be registered bottom-up: {} is younger than {}",
                    pair[0].name, pair[1].name
                )));
            }
        }
        let (ny, nx) = (project.map_grid.ny, project.map_grid.nx);
        let mut valid_needle = Array2::from_elem((ny, nx), true);
        for layer in &layers {
            for ((j, i), value) in layer.present_day_thickness.indexed_iter() {
                if *value == IBS_NO_DATA_VALUE {
                    valid_needle[[j, i]] = false;
                }
            }
        }
        Ok(Simulator {
            project,
            layers,
            valid_needle,
            sink,
            mass_balance_sink,
            output,
            mass_balance: MassBalance::new(),
            saved_minor_snapshot_times: Vec::new(),
            timings: StageTimings::default(),
            time_steps: 0,
        })
    }

    /// Name of the mass-balance report file the surrounding program should
    /// attach to the mass-balance sink.
    pub fn mass_balance_file_name(&self) -> String {
        format!("{}_MassBalance", self.project.name)
    }

    pub fn output(&self) -> &dyn PropertyOutput {
        self.output.as_ref()
    }

    pub fn take_output(self) -> Box<dyn PropertyOutput> {
        self.output
    }

    /// Dispatch on the externally selected calculation mode.
    pub fn run(&mut self) -> Result<RunSummary, SimulationError> {
        self.project.initialise_run_status();
        match self.project.calculation_mode {
            CalculationMode::NoCalculation => Ok(RunSummary {
                geometry_has_converged: true,
                geometric_iterations: 0,
                time_steps: 0,
                thickness_errors: Vec::new(),
            }),
            CalculationMode::HydrostaticDecompaction
            | CalculationMode::HydrostaticHighResDecompaction
            | CalculationMode::CoupledHighResDecompaction => self.solve_decompaction(),
            CalculationMode::HydrostaticTemperature
            | CalculationMode::OverpressuredTemperature
            | CalculationMode::HydrostaticDarcy => self.solve_temperature(),
            CalculationMode::Overpressure => self.solve_pressure(),
            CalculationMode::PressureAndTemperature | CalculationMode::CoupledDarcy => {
                self.solve_coupled()
            }
        }
    }

    fn is_geometric_loop(&self) -> bool {
        !self.project.run_parameters.non_geometric_loop
    }

    /// Pressure-only entry point: the overpressure march wrapped in the
    /// geometric outer loop.
    pub fn solve_pressure(&mut self) -> Result<RunSummary, SimulationError> {
        self.project.initialise_run_status();
        self.geometric_outer_loop(false)
    }

    /// Fully coupled entry point: pressure then temperature within each
    /// step, wrapped in the geometric outer loop.
    pub fn solve_coupled(&mut self) -> Result<RunSummary, SimulationError> {
        self.project.initialise_run_status();
        self.geometric_outer_loop(true)
    }

    /// Hydrostatic decompaction: one non-geometric march, no equation
    /// solve; geometry comes straight from the input real thicknesses.
    pub fn solve_decompaction(&mut self) -> Result<RunSummary, SimulationError> {
        self.project.initialise_run_status();
        self.restart_activity();
        self.evolve_decompaction_basin()?;
        let report = nongeometric::adjust_solid_thickness(&mut self.layers, &self.valid_needle);
        self.save_concluding_maps();
        Ok(RunSummary {
            geometry_has_converged: report.geometry_has_converged,
            geometric_iterations: 1,
            time_steps: self.time_steps,
            thickness_errors: vec![report.maximum_relative_error],
        })
    }

    /// Temperature-only entry point: one march, preceded by the basement
    /// preheat.
    pub fn solve_temperature(&mut self) -> Result<RunSummary, SimulationError> {
        self.project.initialise_run_status();
        self.restart_activity();
        match self.evolve_temperature_basin() {
            Ok(()) => Ok(RunSummary {
                geometry_has_converged: true,
                geometric_iterations: 0,
                time_steps: self.time_steps,
                thickness_errors: Vec::new(),
            }),
            Err(error) => {
                self.sink.line(
                    "MeSsAgE ERROR Calculation has diverged, see help for possible solutions. ",
                );
                Err(error)
            }
        }
    }

    fn geometric_outer_loop(&mut self, coupled: bool) -> Result<RunSummary, SimulationError> {
        let maximum_iterations = if self.is_geometric_loop() {
            self.project.run_parameters.max_number_of_run_overpressure
        } else {
            1
        };
        let mut iteration = 1usize;
        let mut geometry_converged = false;
        let mut thickness_errors = Vec::new();

        loop {
            self.restart_activity();

            let march = if coupled {
                self.evolve_coupled_basin(iteration)
            } else {
                self.evolve_pressure_basin(iteration)
            };
            if let Err(error) = march {
                self.sink.line(
                    "MeSsAgE ERROR Calculation has diverged, see help for possible solutions. ",
                );
                return Err(error);
            }

            let report = if self.is_geometric_loop() {
                geometric::adjust_solid_thickness(
                    &mut self.layers,
                    &self.project,
                    &self.valid_needle,
                    self.project.run_parameters.relative_thickness_tolerance(),
                    self.project.run_parameters.absolute_thickness_tolerance(),
                )
            } else {
                nongeometric::adjust_solid_thickness(&mut self.layers, &self.valid_needle)
            };
            thickness_errors.push(report.maximum_relative_error);
            iteration += 1;

            if report.geometry_has_converged {
                geometry_converged = true;
                break;
            }
            if iteration > maximum_iterations {
                break;
            }
        }

        // Thickness-error and FCT-correction maps are written regardless,
        // so the user can judge a non-converged geometry.
        self.save_concluding_maps();

        if !geometry_converged {
            self.sink.line(&format!(
                "MeSsAgE WARNING Maximum number of geometric iterations, {maximum_iterations}, exceeded and geometry has not converged "
            ));
            self.sink.line(
                "MeSsAgE WARNING Look at the ThicknessError maps in Cauldron to see if the error is acceptable",
            );
        }

        Ok(RunSummary {
            geometry_has_converged: geometry_converged,
            geometric_iterations: iteration - 1,
            time_steps: self.time_steps,
            thickness_errors,
        })
    }

    /// Reset per-march state at the start of a geometric iteration: the
    /// property books, the saved minor snapshots and the ledger.
    fn restart_activity(&mut self) {
        let range = if self.project.calculation_mode == CalculationMode::Overpressure {
            LayerRange::SedimentsOnly
        } else {
            LayerRange::BasementAndSediments
        };
        for index in layer_indices(&self.layers, Direction::Ascending, range, ActivityFilter::All, 0.0)
        {
            self.layers[index].reinitialise();
        }
        self.output
            .delete_minor_snapshots(&self.saved_minor_snapshot_times);
        self.output.delete_snapshot_properties();
        self.saved_minor_snapshot_times.clear();
        self.mass_balance.clear();
        self.time_steps = 0;
    }

    fn find_active_elements(&mut self, age: f64) {
        for layer in &mut self.layers {
            layer.find_active_segments(age);
        }
    }

    fn newton_config(&self, geometric_iteration: usize, for_temperature: bool) -> NewtonConfig {
        let params = &self.project.run_parameters;
        if for_temperature {
            NewtonConfig {
                tolerance: params.temperature_newton_tolerance(),
                max_iterations: params.maximum_temperature_nonlinear_iterations(),
                reuse: JacobianReusePolicy {
                    allow_reuse: false,
                    reuse_count: params.pressure_jacobian_reuse_count,
                },
                linear: LinearSolverConfig::new(params.linear_solver_tolerance()),
                linear_variant: !params.nonlinear_temperature,
            }
        } else {
            NewtonConfig {
                tolerance: params
                    .pressure_newton_tolerance(self.is_geometric_loop(), geometric_iteration),
                max_iterations: params.maximum_pressure_nonlinear_iterations(),
                reuse: JacobianReusePolicy {
                    allow_reuse: params.allow_pressure_jacobian_reuse,
                    reuse_count: params.pressure_jacobian_reuse_count,
                },
                linear: LinearSolverConfig::new(params.linear_solver_tolerance()),
                linear_variant: false,
            }
        }
    }

    /// One overpressure march from the basin age to present day.
    fn evolve_pressure_basin(&mut self, geometric_iteration: usize) -> Result<(), SimulationError> {
        let mut cursor = SnapshotCursor::default();
        let mut current_time = self.project.snapshots.oldest();
        cursor.major_index = 1;
        let mut previous_time = current_time;
        let mut time_step = self
            .project
            .run_parameters
            .initial_time_step_at(current_time);

        loop {
            let snapshots = self.project.snapshots.clone();
            let (more, _major_updated) = step_forward_with_cursor(
                &snapshots,
                self.project.run_parameters.permafrost.as_ref(),
                &mut previous_time,
                &mut current_time,
                &mut time_step,
                &mut cursor,
            );
            if !more {
                break;
            }

            let outcome =
                self.solve_pressure_for_time_step(previous_time, current_time, geometric_iteration)?;
            if outcome.error_in_darcy {
                break;
            }
            let newton_iterations = outcome.newton.iterations;

            self.store_computed_deposition_thickness(current_time);
            self.integrate_chemical_compaction(previous_time, current_time);
            self.integrate_genex(previous_time, current_time);

            let at_major = current_time == cursor.current_major(&snapshots);
            let cfl = self.cfl_value_if_enabled(current_time);
            determine_next_pressure_time_step(
                &self.project.run_parameters,
                current_time,
                &mut time_step,
                newton_iterations,
                outcome.maximum_pressure_difference,
                at_major,
                cfl,
            );

            self.compute_basement_lithostatic_pressure(current_time);
            self.copy_current_properties(current_time);
            self.record_step_mass_balance(previous_time, current_time);
            self.save_properties(current_time, &cursor);
            self.time_steps += 1;
            tracing::debug!(current_time, time_step, "time step complete");
        }
        Ok(())
    }

    /// One temperature march, preceded by the steady-state basement
    /// preheat.
    fn evolve_temperature_basin(&mut self) -> Result<(), SimulationError> {
        self.initialise_basin_temperature()?;

        let mut cursor = SnapshotCursor::default();
        let mut current_time = self.project.snapshots.oldest();
        cursor.major_index = 1;
        let mut previous_time = current_time;
        let mut time_step = self
            .project
            .run_parameters
            .initial_time_step_at(current_time);

        loop {
            let snapshots = self.project.snapshots.clone();
            let (more, _major_updated) = step_forward_with_cursor(
                &snapshots,
                self.project.run_parameters.permafrost.as_ref(),
                &mut previous_time,
                &mut current_time,
                &mut time_step,
                &mut cursor,
            );
            if !more {
                break;
            }

            let outcome =
                self.solve_temperature_for_time_step(previous_time, current_time, false)?;
            if outcome.error_in_darcy {
                break;
            }

            self.integrate_chemical_compaction(previous_time, current_time);
            self.integrate_genex(previous_time, current_time);

            let at_major = current_time == cursor.current_major(&snapshots);
            determine_next_temperature_time_step(
                &self.project.run_parameters,
                current_time,
                &mut time_step,
                outcome.maximum_temperature_difference,
                outcome.maximum_sr_temperature_difference,
                at_major,
            );

            self.compute_basement_lithostatic_pressure(current_time);
            self.copy_current_properties(current_time);
            self.record_step_mass_balance(previous_time, current_time);
            self.save_properties(current_time, &cursor);
            self.time_steps += 1;
            tracing::debug!(current_time, time_step, "time step complete");
        }
        Ok(())
    }

    /// One coupled march: pressure first within each step, then
    /// temperature; pressure moves the geometry, which dominates the
    /// cross-coupling. The inter-equation loop is fixed at one iteration.
    fn evolve_coupled_basin(&mut self, geometric_iteration: usize) -> Result<(), SimulationError> {
        self.initialise_basin_temperature()?;

        let mut cursor = SnapshotCursor::default();
        let mut current_time = self.project.snapshots.oldest();
        cursor.major_index = 1;
        let mut previous_time = current_time;
        let mut time_step = self
            .project
            .run_parameters
            .initial_time_step_at(current_time);

        loop {
            let snapshots = self.project.snapshots.clone();
            let (more, _major_updated) = step_forward_with_cursor(
                &snapshots,
                self.project.run_parameters.permafrost.as_ref(),
                &mut previous_time,
                &mut current_time,
                &mut time_step,
                &mut cursor,
            );
            if !more {
                break;
            }

            let pressure_outcome =
                self.solve_pressure_for_time_step(previous_time, current_time, geometric_iteration)?;
            let temperature_outcome =
                self.solve_temperature_for_time_step(previous_time, current_time, false)?;
            if pressure_outcome.error_in_darcy || temperature_outcome.error_in_darcy {
                break;
            }

            self.store_computed_deposition_thickness(current_time);
            self.integrate_chemical_compaction(previous_time, current_time);
            self.integrate_genex(previous_time, current_time);

            let at_major = current_time == cursor.current_major(&snapshots);
            let cfl = self.cfl_value_if_enabled(current_time);
            determine_next_coupled_time_step(
                &self.project.run_parameters,
                current_time,
                &mut time_step,
                pressure_outcome.maximum_pressure_difference,
                temperature_outcome.maximum_temperature_difference,
                temperature_outcome.maximum_sr_temperature_difference,
                at_major,
                cfl,
            );

            self.compute_basement_lithostatic_pressure(current_time);
            self.copy_current_properties(current_time);
            self.record_step_mass_balance(previous_time, current_time);
            self.save_properties(current_time, &cursor);
            self.time_steps += 1;
            tracing::debug!(current_time, time_step, "time step complete");
        }
        Ok(())
    }

    /// Hydrostatic decompaction march: geometry only, no equation solve.
    fn evolve_decompaction_basin(&mut self) -> Result<(), SimulationError> {
        let mut cursor = SnapshotCursor::default();
        let mut current_time = self.project.snapshots.oldest();
        cursor.major_index = 1;
        let mut previous_time = current_time;
        let mut time_step = self
            .project
            .run_parameters
            .initial_time_step_at(current_time);

        loop {
            let snapshots = self.project.snapshots.clone();
            let (more, _major) = step_forward_with_cursor(
                &snapshots,
                self.project.run_parameters.permafrost.as_ref(),
                &mut previous_time,
                &mut current_time,
                &mut time_step,
                &mut cursor,
            );
            if !more {
                break;
            }

            self.find_active_elements(current_time);
            let property_start = Instant::now();
            nongeometric::initialise_pressure_properties(
                &mut self.layers,
                &self.project,
                &self.valid_needle,
                previous_time,
                current_time,
            );
            estimate_temperature(&mut self.layers, &self.project, &self.valid_needle, current_time);
            nongeometric::compute_dependent_properties(
                &mut self.layers,
                &self.project,
                &self.valid_needle,
                previous_time,
                current_time,
            );
            self.timings.property_calculation += property_start.elapsed().as_secs_f64();

            self.store_computed_deposition_thickness(current_time);

            let at_major = current_time == cursor.current_major(&snapshots);
            if at_major {
                time_step = self
                    .project
                    .run_parameters
                    .initial_time_step_at(current_time);
            }

            self.compute_basement_lithostatic_pressure(current_time);
            self.copy_current_properties(current_time);
            self.record_step_mass_balance(previous_time, current_time);
            self.save_properties(current_time, &cursor);
            self.time_steps += 1;
            tracing::debug!(current_time, time_step, "time step complete");
        }
        Ok(())
    }

    fn solve_pressure_for_time_step(
        &mut self,
        previous_time: f64,
        current_time: f64,
        geometric_iteration: usize,
    ) -> Result<StepOutcome, SimulationError> {
        self.find_active_elements(current_time);

        let property_start = Instant::now();
        if self.is_geometric_loop() {
            geometric::initialise_pressure_properties(
                &mut self.layers,
                &self.valid_needle,
                previous_time,
                current_time,
            );
            estimate_temperature(&mut self.layers, &self.project, &self.valid_needle, current_time);
            geometric::compute_dependent_properties(
                &mut self.layers,
                &self.project,
                &self.valid_needle,
                previous_time,
                current_time,
            );
        } else {
            nongeometric::initialise_pressure_properties(
                &mut self.layers,
                &self.project,
                &self.valid_needle,
                previous_time,
                current_time,
            );
            estimate_temperature(&mut self.layers, &self.project, &self.valid_needle, current_time);
            nongeometric::compute_dependent_properties(
                &mut self.layers,
                &self.project,
                &self.valid_needle,
                previous_time,
                current_time,
            );
        }
        self.timings.property_calculation += property_start.elapsed().as_secs_f64();

        let assembly_start = Instant::now();
        let mut fem = FemGrid::build(
            &self.layers,
            MeshScope::SedimentsOnly,
            current_time,
            &self.project.map_grid,
        )?;
        fem.set_depths(&mut self.layers, &self.valid_needle);
        fem.set_dofs(&self.valid_needle);
        fem.set_real_nodes(&mut self.layers, &self.valid_needle);
        let mut jacobian = create_matrix_structure(&fem, &self.valid_needle, 1)?;
        self.timings.system_assembly += assembly_start.elapsed().as_secs_f64();

        let config = self.newton_config(geometric_iteration, false);
        let solve_start = Instant::now();
        let report = {
            let mut system = PressureSystem {
                layers: &mut self.layers,
                fem: &fem,
                valid_needle: &self.valid_needle,
                project: &self.project,
                previous_time,
                current_time,
                geometric_loop: !self.project.run_parameters.non_geometric_loop,
            };
            solve_nonlinear(&mut system, &mut jacobian, &config, self.sink.as_mut())
        };
        self.timings.system_solve += solve_start.elapsed().as_secs_f64();

        if let Some(reason) = report.diverged.clone() {
            return Err(SimulationError::Diverged {
                equation: "pressure",
                reason,
            });
        }

        let maximum_pressure_difference = maximum_property_difference(
            &self.layers,
            &self.valid_needle,
            Prop::Overpressure,
            false,
            current_time,
        );
        Ok(StepOutcome {
            newton: report,
            maximum_pressure_difference,
            maximum_temperature_difference: 0.0,
            maximum_sr_temperature_difference: 0.0,
            error_in_darcy: false,
        })
        // The per-step grid, DOF vectors and Jacobian drop here.
    }

    fn solve_temperature_for_time_step(
        &mut self,
        previous_time: f64,
        current_time: f64,
        steady_state: bool,
    ) -> Result<StepOutcome, SimulationError> {
        self.find_active_elements(current_time);

        // In the hydrostatic and loosely coupled modes the geometry comes
        // from the hydrostatic decompaction path; in coupled mode the
        // pressure solve of this step has already placed it.
        if !self.project.calculation_mode.is_coupled() {
            let property_start = Instant::now();
            nongeometric::initialise_pressure_properties(
                &mut self.layers,
                &self.project,
                &self.valid_needle,
                previous_time,
                current_time,
            );
            estimate_temperature(&mut self.layers, &self.project, &self.valid_needle, current_time);
            nongeometric::compute_dependent_properties(
                &mut self.layers,
                &self.project,
                &self.valid_needle,
                previous_time,
                current_time,
            );
            self.timings.property_calculation += property_start.elapsed().as_secs_f64();
        }
        self.lay_out_basement_geometry(current_time);
        estimate_temperature(&mut self.layers, &self.project, &self.valid_needle, current_time);

        let assembly_start = Instant::now();
        let mut fem = FemGrid::build(
            &self.layers,
            MeshScope::BasementAndSediments,
            current_time,
            &self.project.map_grid,
        )?;
        fem.set_depths(&mut self.layers, &self.valid_needle);
        fem.set_dofs(&self.valid_needle);
        let mut jacobian = create_matrix_structure(&fem, &self.valid_needle, 1)?;
        self.timings.system_assembly += assembly_start.elapsed().as_secs_f64();

        let mut config = self.newton_config(0, true);
        if steady_state {
            // The preheat runs the nonlinear path with a short budget.
            config.linear_variant = false;
            config.max_iterations = 10;
        }
        let solve_start = Instant::now();
        let report = {
            let mut system = TemperatureSystem {
                layers: &mut self.layers,
                fem: &fem,
                valid_needle: &self.valid_needle,
                project: &self.project,
                previous_time,
                current_time,
                steady_state,
            };
            solve_nonlinear(&mut system, &mut jacobian, &config, self.sink.as_mut())
        };
        self.timings.system_solve += solve_start.elapsed().as_secs_f64();

        if let Some(reason) = report.diverged.clone() {
            return Err(SimulationError::Diverged {
                equation: "temperature",
                reason,
            });
        }

        let maximum_temperature_difference = maximum_property_difference(
            &self.layers,
            &self.valid_needle,
            Prop::Temperature,
            false,
            current_time,
        );
        let maximum_sr_temperature_difference = maximum_property_difference(
            &self.layers,
            &self.valid_needle,
            Prop::Temperature,
            true,
            current_time,
        );
        Ok(StepOutcome {
            newton: report,
            maximum_pressure_difference: 0.0,
            maximum_temperature_difference,
            maximum_sr_temperature_difference,
            error_in_darcy: false,
        })
    }

    /// Steady-state basement temperature preheat at the basin age, run
    /// with the same solver infrastructure as the transient step.
    fn initialise_basin_temperature(&mut self) -> Result<(), SimulationError> {
        let basin_age = self.project.age_of_basin();
        self.solve_temperature_for_time_step(basin_age, basin_age, true)?;
        self.copy_current_properties(basin_age);
        Ok(())
    }

    /// Extend the depth and pressure columns through the basement; the
    /// basement lithologies have zero porosity, so the geometry needs no
    /// compaction solve.
    fn lay_out_basement_geometry(&mut self, age: f64) {
        // Bottom of the deepest active sediment, or the sea bottom when no
        // sediment is active yet.
        let (ny, nx) = self.valid_needle.dim();
        let mut depth_below = Array2::zeros((ny, nx));
        let mut litho_below = Array2::zeros((ny, nx));
        let mut hydro_below = Array2::zeros((ny, nx));
        for ((j, i), &valid) in self.valid_needle.indexed_iter() {
            if !valid {
                continue;
            }
            depth_below[[j, i]] = self.project.sea_bottom_depth_at(i, j, age);
            let fluid = &self.layers.last().expect("layers present").fluid;
            let hydro = fluid.hydrostatic_pressure_at(
                depth_below[[j, i]],
                self.project.sea_bottom_temperature_at(i, j, age),
            );
            litho_below[[j, i]] = hydro;
            hydro_below[[j, i]] = hydro;
        }
        for index in layer_indices(
            &self.layers,
            Direction::Descending,
            LayerRange::SedimentsOnly,
            ActivityFilter::ActiveOnly,
            age,
        ) {
            let layer = &self.layers[index];
            for ((j, i), &valid) in self.valid_needle.indexed_iter() {
                if !valid {
                    continue;
                }
                let bottom = layer.current.value(Prop::Depth, 0, j, i);
                if bottom != crate::CAULDRON_NO_DATA_VALUE {
                    depth_below[[j, i]] = bottom;
                }
                let litho = layer.current.value(Prop::LithostaticPressure, 0, j, i);
                if litho != crate::CAULDRON_NO_DATA_VALUE {
                    litho_below[[j, i]] = litho;
                }
                let hydro = layer.current.value(Prop::HydrostaticPressure, 0, j, i);
                if hydro != crate::CAULDRON_NO_DATA_VALUE {
                    hydro_below[[j, i]] = hydro;
                }
            }
        }

        for index in layer_indices(
            &self.layers,
            Direction::Descending,
            LayerRange::BasementAndSediments,
            ActivityFilter::ActiveOnly,
            age,
        ) {
            let layer = &mut self.layers[index];
            if layer.is_sediment() {
                continue;
            }
            let segments = layer.nr_of_active_segments();
            for ((j, i), &valid) in self.valid_needle.indexed_iter() {
                if !valid {
                    continue;
                }
                let density = layer.lithology(i, j).density();
                let segment_thickness =
                    layer.present_day_thickness[[j, i]].max(0.0) / layer.segment_count as f64;
                let mut depth = depth_below[[j, i]];
                let mut litho = litho_below[[j, i]];
                let hydro = hydro_below[[j, i]];
                layer.current.set(Prop::Depth, segments, j, i, depth);
                layer.current.set(Prop::LithostaticPressure, segments, j, i, litho);
                layer.current.set(Prop::HydrostaticPressure, segments, j, i, hydro);
                layer.current.set(Prop::PorePressure, segments, j, i, hydro);
                for k in (0..segments).rev() {
                    depth += segment_thickness;
                    litho += segment_thickness * density * GRAVITY * PA_TO_MEGAPA;
                    layer.current.set(Prop::Depth, k, j, i, depth);
                    layer.current.set(Prop::LithostaticPressure, k, j, i, litho);
                    layer.current.set(Prop::HydrostaticPressure, k, j, i, hydro);
                    layer.current.set(Prop::PorePressure, k, j, i, hydro);
                    layer.porosity[[k, j, i]] = 0.0;
                }
                layer.porosity[[segments, j, i]] = 0.0;
                depth_below[[j, i]] = depth;
                litho_below[[j, i]] = litho;
            }
        }
    }

    /// Basement lithostatic pressure after an accepted step; the ALC
    /// basement carries its own density model, approximated here by the
    /// lithology grain density.
    fn compute_basement_lithostatic_pressure(&mut self, age: f64) {
        if self.project.calculation_mode == CalculationMode::Overpressure {
            return;
        }
        self.lay_out_basement_geometry(age);
    }

    /// At the deposition age of the youngest active layer, record its
    /// computed deposition thickness.
    fn store_computed_deposition_thickness(&mut self, current_time: f64) {
        let order = layer_indices(
            &self.layers,
            Direction::Descending,
            LayerRange::SedimentsOnly,
            ActivityFilter::ActiveOnly,
            current_time,
        );
        let Some(&top_index) = order.first() else {
            return;
        };
        let geometric_loop = self.is_geometric_loop();
        let layer = &mut self.layers[top_index];
        if !ages_equal(current_time, layer.deposition_age) {
            return;
        }
        let (ny, nx) = self.valid_needle.dim();
        let mut thickness = Array2::zeros((ny, nx));
        let z_top = layer.nr_of_active_segments();
        if geometric_loop {
            for ((j, i), &valid) in self.valid_needle.indexed_iter() {
                if valid {
                    thickness[[j, i]] = layer.current.value(Prop::Depth, 0, j, i)
                        - layer.current.value(Prop::Depth, z_top, j, i);
                }
            }
        } else {
            for ((j, i), &valid) in self.valid_needle.indexed_iter() {
                if valid {
                    let mut total = 0.0;
                    for k in 0..z_top {
                        total += layer.current.value(Prop::SolidThickness, k, j, i);
                    }
                    thickness[[j, i]] = total;
                }
            }
        }
        layer.computed_deposition_thickness = Some(thickness);
    }

    fn integrate_chemical_compaction(&mut self, previous_time: f64, current_time: f64) {
        if !self.project.run_parameters.do_chemical_compaction {
            return;
        }
        for index in layer_indices(
            &self.layers,
            Direction::Descending,
            LayerRange::SedimentsOnly,
            ActivityFilter::ActiveOnly,
            current_time,
        ) {
            self.layers[index].integrate_chemical_compaction(
                previous_time,
                current_time,
                &self.valid_needle,
            );
        }
    }

    fn integrate_genex(&mut self, previous_time: f64, current_time: f64) {
        if !self.project.run_parameters.integrate_genex {
            return;
        }
        for index in layer_indices(
            &self.layers,
            Direction::Descending,
            LayerRange::SedimentsOnly,
            ActivityFilter::ActiveOnly,
            current_time,
        ) {
            self.layers[index].integrate_source_rock(
                previous_time,
                current_time,
                &self.valid_needle,
            );
        }
    }

    fn cfl_value_if_enabled(&self, age: f64) -> Option<f64> {
        if !self.project.run_parameters.cfl_time_stepping {
            return None;
        }
        let mut cfl: f64 = 100.0;
        for index in layer_indices(
            &self.layers,
            Direction::Descending,
            LayerRange::SedimentsOnly,
            ActivityFilter::ActiveOnly,
            age,
        ) {
            cfl = cfl.min(all_reduce_min(self.layers[index].cfl_time_step(&self.valid_needle)));
        }
        Some(cfl)
    }

    /// Rotate current into previous on every active layer.
    fn copy_current_properties(&mut self, age: f64) {
        for index in layer_indices(
            &self.layers,
            Direction::Ascending,
            LayerRange::BasementAndSediments,
            ActivityFilter::ActiveOnly,
            age,
        ) {
            self.layers[index].copy_properties(&self.valid_needle);
        }
    }

    /// Signed solid-mass bookkeeping of the step; the ledger is printed
    /// and cleared at every major snapshot.
    fn record_step_mass_balance(&mut self, previous_time: f64, current_time: f64) {
        let area = self.project.map_grid.delta_x * self.project.map_grid.delta_y;
        let mut deposited = 0.0;
        let mut eroded = 0.0;
        for index in layer_indices(
            &self.layers,
            Direction::Ascending,
            LayerRange::SedimentsOnly,
            ActivityFilter::ActiveOnly,
            current_time,
        ) {
            let layer = &self.layers[index];
            for ((j, i), &valid) in self.valid_needle.indexed_iter() {
                if !valid {
                    continue;
                }
                let density = layer.lithology(i, j).density();
                for k in 0..layer.segment_count {
                    let before = layer.segment_solid_thickness_at(i, j, k, previous_time);
                    let after = layer.segment_solid_thickness_at(i, j, k, current_time);
                    let before = if before == IBS_NO_DATA_VALUE { 0.0 } else { before };
                    let after = if after == IBS_NO_DATA_VALUE { 0.0 } else { after };
                    let delta = (after - before) * area * density;
                    if delta > 0.0 {
                        deposited += delta;
                    } else {
                        eroded -= delta;
                    }
                }
            }
        }
        if deposited > 0.0 {
            self.mass_balance
                .add_to_balance("Deposited sediment solids", deposited);
        }
        if eroded > 0.0 {
            self.mass_balance
                .subtract_from_balance("Eroded sediment solids", eroded);
        }

        if self
            .project
            .snapshots
            .majors()
            .iter()
            .any(|&m| ages_equal(current_time, m))
        {
            let _ = self.mass_balance.balance();
            self.mass_balance.print_mass_balance_interval(
                self.mass_balance_sink.as_mut(),
                previous_time,
                current_time,
                &self.project.name,
            );
            self.mass_balance.clear();
        }
    }

    /// Save property maps and volumes when the step landed on a major
    /// snapshot, or on the minor-snapshot predicate.
    fn save_properties(&mut self, current_time: f64, _cursor: &SnapshotCursor) {
        let is_major = self
            .project
            .snapshots
            .majors()
            .iter()
            .any(|&m| ages_equal(current_time, m));
        let is_minor = !is_major && self.project.snapshots.is_minor_snapshot(current_time);
        if !is_major && !is_minor {
            return;
        }
        if is_minor {
            self.saved_minor_snapshot_times.push(current_time);
        }

        let property_start = Instant::now();
        let filter = self.project.output_filter.clone();

        // Fundamental volumes.
        for index in layer_indices(
            &self.layers,
            Direction::Descending,
            LayerRange::SedimentsOnly,
            ActivityFilter::ActiveOnly,
            current_time,
        ) {
            let (name, grids): (String, Vec<(String, ndarray::Array3<f64>)>) = {
                let layer = &self.layers[index];
                let mut grids = Vec::new();
                for prop in Prop::ALL {
                    if filter.selects(prop.output_name()) {
                        grids.push((prop.output_name().to_string(), layer.current.grid(prop).clone()));
                    }
                }
                if filter.selects("Porosity") {
                    grids.push(("Porosity".to_string(), layer.porosity.clone()));
                }
                if filter.selects("PermeabilityV") {
                    grids.push(("PermeabilityV".to_string(), layer.permeability_normal.clone()));
                }
                if filter.selects("PermeabilityH") {
                    grids.push(("PermeabilityH".to_string(), layer.permeability_planar.clone()));
                }
                (layer.name.clone(), grids)
            };
            for (property, grid) in grids {
                self.output.save_volume(current_time, &name, &property, &grid);
            }
        }

        // Derived grids, computed only when selected, dropped after the
        // save (the full set only at major snapshots).
        if is_major {
            if filter.selects("BulkDensity") {
                crate::derived::compute_bulk_density(&mut self.layers, &self.valid_needle, current_time);
            }
            if filter.selects("Velocity") || filter.selects("Sonic") || filter.selects("Reflectivity") {
                crate::derived::compute_velocity(
                    &mut self.layers,
                    &self.project,
                    &self.valid_needle,
                    current_time,
                );
            }
            if filter.selects("Reflectivity") {
                crate::derived::compute_reflectivity(
                    &mut self.layers,
                    &self.project,
                    &self.valid_needle,
                    current_time,
                );
            }
            if filter.selects("Sonic") {
                crate::derived::compute_sonic(
                    &mut self.layers,
                    &self.project,
                    &self.valid_needle,
                    current_time,
                );
            }
            if filter.selects("ThCond") {
                crate::derived::compute_thermal_conductivity(
                    &mut self.layers,
                    &self.valid_needle,
                    current_time,
                );
            }
            if filter.selects("Diffusivity") {
                crate::derived::compute_diffusivity(&mut self.layers, &self.valid_needle, current_time);
            }
            if filter.selects("Thickness") {
                crate::derived::compute_thickness(&mut self.layers, &self.valid_needle, current_time);
            }
            if filter.selects("ErosionFactor")
                || filter.selects("FaultElements")
                || filter.selects("AllochthonousLithology")
            {
                crate::derived::compute_provenance_maps(
                    &mut self.layers,
                    &self.valid_needle,
                    current_time,
                );
            }

            for index in layer_indices(
                &self.layers,
                Direction::Descending,
                LayerRange::SedimentsOnly,
                ActivityFilter::ActiveOnly,
                current_time,
            ) {
                let layer_name = self.layers[index].name.clone();
                let derived = self.layers[index].derived.clone();
                if let Some(grid) = derived.bulk_density {
                    self.output.save_volume(current_time, &layer_name, "BulkDensity", &grid);
                }
                if let Some(grid) = derived.velocity {
                    self.output.save_volume(current_time, &layer_name, "Velocity", &grid);
                }
                if let Some(grid) = derived.reflectivity {
                    self.output.save_volume(current_time, &layer_name, "Reflectivity", &grid);
                }
                if let Some(grid) = derived.sonic {
                    self.output.save_volume(current_time, &layer_name, "Sonic", &grid);
                }
                if let Some(grid) = derived.thermal_conductivity_normal {
                    self.output.save_volume(current_time, &layer_name, "ThCond", &grid);
                }
                if let Some(grid) = derived.diffusivity {
                    self.output.save_volume(current_time, &layer_name, "Diffusivity", &grid);
                }
                if let Some(map) = derived.thickness {
                    self.output.save_map(current_time, &layer_name, "Thickness", &map);
                }
                if let Some(map) = derived.erosion_factor {
                    self.output.save_map(current_time, &layer_name, "ErosionFactor", &map);
                }
                if let Some(map) = derived.fault_elements {
                    self.output.save_map(current_time, &layer_name, "FaultElements", &map);
                }
                if let Some(map) = derived.allochthonous_lithology {
                    self.output
                        .save_map(current_time, &layer_name, "AllochthonousLithology", &map);
                }
                self.layers[index].derived = Default::default();
            }
        }
        self.timings.property_calculation += property_start.elapsed().as_secs_f64();
    }

    /// The concluding present-day maps: thickness error and the FCT
    /// correction of every sediment layer.
    fn save_concluding_maps(&mut self) {
        for index in layer_indices(
            &self.layers,
            Direction::Descending,
            LayerRange::SedimentsOnly,
            ActivityFilter::ActiveOnly,
            0.0,
        ) {
            let name = self.layers[index].name.clone();
            let thickness_error = self.layers[index].thickness_error.clone();
            let fct_correction = self.layers[index].fct_correction.clone();
            self.output.save_map(0.0, &name, "ThicknessError", &thickness_error);
            self.output.save_map(0.0, &name, "FCTCorrection", &fct_correction);
        }
    }
}
