// File: `src/lib/basin/src/lib.rs`
//
// UNIT SYSTEM: CAULDRON UNITS (CONSISTENT THROUGHOUT)
// ====================================================
// Pressure: megaPascal (MPa)
// VES / MaxVES: Pascal (Pa)
// Distance/depth: meter (m), positive downwards
// Time/age: mega-annum (Ma), decreasing towards present day (0 Ma)
// Temperature: degree Celsius (C)
// Density: kg/m^3
// Permeability: milliDarcy (mD) [1 mD = 9.86923e-16 m^2]
// Thermal conductivity: W/m/K
//
// CONVERSION FACTORS USED:
// - PA_TO_MEGAPA / MEGAPA_TO_PA between the pressure and the VES scales
// - SECONDS_PER_MA when a rate in SI seconds enters a geological time step
// - MILLIDARCY_TO_M2 whenever a permeability enters a flow term

pub mod assembly;
pub mod derived;
pub mod driver;
pub mod error;
pub mod geometric;
pub mod grid;
pub mod layer;
pub mod lithology;
pub mod massbalance;
pub mod mesh;
pub mod newton;
pub mod nongeometric;
pub mod output;
pub mod prealloc;
pub mod project;
pub mod solver;
pub mod timestep;

use serde::{Deserialize, Serialize};

pub use driver::Simulator;
pub use error::SimulationError;
pub use layer::{FundamentalProperty, Layer, LayerKind};
pub use project::{ProjectHandle, RunParameters, Snapshot, SnapshotKind};

/// Acceleration due to gravity in m/s^2. A more accurate value is 9.80665.
pub const GRAVITY: f64 = 9.81;

/// Sentinel for undefined values in input/stratigraphic data.
pub const IBS_NO_DATA_VALUE: f64 = -9999.0;

/// Sentinel for undefined values in computed output. Distinct from the
/// input sentinel because downstream tooling discriminates them.
pub const CAULDRON_NO_DATA_VALUE: f64 = 99999.0;

pub const PA_TO_MEGAPA: f64 = 1.0e-6;
pub const MEGAPA_TO_PA: f64 = 1.0e6;

/// 1 mD in m^2.
pub const MILLIDARCY_TO_M2: f64 = 9.869_23e-16;

/// Seconds in one Ma (Julian year of 365.25 days).
pub const SECONDS_PER_MA: f64 = 3.155_76e13;

/// Minimum time step of 1000 years, 0.001 Ma.
pub const MINIMUM_PRESSURE_TIME_STEP: f64 = 0.001;

/// The minimum porosity allowed for soil-mechanics type lithologies,
/// including the porosity loss in chemical compaction.
pub const MINIMUM_POROSITY: f64 = 0.03;

/// A segment whose top and bottom depths differ by less than this is
/// treated as zero-thickness and collapsed onto the node above.
pub const DEPOSITING_THICKNESS_TOLERANCE: f64 = 0.001;

/// Relative tolerance used when comparing ages against snapshot times.
/// Snapshot times are written out as floats but carried as doubles.
pub const AGE_COMPARISON_EPSILON: f64 = 1.192_092_895_507_812_5e-7; // 2^-23

/// Pressure at the sea surface in MPa.
pub const PRESSURE_AT_SEA_TOP: f64 = 0.1;

pub const STANDARD_WATER_DENSITY: f64 = 1000.0;

/// Assumed surface temperature (C) when no boundary history is defined.
pub const STANDARD_SURFACE_TEMPERATURE: f64 = 10.0;

/// Assumed temperature gradient (C/km) for first temperature estimates.
pub const STANDARD_TEMPERATURE_GRADIENT: f64 = 30.0;

/// Scaling applied to the element jacobian and residual. Necessary when
/// permeabilities are very small, to stop the linear solver from treating
/// the system as singular.
pub const ELEMENT_SCALING: f64 = 1.0e10;

/// Scaling factor used on rows subject to Dirichlet boundary conditions.
pub const DIRICHLET_SCALING_VALUE: f64 = 1.0e25;

/// The default GMRES restart of 30 is not enough for most pressure problems.
pub const GMRES_RESTART_VALUE: usize = 120;

/// Mass-balance bookkeeping tolerance in kg.
pub const MASS_BALANCE_TOLERANCE: f64 = 100.0;

/// Exit status reported when the geometric loop exhausts its iterations
/// without the input layer thicknesses converging.
pub const GEOMETRIC_LOOP_NON_CONVERGENCE_EXIT_STATUS: i32 = 2;

/// Constant of Gardner's velocity-density relation.
pub const GARDNER_VELOCITY_CONSTANT: f64 = 309.4;

pub const NUMBER_OF_OPTIMISATION_LEVELS: usize = 5;

/// The calculation modes the driver dispatches on. Selected externally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalculationMode {
    /// Decompaction assuming a hydrostatic pore pressure.
    HydrostaticDecompaction,
    /// High-resolution decompaction assuming a hydrostatic pore pressure.
    HydrostaticHighResDecompaction,
    /// Temperature assuming a hydrostatic pore pressure.
    HydrostaticTemperature,
    /// Pressure calculation assuming a linear temperature gradient.
    Overpressure,
    /// Temperature using the results of a previous overpressure run.
    OverpressuredTemperature,
    /// High-resolution decompaction using coupled results.
    CoupledHighResDecompaction,
    /// Fully coupled pressure and temperature.
    PressureAndTemperature,
    /// Hydrostatic temperature with Darcy flow.
    HydrostaticDarcy,
    /// Fully coupled pressure and temperature with Darcy flow.
    CoupledDarcy,
    NoCalculation,
}

impl CalculationMode {
    /// The spelling persisted to the project's run-status field.
    pub fn run_status_str(self) -> Option<&'static str> {
        match self {
            CalculationMode::HydrostaticDecompaction => Some("HydrostaticDecompaction"),
            CalculationMode::HydrostaticHighResDecompaction
            | CalculationMode::CoupledHighResDecompaction => Some("HighResDecompaction"),
            CalculationMode::HydrostaticTemperature => Some("HydrostaticTemperature"),
            CalculationMode::Overpressure => Some("Overpressure"),
            CalculationMode::OverpressuredTemperature => Some("OverpressuredTemperature"),
            CalculationMode::PressureAndTemperature => Some("PressureAndTemperature"),
            CalculationMode::HydrostaticDarcy => Some("HydrostaticDarcy"),
            CalculationMode::CoupledDarcy => Some("CoupledDarcy"),
            CalculationMode::NoCalculation => None,
        }
    }

    /// True when the mode solves the overpressure equation.
    pub fn solves_pressure(self) -> bool {
        matches!(
            self,
            CalculationMode::Overpressure
                | CalculationMode::PressureAndTemperature
                | CalculationMode::CoupledDarcy
        )
    }

    /// True when the mode solves the temperature equation.
    pub fn solves_temperature(self) -> bool {
        matches!(
            self,
            CalculationMode::HydrostaticTemperature
                | CalculationMode::OverpressuredTemperature
                | CalculationMode::PressureAndTemperature
                | CalculationMode::HydrostaticDarcy
                | CalculationMode::CoupledDarcy
        )
    }

    /// True for the iteratively coupled pressure-temperature modes.
    pub fn is_coupled(self) -> bool {
        matches!(
            self,
            CalculationMode::PressureAndTemperature | CalculationMode::CoupledDarcy
        )
    }
}

/// Compare an age against a reference with the float-epsilon relative rule
/// used for snapshot times.
pub fn ages_equal(age: f64, reference: f64) -> bool {
    (age - reference).abs() < reference.max(1.0) * AGE_COMPARISON_EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_strings_match_project_file_spellings() {
        assert_eq!(
            CalculationMode::Overpressure.run_status_str(),
            Some("Overpressure")
        );
        assert_eq!(
            CalculationMode::PressureAndTemperature.run_status_str(),
            Some("PressureAndTemperature")
        );
        assert_eq!(
            CalculationMode::HydrostaticDecompaction.run_status_str(),
            Some("HydrostaticDecompaction")
        );
        assert_eq!(
            CalculationMode::OverpressuredTemperature.run_status_str(),
            Some("OverpressuredTemperature")
        );
        assert_eq!(CalculationMode::NoCalculation.run_status_str(), None);
    }

    #[test]
    fn age_comparison_uses_relative_float_epsilon() {
        assert!(ages_equal(10.0 + 1.0e-7, 10.0));
        assert!(!ages_equal(10.01, 10.0));
        // Near present day the tolerance floor is max(age, 1).
        assert!(ages_equal(1.0e-8, 0.0));
    }
}
