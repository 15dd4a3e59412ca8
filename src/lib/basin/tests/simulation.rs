//! End-to-end simulation scenarios on small columnar basins.

use std::cell::RefCell;
use std::rc::Rc;

use basin_simulator::grid::MapGrid;
use basin_simulator::layer::{FundamentalProperty, Layer, LayerKind};
use basin_simulator::lithology::{CompoundLithology, FluidType, SimpleLithology};
use basin_simulator::output::{InMemoryOutput, LineSink, PropertyOutput, SavedVolume};
use basin_simulator::project::{ProjectHandle, Snapshot, SnapshotKind};
use basin_simulator::{CalculationMode, Simulator, GRAVITY, MEGAPA_TO_PA};
use ndarray::{Array2, Array3};

type Prop = FundamentalProperty;

/// Test seam: shares the in-memory output store with the test body while
/// the simulator owns the boxed trait object.
struct SharedOutput(Rc<RefCell<InMemoryOutput>>);

impl PropertyOutput for SharedOutput {
    fn save_map(&mut self, snapshot_age: f64, layer: &str, property: &str, values: &Array2<f64>) {
        self.0.borrow_mut().save_map(snapshot_age, layer, property, values);
    }
    fn save_volume(&mut self, snapshot_age: f64, layer: &str, property: &str, values: &Array3<f64>) {
        self.0.borrow_mut().save_volume(snapshot_age, layer, property, values);
    }
    fn delete_minor_snapshots(&mut self, ages: &[f64]) {
        self.0.borrow_mut().delete_minor_snapshots(ages);
    }
    fn delete_snapshot_properties(&mut self) {
        self.0.borrow_mut().delete_snapshot_properties();
    }
}

/// Test seam for the message and mass-balance line protocols.
struct SharedSink(Rc<RefCell<Vec<String>>>);

impl LineSink for SharedSink {
    fn line(&mut self, text: &str) {
        self.0.borrow_mut().push(text.to_string());
    }
}

fn snapshots(ages: &[f64]) -> Vec<Snapshot> {
    ages.iter()
        .map(|&age| Snapshot {
            age,
            kind: SnapshotKind::Major,
        })
        .collect()
}

fn map_3x3() -> MapGrid {
    MapGrid::new(3, 3, 0.0, 0.0, 100.0, 100.0).unwrap()
}

fn sand_layer(map: &MapGrid, name: &str, start: f64, end: f64, thickness: f64) -> Layer {
    Layer::new(
        name,
        LayerKind::Sediment,
        start,
        end,
        2,
        CompoundLithology::uniform(SimpleLithology::standard_sandstone()),
        FluidType::standard_water(),
        Array2::from_elem((3, 3), thickness),
        map,
    )
}

struct ScenarioRun {
    summary: basin_simulator::error::RunSummary,
    output: Rc<RefCell<InMemoryOutput>>,
    messages: Rc<RefCell<Vec<String>>>,
    balance_lines: Rc<RefCell<Vec<String>>>,
    simulator: Simulator,
}

fn run(
    mode: CalculationMode,
    layers: Vec<Layer>,
    snapshot_ages: &[f64],
    configure: impl FnOnce(&mut ProjectHandle),
) -> ScenarioRun {
    let map = map_3x3();
    let mut project = ProjectHandle::new("scenario", map, mode, &snapshots(snapshot_ages)).unwrap();
    configure(&mut project);
    let output = Rc::new(RefCell::new(InMemoryOutput::default()));
    let messages = Rc::new(RefCell::new(Vec::new()));
    let balance_lines = Rc::new(RefCell::new(Vec::new()));
    let mut simulator = Simulator::with_sinks(
        project,
        layers,
        Box::new(SharedSink(messages.clone())),
        Box::new(SharedSink(balance_lines.clone())),
        Box::new(SharedOutput(output.clone())),
    )
    .unwrap();
    let summary = simulator.run().expect("simulation completes");
    ScenarioRun {
        summary,
        output,
        messages,
        balance_lines,
        simulator,
    }
}

fn volume(output: &InMemoryOutput, age: f64, layer: &str, property: &str) -> SavedVolume {
    output
        .volumes
        .iter()
        .find(|v| {
            basin_simulator::ages_equal(v.snapshot_age, age)
                && v.layer == layer
                && v.property == property
        })
        .unwrap_or_else(|| panic!("volume {property} of {layer} at {age} Ma not saved"))
        .clone()
}

/// Scenario: single-layer hydrostatic decompaction. The input geometry is
/// reproduced exactly and the pressure chain is hydrostatic.
#[test]
fn single_layer_hydrostatic_decompaction() {
    let map = map_3x3();
    let layer = sand_layer(&map, "Sand", 10.0, 5.0, 200.0);
    let scenario = run(
        CalculationMode::HydrostaticDecompaction,
        vec![layer],
        &[10.0, 0.0],
        |_| {},
    );
    assert!(scenario.summary.geometry_has_converged);
    assert!(scenario.summary.time_steps > 0);

    let output = scenario.output.borrow();
    let depth = volume(&output, 0.0, "Sand", "Depth");
    let ves = volume(&output, 0.0, "Sand", "VES");
    let hydro = volume(&output, 0.0, "Sand", "HydroStaticPressure");
    let pore = volume(&output, 0.0, "Sand", "Pressure");
    let litho = volume(&output, 0.0, "Sand", "LithoStaticPressure");

    for j in 0..3 {
        for i in 0..3 {
            // Geometry is driven by the input: 200 m total.
            let thickness = depth.values[[0, j, i]] - depth.values[[2, j, i]];
            assert!(
                (thickness - 200.0).abs() < 1.0e-6,
                "thickness {thickness} at ({i},{j})"
            );
            for k in 0..=2 {
                assert!(ves.values[[k, j, i]] >= 0.0);
                assert!(litho.values[[k, j, i]] + 1.0e-9 >= pore.values[[k, j, i]]);
                assert!(pore.values[[k, j, i]] + 1.0e-9 >= hydro.values[[k, j, i]]);
            }
            // Bottom VES within the buoyant-load envelope
            // (rho_bulk - rho_fluid) * g * H.
            let ves_bottom = ves.values[[0, j, i]];
            let lower = (1500.0 - 1100.0) * GRAVITY * 200.0;
            let upper = (2700.0 - 1000.0) * GRAVITY * 200.0;
            assert!(
                ves_bottom > lower && ves_bottom < upper,
                "VES {ves_bottom} outside [{lower}, {upper}]"
            );
            // And VES is exactly the pressure deficit.
            let expected = (litho.values[[0, j, i]] - pore.values[[0, j, i]]) * MEGAPA_TO_PA;
            assert!((ves_bottom - expected).abs() < 1.0);
        }
    }
}

/// Scenario: zero-thickness collapse. A column where the lower formation
/// has no thickness still assembles and solves; its thickness stays zero.
#[test]
fn zero_thickness_column_still_solves() {
    let map = map_3x3();
    let mut lower_thickness = Array2::from_elem((3, 3), 150.0);
    lower_thickness[[1, 1]] = 0.0;
    let lower = Layer::new(
        "Lower",
        LayerKind::Sediment,
        20.0,
        12.0,
        2,
        CompoundLithology::uniform(SimpleLithology::standard_sandstone()),
        FluidType::standard_water(),
        lower_thickness,
        &map,
    );
    let upper = sand_layer(&map, "Upper", 12.0, 4.0, 150.0);
    let scenario = run(
        CalculationMode::Overpressure,
        vec![lower, upper],
        &[20.0, 12.0, 0.0],
        |project| {
            project.run_parameters.max_number_of_run_overpressure = 2;
        },
    );
    assert!(scenario.summary.time_steps > 0);

    let output = scenario.output.borrow();
    let depth = volume(&output, 0.0, "Lower", "Depth");
    let collapsed = depth.values[[0, 1, 1]] - depth.values[[2, 1, 1]];
    assert!(collapsed.abs() < 1.0e-3, "collapsed thickness {collapsed}");
    let normal = depth.values[[0, 0, 0]] - depth.values[[2, 0, 0]];
    assert!(normal > 10.0, "normal column thickness {normal}");
}

/// Scenario: geometric loop reconvergence. The maximum relative thickness
/// error contracts across outer iterations.
#[test]
fn geometric_loop_error_contracts() {
    let map = map_3x3();
    let layer = sand_layer(&map, "Sand", 10.0, 5.0, 300.0);
    let scenario = run(
        CalculationMode::Overpressure,
        vec![layer],
        &[10.0, 0.0],
        |project| {
            project.run_parameters.max_number_of_run_overpressure = 5;
            project.run_parameters.fct_correction_scaling_weight = 0.5;
        },
    );
    let errors = &scenario.summary.thickness_errors;
    assert!(!errors.is_empty());
    for pair in errors.windows(2) {
        assert!(
            pair[1] <= pair[0] + 1.0e-9,
            "thickness errors did not contract: {errors:?}"
        );
    }
    if scenario.summary.geometry_has_converged {
        let relative_tolerance = 0.03; // default optimisation level
        assert!(errors.last().unwrap() <= &relative_tolerance);
    }

    // ThicknessError and FCTCorrection maps are always written at present
    // day, converged or not.
    let output = scenario.output.borrow();
    assert!(output.map(0.0, "Sand", "ThicknessError").is_some());
    assert!(output.map(0.0, "Sand", "FCTCorrection").is_some());
}

/// Temperature-only run over a layered basin with basement: gradient
/// increases downwards, surface pinned to the sea-bottom temperature.
#[test]
fn hydrostatic_temperature_gradient() {
    let map = map_3x3();
    let mantle = Layer::new(
        "Mantle",
        LayerKind::Mantle,
        1000.0,
        999.0,
        2,
        CompoundLithology::uniform(SimpleLithology::mantle_peridotite()),
        FluidType::standard_water(),
        Array2::from_elem((3, 3), 10000.0),
        &map,
    );
    let crust = Layer::new(
        "Crust",
        LayerKind::Crust,
        1000.0,
        999.0,
        2,
        CompoundLithology::uniform(SimpleLithology::crust_basalt()),
        FluidType::standard_water(),
        Array2::from_elem((3, 3), 5000.0),
        &map,
    );
    let sand = sand_layer(&map, "Sand", 10.0, 5.0, 400.0);
    let scenario = run(
        CalculationMode::HydrostaticTemperature,
        vec![mantle, crust, sand],
        &[10.0, 0.0],
        |_| {},
    );
    assert!(scenario.summary.time_steps > 0);

    let output = scenario.output.borrow();
    let temperature = volume(&output, 0.0, "Sand", "Temperature");
    for j in 0..3 {
        for i in 0..3 {
            let surface = temperature.values[[2, j, i]];
            let bottom = temperature.values[[0, j, i]];
            assert!(
                (surface - 10.0).abs() < 1.0,
                "surface temperature {surface}"
            );
            assert!(bottom >= surface, "no inversion: {bottom} < {surface}");
        }
    }
    // No errors surfaced through the message protocol.
    assert!(
        !scenario
            .messages
            .borrow()
            .iter()
            .any(|l| l.contains("MeSsAgE ERROR")),
        "{:?}",
        scenario.messages.borrow()
    );
}

/// The run-status field is persisted with the fixed spelling.
#[test]
fn run_status_is_persisted() {
    let map = map_3x3();
    let layer = sand_layer(&map, "Sand", 10.0, 5.0, 200.0);
    let scenario = run(
        CalculationMode::HydrostaticDecompaction,
        vec![layer],
        &[10.0, 0.0],
        |_| {},
    );
    assert_eq!(
        scenario.simulator.project.run_status.as_deref(),
        Some("HydrostaticDecompaction")
    );
}

/// The mass-balance ledger prints a block per interior snapshot and the
/// bookkeeping identity holds (debug builds assert it internally).
#[test]
fn mass_balance_blocks_are_emitted_per_snapshot() {
    let map = map_3x3();
    let layer = sand_layer(&map, "Sand", 10.0, 5.0, 200.0);
    let scenario = run(
        CalculationMode::HydrostaticDecompaction,
        vec![layer],
        &[10.0, 5.0, 0.0],
        |_| {},
    );
    assert_eq!(
        scenario.simulator.mass_balance_file_name(),
        "scenario_MassBalance"
    );

    let lines = scenario.balance_lines.borrow();
    let headers: Vec<&String> = lines
        .iter()
        .filter(|l| l.starts_with("-- Snapshot:"))
        .collect();
    assert_eq!(headers.len(), 2, "one block per interior snapshot: {headers:?}");
    assert!(headers[0].contains("5 Ma"));
    assert!(headers[1].contains("0 Ma"));
    assert!(lines.iter().any(|l| l.starts_with("Total in:")));
    assert!(lines.iter().any(|l| l.starts_with("Balance:")));

    // The deposited solid mass over the march is positive.
    let deposit_line = lines
        .iter()
        .find(|l| l.starts_with("Deposited sediment solids:"))
        .expect("deposition recorded");
    assert!(deposit_line.ends_with(" kg"));
}

/// The saved volume set respects the output filter.
#[test]
fn output_filter_restricts_saved_properties() {
    let map = map_3x3();
    let layer = sand_layer(&map, "Sand", 10.0, 5.0, 200.0);
    let scenario = run(
        CalculationMode::HydrostaticDecompaction,
        vec![layer],
        &[10.0, 0.0],
        |project| {
            project.output_filter = basin_simulator::project::OutputFilter::with(&[
                "Depth",
                "Temperature",
            ]);
        },
    );
    let output = scenario.output.borrow();
    assert!(output
        .volumes
        .iter()
        .any(|v| v.property == Prop::Depth.output_name()));
    assert!(!output.volumes.iter().any(|v| v.property == "Porosity"));
    assert!(!output.volumes.iter().any(|v| v.property == "VES"));
}
