//! Formations (layers) and their fundamental-property store.
//!
//! Every layer holds two property books, *current* and *previous*; the
//! driver rotates them at the end of each accepted time step. Properties
//! follow the activation lifecycle: inactive -> activated (insert mode and
//! ghost rule chosen) -> read/write -> restored. On one subdomain the
//! restore reduction is the identity, but the lifecycle is enforced so the
//! collective call order survives a multi-rank backend.

use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

use crate::grid::MapGrid;
use crate::lithology::{CompoundLithology, FluidType};
use crate::{CAULDRON_NO_DATA_VALUE, IBS_NO_DATA_VALUE};

/// The fundamental per-node properties of a formation. Exactly these
/// eleven; derived grids (porosity, permeability, ...) live elsewhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FundamentalProperty {
    Depth,
    /// Real (bulk) segment thickness.
    RealThickness,
    SolidThickness,
    HydrostaticPressure,
    LithostaticPressure,
    Overpressure,
    PorePressure,
    ChemicalCompaction,
    Ves,
    MaxVes,
    Temperature,
}

impl FundamentalProperty {
    pub const ALL: [FundamentalProperty; 11] = [
        FundamentalProperty::Depth,
        FundamentalProperty::RealThickness,
        FundamentalProperty::SolidThickness,
        FundamentalProperty::HydrostaticPressure,
        FundamentalProperty::LithostaticPressure,
        FundamentalProperty::Overpressure,
        FundamentalProperty::PorePressure,
        FundamentalProperty::ChemicalCompaction,
        FundamentalProperty::Ves,
        FundamentalProperty::MaxVes,
        FundamentalProperty::Temperature,
    ];

    pub fn index(self) -> usize {
        match self {
            FundamentalProperty::Depth => 0,
            FundamentalProperty::RealThickness => 1,
            FundamentalProperty::SolidThickness => 2,
            FundamentalProperty::HydrostaticPressure => 3,
            FundamentalProperty::LithostaticPressure => 4,
            FundamentalProperty::Overpressure => 5,
            FundamentalProperty::PorePressure => 6,
            FundamentalProperty::ChemicalCompaction => 7,
            FundamentalProperty::Ves => 8,
            FundamentalProperty::MaxVes => 9,
            FundamentalProperty::Temperature => 10,
        }
    }

    /// Output-facility name.
    pub fn output_name(self) -> &'static str {
        match self {
            FundamentalProperty::Depth => "Depth",
            FundamentalProperty::RealThickness => "Thickness",
            FundamentalProperty::SolidThickness => "SolidThickness",
            FundamentalProperty::HydrostaticPressure => "HydroStaticPressure",
            FundamentalProperty::LithostaticPressure => "LithoStaticPressure",
            FundamentalProperty::Overpressure => "OverPressure",
            FundamentalProperty::PorePressure => "Pressure",
            FundamentalProperty::ChemicalCompaction => "ChemicalCompaction",
            FundamentalProperty::Ves => "VES",
            FundamentalProperty::MaxVes => "MaxVES",
            FundamentalProperty::Temperature => "Temperature",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertMode {
    Insert,
    Add,
}

#[derive(Clone, Copy, Debug)]
struct Activation {
    #[allow(dead_code)]
    insert_mode: InsertMode,
    #[allow(dead_code)]
    include_ghosts: bool,
}

/// One time level of the fundamental properties of a layer: a grid per
/// property, shape `(n_segments + 1, ny, nx)`.
#[derive(Clone, Debug)]
pub struct PropertyBook {
    grids: Vec<Array3<f64>>,
    active: Vec<Option<Activation>>,
}

impl PropertyBook {
    fn new(nz: usize, ny: usize, nx: usize) -> Self {
        PropertyBook {
            grids: (0..FundamentalProperty::ALL.len())
                .map(|_| Array3::from_elem((nz, ny, nx), CAULDRON_NO_DATA_VALUE))
                .collect(),
            active: vec![None; FundamentalProperty::ALL.len()],
        }
    }

    /// Begin an access epoch on a property. Exactly one activation may be
    /// outstanding per property.
    pub fn activate(&mut self, prop: FundamentalProperty, mode: InsertMode, include_ghosts: bool) {
        let slot = &mut self.active[prop.index()];
        debug_assert!(
            slot.is_none(),
            "property {:?} activated twice without restore",
            prop
        );
        *slot = Some(Activation {
            insert_mode: mode,
            include_ghosts,
        });
    }

    /// End the access epoch. Performs the ghost reduction chosen at
    /// activation (identity on one subdomain). Restoring a property that
    /// was never activated is a no-op.
    pub fn restore(&mut self, prop: FundamentalProperty) {
        self.active[prop.index()] = None;
    }

    pub fn activate_all(&mut self, mode: InsertMode, include_ghosts: bool) {
        for prop in FundamentalProperty::ALL {
            if self.active[prop.index()].is_none() {
                self.activate(prop, mode, include_ghosts);
            }
        }
    }

    pub fn restore_all(&mut self) {
        for slot in &mut self.active {
            *slot = None;
        }
    }

    pub fn is_active(&self, prop: FundamentalProperty) -> bool {
        self.active[prop.index()].is_some()
    }

    pub fn value(&self, prop: FundamentalProperty, k: usize, j: usize, i: usize) -> f64 {
        self.grids[prop.index()][[k, j, i]]
    }

    pub fn set(&mut self, prop: FundamentalProperty, k: usize, j: usize, i: usize, value: f64) {
        self.grids[prop.index()][[k, j, i]] = value;
    }

    pub fn grid(&self, prop: FundamentalProperty) -> &Array3<f64> {
        &self.grids[prop.index()]
    }

    pub fn grid_mut(&mut self, prop: FundamentalProperty) -> &mut Array3<f64> {
        &mut self.grids[prop.index()]
    }

    pub fn fill(&mut self, value: f64) {
        for grid in &mut self.grids {
            grid.fill(value);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerKind {
    Sediment,
    Crust,
    Mantle,
}

/// An erosion event: over `[start_age, end_age]` (ages decreasing) the
/// given solid thickness is removed from the top of the layer, linearly in
/// time.
#[derive(Clone, Debug)]
pub struct ErosionEvent {
    pub start_age: f64,
    pub end_age: f64,
    /// Total eroded solid thickness per needle, m.
    pub eroded_solid_thickness: Array2<f64>,
}

impl ErosionEvent {
    /// Fraction of the event completed at `age`.
    fn fraction_at(&self, age: f64) -> f64 {
        if age >= self.start_age {
            0.0
        } else if age <= self.end_age {
            1.0
        } else {
            (self.start_age - age) / (self.start_age - self.end_age)
        }
    }
}

/// On-demand derived grids, allocated by the property evaluators only when
/// the output filter selects them and dropped after saving.
#[derive(Clone, Debug, Default)]
pub struct DerivedGrids {
    pub bulk_density: Option<Array3<f64>>,
    pub velocity: Option<Array3<f64>>,
    pub reflectivity: Option<Array3<f64>>,
    pub sonic: Option<Array3<f64>>,
    pub thermal_conductivity_normal: Option<Array3<f64>>,
    pub thermal_conductivity_planar: Option<Array3<f64>>,
    pub diffusivity: Option<Array3<f64>>,
    pub thickness: Option<Array2<f64>>,
    pub erosion_factor: Option<Array2<f64>>,
    pub fault_elements: Option<Array2<f64>>,
    pub allochthonous_lithology: Option<Array2<f64>>,
}

/// A named stratum: deposition interval, lithology, fluid, the per-needle
/// solid-thickness history driving the geometry, and the two property
/// books.
#[derive(Clone, Debug)]
pub struct Layer {
    pub name: String,
    pub kind: LayerKind,
    /// Age at which deposition begins (base of the layer), Ma.
    pub deposition_start_age: f64,
    /// Age at which deposition completes (top of the layer), Ma.
    pub deposition_age: f64,
    lithologies: Vec<CompoundLithology>,
    /// Per-needle index into `lithologies`; a single entry means uniform.
    lithology_map: Option<Array2<usize>>,
    pub fluid: FluidType,
    /// Mobile (salt-like) layers do not record erosion in MaxVES.
    pub is_mobile: bool,
    pub is_source_rock: bool,
    /// Number of vertical elements at full resolution.
    pub segment_count: usize,

    /// Mutable per-segment input solid-thickness amplitude, m. The FCT
    /// corrector rescales this across geometric iterations.
    segment_full_solid_thickness: Array3<f64>,
    /// Input real thickness as it appears in the strat table, m.
    pub present_day_thickness: Array2<f64>,
    pub erosion: Option<ErosionEvent>,

    pub current: PropertyBook,
    pub previous: PropertyBook,

    /// Multiplicative FCT correction accumulated by the geometric loop.
    pub fct_correction: Array2<f64>,
    /// Relative thickness error map, percent.
    pub thickness_error: Array2<f64>,
    /// Thickness this layer had at its deposition snapshot, recorded once.
    pub computed_deposition_thickness: Option<Array2<f64>>,

    /// Always-needed dependent grids, rebuilt by the integrators.
    pub porosity: Array3<f64>,
    pub permeability_normal: Array3<f64>,
    pub permeability_planar: Array3<f64>,
    pub derived: DerivedGrids,

    /// Source-rock transformation ratio, integrated with temperature.
    pub transformation_ratio: Option<Array2<f64>>,

    nr_active_segments: usize,
}

impl Layer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        kind: LayerKind,
        deposition_start_age: f64,
        deposition_age: f64,
        segment_count: usize,
        lithology: CompoundLithology,
        fluid: FluidType,
        present_day_thickness: Array2<f64>,
        map: &MapGrid,
    ) -> Self {
        assert!(segment_count > 0, "layer {name} needs at least one segment");
        assert!(
            deposition_start_age > deposition_age,
            "layer {name}: deposition must start before it completes"
        );
        let (ny, nx) = (map.ny, map.nx);
        let nz = segment_count + 1;

        // First estimate of the solid thickness: the strat-table thickness
        // compacted by half the surface porosity, split evenly over the
        // segments. The geometric loop refines this through the FCT.
        let surface_porosity = lithology.surface_porosity();
        let mut segment_full_solid_thickness = Array3::zeros((segment_count, ny, nx));
        for j in 0..ny {
            for i in 0..nx {
                let input = present_day_thickness[[j, i]];
                let solid = if input == IBS_NO_DATA_VALUE {
                    IBS_NO_DATA_VALUE
                } else {
                    input * (1.0 - 0.5 * surface_porosity) / segment_count as f64
                };
                for k in 0..segment_count {
                    segment_full_solid_thickness[[k, j, i]] = solid;
                }
            }
        }

        Layer {
            name: name.to_string(),
            kind,
            deposition_start_age,
            deposition_age,
            lithologies: vec![lithology],
            lithology_map: None,
            fluid,
            is_mobile: false,
            is_source_rock: false,
            segment_count,
            segment_full_solid_thickness,
            present_day_thickness,
            erosion: None,
            current: PropertyBook::new(nz, ny, nx),
            previous: PropertyBook::new(nz, ny, nx),
            fct_correction: Array2::from_elem((ny, nx), 1.0),
            thickness_error: Array2::zeros((ny, nx)),
            computed_deposition_thickness: None,
            porosity: Array3::from_elem((nz, ny, nx), CAULDRON_NO_DATA_VALUE),
            permeability_normal: Array3::from_elem((nz, ny, nx), CAULDRON_NO_DATA_VALUE),
            permeability_planar: Array3::from_elem((nz, ny, nx), CAULDRON_NO_DATA_VALUE),
            derived: DerivedGrids::default(),
            transformation_ratio: None,
            nr_active_segments: 0,
        }
    }

    /// Install laterally varying lithologies.
    pub fn set_lithology_map(&mut self, lithologies: Vec<CompoundLithology>, map: Array2<usize>) {
        assert!(!lithologies.is_empty());
        self.lithologies = lithologies;
        self.lithology_map = Some(map);
    }

    pub fn lithology(&self, i: usize, j: usize) -> &CompoundLithology {
        match &self.lithology_map {
            Some(map) => &self.lithologies[map[[j, i]].min(self.lithologies.len() - 1)],
            None => &self.lithologies[0],
        }
    }

    pub fn is_sediment(&self) -> bool {
        self.kind == LayerKind::Sediment
    }

    pub fn is_basement(&self) -> bool {
        !self.is_sediment()
    }

    /// A layer is active once its deposition has begun. Basement is always
    /// active.
    pub fn is_active(&self, age: f64) -> bool {
        self.is_basement() || age < self.deposition_start_age
    }

    /// Age at which segment `k` (0 = bottom) starts depositing.
    fn segment_start_age(&self, k: usize) -> f64 {
        let span = self.deposition_start_age - self.deposition_age;
        self.deposition_start_age - span * k as f64 / self.segment_count as f64
    }

    fn segment_end_age(&self, k: usize) -> f64 {
        self.segment_start_age(k + 1)
    }

    /// Fraction of segment `k` deposited at `age`.
    fn deposition_fraction(&self, k: usize, age: f64) -> f64 {
        let start = self.segment_start_age(k);
        let end = self.segment_end_age(k);
        if age >= start {
            0.0
        } else if age <= end {
            1.0
        } else {
            (start - age) / (start - end)
        }
    }

    /// Set the count of active vertical elements for the given age.
    pub fn find_active_segments(&mut self, age: f64) {
        if self.is_basement() {
            self.nr_active_segments = self.segment_count;
            return;
        }
        self.nr_active_segments = (0..self.segment_count)
            .filter(|&k| age < self.segment_start_age(k))
            .count();
    }

    pub fn nr_of_active_segments(&self) -> usize {
        self.nr_active_segments
    }

    /// Topmost active segment for a needle, -1 when none.
    pub fn current_topmost_segment(&self, _i: usize, _j: usize) -> i64 {
        self.nr_active_segments as i64 - 1
    }

    /// Solid thickness eroded from the top of the needle at `age`, m.
    fn eroded_solid_thickness_at(&self, i: usize, j: usize, age: f64) -> f64 {
        match &self.erosion {
            Some(event) => {
                let total = event.eroded_solid_thickness[[j, i]];
                if total == IBS_NO_DATA_VALUE {
                    0.0
                } else {
                    total * event.fraction_at(age)
                }
            }
            None => 0.0,
        }
    }

    /// Input solid thickness of segment `k` at `age`; the sentinel when the
    /// segment has not started depositing. Erosion removes thickness from
    /// the top segment downwards.
    pub fn segment_solid_thickness_at(&self, i: usize, j: usize, k: usize, age: f64) -> f64 {
        if self.is_basement() {
            // Basement segments carry their full input thickness always.
            return self.segment_full_solid_thickness[[k, j, i]];
        }
        let fraction = self.deposition_fraction(k, age);
        if fraction <= 0.0 {
            return IBS_NO_DATA_VALUE;
        }
        let full = self.segment_full_solid_thickness[[k, j, i]];
        if full == IBS_NO_DATA_VALUE {
            return IBS_NO_DATA_VALUE;
        }
        let mut value = full * fraction;
        let mut eroded = self.eroded_solid_thickness_at(i, j, age);
        if eroded > 0.0 {
            // Remove from segments above first.
            for upper in (k + 1)..self.segment_count {
                let upper_full = self.segment_full_solid_thickness[[upper, j, i]];
                if upper_full != IBS_NO_DATA_VALUE {
                    eroded -= upper_full * self.deposition_fraction(upper, age);
                }
            }
            if eroded > 0.0 {
                value = (value - eroded).max(0.0);
            }
        }
        value
    }

    /// Input real thickness of segment `k` at `age` (strat-table thickness
    /// deposited by the same history). Drives the non-geometric loop.
    pub fn segment_real_thickness_at(&self, i: usize, j: usize, k: usize, age: f64) -> f64 {
        let fraction = self.deposition_fraction(k, age);
        if fraction <= 0.0 && self.is_sediment() {
            return IBS_NO_DATA_VALUE;
        }
        let input = self.present_day_thickness[[j, i]];
        if input == IBS_NO_DATA_VALUE {
            return IBS_NO_DATA_VALUE;
        }
        let per_segment = input / self.segment_count as f64;
        let mut value = per_segment * fraction.max(if self.is_basement() { 1.0 } else { 0.0 });
        let solid_full = self.segment_full_solid_thickness[[k, j, i]];
        let mut eroded = self.eroded_solid_thickness_at(i, j, age);
        if eroded > 0.0 && solid_full > 0.0 && solid_full != IBS_NO_DATA_VALUE {
            // Convert the eroded solid budget into real thickness pro rata.
            let ratio = per_segment / solid_full;
            for upper in (k + 1)..self.segment_count {
                let upper_full = self.segment_full_solid_thickness[[upper, j, i]];
                if upper_full != IBS_NO_DATA_VALUE {
                    eroded -= upper_full * self.deposition_fraction(upper, age);
                }
            }
            if eroded > 0.0 {
                value = (value - eroded * ratio).max(0.0);
            }
        }
        value
    }

    /// Present-day input thickness with erosion taken into account, m.
    pub fn present_day_eroded_thickness(&self, i: usize, j: usize) -> f64 {
        match &self.erosion {
            Some(event) => {
                let total = event.eroded_solid_thickness[[j, i]];
                if total == IBS_NO_DATA_VALUE || total <= 0.0 {
                    0.0
                } else {
                    (self.present_day_thickness[[j, i]] - total).max(0.0)
                }
            }
            None => 0.0,
        }
    }

    /// Replace the solid-thickness history with a uniform per-segment
    /// value everywhere; test scaffolding and simple columnar projects.
    pub fn set_uniform_segment_solid_thickness(&mut self, per_segment: f64) {
        self.segment_full_solid_thickness.fill(per_segment);
    }

    /// Scale the solid-thickness history of a needle; the FCT corrector's
    /// write path.
    pub fn scale_solid_thickness_history(&mut self, i: usize, j: usize, factor: f64) {
        for k in 0..self.segment_count {
            let value = self.segment_full_solid_thickness[[k, j, i]];
            if value != IBS_NO_DATA_VALUE {
                self.segment_full_solid_thickness[[k, j, i]] = value * factor;
            }
        }
    }

    /// Copy every fundamental property from current to previous at every
    /// valid needle and every local k. Idempotent when no writes intervene.
    pub fn copy_properties(&mut self, valid_needle: &Array2<bool>) {
        let nz = self.segment_count + 1;
        for prop in FundamentalProperty::ALL {
            for ((j, i), &valid) in valid_needle.indexed_iter() {
                if !valid {
                    continue;
                }
                for k in 0..nz {
                    let value = self.current.value(prop, k, j, i);
                    self.previous.set(prop, k, j, i, value);
                }
            }
        }
    }

    /// Reset the property books for a fresh geometric iteration. The FCT
    /// correction and the scaled solid-thickness history persist; that is
    /// the state the outer loop iterates on.
    pub fn reinitialise(&mut self) {
        self.current.restore_all();
        self.previous.restore_all();
        self.current.fill(CAULDRON_NO_DATA_VALUE);
        self.previous.fill(CAULDRON_NO_DATA_VALUE);
        self.porosity.fill(CAULDRON_NO_DATA_VALUE);
        self.permeability_normal.fill(CAULDRON_NO_DATA_VALUE);
        self.permeability_planar.fill(CAULDRON_NO_DATA_VALUE);
        self.derived = DerivedGrids::default();
        self.computed_deposition_thickness = None;
        self.transformation_ratio = None;
        self.nr_active_segments = 0;
    }

    /// Integrate the chemical-compaction porosity loss over the step.
    pub fn integrate_chemical_compaction(
        &mut self,
        previous_time: f64,
        current_time: f64,
        valid_needle: &Array2<bool>,
    ) {
        let dt = previous_time - current_time;
        if dt <= 0.0 {
            return;
        }
        let nz = self.segment_count + 1;
        for ((j, i), &valid) in valid_needle.indexed_iter() {
            if !valid {
                continue;
            }
            let lithology = self.lithology(i, j).clone();
            let max_loss = (lithology.surface_porosity() - crate::MINIMUM_POROSITY).max(0.0);
            for k in 0..nz {
                let temperature = self.current.value(FundamentalProperty::Temperature, k, j, i);
                if temperature == CAULDRON_NO_DATA_VALUE {
                    continue;
                }
                let mut cc = self.previous.value(FundamentalProperty::ChemicalCompaction, k, j, i);
                if cc == CAULDRON_NO_DATA_VALUE || cc == IBS_NO_DATA_VALUE {
                    cc = 0.0;
                }
                cc -= lithology.chemical_compaction_rate(temperature) * dt;
                cc = cc.max(-max_loss);
                self.current.set(FundamentalProperty::ChemicalCompaction, k, j, i, cc);
            }
        }
    }

    /// Integrate a first-order Arrhenius source-rock transformation over
    /// the step; only the map trend matters to the driver.
    pub fn integrate_source_rock(
        &mut self,
        previous_time: f64,
        current_time: f64,
        valid_needle: &Array2<bool>,
    ) {
        if !self.is_source_rock {
            return;
        }
        let dt = previous_time - current_time;
        if dt <= 0.0 {
            return;
        }
        let (ny, nx) = valid_needle.dim();
        let ratio = self
            .transformation_ratio
            .get_or_insert_with(|| Array2::zeros((ny, nx)));
        let top = self.segment_count;
        for ((j, i), &valid) in valid_needle.indexed_iter() {
            if !valid {
                continue;
            }
            let temperature = self.current.value(FundamentalProperty::Temperature, top, j, i);
            if temperature == CAULDRON_NO_DATA_VALUE {
                continue;
            }
            let t_kelvin = temperature + 273.15;
            // First-order kinetics, Ea/R = 25000 K, A = 1e13 /Ma scale.
            let rate = 1.0e13 * (-25000.0 / t_kelvin).exp();
            let current = ratio[[j, i]];
            ratio[[j, i]] = 1.0 - (1.0 - current) * (-rate * dt).exp();
        }
    }

    /// Characteristic pressure-diffusion time of the layer, Ma. Used as the
    /// CFL floor on the time step.
    pub fn cfl_time_step(&self, valid_needle: &Array2<bool>) -> f64 {
        let mut cfl: f64 = 100.0; // Ma, effectively no constraint
        let nz = self.segment_count + 1;
        for ((j, i), &valid) in valid_needle.indexed_iter() {
            if !valid {
                continue;
            }
            for k in 0..nz.saturating_sub(1) {
                let top = self.current.value(FundamentalProperty::Depth, k + 1, j, i);
                let bottom = self.current.value(FundamentalProperty::Depth, k, j, i);
                if top == CAULDRON_NO_DATA_VALUE || bottom == CAULDRON_NO_DATA_VALUE {
                    continue;
                }
                let dz = (bottom - top).abs();
                if dz <= crate::DEPOSITING_THICKNESS_TOLERANCE {
                    continue;
                }
                let phi = self.porosity[[k, j, i]];
                let k_md = self.permeability_normal[[k, j, i]];
                if phi == CAULDRON_NO_DATA_VALUE || k_md == CAULDRON_NO_DATA_VALUE || k_md <= 0.0 {
                    continue;
                }
                let viscosity = self.fluid.viscosity(
                    self.current
                        .value(FundamentalProperty::Temperature, k, j, i)
                        .max(10.0),
                );
                let compressibility = self.fluid.compressibility * crate::PA_TO_MEGAPA; // 1/Pa
                let diffusivity =
                    (k_md * crate::MILLIDARCY_TO_M2) / (viscosity * phi.max(0.01) * compressibility.max(1.0e-12));
                let seconds = dz * dz / diffusivity.max(1.0e-12);
                cfl = cfl.min(seconds / crate::SECONDS_PER_MA);
            }
        }
        cfl
    }
}

/// Iteration order over the layer registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Bottom (oldest) first.
    Ascending,
    /// Top (youngest) first.
    Descending,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerRange {
    SedimentsOnly,
    BasementAndSediments,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivityFilter {
    ActiveOnly,
    All,
}

/// Indices into the layer registry, filtered by direction, kind range and
/// activity at the given age. The registry stores layers ascending:
/// index 0 is the bottom-most (mantle).
pub fn layer_indices(
    layers: &[Layer],
    direction: Direction,
    range: LayerRange,
    activity: ActivityFilter,
    age: f64,
) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..layers.len())
        .filter(|&index| {
            let layer = &layers[index];
            let kind_ok = match range {
                LayerRange::SedimentsOnly => layer.is_sediment(),
                LayerRange::BasementAndSediments => true,
            };
            let active_ok = match activity {
                ActivityFilter::ActiveOnly => layer.is_active(age),
                ActivityFilter::All => true,
            };
            kind_ok && active_ok
        })
        .collect();
    if direction == Direction::Descending {
        indices.reverse();
    }
    indices
}
