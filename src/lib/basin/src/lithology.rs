//! Lithology and pore-fluid models.
//!
//! A `CompoundLithology` mixes up to a handful of simple lithologies by
//! volume fraction and exposes the property functions the integrators and
//! assemblers consume: porosity from the (VES, MaxVES, chemical compaction)
//! state, bulk permeability normal/planar to bedding, thermal conductivity,
//! heat capacity and radiogenic heat production.

use serde::{Deserialize, Serialize};

use crate::{MINIMUM_POROSITY, PA_TO_MEGAPA};

/// Porosity-effective-stress model of a simple lithology.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PorosityModel {
    Exponential,
    SoilMechanics,
}

/// A single lithotype with its mechanical and thermal parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimpleLithology {
    pub name: String,
    /// Grain (solid) density, kg/m^3.
    pub density: f64,
    /// Porosity at zero effective stress.
    pub surface_porosity: f64,
    /// Compaction coefficient, 1/Pa (exponential) or the compression index
    /// scale (soil mechanics).
    pub compaction_coefficient: f64,
    pub porosity_model: PorosityModel,
    /// Depositional permeability at surface porosity, mD.
    pub depositional_permeability: f64,
    /// Decades of permeability lost per unit of porosity lost.
    pub permeability_sensitivity: f64,
    /// Planar over normal permeability ratio.
    pub permeability_anisotropy: f64,
    /// Grain thermal conductivity at 20 C, W/m/K.
    pub thermal_conductivity: f64,
    /// Relative conductivity loss per degree above 20 C.
    pub thermal_conductivity_temperature_coefficient: f64,
    /// Grain heat capacity, J/kg/K.
    pub heat_capacity: f64,
    /// Radiogenic heat production, uW/m^3.
    pub heat_production: f64,
    /// Grain seismic velocity, m/s. Used by Wyllie's time average.
    pub seismic_velocity: f64,
}

impl SimpleLithology {
    /// A standard sandstone, the conventional fallback lithotype.
    pub fn standard_sandstone() -> Self {
        SimpleLithology {
            name: "Std. Sandstone".to_string(),
            density: 2650.0,
            surface_porosity: 0.4,
            compaction_coefficient: 2.66e-8,
            porosity_model: PorosityModel::Exponential,
            depositional_permeability: 6000.0,
            permeability_sensitivity: 1.5,
            permeability_anisotropy: 1.0,
            thermal_conductivity: 3.2,
            thermal_conductivity_temperature_coefficient: 1.0e-3,
            heat_capacity: 840.0,
            heat_production: 0.7,
            seismic_velocity: 5500.0,
        }
    }

    pub fn standard_shale() -> Self {
        SimpleLithology {
            name: "Std. Shale".to_string(),
            density: 2710.0,
            surface_porosity: 0.67,
            compaction_coefficient: 9.0e-8,
            porosity_model: PorosityModel::SoilMechanics,
            depositional_permeability: 9.0e-3,
            permeability_sensitivity: 6.0,
            permeability_anisotropy: 0.1,
            thermal_conductivity: 1.9,
            thermal_conductivity_temperature_coefficient: 1.5e-3,
            heat_capacity: 860.0,
            heat_production: 1.8,
            seismic_velocity: 4500.0,
        }
    }

    /// Crustal basement lithotype: effectively porosity-free.
    pub fn crust_basalt() -> Self {
        SimpleLithology {
            name: "Crust".to_string(),
            density: 2850.0,
            surface_porosity: 0.0,
            compaction_coefficient: 0.0,
            porosity_model: PorosityModel::Exponential,
            depositional_permeability: 1.0e-9,
            permeability_sensitivity: 0.0,
            permeability_anisotropy: 1.0,
            thermal_conductivity: 2.6,
            thermal_conductivity_temperature_coefficient: 5.0e-4,
            heat_capacity: 900.0,
            heat_production: 1.0,
            seismic_velocity: 6500.0,
        }
    }

    pub fn mantle_peridotite() -> Self {
        SimpleLithology {
            name: "Mantle".to_string(),
            density: 3300.0,
            surface_porosity: 0.0,
            compaction_coefficient: 0.0,
            porosity_model: PorosityModel::Exponential,
            depositional_permeability: 1.0e-9,
            permeability_sensitivity: 0.0,
            permeability_anisotropy: 1.0,
            thermal_conductivity: 3.9,
            thermal_conductivity_temperature_coefficient: 2.0e-4,
            heat_capacity: 1200.0,
            heat_production: 0.03,
            seismic_velocity: 8000.0,
        }
    }

    fn loading_porosity(&self, max_ves: f64) -> f64 {
        match self.porosity_model {
            PorosityModel::Exponential => {
                self.surface_porosity * (-self.compaction_coefficient * max_ves).exp()
            }
            PorosityModel::SoilMechanics => {
                // Void-ratio formulation: e = e0 - Cc*log10(1 + ves/ves_ref),
                // floored at the minimum porosity.
                let e0 = self.surface_porosity / (1.0 - self.surface_porosity);
                let ves_ref = 1.0e5; // Pa
                let e = e0 - self.compaction_coefficient * 1.0e7 * (1.0 + max_ves / ves_ref).log10();
                let e = e.max(MINIMUM_POROSITY / (1.0 - MINIMUM_POROSITY));
                e / (1.0 + e)
            }
        }
    }

    /// Porosity at the given state. `MaxVES` carries the compaction memory:
    /// on the loading branch (ves >= max_ves) porosity follows the
    /// compaction curve, on unloading a small elastic rebound applies.
    pub fn porosity(
        &self,
        ves: f64,
        max_ves: f64,
        include_chemical_compaction: bool,
        chemical_compaction: f64,
    ) -> f64 {
        if self.surface_porosity <= 0.0 {
            return 0.0;
        }
        let max_ves = max_ves.max(ves).max(0.0);
        let mut phi = self.loading_porosity(max_ves);
        if ves < max_ves {
            // Elastic rebound on the unloading branch, 2% of the loading slope.
            let rebound = 0.02 * self.compaction_coefficient * (max_ves - ves);
            phi += self.surface_porosity * rebound.min(1.0);
        }
        if include_chemical_compaction {
            // chemical_compaction is a non-positive porosity-loss term.
            phi += chemical_compaction;
        }
        let floor = match self.porosity_model {
            PorosityModel::SoilMechanics => MINIMUM_POROSITY,
            PorosityModel::Exponential => {
                if include_chemical_compaction {
                    MINIMUM_POROSITY
                } else {
                    0.0
                }
            }
        };
        phi.clamp(floor, self.surface_porosity)
    }

    /// Permeability (normal to bedding) from porosity, mD. Log-linear in
    /// porosity loss.
    pub fn permeability(&self, porosity: f64) -> f64 {
        if self.surface_porosity <= 0.0 {
            return self.depositional_permeability;
        }
        let lost = (self.surface_porosity - porosity).max(0.0);
        let log_k = self.depositional_permeability.log10() - self.permeability_sensitivity * lost / self.surface_porosity;
        10f64.powf(log_k)
    }

    /// Grain conductivity at temperature T (C).
    pub fn grain_conductivity(&self, temperature: f64) -> f64 {
        let factor = 1.0 - self.thermal_conductivity_temperature_coefficient * (temperature - 20.0);
        (self.thermal_conductivity * factor.max(0.1)).max(0.1)
    }
}

/// A volume-fraction mixture of simple lithologies. Fractions are
/// normalised on construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompoundLithology {
    components: Vec<(SimpleLithology, f64)>,
}

/// Porosity of each mixed component plus the mixture value; the
/// permeability calculation consumes the per-component values.
#[derive(Clone, Debug, Default)]
pub struct CompoundProperty {
    pub mixed: f64,
    pub components: Vec<f64>,
}

impl CompoundLithology {
    pub fn new(components: Vec<(SimpleLithology, f64)>) -> Self {
        let total: f64 = components.iter().map(|(_, f)| f).sum();
        assert!(total > 0.0, "compound lithology needs a positive fraction total");
        let components = components
            .into_iter()
            .map(|(l, f)| (l, f / total))
            .collect();
        CompoundLithology { components }
    }

    pub fn uniform(lithology: SimpleLithology) -> Self {
        CompoundLithology {
            components: vec![(lithology, 1.0)],
        }
    }

    /// Grain density of the mixture, kg/m^3.
    pub fn density(&self) -> f64 {
        self.components.iter().map(|(l, f)| f * l.density).sum()
    }

    pub fn surface_porosity(&self) -> f64 {
        self.components
            .iter()
            .map(|(l, f)| f * l.surface_porosity)
            .sum()
    }

    /// Mixture porosity at the given state.
    pub fn porosity(
        &self,
        ves: f64,
        max_ves: f64,
        include_chemical_compaction: bool,
        chemical_compaction: f64,
    ) -> f64 {
        self.components
            .iter()
            .map(|(l, f)| f * l.porosity(ves, max_ves, include_chemical_compaction, chemical_compaction))
            .sum()
    }

    /// Porosity of the mixture and of each component.
    pub fn get_porosity(
        &self,
        ves: f64,
        max_ves: f64,
        include_chemical_compaction: bool,
        chemical_compaction: f64,
        porosity: &mut CompoundProperty,
    ) {
        porosity.components.clear();
        let mut mixed = 0.0;
        for (l, f) in &self.components {
            let phi = l.porosity(ves, max_ves, include_chemical_compaction, chemical_compaction);
            porosity.components.push(phi);
            mixed += f * phi;
        }
        porosity.mixed = mixed;
    }

    /// Bulk permeability normal and planar to bedding, mD. Normal mixes
    /// harmonically (flow crosses every component), planar arithmetically.
    pub fn bulk_permeability_np(
        &self,
        _ves: f64,
        _max_ves: f64,
        porosity: &CompoundProperty,
    ) -> (f64, f64) {
        let mut harmonic = 0.0;
        let mut planar = 0.0;
        for (index, (l, f)) in self.components.iter().enumerate() {
            let phi = porosity
                .components
                .get(index)
                .copied()
                .unwrap_or(porosity.mixed);
            let k = l.permeability(phi).max(1.0e-12);
            harmonic += f / k;
            planar += f * k * l.permeability_anisotropy.max(1.0e-3);
        }
        let normal = if harmonic > 0.0 { 1.0 / harmonic } else { 0.0 };
        (normal, planar)
    }

    /// Bulk thermal conductivity normal/planar, W/m/K, geometric mixing of
    /// grain and fluid conductivity.
    pub fn bulk_thermal_conductivity_np(
        &self,
        porosity: f64,
        temperature: f64,
        fluid_conductivity: f64,
    ) -> (f64, f64) {
        let mut grain_log = 0.0;
        for (l, f) in &self.components {
            grain_log += f * l.grain_conductivity(temperature).ln();
        }
        let grain = grain_log.exp();
        let bulk = grain.powf(1.0 - porosity) * fluid_conductivity.max(0.05).powf(porosity);
        // Bedding-parallel conduction is slightly more efficient.
        (bulk, 1.05 * bulk)
    }

    /// Grain heat capacity of the mixture, J/kg/K.
    pub fn heat_capacity(&self) -> f64 {
        self.components.iter().map(|(l, f)| f * l.heat_capacity).sum()
    }

    /// Bulk radiogenic heat production, uW/m^3, carried by the solid frame.
    pub fn bulk_heat_production(&self, porosity: f64) -> f64 {
        let grain: f64 = self.components.iter().map(|(l, f)| f * l.heat_production).sum();
        grain * (1.0 - porosity)
    }

    /// Grain seismic velocity of the mixture, m/s.
    pub fn seismic_velocity(&self) -> f64 {
        self.components
            .iter()
            .map(|(l, f)| f * l.seismic_velocity)
            .sum()
    }

    /// Chemical-compaction (quartz cementation) rate in porosity per Ma at
    /// temperature T. Active above ~80 C, Arrhenius in T.
    pub fn chemical_compaction_rate(&self, temperature: f64) -> f64 {
        if temperature <= 80.0 {
            return 0.0;
        }
        let activation = 22000.0; // K, Ea/R
        let reference = 0.12; // porosity/Ma at 110 C
        let t_kelvin = temperature + 273.15;
        let t_ref = 110.0 + 273.15;
        reference * ((-activation) * (1.0 / t_kelvin - 1.0 / t_ref)).exp()
    }
}

/// The pore fluid: density as a function of temperature and pore pressure,
/// viscosity, and the permafrost flag that switches the integrators to
/// ice-solid semantics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FluidType {
    pub name: String,
    /// Density at standard conditions, kg/m^3.
    pub standard_density: f64,
    /// Volumetric thermal expansion, 1/C.
    pub thermal_expansion: f64,
    /// Compressibility, 1/MPa.
    pub compressibility: f64,
    /// Seismic velocity, m/s. Used by Wyllie's time average.
    pub seismic_velocity: f64,
    /// Thermal conductivity, W/m/K.
    pub thermal_conductivity: f64,
    /// Heat capacity, J/kg/K.
    pub heat_capacity: f64,
    /// Ice-solid semantics below freezing.
    pub permafrost: bool,
    /// Density used below freezing when `permafrost` is set, kg/m^3.
    pub frozen_density: f64,
}

impl FluidType {
    pub fn standard_water() -> Self {
        FluidType {
            name: "Std. Water".to_string(),
            standard_density: 1030.0,
            thermal_expansion: 4.0e-4,
            compressibility: 4.5e-4,
            seismic_velocity: 1500.0,
            thermal_conductivity: 0.6,
            heat_capacity: 4185.0,
            permafrost: false,
            frozen_density: 917.0,
        }
    }

    /// Fluid density at temperature (C) and pore pressure (MPa).
    pub fn density(&self, temperature: f64, pore_pressure: f64) -> f64 {
        if self.permafrost && temperature < 0.0 {
            return self.frozen_density;
        }
        let reference_temperature = 20.0;
        let reference_pressure = 0.1; // MPa
        self.standard_density
            * (1.0 - self.thermal_expansion * (temperature - reference_temperature)
                + self.compressibility * (pore_pressure - reference_pressure))
    }

    /// Dynamic viscosity, Pa.s. Andrade-type temperature dependence.
    pub fn viscosity(&self, temperature: f64) -> f64 {
        let t = temperature.max(0.0);
        0.001 * 10f64.powf(1.3272 * (20.0 - t) / (t + 104.0))
    }

    /// True when this fluid is in the ice branch: the fluid density exceeds
    /// the grain density and the fluid flags permafrost.
    pub fn switch_permafrost(&self) -> bool {
        self.permafrost
    }

    /// Hydrostatic pressure (MPa) at `depth` below the sea surface,
    /// integrating the fluid density from the sea top.
    pub fn hydrostatic_pressure_at(&self, depth: f64, surface_temperature: f64) -> f64 {
        if depth <= 0.0 {
            return crate::PRESSURE_AT_SEA_TOP;
        }
        // Two-slice trapezoid is plenty for the water column.
        let mid_pressure = crate::PRESSURE_AT_SEA_TOP
            + self.density(surface_temperature, crate::PRESSURE_AT_SEA_TOP)
                * crate::GRAVITY
                * (0.5 * depth)
                * PA_TO_MEGAPA;
        let rho = self.density(surface_temperature, mid_pressure);
        crate::PRESSURE_AT_SEA_TOP + rho * crate::GRAVITY * depth * PA_TO_MEGAPA
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn porosity_decreases_under_loading_and_remembers_max_ves() {
        let sand = SimpleLithology::standard_sandstone();
        let shallow = sand.porosity(1.0e6, 1.0e6, false, 0.0);
        let deep = sand.porosity(2.0e7, 2.0e7, false, 0.0);
        assert!(deep < shallow);
        // Unloading: porosity rebounds only slightly, never back to the
        // loading-curve value at the lower stress.
        let unloaded = sand.porosity(1.0e6, 2.0e7, false, 0.0);
        assert!(unloaded >= deep);
        assert!(unloaded < shallow);
    }

    #[test]
    fn permeability_round_trips_through_porosity() {
        let sand = SimpleLithology::standard_sandstone();
        let lith = CompoundLithology::uniform(sand);
        let (ves, max_ves) = (5.0e6, 5.0e6);
        let mut compound = CompoundProperty::default();
        lith.get_porosity(ves, max_ves, false, 0.0, &mut compound);
        let (k_direct, _) = lith.bulk_permeability_np(ves, max_ves, &compound);

        let phi = lith.porosity(ves, max_ves, false, 0.0);
        let mut recompute = CompoundProperty::default();
        lith.get_porosity(ves, max_ves, false, 0.0, &mut recompute);
        assert_relative_eq!(recompute.mixed, phi, max_relative = 1.0e-12);
        let (k_roundtrip, _) = lith.bulk_permeability_np(ves, max_ves, &recompute);
        assert_relative_eq!(k_direct, k_roundtrip, max_relative = 1.0e-12);
    }

    #[test]
    fn soil_mechanics_porosity_floors_at_minimum() {
        let shale = SimpleLithology::standard_shale();
        let phi = shale.porosity(5.0e8, 5.0e8, true, -0.5);
        assert_relative_eq!(phi, MINIMUM_POROSITY, max_relative = 1.0e-12);
    }

    #[test]
    fn water_density_responds_to_temperature_and_pressure() {
        let water = FluidType::standard_water();
        let cold_deep = water.density(10.0, 50.0);
        let hot_shallow = water.density(120.0, 5.0);
        assert!(cold_deep > hot_shallow);
    }

    #[test]
    fn permafrost_fluid_returns_frozen_density_below_zero() {
        let mut ice = FluidType::standard_water();
        ice.permafrost = true;
        ice.frozen_density = 2900.0; // denser than grain for the ice branch
        assert_relative_eq!(ice.density(-5.0, 10.0), 2900.0);
        assert!(ice.density(5.0, 10.0) < 1100.0);
    }

    #[test]
    fn chemical_compaction_rate_is_zero_when_cold() {
        let lith = CompoundLithology::uniform(SimpleLithology::standard_sandstone());
        assert_eq!(lith.chemical_compaction_rate(60.0), 0.0);
        assert!(lith.chemical_compaction_rate(120.0) > 0.0);
    }
}
