//! Adaptive time stepping: per-mode step prediction from the maximum
//! property increments, the CFL floor, permafrost refinement and the
//! snapshot alignment of the march. No step ever advances past the next
//! major snapshot.

use crate::project::{PermafrostParameters, RunParameters, SnapshotSequence};

/// Position of the march within the snapshot sequence.
#[derive(Clone, Copy, Debug, Default)]
pub struct SnapshotCursor {
    pub major_index: usize,
    pub minor_index: usize,
}

impl SnapshotCursor {
    pub fn current_major(&self, snapshots: &SnapshotSequence) -> f64 {
        let majors = snapshots.majors();
        majors[self.major_index.min(majors.len() - 1)]
    }
}

/// Advance the march by one step: update the snapshot iterators, subtract
/// the step, snap to nearby snapshot times and re-derive the actual step.
/// Returns `(still_marching, major_snapshot_advanced)`.
pub fn step_forward_with_cursor(
    snapshots: &SnapshotSequence,
    permafrost: Option<&PermafrostParameters>,
    previous_time: &mut f64,
    current_time: &mut f64,
    time_step: &mut f64,
    cursor: &mut SnapshotCursor,
) -> (bool, bool) {
    let mut major_updated = false;
    let majors = snapshots.majors();
    let minors = snapshots.minors();

    if *current_time == 0.0 {
        // We are done.
        return (false, false);
    }

    if cursor.major_index < majors.len() && *current_time == majors[cursor.major_index] {
        // Step to the next snapshot time.
        cursor.major_index += 1;
        major_updated = true;
    } else if snapshots.valid_minor(cursor.minor_index)
        && *current_time <= minors[cursor.minor_index]
    {
        snapshots.advance_minor_iterator(*current_time, &mut cursor.minor_index);
    }

    let next_major = majors[cursor.major_index.min(majors.len() - 1)];

    *previous_time = *current_time;
    *current_time -= *time_step;

    // Do not leave a sliver of a time step as a snapshot approaches: if
    // the current time is just short of the snapshot, set it to the
    // snapshot time.
    if (*current_time - next_major).abs() < 1.0e-4 {
        *current_time = next_major;
    } else if snapshots.prescribes_minor_snapshots
        && snapshots.is_almost_snapshot(*current_time, *time_step, cursor.minor_index, 0.1)
    {
        *current_time = minors[cursor.minor_index];
    }

    if snapshots.prescribes_minor_snapshots
        && snapshots.valid_minor(cursor.minor_index)
        && *current_time < minors[cursor.minor_index]
        && minors[cursor.minor_index] > next_major
    {
        *current_time = minors[cursor.minor_index];
    } else if *current_time < next_major {
        *current_time = next_major;
    }

    adjust_time_to_permafrost(permafrost, *previous_time, current_time);

    *time_step = *previous_time - *current_time;
    (true, major_updated)
}

/// Snap the step to a permafrost switch age lying inside it.
fn adjust_time_to_permafrost(
    permafrost: Option<&PermafrostParameters>,
    previous_time: f64,
    current_time: &mut f64,
) {
    if let Some(parameters) = permafrost {
        for &age in &parameters.switch_ages {
            if age < previous_time && age > *current_time {
                *current_time = age;
                break;
            }
        }
    }
}

/// One-sided prediction rule shared by all modes.
fn predicted_step(
    time_step: f64,
    maximum_difference: f64,
    optimal_difference: f64,
    increase_factor: f64,
    decrease_factor: f64,
) -> f64 {
    if maximum_difference <= 0.0 {
        time_step * increase_factor
    } else if maximum_difference < optimal_difference {
        time_step * (optimal_difference / maximum_difference).min(increase_factor)
    } else {
        time_step * (optimal_difference / maximum_difference).max(decrease_factor)
    }
}

fn apply_permafrost(params: &RunParameters, current_time: f64, time_step: &mut f64) {
    if let Some(permafrost) = &params.permafrost {
        if permafrost.fixed_time_step > 0.0 {
            // The fixed time step overwrites all other time steps.
            *time_step = permafrost.fixed_time_step;
        } else if permafrost.switch_time_step(current_time) {
            *time_step = time_step.min(permafrost.time_step);
        }
    }
}

/// Pressure-mode step prediction.
#[allow(clippy::too_many_arguments)]
pub fn determine_next_pressure_time_step(
    params: &RunParameters,
    current_time: f64,
    time_step: &mut f64,
    newton_iterations: usize,
    maximum_pressure_difference: f64,
    at_major_snapshot: bool,
    cfl_value: Option<f64>,
) {
    if at_major_snapshot {
        *time_step = params.initial_time_step_at(current_time);
    } else {
        let increase = params.time_step_increase_factor;
        let decrease = params.time_step_decrease_factor;
        let optimal = params.optimal_pressure_difference;

        let predicted = if params.optimisation_level >= 6
            && newton_iterations >= params.maximum_pressure_nonlinear_iterations()
            && maximum_pressure_difference > 0.25 * optimal
        {
            // Only allow the step to shrink by at most a factor of a half.
            *time_step * decrease.max(0.5)
        } else {
            predicted_step(
                *time_step,
                maximum_pressure_difference,
                optimal,
                increase,
                decrease,
            )
        };

        *time_step = match (params.cfl_time_stepping, cfl_value) {
            (true, Some(cfl)) => cfl.max(predicted),
            _ => predicted,
        };
        *time_step = time_step.max(params.minimum_time_step);
        *time_step = time_step.min(params.maximum_time_step);
    }
    apply_permafrost(params, current_time, time_step);
}

/// Temperature-mode step prediction: the basin-wide and the source-rock
/// rules run separately and the minimum wins.
pub fn determine_next_temperature_time_step(
    params: &RunParameters,
    current_time: f64,
    time_step: &mut f64,
    maximum_temperature_difference: f64,
    maximum_sr_temperature_difference: f64,
    at_major_snapshot: bool,
) {
    if at_major_snapshot {
        *time_step = params.initial_time_step_at(current_time);
    } else {
        let increase = params.time_step_increase_factor;
        let decrease = params.time_step_decrease_factor;
        let predicted = predicted_step(
            *time_step,
            maximum_temperature_difference,
            params.optimal_temperature_difference,
            increase,
            decrease,
        );
        let predicted_sr = predicted_step(
            *time_step,
            maximum_sr_temperature_difference,
            params.optimal_sr_temperature_difference,
            increase,
            decrease,
        );
        *time_step = predicted.min(predicted_sr);
        *time_step = time_step.min(params.maximum_time_step);
        if params.is_alc {
            *time_step = time_step.max(params.minimum_time_step);
        }
    }
    apply_permafrost(params, current_time, time_step);
}

/// Coupled-mode step prediction: the minimum of the pressure, temperature
/// and source-rock predictions.
#[allow(clippy::too_many_arguments)]
pub fn determine_next_coupled_time_step(
    params: &RunParameters,
    current_time: f64,
    time_step: &mut f64,
    maximum_overpressure_difference: f64,
    maximum_temperature_difference: f64,
    maximum_sr_temperature_difference: f64,
    at_major_snapshot: bool,
    cfl_value: Option<f64>,
) {
    if at_major_snapshot {
        *time_step = params.initial_time_step_at(current_time);
    } else {
        let increase = params.time_step_increase_factor;
        let decrease = params.time_step_decrease_factor;

        let predicted_pressure = predicted_step(
            *time_step,
            maximum_overpressure_difference,
            params.optimal_pressure_difference,
            increase,
            decrease,
        );
        let predicted_temperature = predicted_step(
            *time_step,
            maximum_temperature_difference,
            params.optimal_temperature_difference,
            increase,
            decrease,
        );
        let predicted_source_rock = predicted_step(
            *time_step,
            maximum_sr_temperature_difference,
            params.optimal_sr_temperature_difference,
            increase,
            decrease,
        );

        *time_step = predicted_pressure
            .min(predicted_temperature)
            .min(predicted_source_rock);

        // The result must not fall below the minimum allowed step.
        *time_step = match (params.cfl_time_stepping, cfl_value) {
            (true, Some(cfl)) => cfl.max(*time_step).max(params.minimum_time_step),
            _ => time_step.max(params.minimum_time_step),
        };
        *time_step = time_step.min(params.maximum_time_step);
    }
    apply_permafrost(params, current_time, time_step);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{Snapshot, SnapshotKind};

    fn sequence(majors: &[f64], minors: &[f64]) -> SnapshotSequence {
        let mut all: Vec<Snapshot> = majors
            .iter()
            .map(|&age| Snapshot {
                age,
                kind: SnapshotKind::Major,
            })
            .collect();
        all.extend(minors.iter().map(|&age| Snapshot {
            age,
            kind: SnapshotKind::Minor,
        }));
        SnapshotSequence::new(&all).unwrap()
    }

    #[test]
    fn march_never_steps_past_the_next_major_snapshot() {
        let snapshots = sequence(&[20.0, 10.0, 0.0], &[]);
        let mut cursor = SnapshotCursor::default();
        let mut current = snapshots.oldest();
        cursor.major_index = 1; // positioned past the oldest snapshot
        let mut previous = current;
        let mut dt = 7.0;

        let mut ages = Vec::new();
        loop {
            let (more, _) = step_forward_with_cursor(
                &snapshots,
                None,
                &mut previous,
                &mut current,
                &mut dt,
                &mut cursor,
            );
            if !more {
                break;
            }
            ages.push(current);
            dt = 7.0;
        }
        // 20 -> 13 -> 10 (snapped) -> 3 -> 0 (snapped)
        assert_eq!(ages, vec![13.0, 10.0, 3.0, 0.0]);
    }

    #[test]
    fn near_snapshot_slivers_are_snapped() {
        let snapshots = sequence(&[20.0, 10.0, 0.0], &[]);
        let mut cursor = SnapshotCursor { major_index: 1, minor_index: 0 };
        let mut previous = 20.0;
        let mut current = 20.0;
        let mut dt = 9.99995;
        let (more, _) = step_forward_with_cursor(
            &snapshots,
            None,
            &mut previous,
            &mut current,
            &mut dt,
            &mut cursor,
        );
        assert!(more);
        assert_eq!(current, 10.0);
        assert_eq!(dt, 10.0);
    }

    #[test]
    fn prescribed_minor_snapshots_are_landed_on() {
        let snapshots = sequence(&[20.0, 0.0], &[15.0, 5.0]);
        let mut cursor = SnapshotCursor { major_index: 1, minor_index: 0 };
        let mut previous = 20.0;
        let mut current = 20.0;
        let mut dt = 8.0;
        step_forward_with_cursor(&snapshots, None, &mut previous, &mut current, &mut dt, &mut cursor);
        // 20 - 8 = 12 would overshoot the minor snapshot at 15.
        assert_eq!(current, 15.0);
        assert_eq!(dt, 5.0);
    }

    #[test]
    fn pressure_prediction_follows_the_optimal_delta() {
        let params = RunParameters::default();
        // Growth when the basin is quiet.
        let mut dt = 1.0;
        determine_next_pressure_time_step(&params, 5.0, &mut dt, 4, 0.0, false, None);
        assert_eq!(dt, params.time_step_increase_factor);

        // Shrink proportionally when the delta overshoots.
        let mut dt = 1.0;
        determine_next_pressure_time_step(&params, 5.0, &mut dt, 4, 2.0, false, None);
        assert!(dt < 1.0);
        assert!(dt >= params.time_step_decrease_factor - 1.0e-12);

        // Reset at a snapshot boundary.
        let mut dt = 0.123;
        determine_next_pressure_time_step(&params, 5.0, &mut dt, 4, 2.0, true, None);
        assert_eq!(dt, params.initial_time_step);
    }

    #[test]
    fn pressure_prediction_clamps_to_bounds() {
        let mut params = RunParameters::default();
        params.maximum_time_step = 2.0;
        let mut dt = 1.9;
        determine_next_pressure_time_step(&params, 5.0, &mut dt, 4, 0.0, false, None);
        assert_eq!(dt, 2.0);

        let mut dt = params.minimum_time_step * 1.01;
        determine_next_pressure_time_step(&params, 5.0, &mut dt, 4, 1.0e9, false, None);
        assert_eq!(dt, params.minimum_time_step);
    }

    #[test]
    fn coupled_prediction_takes_the_minimum_of_three() {
        let params = RunParameters::default();
        let mut dt = 1.0;
        // Temperature delta is the binding constraint here.
        determine_next_coupled_time_step(&params, 5.0, &mut dt, 0.0, 50.0, 0.0, false, None);
        let expected = 1.0 * (params.optimal_temperature_difference / 50.0)
            .max(params.time_step_decrease_factor);
        assert!((dt - expected.max(params.minimum_time_step)).abs() < 1.0e-12);
    }

    #[test]
    fn fixed_permafrost_step_overrides_everything() {
        let mut params = RunParameters::default();
        params.permafrost = Some(PermafrostParameters {
            fixed_time_step: 0.01,
            time_step: 0.05,
            switch_ages: vec![3.0],
        });
        let mut dt = 1.0;
        determine_next_pressure_time_step(&params, 5.0, &mut dt, 4, 0.0, false, None);
        assert_eq!(dt, 0.01);
    }

    #[test]
    fn permafrost_switch_clamps_the_step_near_the_switch_age() {
        let mut params = RunParameters::default();
        params.permafrost = Some(PermafrostParameters {
            fixed_time_step: 0.0,
            time_step: 0.05,
            switch_ages: vec![3.0],
        });
        let mut dt = 1.0;
        determine_next_pressure_time_step(&params, 3.02, &mut dt, 4, 0.0, false, None);
        assert_eq!(dt, 0.05);

        // Far from the switch the prediction is untouched.
        let mut dt = 1.0;
        determine_next_pressure_time_step(&params, 8.0, &mut dt, 4, 0.0, false, None);
        assert_eq!(dt, params.time_step_increase_factor);
    }

    #[test]
    fn alc_temperature_step_is_floored() {
        let mut params = RunParameters::default();
        params.is_alc = true;
        let mut dt = 0.002;
        determine_next_temperature_time_step(&params, 5.0, &mut dt, 1.0e9, 1.0e9, false);
        assert_eq!(dt, params.minimum_time_step);
    }
}
