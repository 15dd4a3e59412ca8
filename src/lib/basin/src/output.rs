//! Output seams: the line-oriented text sink that carries user-visible
//! `MeSsAgE`-tagged lines, and the property output facility the driver
//! hands computed maps and volumes to. Both are traits so the surrounding
//! program chooses the medium; the in-memory implementations serve tests
//! and library embedding.

use ndarray::{Array2, Array3};

use crate::grid;

/// A line-oriented text sink. User-visible warnings and errors are printed
/// on rank 0 only.
pub trait LineSink {
    fn line(&mut self, text: &str);
}

/// Prints to standard output on rank 0, swallows elsewhere.
#[derive(Default)]
pub struct ConsoleSink;

impl LineSink for ConsoleSink {
    fn line(&mut self, text: &str) {
        if grid::rank() == 0 {
            println!("{text}");
        }
    }
}

/// Collects lines; used by tests to assert on the message protocol.
#[derive(Default)]
pub struct BufferSink {
    pub lines: Vec<String>,
}

impl LineSink for BufferSink {
    fn line(&mut self, text: &str) {
        self.lines.push(text.to_string());
    }
}

/// A property map or volume saved at a snapshot.
#[derive(Clone, Debug)]
pub struct SavedMap {
    pub snapshot_age: f64,
    pub layer: String,
    pub property: String,
    pub values: Array2<f64>,
}

#[derive(Clone, Debug)]
pub struct SavedVolume {
    pub snapshot_age: f64,
    pub layer: String,
    pub property: String,
    pub values: Array3<f64>,
}

/// The project's output facility, keyed by property name. The HDF5 writers
/// of the production system sit behind this seam; the core never touches
/// files.
pub trait PropertyOutput {
    fn save_map(&mut self, snapshot_age: f64, layer: &str, property: &str, values: &Array2<f64>);
    fn save_volume(&mut self, snapshot_age: f64, layer: &str, property: &str, values: &Array3<f64>);
    /// Discard everything saved at minor snapshots in the given set; the
    /// geometric loop re-runs the march with new time steps and the old
    /// files would carry stale names.
    fn delete_minor_snapshots(&mut self, ages: &[f64]);
    /// Discard every saved property; the geometric loop restarts the whole
    /// march and everything written so far is superseded.
    fn delete_snapshot_properties(&mut self);
}

/// In-memory output store.
#[derive(Default)]
pub struct InMemoryOutput {
    pub maps: Vec<SavedMap>,
    pub volumes: Vec<SavedVolume>,
}

impl PropertyOutput for InMemoryOutput {
    fn save_map(&mut self, snapshot_age: f64, layer: &str, property: &str, values: &Array2<f64>) {
        self.maps.push(SavedMap {
            snapshot_age,
            layer: layer.to_string(),
            property: property.to_string(),
            values: values.clone(),
        });
    }

    fn save_volume(&mut self, snapshot_age: f64, layer: &str, property: &str, values: &Array3<f64>) {
        self.volumes.push(SavedVolume {
            snapshot_age,
            layer: layer.to_string(),
            property: property.to_string(),
            values: values.clone(),
        });
    }

    fn delete_minor_snapshots(&mut self, ages: &[f64]) {
        let is_minor = |age: f64| ages.iter().any(|&a| crate::ages_equal(age, a));
        self.maps.retain(|m| !is_minor(m.snapshot_age));
        self.volumes.retain(|v| !is_minor(v.snapshot_age));
    }

    fn delete_snapshot_properties(&mut self) {
        self.maps.clear();
        self.volumes.clear();
    }
}

impl InMemoryOutput {
    pub fn map(&self, snapshot_age: f64, layer: &str, property: &str) -> Option<&SavedMap> {
        self.maps.iter().find(|m| {
            crate::ages_equal(m.snapshot_age, snapshot_age) && m.layer == layer && m.property == property
        })
    }
}
