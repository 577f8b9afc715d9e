//! Sweep data types: field points, averaged readings, and the run record.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

use crate::config::ExperimentConfig;

/// One requested step of the sweep.
///
/// The field value maps 1:1 to a supply-current setpoint through the fixed
/// electromagnet calibration; the controller commands `current_a` and
/// records both.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct FieldPoint {
    /// Target applied field in oersted.
    pub field_oe: f64,
    /// Derived supply setpoint in amperes.
    pub current_a: f64,
}

impl FieldPoint {
    /// Build a point from a field value and the Oe-per-ampere calibration.
    pub fn from_field(field_oe: f64, oe_per_amp: f64) -> Self {
        Self {
            field_oe,
            current_a: field_oe / oe_per_amp,
        }
    }
}

/// The result of one averaged acquisition at a field point.
///
/// Created once per point and immutable thereafter.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Reading {
    /// Arithmetic mean of the `read_reps` lock-in samples, in volts.
    pub mean: f64,
    /// Full-scale sensitivity in effect when the samples were taken.
    pub sensitivity_volts: f64,
    /// True when auto-ranging exhausted its adjustment budget and this
    /// reading was taken at a best-effort sensitivity.
    pub range_flagged: bool,
    /// Wall-clock timestamp of the acquisition.
    pub taken_at: DateTime<Utc>,
}

/// The ordered result series of one sweep invocation.
///
/// Owned exclusively by the running controller and handed to the caller
/// (and the result sink) when the sweep ends, normally or not. Point order
/// always matches the order of the input field array.
#[derive(Clone, Debug, Serialize)]
pub struct SweepRecord {
    /// When the sweep started.
    pub started_at: DateTime<Utc>,
    /// Snapshot of the configuration the sweep ran with.
    pub config: ExperimentConfig,
    /// Where the result sink persisted this record, once it has.
    pub save_path: Option<PathBuf>,
    /// True when the sweep finished early through cooperative cancellation.
    pub cancelled: bool,
    points: Vec<(FieldPoint, Reading)>,
}

impl SweepRecord {
    /// An empty record carrying a config snapshot.
    pub fn new(config: ExperimentConfig) -> Self {
        Self {
            started_at: Utc::now(),
            config,
            save_path: None,
            cancelled: false,
            points: Vec::new(),
        }
    }

    /// Append a completed point. Insertion order is preserved.
    pub fn push(&mut self, point: FieldPoint, reading: Reading) {
        self.points.push((point, reading));
    }

    /// The completed points, in input order.
    pub fn points(&self) -> &[(FieldPoint, Reading)] {
        &self.points
    }

    /// Number of completed points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when no point completed.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_to_current_calibration() {
        let point = FieldPoint::from_field(193.0, 193.0);
        assert!((point.current_a - 1.0).abs() < 1e-12);
        let negative = FieldPoint::from_field(-96.5, 193.0);
        assert!((negative.current_a + 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_record_preserves_insertion_order() {
        let mut record = SweepRecord::new(ExperimentConfig::default());
        for field in [10.0, -5.0, 2.5] {
            let point = FieldPoint::from_field(field, 193.0);
            let reading = Reading {
                mean: 0.0,
                sensitivity_volts: 2e-4,
                range_flagged: false,
                taken_at: Utc::now(),
            };
            record.push(point, reading);
        }
        let fields: Vec<f64> = record.points().iter().map(|(p, _)| p.field_oe).collect();
        assert_eq!(fields, vec![10.0, -5.0, 2.5]);
        assert_eq!(record.len(), 3);
        assert!(!record.cancelled);
    }
}
