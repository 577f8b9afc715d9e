//! Result persistence.
//!
//! The sweep controller hands every finished (or partial) [`SweepRecord`]
//! to a [`ResultSink`]. The bundled [`CsvSink`] writes one row per field
//! point with the configuration snapshot as a commented JSON preamble, so a
//! result file round-trips with full provenance:
//!
//! ```text
//! # {
//! #   "started_at": "2026-08-23T14:15:02Z",
//! #   ...
//! # }
//! current_a,field_oe,signal_v,sensitivity_v,range_flagged,timestamp
//! 0.518135,100,4.2e-5,0.0002,false,2026-08-23T14:15:09.120Z
//! ```

use async_trait::async_trait;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use crate::error::{SweepError, SweepResult};
use crate::sweep::SweepRecord;

/// Receives the finished series for persistence (and any downstream
/// plotting). The controller calls this exactly once per sweep, on every
/// exit path, so partial records from aborted sweeps are never lost.
#[async_trait]
pub trait ResultSink: Send {
    /// Persist `record`, returning where it was written.
    async fn persist(&mut self, record: &SweepRecord) -> SweepResult<PathBuf>;
}

/// CSV sink with metadata preamble and filename deduplication.
pub struct CsvSink {
    dir: PathBuf,
    basename: String,
}

impl CsvSink {
    /// Write `<basename>.csv` under `dir`, creating the directory as
    /// needed. An existing file is never overwritten; a `_(n)` counter is
    /// appended instead.
    pub fn new(dir: impl Into<PathBuf>, basename: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            basename: basename.into(),
        }
    }

    fn unique_path(&self) -> PathBuf {
        let mut path = self.dir.join(format!("{}.csv", self.basename));
        let mut counter = 1;
        while path.exists() {
            path = self.dir.join(format!("{}_({}).csv", self.basename, counter));
            counter += 1;
        }
        path
    }

    fn write_preamble(&self, file: &mut File, record: &SweepRecord) -> SweepResult<()> {
        let meta = serde_json::json!({
            "started_at": record.started_at,
            "cancelled": record.cancelled,
            "config": record.config,
        });
        let pretty = serde_json::to_string_pretty(&meta)
            .map_err(|e| SweepError::Storage(e.to_string()))?;
        for line in pretty.lines() {
            writeln!(file, "# {}", line)?;
        }
        Ok(())
    }

    fn write_rows(file: File, record: &SweepRecord) -> SweepResult<()> {
        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record([
                "current_a",
                "field_oe",
                "signal_v",
                "sensitivity_v",
                "range_flagged",
                "timestamp",
            ])
            .map_err(|e| SweepError::Storage(e.to_string()))?;
        for (point, reading) in record.points() {
            writer
                .write_record(&[
                    point.current_a.to_string(),
                    point.field_oe.to_string(),
                    reading.mean.to_string(),
                    reading.sensitivity_volts.to_string(),
                    reading.range_flagged.to_string(),
                    reading.taken_at.to_rfc3339(),
                ])
                .map_err(|e| SweepError::Storage(e.to_string()))?;
        }
        writer
            .flush()
            .map_err(|e| SweepError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ResultSink for CsvSink {
    async fn persist(&mut self, record: &SweepRecord) -> SweepResult<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.unique_path();
        let mut file = File::create(&path)?;
        self.write_preamble(&mut file, record)?;
        Self::write_rows(file, record)?;
        log::info!("Wrote {} point(s) to '{}'", record.len(), path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExperimentConfig;
    use crate::sweep::{FieldPoint, Reading};
    use chrono::Utc;

    fn sample_record(points: usize) -> SweepRecord {
        let mut record = SweepRecord::new(ExperimentConfig::default());
        for i in 0..points {
            let point = FieldPoint::from_field(i as f64 * 10.0, 193.0);
            let reading = Reading {
                mean: i as f64 * 1e-5,
                sensitivity_volts: 2e-4,
                range_flagged: false,
                taken_at: Utc::now(),
            };
            record.push(point, reading);
        }
        record
    }

    #[tokio::test]
    async fn test_csv_schema_and_preamble() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::new(dir.path(), "loop");
        let path = sink.persist(&sample_record(3)).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let header = content
            .lines()
            .find(|l| !l.starts_with('#'))
            .unwrap();
        assert_eq!(
            header,
            "current_a,field_oe,signal_v,sensitivity_v,range_flagged,timestamp"
        );
        assert!(content.starts_with("# {"));
        assert!(content.contains("\"cancelled\": false"));
        assert_eq!(content.lines().filter(|l| !l.starts_with('#')).count(), 4);
    }

    #[tokio::test]
    async fn test_existing_file_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let record = sample_record(1);

        let first = CsvSink::new(dir.path(), "loop")
            .persist(&record)
            .await
            .unwrap();
        let second = CsvSink::new(dir.path(), "loop")
            .persist(&record)
            .await
            .unwrap();

        assert!(first.ends_with("loop.csv"));
        assert!(second.ends_with("loop_(1).csv"));
        assert!(first.exists() && second.exists());
    }
}
