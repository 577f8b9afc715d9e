//! Experiment configuration.
//!
//! Configuration is loaded with [Figment](figment) from a TOML file plus
//! `MOKE_`-prefixed environment variable overrides, e.g.
//!
//! ```text
//! MOKE_READ_REPS=5
//! MOKE_LOG_LEVEL=debug
//! ```
//!
//! Every field has a serde default, so an empty file (or no file at all)
//! yields the laboratory defaults. The configuration is long-lived: it is
//! mutated only between sweeps and snapshotted into each
//! [`SweepRecord`](crate::sweep::SweepRecord) at sweep start, so a run is
//! never affected by a concurrent edit.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SweepError, SweepResult};
use crate::instrument::SourceMode;

/// Full-scale sensitivity ladder of the SRS SR830, 2 nV to 1 V.
///
/// Used as the default auto-range ladder; other lock-in models supply their
/// own table through `[range] ladder` in the configuration file.
pub const SR830_SENSITIVITIES: [f64; 27] = [
    2e-9, 5e-9, 1e-8, 2e-8, 5e-8, 1e-7, 2e-7, 5e-7, 1e-6, 2e-6, 5e-6, 1e-5, 2e-5, 5e-5, 1e-4,
    2e-4, 5e-4, 1e-3, 2e-3, 5e-3, 1e-2, 2e-2, 5e-2, 1e-1, 2e-1, 5e-1, 1.0,
];

/// Auto-ranging policy: a discrete sensitivity ladder plus a two-threshold
/// acceptance band.
///
/// A sampled magnitude `m` against sensitivity `s` is accepted when
/// `low_fraction * s <= m <= high_fraction * s`. The band (rather than a
/// single cutoff) prevents flapping between adjacent rungs when the signal
/// sits near a boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangePolicy {
    /// Ascending ladder of full-scale sensitivity values in volts.
    #[serde(default = "default_ladder")]
    pub ladder: Vec<f64>,
    /// Overload threshold: step coarser when `m > s * high_fraction`.
    #[serde(default = "default_high_fraction")]
    pub high_fraction: f64,
    /// Underuse threshold: step finer when `m < s * low_fraction`.
    #[serde(default = "default_low_fraction")]
    pub low_fraction: f64,
    /// Maximum number of rung adjustments per field point before the
    /// reading is recorded flagged with the best-effort sensitivity.
    #[serde(default = "default_max_adjustments")]
    pub max_adjustments: u32,
}

impl Default for RangePolicy {
    fn default() -> Self {
        Self {
            ladder: default_ladder(),
            high_fraction: default_high_fraction(),
            low_fraction: default_low_fraction(),
            max_adjustments: default_max_adjustments(),
        }
    }
}

impl RangePolicy {
    /// Index of the smallest rung that can contain `volts` full-scale,
    /// falling back to the coarsest rung for oversized requests.
    pub fn rung_for(&self, volts: f64) -> usize {
        self.ladder
            .iter()
            .position(|&s| s >= volts * (1.0 - 1e-9))
            .unwrap_or(self.ladder.len().saturating_sub(1))
    }

    fn validate(&self) -> SweepResult<()> {
        if self.ladder.is_empty() {
            return Err(SweepError::Config("sensitivity ladder is empty".into()));
        }
        if !self.ladder.windows(2).all(|w| w[0] < w[1]) {
            return Err(SweepError::Config(
                "sensitivity ladder must be strictly ascending".into(),
            ));
        }
        if !(0.0 < self.low_fraction && self.low_fraction < self.high_fraction) {
            return Err(SweepError::Config(
                "range thresholds must satisfy 0 < low_fraction < high_fraction".into(),
            ));
        }
        if self.high_fraction > 1.0 {
            return Err(SweepError::Config(
                "high_fraction above 1.0 would allow overloaded readings".into(),
            ));
        }
        Ok(())
    }
}

/// Long-lived experiment defaults.
///
/// Per-sweep overrides for the acquisition parameters are carried by
/// `crate::sweep::SweepOptions`; everything here is the fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Constant-current vs constant-voltage supply operation.
    #[serde(default)]
    pub source_mode: SourceMode,

    /// Compliance limit for the non-regulated quantity (volts in current
    /// mode). Applied by the supply driver at connect time.
    #[serde(default = "default_compliance_volts")]
    pub compliance_volts: f64,

    /// Lock-in demodulation filter time constant.
    #[serde(default = "default_time_constant", with = "humantime_serde")]
    pub time_constant: Duration,

    /// Default starting sensitivity in volts.
    #[serde(default = "default_sensitivity")]
    pub sensitivity_volts: f64,

    /// Wait after a sensitivity change before trusting a reading.
    #[serde(default = "default_sensitivity_settle", with = "humantime_serde")]
    pub sensitivity_settle: Duration,

    /// Number of lock-in samples averaged into one reading.
    #[serde(default = "default_read_reps")]
    pub read_reps: u32,

    /// Delay between consecutive samples of one averaged reading.
    #[serde(default = "default_rep_delay", with = "humantime_serde")]
    pub rep_delay: Duration,

    /// Settle delay after commanding a new field point.
    #[serde(default = "default_read_delay", with = "humantime_serde")]
    pub read_delay: Duration,

    /// Extra settle after the first jump away from zero output, where the
    /// supply is slow to reach the setpoint.
    #[serde(default = "default_zero_departure_delay", with = "humantime_serde")]
    pub zero_departure_delay: Duration,

    /// Wait after commanding zero output before disabling the supply.
    #[serde(default = "default_zero_return_delay", with = "humantime_serde")]
    pub zero_return_delay: Duration,

    /// Electromagnet calibration: field in oersted per ampere of coil
    /// current. The controller applies this 1:1 and does not interpret it.
    #[serde(default = "default_oe_per_amp")]
    pub oe_per_amp: f64,

    /// Directory for run-scoped log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Default output directory for sweep results.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Process log filter (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Auto-ranging policy.
    #[serde(default)]
    pub range: RangePolicy,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            source_mode: SourceMode::default(),
            compliance_volts: default_compliance_volts(),
            time_constant: default_time_constant(),
            sensitivity_volts: default_sensitivity(),
            sensitivity_settle: default_sensitivity_settle(),
            read_reps: default_read_reps(),
            rep_delay: default_rep_delay(),
            read_delay: default_read_delay(),
            zero_departure_delay: default_zero_departure_delay(),
            zero_return_delay: default_zero_return_delay(),
            oe_per_amp: default_oe_per_amp(),
            log_dir: default_log_dir(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            range: RangePolicy::default(),
        }
    }
}

impl ExperimentConfig {
    /// Load configuration from `path` (or `config/default.toml` when
    /// `None`), then apply `MOKE_`-prefixed environment overrides.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load(path: Option<&Path>) -> SweepResult<Self> {
        let file = path.unwrap_or_else(|| Path::new("config/default.toml"));
        let config: Self = Figment::new()
            .merge(Toml::file(file))
            .merge(Env::prefixed("MOKE_"))
            .extract()
            .map_err(|e| SweepError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic validation beyond what parsing can catch.
    pub fn validate(&self) -> SweepResult<()> {
        if self.read_reps == 0 {
            return Err(SweepError::Config("read_reps must be at least 1".into()));
        }
        if self.oe_per_amp == 0.0 || !self.oe_per_amp.is_finite() {
            return Err(SweepError::Config(
                "oe_per_amp calibration must be finite and nonzero".into(),
            ));
        }
        if self.sensitivity_volts <= 0.0 {
            return Err(SweepError::Config(
                "sensitivity_volts must be positive".into(),
            ));
        }
        if self.compliance_volts <= 0.0 {
            return Err(SweepError::Config(
                "compliance_volts must be positive".into(),
            ));
        }
        self.range.validate()
    }
}

fn default_ladder() -> Vec<f64> {
    SR830_SENSITIVITIES.to_vec()
}

fn default_high_fraction() -> f64 {
    0.8
}

fn default_low_fraction() -> f64 {
    0.1
}

fn default_max_adjustments() -> u32 {
    5
}

fn default_compliance_volts() -> f64 {
    20.0
}

fn default_time_constant() -> Duration {
    Duration::from_millis(300)
}

fn default_sensitivity() -> f64 {
    2e-4
}

fn default_sensitivity_settle() -> Duration {
    Duration::from_secs(3)
}

fn default_read_reps() -> u32 {
    1
}

fn default_rep_delay() -> Duration {
    Duration::ZERO
}

fn default_read_delay() -> Duration {
    Duration::from_millis(20)
}

fn default_zero_departure_delay() -> Duration {
    Duration::from_secs(4)
}

fn default_zero_return_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_oe_per_amp() -> f64 {
    193.0
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("experiment_logs")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ExperimentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.read_reps, 1);
        assert_eq!(config.oe_per_amp, 193.0);
        assert_eq!(config.range.ladder.len(), 27);
    }

    #[test]
    fn test_rung_snapping() {
        let policy = RangePolicy::default();
        // Exact rung value maps to itself.
        assert_eq!(policy.ladder[policy.rung_for(2e-4)], 2e-4);
        // Between rungs snaps up to the next full-scale that fits.
        assert_eq!(policy.ladder[policy.rung_for(3e-4)], 5e-4);
        // Oversized requests clamp to the coarsest rung.
        assert_eq!(policy.ladder[policy.rung_for(10.0)], 1.0);
        // Undersized requests take the finest rung.
        assert_eq!(policy.ladder[policy.rung_for(1e-12)], 2e-9);
    }

    #[test]
    fn test_inverted_band_rejected() {
        let mut config = ExperimentConfig::default();
        config.range.low_fraction = 0.9;
        config.range.high_fraction = 0.5;
        assert!(matches!(config.validate(), Err(SweepError::Config(_))));
    }

    #[test]
    fn test_unsorted_ladder_rejected() {
        let mut config = ExperimentConfig::default();
        config.range.ladder = vec![1e-3, 1e-4, 1e-2];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_read_reps_rejected() {
        let mut config = ExperimentConfig::default();
        config.read_reps = 0;
        assert!(config.validate().is_err());
    }
}
