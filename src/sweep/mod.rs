//! Sweep controller: the sequencing core of the experiment.
//!
//! [`SweepController`] owns the two instrument ports for the duration of a
//! run and drives each field point through a fixed per-point sequence:
//!
//! ```text
//! Idle -> RampingToPoint -> Settling -> Ranging -> Reading -> Logging
//!            (next point | Finishing) -> Zeroing -> Idle
//! ```
//!
//! with `Aborted` reachable from any non-idle state on an unrecoverable
//! instrument error. Whatever path ends the loop — completion, error, or
//! cooperative cancellation — the controller always ramps the supply back
//! to zero and disables its output before returning. An experimenter must
//! never be left with live current in the electromagnet coil.
//!
//! The whole sweep runs on one logical task: both instruments are
//! single-session serial-bus devices, so commands are fully serialized and
//! every wait is an awaited sleep on the control task.

use chrono::Utc;
use log::{debug, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::ExperimentConfig;
use crate::error::{SweepError, SweepResult};
use crate::instrument::{LockIn, PowerSupply};
use crate::logger::RunLog;
use crate::storage::ResultSink;

pub mod record;

pub use record::{FieldPoint, Reading, SweepRecord};

/// Shared cooperative-cancellation flag.
///
/// Cancellation is checked at the top of each per-point iteration and
/// before each ranging sub-step; once observed, the controller proceeds
/// directly to finishing/zeroing rather than stopping abruptly.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Controller lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepState {
    /// No sweep in progress; supply at zero.
    Idle,
    /// Commanding the current source to a field point's setpoint.
    RampingToPoint,
    /// Waiting for the field and any ringing to stabilize.
    Settling,
    /// Adjusting lock-in sensitivity toward the acceptance band.
    Ranging,
    /// Taking the averaged acquisition.
    Reading,
    /// Appending the point to the run log.
    Logging,
    /// Ramping the supply back to zero.
    Zeroing,
    /// An unrecoverable instrument error ended the sweep.
    Aborted,
}

/// Per-sweep overrides of the configured acquisition defaults.
///
/// `None` falls back to the corresponding [`ExperimentConfig`] field.
#[derive(Clone, Debug, Default)]
pub struct SweepOptions {
    /// Samples averaged into each reading.
    pub read_reps: Option<u32>,
    /// Settle delay after commanding a field point.
    pub read_delay: Option<Duration>,
    /// Delay between samples of one averaged reading.
    pub rep_delay: Option<Duration>,
    /// Wait after each sensitivity change.
    pub sensitivity_settle: Option<Duration>,
    /// Sensitivity to start the sweep at, in volts.
    pub starting_sensitivity: Option<f64>,
}

/// A sweep that ended on an instrument error.
///
/// The points collected up to the failure are preserved so no data is
/// silently lost; the supply has already been returned to zero by the time
/// this value reaches the caller.
#[derive(Debug)]
pub struct SweepAborted {
    /// The partial record, in input order.
    pub record: SweepRecord,
    /// Why the sweep could not continue.
    pub source: SweepError,
}

impl fmt::Display for SweepAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sweep aborted after {} completed point(s): {}",
            self.record.len(),
            self.source
        )
    }
}

impl std::error::Error for SweepAborted {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Evenly spaced values from `start` to `stop` inclusive.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => (0..n)
            .map(|i| start + (stop - start) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

/// Mirror a field branch into a full hysteresis loop: the branch followed
/// by its negation, optionally closed by repeating the first point.
pub fn hysteresis_loop(branch: &[f64], close_loop: bool) -> Vec<f64> {
    let mut fields: Vec<f64> = branch.to_vec();
    fields.extend(branch.iter().map(|f| -f));
    if close_loop {
        if let Some(&first) = fields.first() {
            fields.push(first);
        }
    }
    fields
}

/// The experiment core: sequences field points, manages settle and read
/// timing, auto-ranges the lock-in, aggregates repeated reads, and performs
/// the safety ramp-down.
pub struct SweepController<P: PowerSupply, L: LockIn> {
    config: ExperimentConfig,
    supply: P,
    lockin: L,
    run_log: RunLog,
    sink: Option<Box<dyn ResultSink>>,
    cancel: CancelToken,
    state: SweepState,
}

impl<P: PowerSupply, L: LockIn> SweepController<P, L> {
    /// Build a controller with exclusive ownership of both instrument
    /// ports. Fails on invalid configuration.
    pub fn new(config: ExperimentConfig, supply: P, lockin: L) -> SweepResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            supply,
            lockin,
            run_log: RunLog::disabled(),
            sink: None,
            cancel: CancelToken::new(),
            state: SweepState::Idle,
        })
    }

    /// Attach a run-scoped event log.
    pub fn with_run_log(mut self, run_log: RunLog) -> Self {
        self.run_log = run_log;
        self
    }

    /// Attach a result sink that receives the record when the sweep ends.
    pub fn with_sink(mut self, sink: Box<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use an externally created cancellation token.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// A handle for requesting cooperative cancellation of a running sweep.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SweepState {
        self.state
    }

    /// Run one sweep over `fields_oe`, in order.
    ///
    /// On success the full record is returned; on an instrument error the
    /// partial record travels inside [`SweepAborted`]. Cancellation is a
    /// clean early finish: `Ok` with the record's `cancelled` flag set. In
    /// every case the supply has been commanded to zero and disabled before
    /// this returns, and the record has been offered to the attached sink.
    pub async fn sweep(
        &mut self,
        fields_oe: &[f64],
        options: SweepOptions,
    ) -> Result<SweepRecord, SweepAborted> {
        let mut record = SweepRecord::new(self.config.clone());
        if fields_oe.is_empty() {
            self.run_log.log("EMPTY_SWEEP", &[]);
            return Ok(record);
        }

        let outcome = self.run_points(fields_oe, &options, &mut record).await;
        let cancelled = matches!(outcome, Err(SweepError::Cancelled));
        if cancelled {
            record.cancelled = true;
            info!("Sweep cancelled after {} point(s)", record.len());
            self.run_log
                .log("CANCELLED", &[("points", record.len().to_string())]);
        } else if let Err(e) = &outcome {
            self.state = SweepState::Aborted;
            warn!("Sweep aborted after {} point(s): {}", record.len(), e);
            self.run_log.log("ABORT", &[("error", e.to_string())]);
        }

        // Safety contract: the supply goes back to zero on every exit path.
        self.state = SweepState::Zeroing;
        let zero_result = self.ramp_to_zero().await;
        self.state = SweepState::Idle;

        // Hand the record (partial or not) to the sink so nothing is lost.
        if let Some(sink) = self.sink.as_mut() {
            match sink.persist(&record).await {
                Ok(path) => {
                    info!("Sweep results saved to '{}'", path.display());
                    self.run_log
                        .log("SAVED", &[("path", path.display().to_string())]);
                    record.save_path = Some(path);
                }
                Err(e) => {
                    warn!("Result sink failed: {}", e);
                    self.run_log.log("SINK_ERROR", &[("error", e.to_string())]);
                }
            }
        }

        match outcome {
            Err(source) if !cancelled => Err(SweepAborted { record, source }),
            _ => match zero_result {
                Ok(()) => Ok(record),
                Err(source) => Err(SweepAborted { record, source }),
            },
        }
    }

    /// The per-point loop. Returns `Err(Cancelled)` when the token trips.
    async fn run_points(
        &mut self,
        fields_oe: &[f64],
        options: &SweepOptions,
        record: &mut SweepRecord,
    ) -> SweepResult<()> {
        let read_reps = options.read_reps.unwrap_or(self.config.read_reps).max(1);
        let read_delay = options.read_delay.unwrap_or(self.config.read_delay);
        let rep_delay = options.rep_delay.unwrap_or(self.config.rep_delay);
        let sen_settle = options
            .sensitivity_settle
            .unwrap_or(self.config.sensitivity_settle);
        let start_sen = options
            .starting_sensitivity
            .unwrap_or(self.config.sensitivity_volts);

        let mut rung = self.config.range.rung_for(start_sen);
        self.lockin
            .set_time_constant(self.config.time_constant)
            .await?;
        self.lockin
            .set_sensitivity(self.config.range.ladder[rung])
            .await?;
        self.supply.enable(true).await?;
        info!(
            "Sweep started: {} point(s), {} mode, sensitivity {:.3e} V",
            fields_oe.len(),
            self.config.source_mode,
            self.config.range.ladder[rung]
        );
        self.run_log.log(
            "SWEEP_START",
            &[
                ("points", fields_oe.len().to_string()),
                ("mode", self.config.source_mode.to_string()),
                ("sensitivity_v", format!("{:e}", self.config.range.ladder[rung])),
            ],
        );

        for (index, &field_oe) in fields_oe.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(SweepError::Cancelled);
            }
            let point = FieldPoint::from_field(field_oe, self.config.oe_per_amp);

            self.state = SweepState::RampingToPoint;
            self.supply
                .set_output(point.current_a, self.config.source_mode)
                .await?;
            if index == 0 {
                // The supply is slow to reach the first setpoint from zero.
                sleep(self.config.zero_departure_delay).await;
            }

            self.state = SweepState::Settling;
            sleep(read_delay).await;

            self.state = SweepState::Ranging;
            let (new_rung, flagged) = self.auto_range(rung, sen_settle).await?;
            rung = new_rung;

            self.state = SweepState::Reading;
            let reading = self
                .read_averaged(read_reps, rep_delay, rung, flagged)
                .await?;

            self.state = SweepState::Logging;
            debug!(
                "Point {}: {:.4} Oe -> {:.6e} V at {:.1e} V full scale",
                index, point.field_oe, reading.mean, reading.sensitivity_volts
            );
            self.run_log.log(
                "POINT",
                &[
                    ("index", index.to_string()),
                    ("field_oe", point.field_oe.to_string()),
                    ("current_a", point.current_a.to_string()),
                    ("signal_v", format!("{:e}", reading.mean)),
                    ("sensitivity_v", format!("{:e}", reading.sensitivity_volts)),
                    ("range_flagged", reading.range_flagged.to_string()),
                ],
            );
            record.push(point, reading);
        }

        self.run_log
            .log("SWEEP_DONE", &[("points", record.len().to_string())]);
        Ok(())
    }

    /// Walk the sensitivity ladder until the present reading falls inside
    /// the acceptance band, one rung at a time.
    ///
    /// Returns the final rung and whether the adjustment budget ran out
    /// before the band was reached (in which case the reading proceeds at
    /// the best-effort sensitivity, flagged).
    async fn auto_range(&mut self, mut rung: usize, settle: Duration) -> SweepResult<(usize, bool)> {
        for _ in 0..self.config.range.max_adjustments {
            if self.cancel.is_cancelled() {
                return Err(SweepError::Cancelled);
            }
            let magnitude = self.lockin.read_magnitude().await?.abs();
            let scale = self.config.range.ladder[rung];

            if magnitude > scale * self.config.range.high_fraction {
                if rung + 1 >= self.config.range.ladder.len() {
                    warn!(
                        "Signal {:.3e} V over range at coarsest sensitivity {:.3e} V",
                        magnitude, scale
                    );
                    self.run_log
                        .log("RANGE_EXHAUSTED", &[("signal_v", format!("{:e}", magnitude))]);
                    return Ok((rung, true));
                }
                rung += 1;
                self.lockin
                    .set_sensitivity(self.config.range.ladder[rung])
                    .await?;
                self.run_log.log(
                    "RANGE_UP",
                    &[("sensitivity_v", format!("{:e}", self.config.range.ladder[rung]))],
                );
                sleep(settle).await;
            } else if magnitude < scale * self.config.range.low_fraction && rung > 0 {
                rung -= 1;
                self.lockin
                    .set_sensitivity(self.config.range.ladder[rung])
                    .await?;
                self.run_log.log(
                    "RANGE_DOWN",
                    &[("sensitivity_v", format!("{:e}", self.config.range.ladder[rung]))],
                );
                sleep(settle).await;
            } else {
                return Ok((rung, false));
            }
        }

        warn!(
            "Auto-range budget ({}) exhausted, keeping {:.3e} V",
            self.config.range.max_adjustments, self.config.range.ladder[rung]
        );
        self.run_log.log(
            "RANGE_EXHAUSTED",
            &[("sensitivity_v", format!("{:e}", self.config.range.ladder[rung]))],
        );
        Ok((rung, true))
    }

    /// Take `reps` consecutive samples and average them into one reading.
    /// No outlier rejection: settle and ranging are assumed to have
    /// produced a stable signal already.
    async fn read_averaged(
        &mut self,
        reps: u32,
        rep_delay: Duration,
        rung: usize,
        range_flagged: bool,
    ) -> SweepResult<Reading> {
        let mut sum = 0.0;
        for rep in 0..reps {
            sum += self.lockin.read_magnitude().await?;
            if rep + 1 < reps {
                sleep(rep_delay).await;
            }
        }
        Ok(Reading {
            mean: sum / f64::from(reps),
            sensitivity_volts: self.config.range.ladder[rung],
            range_flagged,
            taken_at: Utc::now(),
        })
    }

    /// Ramp the supply to zero, wait the zero-return delay, and disable the
    /// output. Attempts the disable even when the zero command fails.
    async fn ramp_to_zero(&mut self) -> SweepResult<()> {
        let set_result = self
            .supply
            .set_output(0.0, self.config.source_mode)
            .await;
        if set_result.is_ok() {
            sleep(self.config.zero_return_delay).await;
        }
        let enable_result = self.supply.enable(false).await;

        match set_result.and(enable_result) {
            Ok(()) => {
                self.run_log.log("ZEROED", &[]);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to return supply to zero: {}", e);
                self.run_log.log("ZERO_FAILED", &[("error", e.to_string())]);
                Err(e)
            }
        }
    }
}
