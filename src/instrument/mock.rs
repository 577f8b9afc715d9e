//! Deterministic mock instruments.
//!
//! These stand in for the hardware in tests and `--dry-run` sweeps. Both
//! mocks expose a shareable trace handle so a test can inspect every
//! command issued after the controller has taken ownership of the port.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{SweepError, SweepResult};
use crate::instrument::{LockIn, OutputReadback, PowerSupply, SourceMode};
use crate::sweep::CancelToken;

// Nominal electromagnet coil resistance for the voltage readback, ohms.
const COIL_RESISTANCE: f64 = 4.0;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One command observed by the mock supply, in issue order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SupplyCommand {
    /// `set_output(value, mode)` was called.
    SetOutput {
        /// Commanded setpoint.
        value: f64,
        /// Regulation mode of the command.
        mode: SourceMode,
    },
    /// `enable(on)` was called.
    Enable(bool),
}

/// Shared view of the commands a [`MockSupply`] has received.
#[derive(Clone, Debug, Default)]
pub struct SupplyCommandLog(Arc<Mutex<Vec<SupplyCommand>>>);

impl SupplyCommandLog {
    /// Copy of the commands issued so far, in order.
    pub fn snapshot(&self) -> Vec<SupplyCommand> {
        locked(&self.0).clone()
    }

    fn push(&self, command: SupplyCommand) {
        locked(&self.0).push(command);
    }
}

/// Mock bipolar supply that records every command.
pub struct MockSupply {
    log: SupplyCommandLog,
    last_value: f64,
    sets_seen: u32,
    fail_on_set: Option<u32>,
}

impl Default for MockSupply {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSupply {
    /// A supply that accepts everything.
    pub fn new() -> Self {
        Self {
            log: SupplyCommandLog::default(),
            last_value: 0.0,
            sets_seen: 0,
            fail_on_set: None,
        }
    }

    /// A supply whose `n`-th `set_output` call (1-based) fails with an
    /// instrument error. Later calls succeed again, so the safety zeroing
    /// sequence still goes through.
    pub fn failing_on_set(n: u32) -> Self {
        Self {
            fail_on_set: Some(n),
            ..Self::new()
        }
    }

    /// Handle for inspecting issued commands after the controller has
    /// taken ownership of this port.
    pub fn command_log(&self) -> SupplyCommandLog {
        self.log.clone()
    }
}

#[async_trait]
impl PowerSupply for MockSupply {
    async fn set_output(&mut self, value: f64, mode: SourceMode) -> SweepResult<()> {
        self.sets_seen += 1;
        if self.fail_on_set == Some(self.sets_seen) {
            return Err(SweepError::Instrument(format!(
                "mock supply timed out on set_output #{}",
                self.sets_seen
            )));
        }
        self.log.push(SupplyCommand::SetOutput { value, mode });
        self.last_value = value;
        Ok(())
    }

    async fn read_output(&mut self) -> SweepResult<OutputReadback> {
        Ok(OutputReadback {
            current_a: self.last_value,
            voltage_v: self.last_value * COIL_RESISTANCE,
        })
    }

    async fn enable(&mut self, on: bool) -> SweepResult<()> {
        self.log.push(SupplyCommand::Enable(on));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TraceInner {
    sensitivity_sets: Vec<f64>,
    reads: u32,
}

/// Shared view of what a [`MockLockIn`] has been asked to do.
#[derive(Clone, Debug, Default)]
pub struct LockInTrace(Arc<Mutex<TraceInner>>);

impl LockInTrace {
    /// Every sensitivity value set so far, in order.
    pub fn sensitivity_sets(&self) -> Vec<f64> {
        locked(&self.0).sensitivity_sets.clone()
    }

    /// Number of magnitude reads served.
    pub fn read_count(&self) -> u32 {
        locked(&self.0).reads
    }
}

/// Mock lock-in amplifier with a scriptable sample stream.
///
/// `read_magnitude` pops scripted samples first and falls back to a
/// constant level once the script is exhausted, so tests can pin exact
/// values for the ranging check and the averaged reads.
pub struct MockLockIn {
    level: f64,
    samples: VecDeque<f64>,
    sensitivity: f64,
    time_constant: Duration,
    trace: LockInTrace,
    cancel_after: Option<(u32, CancelToken)>,
}

impl MockLockIn {
    /// A lock-in that always reads `level` volts.
    pub fn with_level(level: f64) -> Self {
        Self {
            level,
            samples: VecDeque::new(),
            sensitivity: 2e-4,
            time_constant: Duration::from_millis(300),
            trace: LockInTrace::default(),
            cancel_after: None,
        }
    }

    /// Queue scripted samples served before the constant level.
    pub fn push_samples(&mut self, samples: impl IntoIterator<Item = f64>) {
        self.samples.extend(samples);
    }

    /// Trip `token` once `n` magnitude reads have been served. Used to
    /// cancel a sweep at a deterministic spot.
    pub fn cancel_after_reads(mut self, n: u32, token: CancelToken) -> Self {
        self.cancel_after = Some((n, token));
        self
    }

    /// Handle for inspecting issued commands after the controller has
    /// taken ownership of this port.
    pub fn trace(&self) -> LockInTrace {
        self.trace.clone()
    }
}

#[async_trait]
impl LockIn for MockLockIn {
    async fn set_sensitivity(&mut self, volts: f64) -> SweepResult<()> {
        self.sensitivity = volts;
        locked(&self.trace.0).sensitivity_sets.push(volts);
        Ok(())
    }

    async fn sensitivity(&mut self) -> SweepResult<f64> {
        Ok(self.sensitivity)
    }

    async fn set_time_constant(&mut self, tc: Duration) -> SweepResult<()> {
        self.time_constant = tc;
        Ok(())
    }

    async fn read_magnitude(&mut self) -> SweepResult<f64> {
        let value = self.samples.pop_front().unwrap_or(self.level);
        let reads = {
            let mut inner = locked(&self.trace.0);
            inner.reads += 1;
            inner.reads
        };
        if let Some((after, token)) = &self.cancel_after {
            if reads >= *after {
                token.cancel();
            }
        }
        Ok(value)
    }
}
