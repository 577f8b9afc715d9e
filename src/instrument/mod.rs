//! Instrument port traits.
//!
//! The sweep controller talks to exactly two instruments, each behind a
//! narrow async trait: a bipolar current source ([`PowerSupply`]) and a
//! lock-in amplifier ([`LockIn`]). Both instruments are single-session
//! serial-bus devices, so the traits assume exclusive ownership: the
//! controller holds the only handle for the duration of a run and never
//! interleaves commands.
//!
//! Raw command encoding (SCPI strings, VISA sessions) lives in the driver
//! modules behind these traits; the controller never sees it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::SweepResult;

pub mod mock;

#[cfg(feature = "instrument_visa")]
pub mod kepco_bop;
#[cfg(feature = "instrument_visa")]
pub mod srs_sr830;
#[cfg(feature = "instrument_visa")]
pub mod visa;

/// Which physical quantity the supply regulates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    /// Constant-current operation (the electromagnet default).
    #[default]
    Current,
    /// Constant-voltage operation.
    Voltage,
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceMode::Current => write!(f, "current"),
            SourceMode::Voltage => write!(f, "voltage"),
        }
    }
}

/// Readback of the supply's actual output.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutputReadback {
    /// Measured output current in amperes.
    pub current_a: f64,
    /// Measured output voltage in volts.
    pub voltage_v: f64,
}

/// Bipolar power supply driving the electromagnet coil.
#[async_trait]
pub trait PowerSupply: Send {
    /// Command the output setpoint. `mode` selects whether `value` is
    /// interpreted as amperes or volts.
    async fn set_output(&mut self, value: f64, mode: SourceMode) -> SweepResult<()>;

    /// Read back the actual output current and voltage.
    async fn read_output(&mut self) -> SweepResult<OutputReadback>;

    /// Enable or disable the output stage.
    async fn enable(&mut self, on: bool) -> SweepResult<()>;
}

/// Lock-in amplifier reading the demodulated optical signal.
#[async_trait]
pub trait LockIn: Send {
    /// Set the full-scale sensitivity in volts. Drivers snap the request to
    /// the instrument's nearest discrete range.
    async fn set_sensitivity(&mut self, volts: f64) -> SweepResult<()>;

    /// Query the sensitivity currently in effect, in volts.
    async fn sensitivity(&mut self) -> SweepResult<f64>;

    /// Set the demodulation filter time constant.
    async fn set_time_constant(&mut self, tc: Duration) -> SweepResult<()>;

    /// Read the demodulated signal magnitude (R) in volts.
    async fn read_magnitude(&mut self) -> SweepResult<f64>;
}
