//! SRS SR830 lock-in amplifier driver.
//!
//! SCPI-style commands over VISA. The SR830 exposes its full-scale
//! sensitivity and time constant as discrete code tables; requested values
//! snap to the smallest setting that contains them.

use async_trait::async_trait;
use std::time::Duration;

use crate::config::SR830_SENSITIVITIES;
use crate::error::{SweepError, SweepResult};
use crate::instrument::visa::VisaAdapter;
use crate::instrument::LockIn;

/// SR830 time constants in seconds, codes 0..=19 (10 us .. 30 ks).
const TIME_CONSTANTS: [f64; 20] = [
    1e-5, 3e-5, 1e-4, 3e-4, 1e-3, 3e-3, 1e-2, 3e-2, 1e-1, 3e-1, 1.0, 3.0, 10.0, 30.0, 100.0,
    300.0, 1e3, 3e3, 1e4, 3e4,
];

fn sensitivity_code(volts: f64) -> usize {
    SR830_SENSITIVITIES
        .iter()
        .position(|&s| s >= volts * (1.0 - 1e-9))
        .unwrap_or(SR830_SENSITIVITIES.len() - 1)
}

fn time_constant_code(tc: Duration) -> usize {
    let secs = tc.as_secs_f64();
    TIME_CONSTANTS
        .iter()
        .position(|&t| t >= secs * (1.0 - 1e-9))
        .unwrap_or(TIME_CONSTANTS.len() - 1)
}

/// Driver for the SRS SR830.
pub struct SrsSr830 {
    adapter: VisaAdapter,
}

impl SrsSr830 {
    /// Open the lock-in at `resource`.
    pub fn open(resource: &str) -> SweepResult<Self> {
        let mut adapter = VisaAdapter::open(resource)?;
        adapter.send("*CLS")?;
        // Route responses to the GPIB interface.
        adapter.send("OUTX 1")?;
        log::info!("SR830 at '{}' ready", resource);
        Ok(Self { adapter })
    }
}

#[async_trait]
impl LockIn for SrsSr830 {
    async fn set_sensitivity(&mut self, volts: f64) -> SweepResult<()> {
        if volts <= 0.0 {
            return Err(SweepError::Instrument(format!(
                "sensitivity {} V must be positive",
                volts
            )));
        }
        self.adapter
            .send(&format!("SENS {}", sensitivity_code(volts)))
    }

    async fn sensitivity(&mut self) -> SweepResult<f64> {
        let reply = self.adapter.query("SENS?")?;
        let code: usize = reply.parse().map_err(|_| {
            SweepError::Instrument(format!("unparsable SENS? reply '{}'", reply))
        })?;
        SR830_SENSITIVITIES.get(code).copied().ok_or_else(|| {
            SweepError::Instrument(format!("SENS? returned out-of-range code {}", code))
        })
    }

    async fn set_time_constant(&mut self, tc: Duration) -> SweepResult<()> {
        self.adapter
            .send(&format!("OFLT {}", time_constant_code(tc)))
    }

    async fn read_magnitude(&mut self) -> SweepResult<f64> {
        // OUTP? 3 reads R, the demodulated magnitude.
        self.adapter.query_f64("OUTP? 3")
    }
}
