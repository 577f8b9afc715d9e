//! KEPCO BOP bipolar operational power supply driver.
//!
//! SCPI over VISA (typically GPIB). Opening the driver applies the safety
//! presets the rig depends on: current mode, compliance voltage limit, and
//! zero output, so a freshly connected supply can never surprise the coil.

use async_trait::async_trait;

use crate::error::{SweepError, SweepResult};
use crate::instrument::visa::VisaAdapter;
use crate::instrument::{OutputReadback, PowerSupply, SourceMode};

fn mode_token(mode: SourceMode) -> &'static str {
    match mode {
        SourceMode::Current => "CURR",
        SourceMode::Voltage => "VOLT",
    }
}

/// Driver for the KEPCO BOP series.
pub struct KepcoBop {
    adapter: VisaAdapter,
    mode: Option<SourceMode>,
    max_setpoint: f64,
}

impl KepcoBop {
    /// Nominal output limit of the BOP 50-8D in current mode, amperes.
    pub const DEFAULT_MAX_CURRENT_A: f64 = 8.0;

    /// Open the supply at `resource` and apply the safety presets:
    /// constant-current mode, `compliance_volts` voltage limit, output at
    /// zero.
    pub fn open(resource: &str, compliance_volts: f64) -> SweepResult<Self> {
        let mut adapter = VisaAdapter::open(resource)?;
        adapter.send("*CLS")?;
        adapter.send("FUNC:MODE CURR")?;
        adapter.send(&format!("VOLT {:.4}", compliance_volts))?;
        adapter.send("CURR 0")?;
        log::info!(
            "KEPCO BOP at '{}' in current mode, compliance {} V, output zeroed",
            resource,
            compliance_volts
        );
        Ok(Self {
            adapter,
            mode: Some(SourceMode::Current),
            max_setpoint: Self::DEFAULT_MAX_CURRENT_A,
        })
    }

    /// Override the setpoint limit (amperes in current mode, volts in
    /// voltage mode) for smaller supplies in the series.
    pub fn with_max_setpoint(mut self, limit: f64) -> Self {
        self.max_setpoint = limit;
        self
    }

    fn validate_setpoint(&self, value: f64) -> SweepResult<()> {
        if !value.is_finite() || value.abs() > self.max_setpoint {
            return Err(SweepError::Instrument(format!(
                "setpoint {} outside +/-{} supply limit",
                value, self.max_setpoint
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PowerSupply for KepcoBop {
    async fn set_output(&mut self, value: f64, mode: SourceMode) -> SweepResult<()> {
        self.validate_setpoint(value)?;
        if self.mode != Some(mode) {
            self.adapter
                .send(&format!("FUNC:MODE {}", mode_token(mode)))?;
            self.mode = Some(mode);
        }
        self.adapter
            .send(&format!("{} {:.6}", mode_token(mode), value))
    }

    async fn read_output(&mut self) -> SweepResult<OutputReadback> {
        let current_a = self.adapter.query_f64("MEAS:CURR?")?;
        let voltage_v = self.adapter.query_f64("MEAS:VOLT?")?;
        Ok(OutputReadback {
            current_a,
            voltage_v,
        })
    }

    async fn enable(&mut self, on: bool) -> SweepResult<()> {
        self.adapter
            .send(if on { "OUTP ON" } else { "OUTP OFF" })
    }
}
