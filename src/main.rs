//! Command-line entry point: run one MOKE hysteresis loop.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;

use moke_daq::config::ExperimentConfig;
use moke_daq::instrument::mock::{MockLockIn, MockSupply};
use moke_daq::instrument::{LockIn, PowerSupply};
use moke_daq::logger::RunLog;
use moke_daq::storage::CsvSink;
use moke_daq::sweep::{hysteresis_loop, linspace, SweepController, SweepOptions};

#[derive(Parser, Debug)]
#[command(name = "moke_daq", about = "MOKE hysteresis sweep automation")]
struct Cli {
    /// Path to the experiment configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Peak applied field of the loop, in oersted.
    #[arg(long, default_value_t = 200.0)]
    max_field: f64,

    /// Number of field points per branch of the loop.
    #[arg(long, default_value_t = 41)]
    points: usize,

    /// Repeat the first point at the end to close the loop.
    #[arg(long)]
    close_loop: bool,

    /// Basename for the result file.
    #[arg(long, default_value = "moke_sweep")]
    name: String,

    /// Output directory (defaults to the configured data directory).
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Run against the mock instruments instead of hardware.
    #[arg(long)]
    dry_run: bool,

    /// VISA resource of the power supply, e.g. GPIB0::6::INSTR.
    #[arg(long)]
    supply_resource: Option<String>,

    /// VISA resource of the lock-in, e.g. GPIB0::8::INSTR.
    #[arg(long)]
    lockin_resource: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ExperimentConfig::load(cli.config.as_deref())
        .context("failed to load experiment configuration")?;

    env_logger::Builder::new()
        .parse_filters(&config.log_level)
        .init();

    let branch = linspace(cli.max_field, -cli.max_field, cli.points);
    let fields = hysteresis_loop(&branch, cli.close_loop);
    info!(
        "Field plan: {} point(s), +/-{} Oe{}",
        fields.len(),
        cli.max_field,
        if cli.close_loop { ", closed loop" } else { "" }
    );

    if cli.dry_run {
        let lockin = MockLockIn::with_level(config.sensitivity_volts * 0.4);
        run_sweep(config, MockSupply::new(), lockin, &fields, &cli).await
    } else {
        run_hardware(config, &fields, &cli).await
    }
}

#[cfg(feature = "instrument_visa")]
async fn run_hardware(config: ExperimentConfig, fields: &[f64], cli: &Cli) -> Result<()> {
    use moke_daq::instrument::{kepco_bop::KepcoBop, srs_sr830::SrsSr830};

    let supply_resource = cli
        .supply_resource
        .as_deref()
        .ok_or_else(|| anyhow!("--supply-resource is required without --dry-run"))?;
    let lockin_resource = cli
        .lockin_resource
        .as_deref()
        .ok_or_else(|| anyhow!("--lockin-resource is required without --dry-run"))?;

    let supply = KepcoBop::open(supply_resource, config.compliance_volts)
        .context("failed to open power supply")?;
    let lockin = SrsSr830::open(lockin_resource).context("failed to open lock-in")?;
    run_sweep(config, supply, lockin, fields, cli).await
}

#[cfg(not(feature = "instrument_visa"))]
async fn run_hardware(_config: ExperimentConfig, _fields: &[f64], _cli: &Cli) -> Result<()> {
    Err(anyhow!(
        "hardware support not enabled; rebuild with --features instrument_visa or pass --dry-run"
    ))
}

async fn run_sweep<P, L>(
    config: ExperimentConfig,
    supply: P,
    lockin: L,
    fields: &[f64],
    cli: &Cli,
) -> Result<()>
where
    P: PowerSupply,
    L: LockIn,
{
    let run_log = RunLog::create(&config.log_dir);
    let out_dir = cli.out_dir.clone().unwrap_or_else(|| config.data_dir.clone());
    let sink = CsvSink::new(out_dir, cli.name.clone());

    let mut controller = SweepController::new(config, supply, lockin)?
        .with_run_log(run_log)
        .with_sink(Box::new(sink));

    // Ctrl-C requests a cooperative cancel: the controller finishes the
    // current point, zeroes the supply, and persists what it has.
    let token = controller.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Cancellation requested; finishing current point and zeroing");
            token.cancel();
        }
    });

    match controller.sweep(fields, SweepOptions::default()).await {
        Ok(record) => {
            info!(
                "Sweep {}: {} point(s){}",
                if record.cancelled { "cancelled" } else { "complete" },
                record.len(),
                record
                    .save_path
                    .as_ref()
                    .map(|p| format!(", saved to '{}'", p.display()))
                    .unwrap_or_default()
            );
            Ok(())
        }
        Err(aborted) => {
            warn!(
                "Partial data ({} point(s)) was still persisted",
                aborted.record.len()
            );
            Err(aborted.into())
        }
    }
}
