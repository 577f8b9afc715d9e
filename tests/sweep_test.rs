//! End-to-end sweep behavior against the mock instruments.
//!
//! Every test runs with all settle delays zeroed so the suite stays fast;
//! the delays are plain awaited sleeps and do not change sequencing.

use std::time::Duration;

use moke_daq::config::ExperimentConfig;
use moke_daq::instrument::mock::{MockLockIn, MockSupply, SupplyCommand};
use moke_daq::instrument::SourceMode;
use moke_daq::storage::CsvSink;
use moke_daq::sweep::{CancelToken, SweepController, SweepOptions};

fn quick_config() -> ExperimentConfig {
    let mut config = ExperimentConfig::default();
    config.sensitivity_settle = Duration::ZERO;
    config.read_delay = Duration::ZERO;
    config.rep_delay = Duration::ZERO;
    config.zero_departure_delay = Duration::ZERO;
    config.zero_return_delay = Duration::ZERO;
    config
}

fn is_zero_set(command: &SupplyCommand) -> bool {
    matches!(command, SupplyCommand::SetOutput { value, .. } if *value == 0.0)
}

#[tokio::test]
async fn test_points_follow_input_order() {
    let fields = [10.0, 5.0, -5.0, -10.0, 3.0];
    // 8e-5 V sits inside the acceptance band of the default 2e-4 V
    // sensitivity, so no ranging steps occur.
    let lockin = MockLockIn::with_level(8e-5);
    let mut controller =
        SweepController::new(quick_config(), MockSupply::new(), lockin).unwrap();

    let record = controller
        .sweep(&fields, SweepOptions::default())
        .await
        .unwrap();

    assert_eq!(record.len(), fields.len());
    assert!(!record.cancelled);
    for ((point, reading), &field) in record.points().iter().zip(&fields) {
        assert_eq!(point.field_oe, field);
        assert!((point.current_a - field / 193.0).abs() < 1e-12);
        assert!((reading.mean - 8e-5).abs() < 1e-15);
        assert!(!reading.range_flagged);
    }
}

#[tokio::test]
async fn test_supply_is_zeroed_and_disabled_after_completion() {
    let supply = MockSupply::new();
    let log = supply.command_log();
    let mut controller =
        SweepController::new(quick_config(), supply, MockLockIn::with_level(8e-5)).unwrap();

    controller
        .sweep(&[20.0, -20.0], SweepOptions::default())
        .await
        .unwrap();

    let commands = log.snapshot();
    assert_eq!(commands.first(), Some(&SupplyCommand::Enable(true)));
    let n = commands.len();
    assert!(is_zero_set(&commands[n - 2]));
    assert_eq!(commands[n - 1], SupplyCommand::Enable(false));
}

#[tokio::test]
async fn test_reading_averages_the_requested_reps() {
    // First scripted sample feeds the ranging check; the next three are
    // the averaged acquisition.
    let mut lockin = MockLockIn::with_level(5e-5);
    lockin.push_samples([5e-5, 2e-5, 4e-5, 6e-5]);
    let trace = lockin.trace();
    let mut controller =
        SweepController::new(quick_config(), MockSupply::new(), lockin).unwrap();

    let options = SweepOptions {
        read_reps: Some(3),
        ..SweepOptions::default()
    };
    let record = controller.sweep(&[50.0], options).await.unwrap();

    let (_, reading) = record.points()[0];
    assert!((reading.mean - 4e-5).abs() < 1e-15);
    assert_eq!(trace.read_count(), 4);
}

#[tokio::test]
async fn test_auto_range_walks_to_the_acceptance_band() {
    let mut config = quick_config();
    config.range.max_adjustments = 30;
    let lockin = MockLockIn::with_level(3e-4);
    let trace = lockin.trace();
    let mut controller = SweepController::new(config, MockSupply::new(), lockin).unwrap();

    // Start at the coarsest rung; the signal only fills the band at
    // 2e-3 V full scale.
    let options = SweepOptions {
        starting_sensitivity: Some(1.0),
        ..SweepOptions::default()
    };
    let record = controller.sweep(&[100.0], options).await.unwrap();

    let (_, reading) = record.points()[0];
    assert!(!reading.range_flagged);
    assert_eq!(reading.sensitivity_volts, 2e-3);
    assert!(3e-4 <= reading.sensitivity_volts * 0.8);
    assert!(3e-4 >= reading.sensitivity_volts * 0.1);

    // One step down per rung between 1.0 and 2e-3, after the initial set.
    let sets = trace.sensitivity_sets();
    assert_eq!(sets[0], 1.0);
    assert!(sets.windows(2).all(|w| w[1] < w[0]));
    assert_eq!(*sets.last().unwrap(), 2e-3);
}

#[tokio::test]
async fn test_exhausted_range_budget_flags_the_reading() {
    let mut config = quick_config();
    config.range.max_adjustments = 2;
    let lockin = MockLockIn::with_level(3e-4);
    let mut controller = SweepController::new(config, MockSupply::new(), lockin).unwrap();

    let options = SweepOptions {
        starting_sensitivity: Some(1.0),
        ..SweepOptions::default()
    };
    let record = controller.sweep(&[100.0], options).await.unwrap();

    // Two rung steps from 1.0 reach 2e-1, still far from the band; the
    // point is recorded anyway, flagged.
    assert_eq!(record.len(), 1);
    let (_, reading) = record.points()[0];
    assert!(reading.range_flagged);
    assert_eq!(reading.sensitivity_volts, 2e-1);
}

#[tokio::test]
async fn test_instrument_failure_keeps_partial_data_and_zeroes() {
    // Third set_output (the third field point) times out; the zeroing
    // set afterwards succeeds.
    let supply = MockSupply::failing_on_set(3);
    let log = supply.command_log();
    let mut controller =
        SweepController::new(quick_config(), supply, MockLockIn::with_level(8e-5)).unwrap();

    let fields = [10.0, 5.0, -5.0, -10.0, 3.0];
    let aborted = controller
        .sweep(&fields, SweepOptions::default())
        .await
        .unwrap_err();

    assert_eq!(aborted.record.len(), 2);
    assert!(!aborted.record.cancelled);

    let commands = log.snapshot();
    let n = commands.len();
    assert!(is_zero_set(&commands[n - 2]));
    assert_eq!(commands[n - 1], SupplyCommand::Enable(false));
    let nonzero_sets = commands
        .iter()
        .filter(|c| matches!(c, SupplyCommand::SetOutput { value, .. } if *value != 0.0))
        .count();
    assert_eq!(nonzero_sets, 2);
}

#[tokio::test]
async fn test_cancellation_finishes_cleanly_mid_sweep() {
    let token = CancelToken::new();
    // Each point costs two reads (one ranging check, one sample), so the
    // token trips as the fourth point's sample is served.
    let lockin = MockLockIn::with_level(8e-5).cancel_after_reads(8, token.clone());
    let supply = MockSupply::new();
    let log = supply.command_log();
    let mut controller = SweepController::new(quick_config(), supply, lockin)
        .unwrap()
        .with_cancel_token(token);

    let fields: Vec<f64> = (0..10).map(|i| 100.0 - 10.0 * i as f64).collect();
    let record = controller
        .sweep(&fields, SweepOptions::default())
        .await
        .unwrap();

    assert!(record.cancelled);
    assert_eq!(record.len(), 4);

    // Enable, four setpoints, the zeroing set, disable. No fifth point.
    let commands = log.snapshot();
    assert_eq!(commands.len(), 7);
    assert!(is_zero_set(&commands[5]));
    assert_eq!(commands[6], SupplyCommand::Enable(false));
}

#[tokio::test]
async fn test_empty_field_array_touches_no_instrument() {
    let supply = MockSupply::new();
    let log = supply.command_log();
    let mut controller =
        SweepController::new(quick_config(), supply, MockLockIn::with_level(8e-5)).unwrap();

    let record = controller.sweep(&[], SweepOptions::default()).await.unwrap();

    assert!(record.is_empty());
    assert!(record.save_path.is_none());
    assert!(log.snapshot().is_empty());
}

#[tokio::test]
async fn test_aborted_sweep_still_persists_partial_record() {
    let dir = tempfile::tempdir().unwrap();
    let supply = MockSupply::failing_on_set(3);
    let sink = CsvSink::new(dir.path(), "partial");
    let mut controller =
        SweepController::new(quick_config(), supply, MockLockIn::with_level(8e-5))
            .unwrap()
            .with_sink(Box::new(sink));

    let aborted = controller
        .sweep(&[10.0, 5.0, -5.0, -10.0], SweepOptions::default())
        .await
        .unwrap_err();

    let path = aborted.record.save_path.as_ref().expect("partial not saved");
    let content = std::fs::read_to_string(path).unwrap();
    // Header plus the two completed points.
    assert_eq!(content.lines().filter(|l| !l.starts_with('#')).count(), 3);
}

#[tokio::test]
async fn test_voltage_mode_is_passed_through_to_the_supply() {
    let mut config = quick_config();
    config.source_mode = SourceMode::Voltage;
    let supply = MockSupply::new();
    let log = supply.command_log();
    let mut controller =
        SweepController::new(config, supply, MockLockIn::with_level(8e-5)).unwrap();

    controller
        .sweep(&[19.3], SweepOptions::default())
        .await
        .unwrap();

    let modes: Vec<SourceMode> = log
        .snapshot()
        .iter()
        .filter_map(|c| match c {
            SupplyCommand::SetOutput { mode, .. } => Some(*mode),
            _ => None,
        })
        .collect();
    assert!(!modes.is_empty());
    assert!(modes.iter().all(|m| *m == SourceMode::Voltage));
}
