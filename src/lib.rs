//! Automation for Magneto-Optic Kerr Effect (MOKE) hysteresis measurements.
//!
//! A sweep drives a bipolar current source through an ordered array of
//! field setpoints while a lock-in amplifier reads the demodulated optical
//! signal at each one, producing a field-vs-signal dataset. The core of
//! the crate is [`sweep::SweepController`], which sequences the instrument
//! commands, auto-ranges the lock-in sensitivity, averages repeated reads,
//! and guarantees the supply is ramped back to zero on every exit path.
//!
//! Instruments sit behind the narrow port traits in [`instrument`]; the
//! default build ships only the deterministic mocks, while the
//! `instrument_visa` feature adds VISA-backed drivers for the KEPCO BOP
//! supply and the SRS SR830 lock-in.

pub mod config;
pub mod error;
pub mod instrument;
pub mod logger;
pub mod storage;
pub mod sweep;
