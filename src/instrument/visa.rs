//! VISA session wrapper for SCPI instruments.
//!
//! Thin synchronous wrapper over `visa-rs`. Both instruments on this rig
//! are single-session devices commanded strictly sequentially by the sweep
//! controller, so the drivers call these methods directly from their async
//! trait implementations; there is never a second task contending for the
//! bus.

use std::ffi::CString;
use std::fmt::Display;
use std::io::{Read, Write};

use visa_rs::prelude::*;

use crate::error::{SweepError, SweepResult};

fn instrument_error(context: &str, e: impl Display) -> SweepError {
    SweepError::Instrument(format!("{}: {}", context, e))
}

/// An open VISA session to one instrument.
pub struct VisaAdapter {
    resource: String,
    session: visa_rs::Instrument,
    // The session is only valid while its resource manager lives.
    _rm: DefaultRM,
}

impl VisaAdapter {
    /// Open `resource` (e.g. `"GPIB0::6::INSTR"`).
    pub fn open(resource: &str) -> SweepResult<Self> {
        let rm = DefaultRM::new()
            .map_err(|e| instrument_error("failed to create VISA resource manager", e))?;
        let cstr = CString::new(resource)
            .map_err(|e| instrument_error("invalid VISA resource string", e))?;
        let session = rm
            .open(
                &VisaString::from(cstr),
                AccessMode::NO_LOCK,
                TIMEOUT_IMMEDIATE,
            )
            .map_err(|e| instrument_error(&format!("failed to open '{}'", resource), e))?;
        log::info!("VISA resource '{}' opened", resource);
        Ok(Self {
            resource: resource.to_string(),
            session,
            _rm: rm,
        })
    }

    /// The resource string this session was opened with.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Write one command, newline-terminated.
    pub fn send(&mut self, command: &str) -> SweepResult<()> {
        log::debug!("[{}] -> {}", self.resource, command);
        self.session
            .write_all(format!("{}\n", command).as_bytes())
            .map_err(|e| instrument_error(&format!("write '{}' failed", command), e))
    }

    /// Write one query and read back its reply, trimmed.
    pub fn query(&mut self, command: &str) -> SweepResult<String> {
        self.send(command)?;
        let mut buf = [0u8; 256];
        let n = self
            .session
            .read(&mut buf)
            .map_err(|e| instrument_error(&format!("read after '{}' failed", command), e))?;
        let reply = String::from_utf8_lossy(&buf[..n]).trim().to_string();
        log::debug!("[{}] <- {}", self.resource, reply);
        if reply.is_empty() {
            return Err(SweepError::Instrument(format!(
                "empty reply to '{}' from {}",
                command, self.resource
            )));
        }
        Ok(reply)
    }

    /// Query a single numeric value. Handles scientific notation and
    /// rejects instrument error markers.
    pub fn query_f64(&mut self, command: &str) -> SweepResult<f64> {
        let reply = self.query(command)?;
        if reply.contains("ERR") || reply.contains("OVER") || reply.contains("UNDER") {
            return Err(SweepError::Instrument(format!(
                "error response to '{}': {}",
                command, reply
            )));
        }
        reply
            .parse::<f64>()
            .map_err(|e| instrument_error(&format!("unparsable reply '{}' to '{}'", reply, command), e))
    }
}
