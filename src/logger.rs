//! Run-scoped log file.
//!
//! Every sweep appends structured one-line events (timestamps, commanded
//! setpoints, sensitivity changes, errors) to a per-run file under the
//! configured log directory. This is experiment provenance, not process
//! diagnostics — the `log` crate handles the latter.
//!
//! Logging is strictly best-effort: a full disk or bad path must never
//! abort a physics run, so failures are downgraded to `log::warn!` and the
//! logger disables itself.

use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Append-only, run-scoped event log.
#[derive(Debug)]
pub struct RunLog {
    path: Option<PathBuf>,
    // Set once the first append fails, so a dead disk warns only once.
    failed: AtomicBool,
}

impl RunLog {
    /// A logger that discards everything. Used by tests and dry runs.
    pub fn disabled() -> Self {
        Self {
            path: None,
            failed: AtomicBool::new(false),
        }
    }

    /// Create a timestamped log file under `dir`, e.g.
    /// `experiment_logs/moke_20260823_141502.log`.
    ///
    /// On any filesystem error the logger comes back disabled with a
    /// warning instead of failing the run.
    pub fn create(dir: &Path) -> Self {
        let name = format!("moke_{}.log", Utc::now().format("%Y%m%d_%H%M%S"));
        let path = dir.join(name);
        let header = format!("# moke_daq run log @ {}\n", Utc::now());
        let result = std::fs::create_dir_all(dir)
            .and_then(|_| std::fs::write(&path, header.as_bytes()));
        match result {
            Ok(()) => {
                log::info!("Run log opened at '{}'", path.display());
                Self {
                    path: Some(path),
                    failed: AtomicBool::new(false),
                }
            }
            Err(e) => {
                log::warn!("Could not open run log in '{}': {}", dir.display(), e);
                Self::disabled()
            }
        }
    }

    /// Where this log writes, if anywhere.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one event line: `<utc timestamp> EVENT key=value ...`.
    ///
    /// Never returns an error; see the module docs.
    pub fn log(&self, event: &str, fields: &[(&str, String)]) {
        let Some(path) = &self.path else { return };
        let mut line = format!("{} {}", Utc::now().to_rfc3339(), event);
        for (key, value) in fields {
            line.push(' ');
            line.push_str(key);
            line.push('=');
            line.push_str(value);
        }
        line.push('\n');

        let result = OpenOptions::new()
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            if !self.failed.swap(true, Ordering::Relaxed) {
                log::warn!("Run log write failed, disabling: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_log_is_silent() {
        let log = RunLog::disabled();
        log.log("SET_FIELD", &[("current_a", "0.1".to_string())]);
        assert!(log.path().is_none());
    }

    #[test]
    fn test_create_and_append() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::create(dir.path());
        log.log("SWEEP_START", &[("points", "5".to_string())]);
        log.log("ZEROED", &[]);

        let content = std::fs::read_to_string(log.path().unwrap()).unwrap();
        let mut lines = content.lines();
        assert!(lines.next().unwrap().starts_with("# moke_daq run log"));
        assert!(content.contains("SWEEP_START points=5"));
        assert!(content.contains("ZEROED"));
    }

    #[test]
    fn test_bad_directory_degrades_to_disabled() {
        // A path under a file cannot be created as a directory.
        let file = tempfile::NamedTempFile::new().unwrap();
        let log = RunLog::create(&file.path().join("nested"));
        assert!(log.path().is_none());
        log.log("EVENT", &[]);
    }
}
