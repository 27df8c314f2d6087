use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const WARNING_LOG_NAME: &str = "transfer_warnings.log";

/// Append-only log for non-fatal events.
///
/// Writes `[RFC 3339 timestamp] message` lines to `transfer_warnings.log` in
/// the session's working directory. Failures to write are swallowed: the sink
/// must never disrupt a transfer.
pub struct WarningSink {
    path: PathBuf,
}

impl WarningSink {
    pub fn new(dir: &Path) -> Self {
        WarningSink {
            path: dir.join(WARNING_LOG_NAME),
        }
    }

    pub fn warn(&self, message: &str) {
        log::warn!("{}", message);
        let line = format!("[{}] {}\n", chrono::Utc::now().to_rfc3339(), message);
        let _ = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
    }
}
