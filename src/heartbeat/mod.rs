use std::path::{Path, PathBuf};
use chrono::{DateTime, Local};
use log::debug;

/// File holding the time of the last successful publish.
///
/// It is only ever written. An external watchdog looks at its age to tell
/// whether the bridge is stuck or the broker unreachable.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    path: PathBuf,
}

impl Heartbeat {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        return Heartbeat { path: path.into() };
    }

    pub fn path(&self) -> &Path {
        return &self.path;
    }

    /// Replaces the file content with `now`.
    pub async fn beat(&self, now: DateTime<Local>) -> std::io::Result<()> {
        let stamp = crate::iso_timestamp(&now);
        tokio::fs::write(&self.path, stamp.as_bytes()).await?;
        debug!("Heartbeat {} written to {}", stamp, self.path.display());
        return Ok(());
    }
}
