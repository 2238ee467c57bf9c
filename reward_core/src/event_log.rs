//! Experiment event log.
//!
//! While recording, every event is appended to a CSV file as
//! `<ISO timestamp ms>, <level>, <message>`. Events are mirrored to
//! `tracing` whether or not a recording is active.
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventLevel::Info => "INFO",
            EventLevel::Warning => "WARNING",
            EventLevel::Error => "ERROR",
        })
    }
}

struct Recording {
    path: PathBuf,
    out: LineWriter<File>,
}

#[derive(Default)]
struct Inner {
    active: Option<Recording>,
    last_path: Option<PathBuf>,
}

#[derive(Default)]
pub struct EventLog {
    inner: Mutex<Inner>,
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog")
            .field("file", &self.file())
            .finish()
    }
}

pub fn timestamp() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H:%M:%S%.3f")
        .to_string()
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_recording(&self) -> bool {
        self.inner.lock().active.is_some()
    }

    /// Path of the active recording.
    pub fn file(&self) -> Option<PathBuf> {
        self.inner.lock().active.as_ref().map(|r| r.path.clone())
    }

    /// Start recording under `data_dir`. With `reset` a fresh timestamped
    /// file is opened; otherwise the previous recording is continued.
    pub fn start(&self, data_dir: &Path, reset: bool) -> Result<PathBuf> {
        let mut inner = self.inner.lock();
        let path = match (&inner.last_path, reset) {
            (Some(prev), false) => prev.clone(),
            _ => {
                fs::create_dir_all(data_dir)?;
                let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S%.3f");
                data_dir.join(format!("events_{stamp}.csv"))
            }
        };
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        inner.active = Some(Recording {
            path: path.clone(),
            out: LineWriter::new(file),
        });
        inner.last_path = Some(path.clone());
        tracing::info!(file = %path.display(), "recording started");
        Ok(path)
    }

    pub fn stop(&self) {
        if let Some(mut rec) = self.inner.lock().active.take() {
            if let Err(e) = rec.out.flush() {
                tracing::warn!(error = %e, "event log flush failed");
            }
            tracing::info!(file = %rec.path.display(), "recording stopped");
        }
    }

    pub fn record(&self, level: EventLevel, message: &str) {
        match level {
            EventLevel::Info => tracing::info!(target: "events", "{message}"),
            EventLevel::Warning => tracing::warn!(target: "events", "{message}"),
            EventLevel::Error => tracing::error!(target: "events", "{message}"),
        }
        let mut inner = self.inner.lock();
        if let Some(rec) = inner.active.as_mut()
            && let Err(e) = writeln!(rec.out, "{}, {level}, {message}", timestamp())
        {
            tracing::error!(error = %e, "event log write failed, recording stopped");
            inner.active = None;
        }
    }

    pub fn info(&self, message: &str) {
        self.record(EventLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.record(EventLevel::Warning, message);
    }

    pub fn error(&self, message: &str) {
        self.record(EventLevel::Error, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_written_only_while_recording() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new();
        log.info("before");
        let path = log.start(dir.path(), true).unwrap();
        log.info("lick,A");
        log.error("boom");
        log.stop();
        log.info("after");
        let text = fs::read_to_string(path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(", INFO, lick,A"));
        assert!(lines[1].ends_with(", ERROR, boom"));
    }

    #[test]
    fn restart_without_reset_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new();
        let first = log.start(dir.path(), true).unwrap();
        log.info("one");
        log.stop();
        let second = log.start(dir.path(), false).unwrap();
        log.info("two");
        log.stop();
        assert_eq!(first, second);
        assert_eq!(fs::read_to_string(first).unwrap().lines().count(), 2);
    }

    #[test]
    fn timestamp_has_millisecond_precision() {
        let ts = timestamp();
        let frac = ts.rsplit('.').next().unwrap();
        assert_eq!(frac.len(), 3);
    }
}
