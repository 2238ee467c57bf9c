//! Pump position persistence.
//!
//! Each pump's carriage position lives in `<state_dir>/<pump>.pos` as a
//! decimal number of cm. A journal thread polls the pumps and rewrites a file
//! whenever the in-memory position differs from what was last written.
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel as xch;
use indexmap::IndexMap;

use crate::pump::Pump;

/// Write `bytes` to a sibling temp file and rename it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("pos.new");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(tmp, path)
}

#[derive(Debug, Clone)]
pub struct PositionStore {
    dir: PathBuf,
}

impl PositionStore {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, pump: &str) -> PathBuf {
        self.dir.join(format!("{pump}.pos"))
    }

    /// Stored position of `pump`; a missing or unreadable file yields 0 and
    /// is (re)created.
    pub fn load(&self, pump: &str) -> f64 {
        let path = self.path_for(pump);
        let parsed = fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|s| s.trim().parse::<f64>().map_err(|e| e.to_string()))
            .and_then(|v| {
                if v.is_finite() {
                    Ok(v)
                } else {
                    Err(format!("non-finite value {v}"))
                }
            });
        match parsed {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(pump, path = %path.display(), error = %e, "no usable stored position, assuming 0");
                if let Err(e) = self.save(pump, 0.0) {
                    tracing::warn!(pump, error = %e, "could not create position file");
                }
                0.0
            }
        }
    }

    pub fn save(&self, pump: &str, position: f64) -> std::io::Result<()> {
        write_atomic(&self.path_for(pump), format!("{position}\n").as_bytes())
    }
}

/// Background writer of pump positions.
///
/// Dropping the journal stops the thread and performs a final flush.
pub struct PositionJournal {
    stop_tx: Option<xch::Sender<()>>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl PositionJournal {
    pub fn spawn(store: PositionStore, pumps: IndexMap<String, Arc<Pump>>, period: Duration) -> Self {
        let (stop_tx, stop_rx) = xch::bounded::<()>(0);
        let join_handle = std::thread::Builder::new()
            .name("position-journal".into())
            .spawn(move || {
                let mut last: IndexMap<String, f64> = pumps
                    .iter()
                    .map(|(name, p)| (name.clone(), p.position()))
                    .collect();
                loop {
                    let stopping = !matches!(
                        stop_rx.recv_timeout(period),
                        Err(xch::RecvTimeoutError::Timeout)
                    );
                    for (name, pump) in &pumps {
                        let pos = pump.position();
                        if stopping || last.get(name) != Some(&pos) {
                            match store.save(name, pos) {
                                Ok(()) => {
                                    last.insert(name.clone(), pos);
                                }
                                Err(e) => {
                                    tracing::error!(pump = %name, error = %e, "failed to persist position");
                                }
                            }
                        }
                    }
                    if stopping {
                        break;
                    }
                }
                tracing::trace!("position journal exiting cleanly");
            });
        let join_handle = match join_handle {
            Ok(h) => Some(h),
            Err(e) => {
                tracing::error!(error = %e, "could not spawn position journal");
                None
            }
        };
        Self {
            stop_tx: Some(stop_tx),
            join_handle,
        }
    }

    /// Stop the thread after a final write of every position.
    pub fn shutdown(&mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.join_handle.take()
            && let Err(e) = handle.join()
        {
            tracing::warn!(?e, "position journal panicked during shutdown");
        }
    }
}

impl Drop for PositionJournal {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_zero_and_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path()).unwrap();
        assert_eq!(store.load("pumpA"), 0.0);
        assert!(store.path_for("pumpA").exists());
    }

    #[test]
    fn garbage_file_yields_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path()).unwrap();
        fs::write(store.path_for("p"), "not a number").unwrap();
        assert_eq!(store.load("p"), 0.0);
        assert_eq!(fs::read_to_string(store.path_for("p")).unwrap().trim(), "0");
    }

    #[test]
    fn saved_position_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path()).unwrap();
        store.save("p", 3.125).unwrap();
        assert_eq!(store.load("p"), 3.125);
    }
}
