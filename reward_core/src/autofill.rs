//! Automatic syringe refilling.
//!
//! Two workers share a `needs_refilling` set: the check loop adds every
//! fill-valve-equipped pump running low, the scheduler (driven by the
//! controller) starts a fill task for each listed pump whose slot is free.
//! A successful fill task removes its pump from the set.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel as xch;
use indexmap::IndexSet;
use parking_lot::Mutex;

use crate::error::{Result, RewardError};
use crate::pump::Pump;
use crate::resource::Resource;

/// Cadence of both auto-fill loops.
pub const AUTO_FILL_PERIOD: Duration = Duration::from_millis(500);

/// Pump names awaiting a refill, in the order they ran low.
pub type RefillSet = Arc<Mutex<IndexSet<String>>>;

#[derive(Debug)]
pub struct AutoFill {
    enabled: AtomicBool,
    frac_thresh: Mutex<f64>,
    needs: RefillSet,
}

impl AutoFill {
    pub fn new(enabled: bool, frac_thresh: f64) -> Result<Self> {
        check_thresh(frac_thresh)?;
        Ok(Self {
            enabled: AtomicBool::new(enabled),
            frac_thresh: Mutex::new(frac_thresh),
            needs: Arc::new(Mutex::new(IndexSet::new())),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Set or flip the flag; returns the new state.
    pub fn toggle(&self, on: Option<bool>) -> bool {
        let next = on.unwrap_or(!self.is_enabled());
        self.enabled.store(next, Ordering::SeqCst);
        tracing::info!(auto_fill = next, "auto-fill toggled");
        next
    }

    /// Set the flag, returning the previous state.
    pub fn swap(&self, on: bool) -> bool {
        self.enabled.swap(on, Ordering::SeqCst)
    }

    pub fn frac_thresh(&self) -> f64 {
        *self.frac_thresh.lock()
    }

    pub fn set_frac_thresh(&self, value: f64) -> Result<()> {
        check_thresh(value)?;
        *self.frac_thresh.lock() = value;
        Ok(())
    }

    pub fn needs_refilling(&self) -> &RefillSet {
        &self.needs
    }

    pub fn pending(&self) -> Vec<String> {
        self.needs.lock().iter().cloned().collect()
    }

    /// Add every pump with a fill valve whose volume dropped below the
    /// threshold. Does nothing while auto-fill is off.
    pub fn check<'a>(&self, pumps: impl IntoIterator<Item = &'a Arc<Pump>>) {
        if !self.is_enabled() {
            return;
        }
        let thresh = self.frac_thresh();
        let mut needs = self.needs.lock();
        for pump in pumps {
            if pump.has_fill_valve() && pump.vol_left() < thresh * pump.syringe().volume
                && needs.insert(pump.name().to_string())
            {
                tracing::info!(pump = %pump.name(), vol_left = pump.vol_left(), "pump needs refilling");
            }
        }
    }
}

fn check_thresh(value: f64) -> Result<()> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(RewardError::InvalidArgument(format!(
            "auto_fill_frac_thresh must be in (0, 1), got {value}"
        )))
    }
}

/// Run `tick` every `period` until the shutdown channel closes.
pub(crate) fn spawn_periodic(
    name: &str,
    period: Duration,
    shutdown: xch::Receiver<()>,
    mut tick: impl FnMut() + Send + 'static,
) -> std::io::Result<JoinHandle<()>> {
    let label = name.to_string();
    std::thread::Builder::new().name(label.clone()).spawn(move || {
        while let Err(xch::RecvTimeoutError::Timeout) = shutdown.recv_timeout(period) {
            tick();
        }
        tracing::trace!(worker = %label, "worker exiting cleanly");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_bounds_are_exclusive() {
        assert!(AutoFill::new(false, 0.0).is_err());
        assert!(AutoFill::new(false, 1.0).is_err());
        assert!(AutoFill::new(false, f64::NAN).is_err());
        let af = AutoFill::new(false, 0.5).unwrap();
        assert!(af.set_frac_thresh(0.25).is_ok());
        assert_eq!(af.frac_thresh(), 0.25);
    }

    #[test]
    fn toggle_flips_or_sets() {
        let af = AutoFill::new(false, 0.5).unwrap();
        assert!(af.toggle(None));
        assert!(af.toggle(Some(true)));
        assert!(!af.toggle(None));
    }
}
