//! Solenoid valves, both delivery and fill.
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reward_traits::DigitalOutput;
use serde::Serialize;

use crate::error::Result;
use crate::hw_error::hw;
use crate::resource::{Holder, Resource, ResourceLock};
use crate::util::SharedClock;

/// Valve wiring. Normally closed: driving the line high opens the valve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Polarity {
    NormallyClosed,
    NormallyOpen,
}

impl Polarity {
    pub fn from_nc(nc: bool) -> Self {
        if nc {
            Polarity::NormallyClosed
        } else {
            Polarity::NormallyOpen
        }
    }

    fn level_for(self, open: bool) -> bool {
        match self {
            Polarity::NormallyClosed => open,
            Polarity::NormallyOpen => !open,
        }
    }
}

pub struct Valve {
    name: String,
    lock: Arc<ResourceLock>,
    pin: Mutex<Box<dyn DigitalOutput>>,
    polarity: Polarity,
    settle: Duration,
    clock: SharedClock,
}

impl std::fmt::Debug for Valve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Valve")
            .field("name", &self.name)
            .field("polarity", &self.polarity)
            .field("is_open", &self.is_open())
            .finish()
    }
}

impl Valve {
    /// Wrap `pin` and drive it to the closed level.
    pub fn new(
        name: impl Into<String>,
        mut pin: Box<dyn DigitalOutput>,
        polarity: Polarity,
        settle: Duration,
        clock: SharedClock,
    ) -> Result<Self> {
        let name = name.into();
        pin.set_level(polarity.level_for(false)).map_err(hw)?;
        Ok(Self {
            lock: ResourceLock::new(name.clone()),
            name,
            pin: Mutex::new(pin),
            polarity,
            settle,
            clock,
        })
    }

    pub fn polarity(&self) -> Polarity {
        self.polarity
    }

    pub fn is_open(&self) -> bool {
        self.polarity.level_for(true) == self.pin.lock().level()
    }

    pub fn open(&self, holder: Holder) -> Result<()> {
        self.set(holder, true)
    }

    pub fn close(&self, holder: Holder) -> Result<()> {
        self.set(holder, false)
    }

    /// Flip the valve, or force it to `open` when given. Returns the new state.
    pub fn toggle(&self, holder: Holder, open: Option<bool>) -> Result<bool> {
        let target = open.unwrap_or(!self.is_open());
        self.set(holder, target)?;
        Ok(target)
    }

    fn set(&self, holder: Holder, open: bool) -> Result<()> {
        let _guard = self.try_acquire(holder)?;
        if self.is_open() == open {
            return Ok(());
        }
        self.pin
            .lock()
            .set_level(self.polarity.level_for(open))
            .map_err(hw)?;
        tracing::debug!(valve = %self.name, open, "valve transition");
        self.clock.sleep(self.settle);
        Ok(())
    }
}

impl Resource for Valve {
    fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> &Arc<ResourceLock> {
        &self.lock
    }
}
