//! On/off cue lights.
use std::sync::Arc;

use parking_lot::Mutex;
use reward_traits::DigitalOutput;

use crate::error::Result;
use crate::hw_error::hw;
use crate::resource::{Holder, Resource, ResourceLock};

pub struct Led {
    name: String,
    lock: Arc<ResourceLock>,
    pin: Mutex<Box<dyn DigitalOutput>>,
}

impl std::fmt::Debug for Led {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Led")
            .field("name", &self.name)
            .field("is_on", &self.is_on())
            .finish()
    }
}

impl Led {
    pub fn new(name: impl Into<String>, mut pin: Box<dyn DigitalOutput>) -> Result<Self> {
        let name = name.into();
        pin.set_level(false).map_err(hw)?;
        Ok(Self {
            lock: ResourceLock::new(name.clone()),
            name,
            pin: Mutex::new(pin),
        })
    }

    pub fn is_on(&self) -> bool {
        self.pin.lock().level()
    }

    pub fn on(&self, holder: Holder) -> Result<()> {
        self.set(holder, true)
    }

    pub fn off(&self, holder: Holder) -> Result<()> {
        self.set(holder, false)
    }

    pub fn toggle(&self, holder: Holder, on: Option<bool>) -> Result<bool> {
        let target = on.unwrap_or(!self.is_on());
        self.set(holder, target)?;
        Ok(target)
    }

    fn set(&self, holder: Holder, on: bool) -> Result<()> {
        let _guard = self.try_acquire(holder)?;
        self.pin.lock().set_level(on).map_err(hw)
    }
}

impl Resource for Led {
    fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> &Arc<ResourceLock> {
        &self.lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reward_hardware::SimBoard;
    use reward_traits::Board;

    #[test]
    fn led_toggles() {
        let board = SimBoard::new();
        let led = Led::new("cue", board.output(8).unwrap()).unwrap();
        let h = Holder::new();
        assert!(led.toggle(h, None).unwrap());
        assert!(led.is_on());
        assert!(!led.toggle(h, Some(false)).unwrap());
        assert!(!board.line(8).level());
    }
}
