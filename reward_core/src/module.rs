//! Delivery sites: a pump plus the valve and cues of one port.
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{Result, RewardError};
use crate::led::Led;
use crate::lickometer::{LickStatus, Lickometer};
use crate::pump::Pump;
use crate::resource::Resource;
use crate::valve::Valve;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModuleSettings {
    /// mL of tubing between valve and port
    pub dead_volume: f64,
    /// seconds between pump stop and valve close
    pub post_delay: f64,
    pub reward_thresh: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleStatus {
    pub kind: String,
    pub pump: String,
    pub valve_open: bool,
    #[serde(flatten)]
    pub settings: ModuleSettings,
    pub lickometer: Option<LickStatus>,
    pub led: Option<bool>,
    pub speaker: Option<String>,
}

#[derive(Debug)]
pub struct Module {
    name: String,
    kind: String,
    pub pump: Arc<Pump>,
    pub valve: Arc<Valve>,
    pub lickometer: Option<Arc<Lickometer>>,
    pub led: Option<Arc<Led>>,
    pub speaker: Option<String>,
    settings: Mutex<ModuleSettings>,
}

impl Module {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        pump: Arc<Pump>,
        valve: Arc<Valve>,
        settings: ModuleSettings,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            pump,
            valve,
            lickometer: None,
            led: None,
            speaker: None,
            settings: Mutex::new(settings),
        }
    }

    pub fn with_lickometer(mut self, lick: Arc<Lickometer>) -> Self {
        self.lickometer = Some(lick);
        self
    }

    pub fn with_led(mut self, led: Arc<Led>) -> Self {
        self.led = Some(led);
        self
    }

    pub fn with_speaker(mut self, speaker: impl Into<String>) -> Self {
        self.speaker = Some(speaker.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> ModuleSettings {
        *self.settings.lock()
    }

    pub fn dead_volume(&self) -> f64 {
        self.settings.lock().dead_volume
    }

    pub fn post_delay(&self) -> f64 {
        self.settings.lock().post_delay
    }

    pub fn set_post_delay(&self, post_delay: f64) -> Result<()> {
        if !(post_delay.is_finite() && post_delay >= 0.0) {
            return Err(RewardError::InvalidArgument(format!(
                "post_delay must be >= 0 s, got {post_delay}"
            )));
        }
        self.settings.lock().post_delay = post_delay;
        Ok(())
    }

    /// Lick-triggered delivery gate: the animal is in a burst of more than
    /// `reward_thresh` licks.
    pub fn trigger(&self) -> bool {
        let thresh = self.settings.lock().reward_thresh;
        self.lickometer
            .as_ref()
            .is_some_and(|l| l.in_burst() && l.burst_lick() > thresh)
    }

    pub fn lickometer(&self) -> Result<&Arc<Lickometer>> {
        self.lickometer
            .as_ref()
            .ok_or_else(|| RewardError::MissingResource(format!("module {} has no lickometer", self.name)))
    }

    pub fn status(&self) -> ModuleStatus {
        ModuleStatus {
            kind: self.kind.clone(),
            pump: self.pump.name().to_string(),
            valve_open: self.valve.is_open(),
            settings: self.settings(),
            lickometer: self.lickometer.as_ref().map(|l| l.status()),
            led: self.led.as_ref().map(|l| l.is_on()),
            speaker: self.speaker.clone(),
        }
    }
}
