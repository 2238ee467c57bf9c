#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schema for the reward controller.
//!
//! `Config` and its sub-structs are deserialized from TOML and checked by
//! `Config::validate()`, which names the offending key in every error.
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use serde::Deserialize;

/// Syringe catalogue keys accepted by `pumps.<name>.syringe`.
pub const SYRINGE_KEYS: &[&str] = &["BD1mL", "BD3mL", "BD5mL", "BD10mL", "BD30mL", "BD60mL"];

/// Microstep levels accepted by `pumps.<name>.step_type`.
pub const STEP_TYPES: &[&str] = &["Full", "Half", "1/4", "1/8", "1/16", "1/32"];

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerCfg {
    pub host: String,
    pub port: u16,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8123,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControllerCfg {
    /// Start with automatic refilling enabled
    pub auto_fill: bool,
    /// Refill once vol_left drops below this fraction of the syringe volume
    pub auto_fill_frac_thresh: f64,
    /// Burst monitor polling period (ms)
    pub burst_update_ms: u64,
    /// Bounded wait used by compound operations (fill_lines / empty_lines)
    pub lock_wait_ms: u64,
    /// Position journal polling period (ms)
    pub journal_ms: u64,
}

impl Default for ControllerCfg {
    fn default() -> Self {
        Self {
            auto_fill: false,
            auto_fill_frac_thresh: 0.5,
            burst_update_ms: 10,
            lock_wait_ms: 250,
            journal_ms: 100,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AudioCfg {
    /// Mixer sampling rate in Hz
    pub fs: u32,
    /// Optional ALSA device passed to the PCM sink
    pub device: Option<String>,
}

impl Default for AudioCfg {
    fn default() -> Self {
        Self {
            fs: 44_100,
            device: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

/// Optional input whose rising edges are logged as `clock` events.
#[derive(Debug, Deserialize)]
pub struct ClockCfg {
    pub pin: u8,
    #[serde(default)]
    pub active_low: bool,
}

/// MCP23017 shared by several lickometers.
#[derive(Debug, Deserialize)]
pub struct LickBusCfg {
    pub interrupt_pin: u8,
    #[serde(default = "default_i2c_bus")]
    pub i2c_bus: u8,
    #[serde(default = "default_expander_address")]
    pub address: u16,
}

fn default_i2c_bus() -> u8 {
    1
}

fn default_expander_address() -> u16 {
    0x20
}

#[derive(Debug, Deserialize)]
pub struct SpeakerCfg {
    /// Amplifier shutdown (mute) pin; high = enabled
    pub sd_pin: u8,
    #[serde(default)]
    pub channel: u8,
}

#[derive(Debug, Deserialize)]
pub struct PumpCfg {
    pub step_pin: u8,
    pub dir_pin: u8,
    /// Microstep strapping pins M0, M1, M2
    pub ms_pins: [u8; 3],
    #[serde(default = "default_syringe")]
    pub syringe: String,
    #[serde(default = "default_step_type")]
    pub step_type: String,
    /// Seconds per half pulse
    #[serde(default = "default_step_delay")]
    pub step_delay: f64,
    /// Lead-screw pitch in cm per revolution
    #[serde(default = "default_pitch")]
    pub pitch: f64,
    /// Flip the direction line when the driver is wired the other way round
    #[serde(default)]
    pub invert_direction: bool,
    pub fill_valve_pin: Option<u8>,
    #[serde(default = "default_true")]
    pub fill_valve_nc: bool,
    pub flush_pin: Option<u8>,
    pub reverse_pin: Option<u8>,
    pub end_pin: Option<u8>,
    #[serde(default = "default_true")]
    pub buttons_active_low: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Valve settle after each transition (ms)
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_syringe() -> String {
    "BD5mL".to_string()
}

fn default_step_type() -> String {
    "Half".to_string()
}

fn default_step_delay() -> f64 {
    0.0005
}

fn default_pitch() -> f64 {
    0.08
}

fn default_true() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    50
}

fn default_settle_ms() -> u64 {
    20
}

#[derive(Debug, Deserialize)]
pub struct ModuleCfg {
    /// Free-form module type reported in status (e.g. "port", "behavior")
    #[serde(default = "default_kind")]
    pub kind: String,
    pub pump: String,
    pub valve_pin: u8,
    #[serde(default = "default_true")]
    pub valve_nc: bool,
    pub lick_pin: Option<u8>,
    /// Expander input number (0..16) when the lickometer sits on the lick bus
    pub lick_bus_pin: Option<u8>,
    pub led_pin: Option<u8>,
    pub speaker: Option<String>,
    #[serde(default)]
    pub dead_volume: f64,
    #[serde(default)]
    pub post_delay: f64,
    #[serde(default = "default_burst_thresh")]
    pub burst_thresh: f64,
    #[serde(default = "default_reward_thresh")]
    pub reward_thresh: u32,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_kind() -> String {
    "port".to_string()
}

fn default_burst_thresh() -> f64 {
    0.5
}

fn default_reward_thresh() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Valve,
    Led,
    Lickometer,
}

/// A resource not bound to any module.
#[derive(Debug, Deserialize)]
pub struct PluginCfg {
    pub kind: PluginKind,
    pub pin: u8,
    #[serde(default = "default_true")]
    pub nc: bool,
    #[serde(default = "default_burst_thresh")]
    pub burst_thresh: f64,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub server: ServerCfg,
    #[serde(default)]
    pub controller: ControllerCfg,
    #[serde(default)]
    pub audio: AudioCfg,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub clock: Option<ClockCfg>,
    #[serde(default)]
    pub lick_bus: Option<LickBusCfg>,
    #[serde(default)]
    pub speakers: BTreeMap<String, SpeakerCfg>,
    pub pumps: BTreeMap<String, PumpCfg>,
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleCfg>,
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginCfg>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

/// Read, parse and validate a config file.
pub fn load_file(path: &std::path::Path) -> eyre::Result<Config> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("read config {}: {e}", path.display()))?;
    let cfg = load_toml(&text).map_err(|e| eyre::eyre!("parse config {}: {e}", path.display()))?;
    cfg.validate()
        .map_err(|e| eyre::eyre!("invalid config {}: {e}", path.display()))?;
    Ok(cfg)
}

/// Tracks output pins so two resources never drive the same line.
struct PinClaims(HashSet<u8>);

impl PinClaims {
    fn claim(&mut self, pin: u8, what: &str) -> eyre::Result<()> {
        if !self.0.insert(pin) {
            eyre::bail!("{what}: pin {pin} is already used by another resource");
        }
        Ok(())
    }
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        let mut pins = PinClaims(HashSet::new());

        // Controller
        let f = self.controller.auto_fill_frac_thresh;
        if !(f > 0.0 && f < 1.0) {
            eyre::bail!("controller.auto_fill_frac_thresh must be in (0.0, 1.0)");
        }
        if self.controller.burst_update_ms == 0 {
            eyre::bail!("controller.burst_update_ms must be >= 1");
        }
        if self.controller.journal_ms == 0 {
            eyre::bail!("controller.journal_ms must be >= 1");
        }

        // Audio
        if self.audio.fs < 8_000 || self.audio.fs > 192_000 {
            eyre::bail!("audio.fs must be in [8000, 192000]");
        }

        // Logging
        if let Some(r) = self.logging.rotation.as_deref()
            && !matches!(r, "never" | "daily" | "hourly")
        {
            eyre::bail!("logging.rotation must be one of never|daily|hourly (got '{r}')");
        }

        // Pumps
        if self.pumps.is_empty() {
            eyre::bail!("at least one [pumps.<name>] table is required");
        }
        for (name, p) in &self.pumps {
            let key = format!("pumps.{name}");
            pins.claim(p.step_pin, &format!("{key}.step_pin"))?;
            pins.claim(p.dir_pin, &format!("{key}.dir_pin"))?;
            for (i, pin) in p.ms_pins.iter().enumerate() {
                pins.claim(*pin, &format!("{key}.ms_pins[{i}]"))?;
            }
            if !SYRINGE_KEYS.contains(&p.syringe.as_str()) {
                eyre::bail!(
                    "{key}.syringe '{}' is unknown (expected one of {})",
                    p.syringe,
                    SYRINGE_KEYS.join(", ")
                );
            }
            if !STEP_TYPES.contains(&p.step_type.as_str()) {
                eyre::bail!(
                    "{key}.step_type '{}' is unknown (expected one of {})",
                    p.step_type,
                    STEP_TYPES.join(", ")
                );
            }
            if !(p.step_delay.is_finite() && p.step_delay > 0.0 && p.step_delay <= 0.1) {
                eyre::bail!("{key}.step_delay must be in (0.0, 0.1] seconds");
            }
            if !(p.pitch.is_finite() && p.pitch > 0.0) {
                eyre::bail!("{key}.pitch must be > 0");
            }
            if let Some(pin) = p.fill_valve_pin {
                pins.claim(pin, &format!("{key}.fill_valve_pin"))?;
            }
            for (label, pin) in [
                ("flush_pin", p.flush_pin),
                ("reverse_pin", p.reverse_pin),
                ("end_pin", p.end_pin),
            ] {
                if let Some(pin) = pin {
                    pins.claim(pin, &format!("{key}.{label}"))?;
                }
            }
            check_settle(&key, p.settle_ms)?;
        }

        // Speakers
        for (name, s) in &self.speakers {
            pins.claim(s.sd_pin, &format!("speakers.{name}.sd_pin"))?;
            if s.channel > 1 {
                eyre::bail!("speakers.{name}.channel must be 0 (left) or 1 (right)");
            }
        }

        // Modules
        let mut bus_inputs = HashSet::new();
        for (name, m) in &self.modules {
            let key = format!("modules.{name}");
            if !self.pumps.contains_key(&m.pump) {
                eyre::bail!("{key}.pump '{}' does not name a configured pump", m.pump);
            }
            pins.claim(m.valve_pin, &format!("{key}.valve_pin"))?;
            if let Some(pin) = m.led_pin {
                pins.claim(pin, &format!("{key}.led_pin"))?;
            }
            if let Some(pin) = m.lick_pin {
                pins.claim(pin, &format!("{key}.lick_pin"))?;
            }
            if m.lick_pin.is_some() && m.lick_bus_pin.is_some() {
                eyre::bail!("{key}: set either lick_pin or lick_bus_pin, not both");
            }
            if let Some(bit) = m.lick_bus_pin {
                if self.lick_bus.is_none() {
                    eyre::bail!("{key}.lick_bus_pin requires a [lick_bus] table");
                }
                if bit >= 16 {
                    eyre::bail!("{key}.lick_bus_pin must be in 0..16");
                }
                if !bus_inputs.insert(bit) {
                    eyre::bail!("{key}.lick_bus_pin {bit} is shared with another module");
                }
            }
            if let Some(spk) = &m.speaker
                && !self.speakers.contains_key(spk)
            {
                eyre::bail!("{key}.speaker '{spk}' does not name a configured speaker");
            }
            if !(m.dead_volume.is_finite() && m.dead_volume >= 0.0) {
                eyre::bail!("{key}.dead_volume must be >= 0");
            }
            if !(m.post_delay.is_finite() && (0.0..=10.0).contains(&m.post_delay)) {
                eyre::bail!("{key}.post_delay must be in [0.0, 10.0] seconds");
            }
            if !(m.burst_thresh.is_finite() && m.burst_thresh > 0.0) {
                eyre::bail!("{key}.burst_thresh must be > 0");
            }
            check_settle(&key, m.settle_ms)?;
        }

        // Plugins
        for (name, p) in &self.plugins {
            if self.modules.contains_key(name) {
                eyre::bail!("plugins.{name} collides with a module of the same name");
            }
            pins.claim(p.pin, &format!("plugins.{name}.pin"))?;
        }

        // Optional inputs
        if let Some(clock) = &self.clock {
            pins.claim(clock.pin, "clock.pin")?;
        }
        if let Some(bus) = &self.lick_bus {
            pins.claim(bus.interrupt_pin, "lick_bus.interrupt_pin")?;
            if !(0x20..=0x27).contains(&bus.address) {
                eyre::bail!("lick_bus.address must be in 0x20..=0x27");
            }
        }

        Ok(())
    }
}

fn check_settle(key: &str, settle_ms: u64) -> eyre::Result<()> {
    if !(20..=50).contains(&settle_ms) {
        eyre::bail!("{key}.settle_ms must be in [20, 50]");
    }
    Ok(())
}
