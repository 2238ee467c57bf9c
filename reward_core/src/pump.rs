//! Syringe pump motion engine.
//!
//! A pump is a lead-screw carriage driven by a stepper through a
//! microstepping driver. Motion is expressed in mL, quantized to whole steps,
//! and tracked as an absolute carriage position in cm measured from the
//! fully-dispensed end (0 = empty, `max_pos` = full).
//!
//! `enabled` is a cooperative gate rather than a driver enable line: the move
//! loop checks it before every step, so `disable()` from any thread cancels a
//! running move after the current pulse.
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use reward_traits::DigitalOutput;
use serde::Serialize;

use crate::error::{Result, RewardError};
use crate::hw_error::hw;
use crate::resource::{Holder, LockWait, Resource, ResourceLock};
use crate::syringe::Syringe;
use crate::util::{SharedClock, positive_finite, secs};
use crate::valve::Valve;

/// Positions closer than this to an end count as being at it.
const POS_EPS: f64 = 1e-9;

/// Driver mode pins need this long to latch a new microstep level.
const STEP_TYPE_SETTLE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    /// Dispense; carriage moves toward position 0.
    Forward,
    /// Refill; carriage moves toward `max_pos`.
    Backward,
}

impl Direction {
    fn sign(self) -> f64 {
        match self {
            Direction::Forward => -1.0,
            Direction::Backward => 1.0,
        }
    }
}

/// Microstep level with its DRV8825-style strapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepType {
    Full,
    Half,
    Quarter,
    Eighth,
    Sixteenth,
    ThirtySecond,
}

impl StepType {
    pub const ALL: [StepType; 6] = [
        StepType::Full,
        StepType::Half,
        StepType::Quarter,
        StepType::Eighth,
        StepType::Sixteenth,
        StepType::ThirtySecond,
    ];

    pub fn steps_per_rev(self) -> u32 {
        match self {
            StepType::Full => 200,
            StepType::Half => 400,
            StepType::Quarter => 800,
            StepType::Eighth => 1600,
            StepType::Sixteenth => 3200,
            StepType::ThirtySecond => 6400,
        }
    }

    /// Levels of mode pins M0, M1, M2.
    pub fn mode_pins(self) -> [bool; 3] {
        match self {
            StepType::Full => [false, false, false],
            StepType::Half => [true, false, false],
            StepType::Quarter => [false, true, false],
            StepType::Eighth => [true, true, false],
            StepType::Sixteenth => [false, false, true],
            StepType::ThirtySecond => [true, false, true],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StepType::Full => "Full",
            StepType::Half => "Half",
            StepType::Quarter => "1/4",
            StepType::Eighth => "1/8",
            StepType::Sixteenth => "1/16",
            StepType::ThirtySecond => "1/32",
        }
    }
}

impl FromStr for StepType {
    type Err = RewardError;

    fn from_str(s: &str) -> Result<Self> {
        StepType::ALL
            .into_iter()
            .find(|t| t.label().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                RewardError::InvalidArgument(format!(
                    "unknown step type '{s}' (expected Full, Half, 1/4, 1/8, 1/16 or 1/32)"
                ))
            })
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for StepType {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(self.label())
    }
}

/// Output lines driving one stepper driver.
pub struct PumpPins {
    pub step: Box<dyn DigitalOutput>,
    pub dir: Box<dyn DigitalOutput>,
    pub mode: [Box<dyn DigitalOutput>; 3],
}

/// Initial mechanical settings of a pump.
#[derive(Debug, Clone)]
pub struct PumpSettings {
    pub syringe: Syringe,
    pub step_type: StepType,
    pub step_delay: f64,
    pub pitch: f64,
    pub invert_direction: bool,
}

#[derive(Debug, Clone)]
struct Motion {
    syringe: Syringe,
    step_type: StepType,
    step_delay: f64,
    pitch: f64,
    direction: Direction,
    position: f64,
    end_known: bool,
}

impl Motion {
    fn steps_per_ml(&self) -> f64 {
        f64::from(self.step_type.steps_per_rev()) / (self.syringe.ml_per_cm() * self.pitch)
    }

    fn displacement_per_step(&self) -> f64 {
        self.pitch / f64::from(self.step_type.steps_per_rev())
    }

    fn vol_left(&self) -> f64 {
        self.syringe.ml_per_cm() * self.position
    }

    fn at_min_pos(&self) -> bool {
        self.position <= POS_EPS
    }

    fn at_max_pos(&self) -> bool {
        self.position >= self.syringe.max_pos() - POS_EPS
    }
}

/// Knobs for `Pump::move_volume`.
#[derive(Debug, Clone, Copy)]
pub struct MoveOptions {
    pub check_availability: bool,
    pub wait: LockWait,
    /// Refuse to move if `disable()` was called since this stop epoch was read.
    pub epoch: Option<u64>,
}

impl Default for MoveOptions {
    fn default() -> Self {
        Self {
            check_availability: true,
            wait: LockWait::Immediate,
            epoch: None,
        }
    }
}

impl MoveOptions {
    pub fn since(epoch: u64) -> Self {
        Self {
            epoch: Some(epoch),
            ..Self::default()
        }
    }
}

/// Steps emitted by a move and the volume they displaced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MoveReport {
    pub steps: u64,
    pub requested_ml: f64,
    pub delivered_ml: f64,
    /// delivered minus requested
    pub error_ml: f64,
}

impl MoveReport {
    fn partial(requested_ml: f64, steps: u64, steps_per_ml: f64) -> Self {
        let delivered_ml = steps as f64 / steps_per_ml;
        Self {
            steps,
            requested_ml,
            delivered_ml,
            error_ml: delivered_ml - requested_ml,
        }
    }
}

/// A move that stopped early, with what it managed before the error.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialMove {
    pub report: MoveReport,
    pub error: RewardError,
}

/// Point-in-time view of a pump for status replies.
#[derive(Debug, Clone, Serialize)]
pub struct PumpStatus {
    pub syringe: &'static str,
    pub step_type: StepType,
    pub step_delay: f64,
    pub pitch: f64,
    pub direction: Direction,
    pub position: f64,
    pub max_pos: f64,
    pub vol_left: f64,
    pub steps_per_ml: f64,
    pub end_known: bool,
    pub enabled: bool,
    pub locked: bool,
    pub fill_valve: Option<bool>,
}

pub struct Pump {
    name: String,
    lock: Arc<ResourceLock>,
    pins: Mutex<PumpPins>,
    motion: Mutex<Motion>,
    enabled: AtomicBool,
    stop_epoch: AtomicU64,
    invert_direction: bool,
    fill_valve: Option<Arc<Valve>>,
    clock: SharedClock,
}

impl fmt::Debug for Pump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pump")
            .field("name", &self.name)
            .field("motion", &*self.motion.lock())
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

impl Pump {
    pub fn new(
        name: impl Into<String>,
        pins: PumpPins,
        settings: PumpSettings,
        fill_valve: Option<Arc<Valve>>,
        clock: SharedClock,
    ) -> Result<Self> {
        let name = name.into();
        positive_finite("step_delay", settings.step_delay)?;
        positive_finite("pitch", settings.pitch)?;
        let pump = Self {
            lock: ResourceLock::new(name.clone()),
            name,
            pins: Mutex::new(pins),
            motion: Mutex::new(Motion {
                syringe: settings.syringe,
                step_type: settings.step_type,
                step_delay: settings.step_delay,
                pitch: settings.pitch,
                direction: Direction::Forward,
                position: 0.0,
                end_known: false,
            }),
            enabled: AtomicBool::new(false),
            stop_epoch: AtomicU64::new(0),
            invert_direction: settings.invert_direction,
            fill_valve,
            clock,
        };
        {
            let mut pins = pump.pins.lock();
            pump.write_mode_pins(&mut pins, settings.step_type)?;
            pump.write_dir_pin(&mut pins, Direction::Forward)?;
            pins.step.set_level(false).map_err(hw)?;
        }
        Ok(pump)
    }

    // ----- derived state -----

    pub fn position(&self) -> f64 {
        self.motion.lock().position
    }

    pub fn vol_left(&self) -> f64 {
        self.motion.lock().vol_left()
    }

    pub fn at_min_pos(&self) -> bool {
        self.motion.lock().at_min_pos()
    }

    pub fn at_max_pos(&self) -> bool {
        self.motion.lock().at_max_pos()
    }

    pub fn steps_per_ml(&self) -> f64 {
        self.motion.lock().steps_per_ml()
    }

    pub fn displacement_per_step(&self) -> f64 {
        self.motion.lock().displacement_per_step()
    }

    pub fn syringe(&self) -> Syringe {
        self.motion.lock().syringe.clone()
    }

    pub fn step_type(&self) -> StepType {
        self.motion.lock().step_type
    }

    pub fn step_delay(&self) -> f64 {
        self.motion.lock().step_delay
    }

    pub fn direction(&self) -> Direction {
        self.motion.lock().direction
    }

    pub fn end_known(&self) -> bool {
        self.motion.lock().end_known
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn has_fill_valve(&self) -> bool {
        self.fill_valve.is_some()
    }

    pub fn fill_valve(&self) -> Option<&Arc<Valve>> {
        self.fill_valve.as_ref()
    }

    pub fn status(&self) -> PumpStatus {
        let m = self.motion.lock().clone();
        PumpStatus {
            syringe: m.syringe.key,
            step_type: m.step_type,
            step_delay: m.step_delay,
            pitch: m.pitch,
            direction: m.direction,
            position: m.position,
            max_pos: m.syringe.max_pos(),
            vol_left: m.vol_left(),
            steps_per_ml: m.steps_per_ml(),
            end_known: m.end_known,
            enabled: self.is_enabled(),
            locked: self.lock.is_locked(),
            fill_valve: self.fill_valve.as_ref().map(|v| v.is_open()),
        }
    }

    // ----- gate -----

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Cancel any running move after its current pulse.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.stop_epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Incremented by every `disable()`.
    pub fn stop_epoch(&self) -> u64 {
        self.stop_epoch.load(Ordering::SeqCst)
    }

    // ----- motion -----

    /// Emit one pulse and move the tracked position by one step.
    pub fn single_step(
        &self,
        holder: Holder,
        direction: Option<Direction>,
        force: bool,
        pre_checked: bool,
    ) -> Result<()> {
        let _guard = self.try_acquire(holder)?;
        if !force && !self.is_enabled() {
            return Err(RewardError::PumpNotEnabled(self.name.clone()));
        }
        let mut pins = self.pins.lock();
        let mut m = self.motion.lock();
        if let Some(d) = direction
            && d != m.direction
        {
            self.write_dir_pin(&mut pins, d)?;
            m.direction = d;
        }
        if !force && !pre_checked {
            let blocked = match m.direction {
                Direction::Forward => m.at_min_pos(),
                Direction::Backward => m.at_max_pos(),
            };
            if blocked {
                return Err(self.end_track(m.direction));
            }
        }
        let half = secs(m.step_delay);
        pins.step.set_level(true).map_err(hw)?;
        self.clock.busy_wait(half);
        pins.step.set_level(false).map_err(hw)?;
        self.clock.busy_wait(half);
        let next = m.position + m.direction.sign() * m.displacement_per_step();
        m.position = next.clamp(0.0, m.syringe.max_pos());
        Ok(())
    }

    /// Move `amount` mL in `direction`, quantized to whole steps.
    pub fn move_volume(
        &self,
        holder: Holder,
        amount: f64,
        direction: Direction,
        opts: MoveOptions,
    ) -> Result<MoveReport> {
        self.try_move_volume(holder, amount, direction, opts)
            .map_err(|p| p.error)
    }

    /// Like [`Pump::move_volume`], but a failed move still reports the
    /// steps it emitted before stopping.
    pub fn try_move_volume(
        &self,
        holder: Holder,
        amount: f64,
        direction: Direction,
        opts: MoveOptions,
    ) -> std::result::Result<MoveReport, PartialMove> {
        let none = |error| PartialMove {
            report: MoveReport::partial(amount, 0, 1.0),
            error,
        };
        positive_finite("amount", amount).map_err(none)?;
        let _guard = self.acquire(holder, opts.wait).map_err(none)?;
        let (steps, steps_per_ml) = {
            let m = self.motion.lock();
            if opts.check_availability {
                let available = match direction {
                    Direction::Forward => m.vol_left(),
                    Direction::Backward => m.syringe.volume - m.vol_left(),
                };
                if amount > available + POS_EPS {
                    tracing::warn!(pump = %self.name, amount, available, ?direction, "move exceeds travel");
                    return Err(none(self.end_track(direction)));
                }
            }
            let spm = m.steps_per_ml();
            ((spm * amount).round() as u64, spm)
        };

        let was_enabled = self.enabled.swap(true, Ordering::SeqCst);
        if let Some(epoch) = opts.epoch
            && epoch != self.stop_epoch()
        {
            self.enabled.store(false, Ordering::SeqCst);
            return Err(none(RewardError::PumpNotEnabled(self.name.clone())));
        }
        let mut done = 0u64;
        let mut result = Ok(());
        for _ in 0..steps {
            if let Err(e) = self.single_step(holder, Some(direction), false, true) {
                result = Err(e);
                break;
            }
            done += 1;
        }
        self.enabled.store(was_enabled, Ordering::SeqCst);

        let report = MoveReport::partial(amount, done, steps_per_ml);
        if let Err(error) = result {
            tracing::warn!(
                pump = %self.name,
                steps = done,
                of = steps,
                moved_ml = report.delivered_ml,
                error = %error,
                "move interrupted"
            );
            return Err(PartialMove { report, error });
        }
        tracing::debug!(pump = %self.name, steps, ?direction, delivered_ml = report.delivered_ml, "move complete");
        Ok(report)
    }

    /// Refill the syringe completely.
    pub fn ret_to_max(&self, holder: Holder, opts: MoveOptions) -> Result<MoveReport> {
        let missing = {
            let m = self.motion.lock();
            if m.at_max_pos() {
                return Err(self.end_track(Direction::Backward));
            }
            m.syringe.volume - m.vol_left()
        };
        self.move_volume(
            holder,
            missing,
            Direction::Backward,
            MoveOptions {
                check_availability: true,
                ..opts
            },
        )
    }

    /// Declare the carriage to be at the fully-dispensed end.
    pub fn calibrate(&self, holder: Holder) -> Result<()> {
        let _guard = self.try_acquire(holder)?;
        let mut m = self.motion.lock();
        m.position = 0.0;
        m.end_known = true;
        tracing::info!(pump = %self.name, "position calibrated to 0");
        Ok(())
    }

    /// Restore a persisted position. Values outside the track are clamped.
    pub fn set_position(&self, holder: Holder, position: f64) -> Result<()> {
        let _guard = self.try_acquire(holder)?;
        let mut m = self.motion.lock();
        let max = m.syringe.max_pos();
        m.position = if position.is_finite() {
            position.clamp(0.0, max)
        } else {
            0.0
        };
        Ok(())
    }

    pub fn change_syringe(&self, holder: Holder, key: &str) -> Result<()> {
        let syringe = Syringe::from_key(key)?;
        let _guard = self.try_acquire(holder)?;
        let mut m = self.motion.lock();
        let max = syringe.max_pos();
        if m.position > max {
            tracing::warn!(pump = %self.name, position = m.position, max, "position beyond new syringe, clamped");
            m.position = max;
        }
        m.syringe = syringe;
        tracing::info!(pump = %self.name, syringe = key, "syringe changed");
        Ok(())
    }

    pub fn set_step_type(&self, holder: Holder, step_type: StepType) -> Result<()> {
        let _guard = self.try_acquire(holder)?;
        {
            let mut pins = self.pins.lock();
            self.write_mode_pins(&mut pins, step_type)?;
        }
        self.motion.lock().step_type = step_type;
        self.clock.sleep(STEP_TYPE_SETTLE);
        tracing::debug!(pump = %self.name, %step_type, "step type set");
        Ok(())
    }

    pub fn set_step_delay(&self, holder: Holder, step_delay: f64) -> Result<()> {
        positive_finite("step_delay", step_delay)?;
        let _guard = self.try_acquire(holder)?;
        self.motion.lock().step_delay = step_delay;
        Ok(())
    }

    /// Derive the step delay for a flow rate in mL/s at the current step type.
    pub fn set_flow_rate(&self, holder: Holder, flow_rate: f64) -> Result<f64> {
        positive_finite("flow_rate", flow_rate)?;
        let _guard = self.try_acquire(holder)?;
        let mut m = self.motion.lock();
        let delay = 1.0 / (2.0 * flow_rate * m.steps_per_ml());
        m.step_delay = delay;
        tracing::debug!(pump = %self.name, flow_rate, step_delay = delay, "flow rate set");
        Ok(delay)
    }

    fn write_mode_pins(&self, pins: &mut PumpPins, step_type: StepType) -> Result<()> {
        for (pin, level) in pins.mode.iter_mut().zip(step_type.mode_pins()) {
            pin.set_level(level).map_err(hw)?;
        }
        Ok(())
    }

    fn write_dir_pin(&self, pins: &mut PumpPins, direction: Direction) -> Result<()> {
        let high = (direction == Direction::Forward) != self.invert_direction;
        pins.dir.set_level(high).map_err(hw)
    }

    fn end_track(&self, direction: Direction) -> RewardError {
        let end = match direction {
            Direction::Forward => "empty",
            Direction::Backward => "full",
        };
        RewardError::EndTrack(format!("pump {} is {end}", self.name))
    }
}

impl Resource for Pump {
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
    use reward_traits::{Board, TestClock};

    fn pump(board: &SimBoard) -> Pump {
        let pins = PumpPins {
            step: board.output(17).unwrap(),
            dir: board.output(27).unwrap(),
            mode: [
                board.output(5).unwrap(),
                board.output(6).unwrap(),
                board.output(13).unwrap(),
            ],
        };
        Pump::new(
            "pumpA",
            pins,
            PumpSettings {
                syringe: Syringe::from_key("BD5mL").unwrap(),
                step_type: StepType::Half,
                step_delay: 0.0005,
                pitch: 0.08,
                invert_direction: false,
            },
            None,
            Arc::new(TestClock::new()),
        )
        .unwrap()
    }

    #[test]
    fn step_type_labels_parse_back() {
        for t in StepType::ALL {
            assert_eq!(t.label().parse::<StepType>().unwrap(), t);
        }
        assert!("1/3".parse::<StepType>().is_err());
    }

    #[test]
    fn half_step_straps_m0_only() {
        let board = SimBoard::new();
        let _p = pump(&board);
        assert!(board.line(5).level());
        assert!(!board.line(6).level());
        assert!(!board.line(13).level());
    }

    #[test]
    fn unforced_step_needs_enable() {
        let board = SimBoard::new();
        let p = pump(&board);
        let h = Holder::new();
        p.set_position(h, 1.0).unwrap();
        let err = p.single_step(h, Some(Direction::Forward), false, false).unwrap_err();
        assert_eq!(err.kind(), "PumpNotEnabled");
        p.single_step(h, Some(Direction::Forward), true, false).unwrap();
        assert_eq!(board.line(17).rising_writes(), 1);
    }

    #[test]
    fn empty_pump_refuses_forward_step() {
        let board = SimBoard::new();
        let p = pump(&board);
        p.enable();
        let err = p
            .single_step(Holder::new(), Some(Direction::Forward), false, false)
            .unwrap_err();
        assert_eq!(err.kind(), "EndTrackError");
        assert_eq!(board.line(17).rising_writes(), 0);
    }

    #[test]
    fn forced_step_at_end_clamps_position() {
        let board = SimBoard::new();
        let p = pump(&board);
        p.single_step(Holder::new(), Some(Direction::Forward), true, false)
            .unwrap();
        assert_eq!(p.position(), 0.0);
    }

    #[test]
    fn flow_rate_maps_to_step_delay() {
        let board = SimBoard::new();
        let p = pump(&board);
        let delay = p.set_flow_rate(Holder::new(), 0.1).unwrap();
        assert!((delay - 1.0 / (0.2 * p.steps_per_ml())).abs() < 1e-12);
        assert_eq!(p.step_delay(), delay);
    }

    #[test]
    fn setters_refuse_foreign_holder() {
        let board = SimBoard::new();
        let p = pump(&board);
        let _g = p.try_acquire(Holder::new()).unwrap();
        let err = p.set_step_delay(Holder::new(), 0.001).unwrap_err();
        assert_eq!(err.kind(), "ResourceLocked");
    }
}
