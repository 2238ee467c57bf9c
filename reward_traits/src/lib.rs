//! Hardware capability contracts consumed by the reward controller.
//!
//! Every trait here returns `Box<dyn Error + Send + Sync>` so that simulated
//! and Raspberry Pi backends can surface their own error types;
//! `reward_core::hw_error` maps them onto typed controller errors.
pub mod clock;

pub use clock::{Clock, MonotonicClock, TestClock};

pub type HwResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Callback invoked from the backend's interrupt context with the new level.
pub type EdgeCallback = Box<dyn FnMut(bool) + Send + 'static>;

/// Which transitions an input subscription reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    /// Whether a transition to `level` matches this edge selector.
    pub fn matches(self, level: bool) -> bool {
        match self {
            Edge::Rising => level,
            Edge::Falling => !level,
            Edge::Both => true,
        }
    }
}

/// Input bias applied when an input pin is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pull {
    #[default]
    None,
    Up,
    Down,
}

/// A push-pull output line (step, direction, mode straps, valves, LEDs, SD mute).
pub trait DigitalOutput: Send {
    fn set_level(&mut self, high: bool) -> HwResult<()>;
    /// Last level written to the line.
    fn level(&self) -> bool;
}

/// An input line with optional edge notification.
pub trait DigitalInput: Send {
    fn is_high(&self) -> HwResult<bool>;
    /// Register `callback` for `edge`; replaces any previous subscription.
    fn subscribe(&mut self, edge: Edge, callback: EdgeCallback) -> HwResult<()>;
}

/// 16-bit I/O expander with interrupt-on-change (MCP23017 style).
pub trait PortExpander: Send {
    /// Configure every pin as an input with interrupt-on-change enabled.
    fn configure_inputs(&mut self) -> HwResult<()>;
    /// Bit mask of pins that raised the pending interrupt.
    fn interrupt_flags(&mut self) -> HwResult<u16>;
    /// Pin levels captured at the time of the interrupt; reading clears it.
    fn captured_levels(&mut self) -> HwResult<u16>;
    /// Current port levels.
    fn levels(&mut self) -> HwResult<u16>;
}

/// Mono PCM sink. Implementations must not call back into the controller.
pub trait AudioOutput: Send {
    fn play(&mut self, channel: u8, samples: &[i16], fs: u32) -> HwResult<()>;
    fn stop(&mut self) -> HwResult<()>;
    fn is_busy(&self) -> bool;
}

/// Factory for the lines a configuration names.
pub trait Board: Send + Sync {
    fn output(&self, pin: u8) -> HwResult<Box<dyn DigitalOutput>>;
    fn input(&self, pin: u8, pull: Pull) -> HwResult<Box<dyn DigitalInput>>;
    fn expander(&self, bus: u8, address: u16) -> HwResult<Box<dyn PortExpander>>;
    fn audio(&self, device: Option<&str>) -> HwResult<Box<dyn AudioOutput>>;
}
