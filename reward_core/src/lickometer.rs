//! Lick counting and burst tracking.
//!
//! A lickometer is fed rising edges either directly from its own GPIO input
//! or through a `LickBus` that demultiplexes an MCP23017 interrupt.
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use reward_traits::{DigitalInput, Edge, PortExpander};
use serde::Serialize;

use crate::error::Result;
use crate::event_log::EventLog;
use crate::hw_error::hw;
use crate::resource::{Resource, ResourceLock};
use crate::util::{SharedClock, positive_finite, secs};

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    licks: u64,
    burst_lick: u64,
    last_lick: Option<Instant>,
    in_burst: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LickStatus {
    pub licks: u64,
    pub burst_lick: u64,
    pub in_burst: bool,
    pub burst_thresh: f64,
}

pub struct Lickometer {
    name: String,
    lock: Arc<ResourceLock>,
    counts: Mutex<Counts>,
    burst_thresh: f64,
    clock: SharedClock,
    events: Arc<EventLog>,
    input: Mutex<Option<Box<dyn DigitalInput>>>,
}

impl std::fmt::Debug for Lickometer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lickometer")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

impl Lickometer {
    pub fn new(
        name: impl Into<String>,
        burst_thresh: f64,
        clock: SharedClock,
        events: Arc<EventLog>,
    ) -> Result<Arc<Self>> {
        positive_finite("burst_thresh", burst_thresh)?;
        let name = name.into();
        Ok(Arc::new(Self {
            lock: ResourceLock::new(name.clone()),
            name,
            counts: Mutex::new(Counts::default()),
            burst_thresh,
            clock,
            events,
            input: Mutex::new(None),
        }))
    }

    /// Count rising edges of `input` as licks. The handle is kept for the
    /// lifetime of the lickometer.
    pub fn attach(self: &Arc<Self>, mut input: Box<dyn DigitalInput>) -> Result<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        input
            .subscribe(
                Edge::Rising,
                Box::new(move |_| {
                    if let Some(lick) = weak.upgrade() {
                        lick.register_lick();
                    }
                }),
            )
            .map_err(hw)?;
        *self.input.lock() = Some(input);
        Ok(())
    }

    pub fn register_lick(&self) {
        {
            let mut c = self.counts.lock();
            c.licks += 1;
            c.burst_lick += 1;
            c.last_lick = Some(self.clock.now());
            c.in_burst = true;
        }
        self.events.info(&format!("lick,{}", self.name));
    }

    /// Clear burst state once the last lick is older than the threshold.
    pub fn update(&self, now: Instant) {
        let thresh = secs(self.burst_thresh);
        let mut c = self.counts.lock();
        if let Some(last) = c.last_lick
            && now.saturating_duration_since(last) > thresh
        {
            c.burst_lick = 0;
            c.in_burst = false;
        }
    }

    pub fn reset_licks(&self) {
        self.counts.lock().licks = 0;
    }

    pub fn licks(&self) -> u64 {
        self.counts.lock().licks
    }

    pub fn burst_lick(&self) -> u64 {
        self.counts.lock().burst_lick
    }

    pub fn in_burst(&self) -> bool {
        self.counts.lock().in_burst
    }

    pub fn status(&self) -> LickStatus {
        let c = *self.counts.lock();
        LickStatus {
            licks: c.licks,
            burst_lick: c.burst_lick,
            in_burst: c.in_burst,
            burst_thresh: self.burst_thresh,
        }
    }
}

impl Resource for Lickometer {
    fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> &Arc<ResourceLock> {
        &self.lock
    }
}

/// Many lickometers behind one port expander and one interrupt line.
pub struct LickBus {
    expander: Mutex<Box<dyn PortExpander>>,
    inputs: Mutex<HashMap<u8, Arc<Lickometer>>>,
    interrupt: Mutex<Option<Box<dyn DigitalInput>>>,
}

impl LickBus {
    pub fn new(mut expander: Box<dyn PortExpander>) -> Result<Arc<Self>> {
        expander.configure_inputs().map_err(hw)?;
        Ok(Arc::new(Self {
            expander: Mutex::new(expander),
            inputs: Mutex::new(HashMap::new()),
            interrupt: Mutex::new(None),
        }))
    }

    /// Route licks on expander input `bit` (0..16) to `lick`.
    pub fn map(&self, bit: u8, lick: Arc<Lickometer>) {
        self.inputs.lock().insert(bit, lick);
    }

    /// The expander's INT output is active low.
    pub fn attach(self: &Arc<Self>, mut interrupt: Box<dyn DigitalInput>) -> Result<()> {
        let weak = Arc::downgrade(self);
        interrupt
            .subscribe(
                Edge::Falling,
                Box::new(move |_| {
                    if let Some(bus) = weak.upgrade()
                        && let Err(e) = bus.on_interrupt()
                    {
                        tracing::error!(error = %e, "lick bus read failed");
                    }
                }),
            )
            .map_err(hw)?;
        *self.interrupt.lock() = Some(interrupt);
        Ok(())
    }

    /// Read flags and captured levels (clearing the interrupt) and register
    /// a lick for every flagged input captured high.
    pub fn on_interrupt(&self) -> Result<()> {
        let (flags, levels) = {
            let mut exp = self.expander.lock();
            let flags = exp.interrupt_flags().map_err(hw)?;
            let levels = exp.captured_levels().map_err(hw)?;
            (flags, levels)
        };
        let hits = flags & levels;
        if hits == 0 {
            return Ok(());
        }
        let inputs = self.inputs.lock();
        for bit in 0..16u8 {
            if hits & (1 << bit) != 0 {
                match inputs.get(&bit) {
                    Some(lick) => lick.register_lick(),
                    None => tracing::trace!(bit, "edge on unmapped expander input"),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use reward_hardware::SimBoard;
    use reward_traits::{Board, Clock, Pull, TestClock};

    fn lick(clock: &TestClock) -> Arc<Lickometer> {
        Lickometer::new("A", 0.5, Arc::new(clock.clone()), Arc::new(EventLog::new())).unwrap()
    }

    #[test]
    fn rising_edges_count_and_burst_expires() {
        let board = SimBoard::new();
        let clock = TestClock::new();
        let l = lick(&clock);
        l.attach(board.input(4, Pull::None).unwrap()).unwrap();
        let line = board.line(4);
        for _ in 0..3 {
            line.pulse();
        }
        assert_eq!(l.licks(), 3);
        assert!(l.in_burst());
        clock.advance(Duration::from_millis(400));
        l.update(clock.now());
        assert_eq!(l.burst_lick(), 3);
        clock.advance(Duration::from_millis(200));
        l.update(clock.now());
        assert_eq!(l.burst_lick(), 0);
        assert!(!l.in_burst());
        assert_eq!(l.licks(), 3);
    }

    #[test]
    fn bus_registers_flagged_inputs_captured_high() {
        let board = SimBoard::new();
        let clock = TestClock::new();
        let a = lick(&clock);
        let b = lick(&clock);
        let bus = LickBus::new(board.expander(1, 0x20).unwrap()).unwrap();
        bus.map(0, a.clone());
        bus.map(3, b.clone());
        bus.attach(board.input(26, Pull::Up).unwrap()).unwrap();
        let state = board.expander_state(1, 0x20);
        assert!(state.is_configured());

        // input 0 rises, input 3 falls
        state.latch(0b0001, 0b1001);
        let int = board.line(26);
        int.drive(false);
        int.drive(true);
        assert_eq!(a.licks(), 1);
        assert_eq!(b.licks(), 0);
        assert_eq!(state.pending_flags(), 0);
    }
}
