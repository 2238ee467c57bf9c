//! Simulated board: every line is an in-memory level that tests can drive
//! and inspect. Edge callbacks run synchronously on the driving thread.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reward_traits::{
    AudioOutput, Board, DigitalInput, DigitalOutput, Edge, EdgeCallback, HwResult, PortExpander,
    Pull,
};

use crate::error::HwError;

static NEXT_SUBSCRIBER: AtomicU64 = AtomicU64::new(1);

struct Subscription {
    id: u64,
    edge: Edge,
    callback: EdgeCallback,
}

/// One simulated GPIO line shared by every handle opened on the same pin.
#[derive(Default)]
pub struct SimLine {
    level: AtomicBool,
    writes: Mutex<Vec<bool>>,
    subscribers: Mutex<Vec<Subscription>>,
}

impl SimLine {
    pub fn level(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }

    /// Drive the line from outside (sensor, button, interrupt source).
    /// Matching subscribers fire only when the level actually changes.
    pub fn drive(&self, high: bool) {
        let prev = self.level.swap(high, Ordering::SeqCst);
        if prev == high {
            return;
        }
        let mut subs = self.subscribers.lock();
        for sub in subs.iter_mut() {
            if sub.edge.matches(high) {
                (sub.callback)(high);
            }
        }
    }

    /// Drive a full low-high-low pulse.
    pub fn pulse(&self) {
        self.drive(true);
        self.drive(false);
    }

    /// Number of low-to-high transitions written through output handles.
    pub fn rising_writes(&self) -> usize {
        self.transitions(true)
    }

    /// Number of high-to-low transitions written through output handles.
    pub fn falling_writes(&self) -> usize {
        self.transitions(false)
    }

    fn transitions(&self, to: bool) -> usize {
        let writes = self.writes.lock();
        let mut prev = false;
        let mut n = 0;
        for &w in writes.iter() {
            if w != prev && w == to {
                n += 1;
            }
            prev = w;
        }
        n
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

struct SimOutput {
    line: Arc<SimLine>,
}

impl DigitalOutput for SimOutput {
    fn set_level(&mut self, high: bool) -> HwResult<()> {
        self.line.level.store(high, Ordering::SeqCst);
        self.line.writes.lock().push(high);
        Ok(())
    }

    fn level(&self) -> bool {
        self.line.level()
    }
}

struct SimInput {
    line: Arc<SimLine>,
    id: u64,
}

impl DigitalInput for SimInput {
    fn is_high(&self) -> HwResult<bool> {
        Ok(self.line.level())
    }

    fn subscribe(&mut self, edge: Edge, callback: EdgeCallback) -> HwResult<()> {
        let mut subs = self.line.subscribers.lock();
        subs.retain(|s| s.id != self.id);
        subs.push(Subscription {
            id: self.id,
            edge,
            callback,
        });
        Ok(())
    }
}

impl Drop for SimInput {
    fn drop(&mut self) {
        self.line.subscribers.lock().retain(|s| s.id != self.id);
    }
}

/// Register state of a simulated port expander.
#[derive(Debug, Default)]
pub struct SimExpanderState {
    configured: AtomicBool,
    regs: Mutex<ExpanderRegs>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ExpanderRegs {
    flags: u16,
    captured: u16,
    levels: u16,
}

impl SimExpanderState {
    /// Latch a change: `levels` becomes the port state and `flags` the pins
    /// that raised the interrupt. Flags accumulate until captured.
    pub fn latch(&self, levels: u16, flags: u16) {
        let mut r = self.regs.lock();
        r.levels = levels;
        r.flags |= flags;
        r.captured = levels;
    }

    pub fn pending_flags(&self) -> u16 {
        self.regs.lock().flags
    }

    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::SeqCst)
    }
}

struct SimExpander {
    state: Arc<SimExpanderState>,
}

impl PortExpander for SimExpander {
    fn configure_inputs(&mut self) -> HwResult<()> {
        self.state.configured.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn interrupt_flags(&mut self) -> HwResult<u16> {
        Ok(self.state.regs.lock().flags)
    }

    fn captured_levels(&mut self) -> HwResult<u16> {
        let mut r = self.state.regs.lock();
        r.flags = 0;
        Ok(r.captured)
    }

    fn levels(&mut self) -> HwResult<u16> {
        Ok(self.state.regs.lock().levels)
    }
}

/// A clip handed to the simulated audio sink.
#[derive(Debug, Clone)]
pub struct PlayedClip {
    pub channel: u8,
    pub samples: Vec<i16>,
    pub fs: u32,
}

#[derive(Debug, Default)]
pub struct SimAudioState {
    played: Mutex<Vec<PlayedClip>>,
    ends_at: Mutex<Option<Instant>>,
    stops: AtomicU64,
}

impl SimAudioState {
    pub fn played(&self) -> Vec<PlayedClip> {
        self.played.lock().clone()
    }

    pub fn stop_count(&self) -> u64 {
        self.stops.load(Ordering::SeqCst)
    }
}

struct SimAudio {
    state: Arc<SimAudioState>,
}

impl AudioOutput for SimAudio {
    fn play(&mut self, channel: u8, samples: &[i16], fs: u32) -> HwResult<()> {
        if fs == 0 {
            return Err(Box::new(HwError::Audio("sampling rate must be > 0".into())));
        }
        let dur = Duration::from_secs_f64(samples.len() as f64 / f64::from(fs));
        *self.state.ends_at.lock() = Some(Instant::now() + dur);
        self.state.played.lock().push(PlayedClip {
            channel,
            samples: samples.to_vec(),
            fs,
        });
        Ok(())
    }

    fn stop(&mut self) -> HwResult<()> {
        *self.state.ends_at.lock() = None;
        self.state.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_busy(&self) -> bool {
        matches!(*self.state.ends_at.lock(), Some(t) if Instant::now() < t)
    }
}

/// In-memory board used by tests and `--simulate` servers.
#[derive(Default)]
pub struct SimBoard {
    lines: Mutex<HashMap<u8, Arc<SimLine>>>,
    expanders: Mutex<HashMap<(u8, u16), Arc<SimExpanderState>>>,
    audio: Arc<SimAudioState>,
}

impl SimBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared state of `pin`, created on first use.
    pub fn line(&self, pin: u8) -> Arc<SimLine> {
        self.lines.lock().entry(pin).or_default().clone()
    }

    pub fn expander_state(&self, bus: u8, address: u16) -> Arc<SimExpanderState> {
        self.expanders
            .lock()
            .entry((bus, address))
            .or_default()
            .clone()
    }

    pub fn audio_state(&self) -> Arc<SimAudioState> {
        self.audio.clone()
    }
}

impl Board for SimBoard {
    fn output(&self, pin: u8) -> HwResult<Box<dyn DigitalOutput>> {
        Ok(Box::new(SimOutput {
            line: self.line(pin),
        }))
    }

    fn input(&self, pin: u8, pull: Pull) -> HwResult<Box<dyn DigitalInput>> {
        let line = self.line(pin);
        if pull == Pull::Up && line.writes.lock().is_empty() {
            line.level.store(true, Ordering::SeqCst);
        }
        Ok(Box::new(SimInput {
            line,
            id: NEXT_SUBSCRIBER.fetch_add(1, Ordering::Relaxed),
        }))
    }

    fn expander(&self, bus: u8, address: u16) -> HwResult<Box<dyn PortExpander>> {
        Ok(Box::new(SimExpander {
            state: self.expander_state(bus, address),
        }))
    }

    fn audio(&self, _device: Option<&str>) -> HwResult<Box<dyn AudioOutput>> {
        Ok(Box::new(SimAudio {
            state: self.audio.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn output_writes_are_visible_on_the_line() {
        let board = SimBoard::new();
        let mut out = board.output(4).unwrap();
        out.set_level(true).unwrap();
        out.set_level(true).unwrap();
        out.set_level(false).unwrap();
        let line = board.line(4);
        assert!(!line.level());
        assert_eq!(line.rising_writes(), 1);
        assert_eq!(line.falling_writes(), 1);
    }

    #[test]
    fn input_callbacks_fire_on_matching_edges_only() {
        let board = SimBoard::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = hits.clone();
        let mut input = board.input(9, Pull::None).unwrap();
        input
            .subscribe(
                Edge::Rising,
                Box::new(move |_| {
                    hits_cb.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        let line = board.line(9);
        line.pulse();
        line.pulse();
        line.drive(false);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        drop(input);
        assert_eq!(line.subscriber_count(), 0);
    }

    #[test]
    fn expander_capture_clears_flags() {
        let board = SimBoard::new();
        let mut exp = board.expander(1, 0x20).unwrap();
        let state = board.expander_state(1, 0x20);
        state.latch(0b101, 0b100);
        assert_eq!(exp.interrupt_flags().unwrap(), 0b100);
        assert_eq!(exp.captured_levels().unwrap(), 0b101);
        assert_eq!(exp.interrupt_flags().unwrap(), 0);
    }
}
