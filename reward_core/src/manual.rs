//! Physical flush / reverse / end-of-track buttons of a pump.
//!
//! Edge callbacks only forward events to a worker thread; the worker owns
//! all motion. A press is acted on only when the pump lock is free.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel as xch;
use reward_hardware::util::Debouncer;
use reward_traits::{DigitalInput, Edge};

use crate::error::{Result, RewardError};
use crate::hw_error::hw;
use crate::pump::{Direction, Pump, StepType};
use crate::resource::{Holder, Resource};
use crate::util::SharedClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Flush,
    Reverse,
    End,
}

#[derive(Debug, Clone, Copy)]
struct Press {
    button: Button,
    at: Instant,
}

/// Input lines of the buttons present on a pump.
#[derive(Default)]
pub struct ButtonInputs {
    pub flush: Option<Box<dyn DigitalInput>>,
    pub reverse: Option<Box<dyn DigitalInput>>,
    pub end: Option<Box<dyn DigitalInput>>,
}

#[derive(Debug, Clone, Copy)]
pub struct ButtonSettings {
    pub active_low: bool,
    pub debounce: Duration,
}

pub struct ManualControl {
    _inputs: Vec<Box<dyn DigitalInput>>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Held {
    flush: AtomicBool,
    reverse: AtomicBool,
}

impl Held {
    fn flag(&self, b: Button) -> Option<&AtomicBool> {
        match b {
            Button::Flush => Some(&self.flush),
            Button::Reverse => Some(&self.reverse),
            Button::End => None,
        }
    }
}

impl ManualControl {
    /// Subscribe to the given inputs and start the worker. Returns `None`
    /// when the pump has no buttons.
    pub fn spawn(
        pump: Arc<Pump>,
        inputs: ButtonInputs,
        settings: ButtonSettings,
        clock: SharedClock,
        shutdown: xch::Receiver<()>,
    ) -> Result<Option<Self>> {
        let (tx, rx) = xch::unbounded::<Press>();
        let held = Arc::new(Held::default());
        let mut kept = Vec::new();
        for (button, input) in [
            (Button::Flush, inputs.flush),
            (Button::Reverse, inputs.reverse),
            (Button::End, inputs.end),
        ] {
            let Some(mut input) = input else { continue };
            let tx = tx.clone();
            let held = held.clone();
            let clock = clock.clone();
            let active_low = settings.active_low;
            input
                .subscribe(
                    Edge::Both,
                    Box::new(move |level| {
                        let pressed = level != active_low;
                        if let Some(flag) = held.flag(button) {
                            flag.store(pressed, Ordering::SeqCst);
                        }
                        if pressed {
                            let _ = tx.send(Press {
                                button,
                                at: clock.now(),
                            });
                        }
                    }),
                )
                .map_err(hw)?;
            kept.push(input);
        }
        if kept.is_empty() {
            return Ok(None);
        }
        let worker = Worker {
            pump,
            held,
            debounce: [Button::Flush, Button::Reverse, Button::End]
                .map(|_| Debouncer::new(settings.debounce)),
            shutdown,
        };
        let handle = std::thread::Builder::new()
            .name("manual-buttons".into())
            .spawn(move || worker.run(rx))?;
        Ok(Some(Self {
            _inputs: kept,
            handle: Some(handle),
        }))
    }

    /// Wait for the worker; it exits once the shutdown channel closes.
    pub fn join(mut self) {
        if let Some(h) = self.handle.take()
            && let Err(e) = h.join()
        {
            tracing::warn!(?e, "manual button worker panicked");
        }
    }
}

struct Worker {
    pump: Arc<Pump>,
    held: Arc<Held>,
    debounce: [Debouncer; 3],
    shutdown: xch::Receiver<()>,
}

impl Worker {
    fn run(mut self, rx: xch::Receiver<Press>) {
        let shutdown = self.shutdown.clone();
        loop {
            xch::select! {
                recv(rx) -> press => match press {
                    Ok(p) => self.on_press(p),
                    Err(_) => break,
                },
                recv(shutdown) -> _ => break,
            }
        }
        tracing::trace!(pump = %self.pump.name(), "manual button worker exiting cleanly");
    }

    fn on_press(&mut self, p: Press) {
        let idx = p.button as usize;
        if !self.debounce[idx].accept(p.at) {
            return;
        }
        let result = match p.button {
            Button::Flush => self.drive(Button::Flush, Direction::Forward),
            Button::Reverse => self.drive(Button::Reverse, Direction::Backward),
            Button::End => self.pump.calibrate(Holder::new()),
        };
        match result {
            Ok(()) => {}
            Err(RewardError::ResourceLocked(_)) => {
                tracing::debug!(pump = %self.pump.name(), button = ?p.button, "pump busy, press skipped");
            }
            Err(e) => {
                tracing::error!(pump = %self.pump.name(), button = ?p.button, error = %e, "manual control failed");
            }
        }
    }

    fn shutting_down(&self) -> bool {
        matches!(self.shutdown.try_recv(), Err(xch::TryRecvError::Disconnected))
    }

    /// Step at full-step resolution for as long as the button stays down.
    fn drive(&self, button: Button, direction: Direction) -> Result<()> {
        let holder = Holder::new();
        let _guard = self.pump.try_acquire(holder)?;
        let Some(flag) = self.held.flag(button) else {
            return Ok(());
        };
        let prev = self.pump.step_type();
        self.pump.set_step_type(holder, StepType::Full)?;
        tracing::info!(pump = %self.pump.name(), ?direction, "manual motion started");
        let mut steps = 0u64;
        let mut result = Ok(());
        while flag.load(Ordering::SeqCst) && !self.shutting_down() {
            if let Err(e) = self.pump.single_step(holder, Some(direction), true, false) {
                result = Err(e);
                break;
            }
            steps += 1;
        }
        let restored = self.pump.set_step_type(holder, prev);
        tracing::info!(pump = %self.pump.name(), steps, "manual motion stopped");
        result.and(restored)
    }
}
