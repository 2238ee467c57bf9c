//! Controller facade: owns every resource built from the configuration and
//! exposes the command surface served to clients.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel as xch;
use eyre::WrapErr;
use indexmap::IndexMap;
use parking_lot::Mutex;
use reward_config::{Config, PluginKind};
use reward_traits::{Board, DigitalInput, Edge, Pull};
use serde_json::{Value, json};

use crate::audio::{AudioMixer, Speaker};
use crate::autofill::{AUTO_FILL_PERIOD, AutoFill, spawn_periodic};
use crate::delivery::{
    FillTask, PumpTask, RewardRequest, RewardTask, TaskContext, TaskKind, TriggeredTask,
};
use crate::error::{Result, RewardError};
use crate::event_log::EventLog;
use crate::hw_error::hw;
use crate::led::Led;
use crate::lickometer::{LickBus, Lickometer};
use crate::manual::{ButtonInputs, ButtonSettings, ManualControl};
use crate::module::{Module, ModuleSettings};
use crate::persist::{PositionJournal, PositionStore};
use crate::pump::{Direction, MoveOptions, Pump, PumpPins, PumpSettings, StepType};
use crate::resource::{Holder, LockSet, LockWait, Resource};
use crate::syringe::Syringe;
use crate::util::SharedClock;
use crate::valve::{Polarity, Valve};

/// Flags of `Controller::trigger_reward`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RewardOptions {
    /// Stop an active reward on the same pump first.
    pub force: bool,
    /// Deliver on the calling thread.
    pub sync: bool,
    /// Append to the active reward task of the pump.
    pub enqueue: bool,
    /// Deliver while the module's lick trigger holds.
    pub triggered: bool,
}

/// Start-up switches not carried by the configuration file.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControllerOptions {
    /// Ignore stored positions and start every pump at 0.
    pub reset_positions: bool,
}

/// Resources not bound to a module.
#[derive(Default)]
struct Plugins {
    valves: IndexMap<String, Arc<Valve>>,
    leds: IndexMap<String, Arc<Led>>,
    lickometers: IndexMap<String, Arc<Lickometer>>,
}

type Slot = Mutex<Option<Arc<PumpTask>>>;

/// State shared with background workers.
struct Core {
    pumps: IndexMap<String, Arc<Pump>>,
    modules: IndexMap<String, Arc<Module>>,
    plugins: Plugins,
    slots: IndexMap<String, Slot>,
    mixer: Option<AudioMixer>,
    events: Arc<EventLog>,
    autofill: AutoFill,
    clock: SharedClock,
}

impl Core {
    fn ctx(&self) -> TaskContext {
        TaskContext {
            events: self.events.clone(),
            clock: self.clock.clone(),
        }
    }

    fn pump(&self, name: &str) -> Result<&Arc<Pump>> {
        self.pumps
            .get(name)
            .ok_or_else(|| RewardError::MissingResource(format!("pump '{name}'")))
    }

    fn slot(&self, pump: &str) -> Result<&Slot> {
        self.slots
            .get(pump)
            .ok_or_else(|| RewardError::MissingResource(format!("pump '{pump}'")))
    }

    fn modules_of(&self, pump: &str) -> Vec<Arc<Module>> {
        self.modules
            .values()
            .filter(|m| m.pump.name() == pump)
            .cloned()
            .collect()
    }

    fn lickometers(&self) -> Vec<Arc<Lickometer>> {
        self.modules
            .values()
            .filter_map(|m| m.lickometer.clone())
            .chain(self.plugins.lickometers.values().cloned())
            .collect()
    }

    /// Start a fill task for every listed pump whose slot is free.
    fn schedule_fills(&self) {
        for name in self.autofill.pending() {
            if !self.autofill.is_enabled() {
                return;
            }
            let (Some(pump), Some(slot)) = (self.pumps.get(&name), self.slots.get(&name)) else {
                self.autofill.needs_refilling().lock().shift_remove(&name);
                continue;
            };
            let mut slot = slot.lock();
            if slot.as_ref().is_some_and(|t| t.is_alive()) {
                continue;
            }
            let task = FillTask::new(
                pump.clone(),
                self.modules_of(&name),
                self.autofill.needs_refilling().clone(),
                self.ctx(),
            );
            match task.start() {
                Ok(()) => {
                    tracing::info!(pump = %name, "auto-fill started");
                    *slot = Some(Arc::new(PumpTask::Fill(task)));
                }
                Err(e) => tracing::debug!(pump = %name, error = %e, "auto-fill deferred"),
            }
        }
    }
}

struct Lifecycle {
    shutdown_tx: Option<xch::Sender<()>>,
    workers: Vec<JoinHandle<()>>,
    manual: Vec<ManualControl>,
    journal: Option<PositionJournal>,
}

pub struct Controller {
    core: Arc<Core>,
    store: PositionStore,
    data_dir: PathBuf,
    lock_wait: Duration,
    burst_period: Duration,
    journal_period: Duration,
    buttons: Mutex<Vec<(Arc<Pump>, ButtonInputs, ButtonSettings)>>,
    lifecycle: Mutex<Lifecycle>,
    // Kept for their edge subscriptions.
    _lick_bus: Option<Arc<LickBus>>,
    _clock_input: Mutex<Option<Box<dyn DigitalInput>>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("pumps", &self.core.pumps.keys().collect::<Vec<_>>())
            .field("modules", &self.core.modules.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn input_pull(active_low: bool) -> Pull {
    if active_low { Pull::Up } else { Pull::Down }
}

impl Controller {
    /// Build every resource named by `cfg` on `board`.
    pub fn from_config(
        cfg: &Config,
        board: Arc<dyn Board>,
        clock: SharedClock,
        opts: ControllerOptions,
    ) -> eyre::Result<Self> {
        cfg.validate()?;
        let events = Arc::new(EventLog::new());
        let store = PositionStore::new(&cfg.state_dir)
            .wrap_err_with(|| format!("state dir {}", cfg.state_dir.display()))?;

        let mut pumps = IndexMap::new();
        let mut buttons = Vec::new();
        for (name, p) in &cfg.pumps {
            let fill_valve = match p.fill_valve_pin {
                Some(pin) => Some(Arc::new(Valve::new(
                    format!("{name}.fill"),
                    board.output(pin).map_err(hw)?,
                    Polarity::from_nc(p.fill_valve_nc),
                    Duration::from_millis(p.settle_ms),
                    clock.clone(),
                )?)),
                None => None,
            };
            let pins = PumpPins {
                step: board.output(p.step_pin).map_err(hw)?,
                dir: board.output(p.dir_pin).map_err(hw)?,
                mode: [
                    board.output(p.ms_pins[0]).map_err(hw)?,
                    board.output(p.ms_pins[1]).map_err(hw)?,
                    board.output(p.ms_pins[2]).map_err(hw)?,
                ],
            };
            let settings = PumpSettings {
                syringe: Syringe::from_key(&p.syringe)?,
                step_type: p.step_type.parse::<StepType>()?,
                step_delay: p.step_delay,
                pitch: p.pitch,
                invert_direction: p.invert_direction,
            };
            let pump = Arc::new(Pump::new(name.clone(), pins, settings, fill_valve, clock.clone())?);

            let position = if opts.reset_positions {
                store
                    .save(name, 0.0)
                    .wrap_err_with(|| format!("reset position of {name}"))?;
                0.0
            } else {
                store.load(name)
            };
            pump.set_position(Holder::new(), position)?;
            tracing::info!(pump = %name, position, "pump ready");

            let pull = input_pull(p.buttons_active_low);
            let open_in = |pin: Option<u8>| -> Result<Option<Box<dyn DigitalInput>>> {
                pin.map(|pin| board.input(pin, pull).map_err(hw)).transpose()
            };
            let inputs = ButtonInputs {
                flush: open_in(p.flush_pin)?,
                reverse: open_in(p.reverse_pin)?,
                end: open_in(p.end_pin)?,
            };
            if inputs.flush.is_some() || inputs.reverse.is_some() || inputs.end.is_some() {
                buttons.push((
                    pump.clone(),
                    inputs,
                    ButtonSettings {
                        active_low: p.buttons_active_low,
                        debounce: Duration::from_millis(p.debounce_ms),
                    },
                ));
            }
            pumps.insert(name.clone(), pump);
        }

        let lick_bus = match &cfg.lick_bus {
            Some(b) => {
                let bus = LickBus::new(board.expander(b.i2c_bus, b.address).map_err(hw)?)?;
                bus.attach(board.input(b.interrupt_pin, Pull::Up).map_err(hw)?)?;
                Some(bus)
            }
            None => None,
        };

        let mixer = if cfg.speakers.is_empty() {
            None
        } else {
            let mut speakers = IndexMap::new();
            for (name, s) in &cfg.speakers {
                speakers.insert(
                    name.clone(),
                    Speaker::new(board.output(s.sd_pin).map_err(hw)?, s.channel)?,
                );
            }
            let output = board.audio(cfg.audio.device.as_deref()).map_err(hw)?;
            Some(AudioMixer::new(cfg.audio.fs, output, speakers))
        };

        let mut modules = IndexMap::new();
        for (name, m) in &cfg.modules {
            let pump = pumps
                .get(&m.pump)
                .cloned()
                .ok_or_else(|| eyre::eyre!("modules.{name}.pump '{}' is not configured", m.pump))?;
            let valve = Arc::new(Valve::new(
                name.clone(),
                board.output(m.valve_pin).map_err(hw)?,
                Polarity::from_nc(m.valve_nc),
                Duration::from_millis(m.settle_ms),
                clock.clone(),
            )?);
            let mut module = Module::new(
                name.clone(),
                m.kind.clone(),
                pump,
                valve,
                ModuleSettings {
                    dead_volume: m.dead_volume,
                    post_delay: m.post_delay,
                    reward_thresh: u64::from(m.reward_thresh),
                },
            );
            if m.lick_pin.is_some() || m.lick_bus_pin.is_some() {
                let lick =
                    Lickometer::new(name.clone(), m.burst_thresh, clock.clone(), events.clone())?;
                if let Some(pin) = m.lick_pin {
                    lick.attach(board.input(pin, Pull::Down).map_err(hw)?)?;
                }
                if let (Some(bit), Some(bus)) = (m.lick_bus_pin, &lick_bus) {
                    bus.map(bit, lick.clone());
                }
                module = module.with_lickometer(lick);
            }
            if let Some(pin) = m.led_pin {
                module = module.with_led(Arc::new(Led::new(
                    format!("{name}.led"),
                    board.output(pin).map_err(hw)?,
                )?));
            }
            if let Some(spk) = &m.speaker {
                module = module.with_speaker(spk.clone());
            }
            modules.insert(name.clone(), Arc::new(module));
        }

        let mut plugins = Plugins::default();
        for (name, p) in &cfg.plugins {
            match p.kind {
                PluginKind::Valve => {
                    let v = Valve::new(
                        name.clone(),
                        board.output(p.pin).map_err(hw)?,
                        Polarity::from_nc(p.nc),
                        Duration::from_millis(20),
                        clock.clone(),
                    )?;
                    plugins.valves.insert(name.clone(), Arc::new(v));
                }
                PluginKind::Led => {
                    let led = Led::new(name.clone(), board.output(p.pin).map_err(hw)?)?;
                    plugins.leds.insert(name.clone(), Arc::new(led));
                }
                PluginKind::Lickometer => {
                    let lick =
                        Lickometer::new(name.clone(), p.burst_thresh, clock.clone(), events.clone())?;
                    lick.attach(board.input(p.pin, Pull::Down).map_err(hw)?)?;
                    plugins.lickometers.insert(name.clone(), lick);
                }
            }
        }

        let clock_input = match &cfg.clock {
            Some(c) => {
                let mut input = board.input(c.pin, input_pull(c.active_low)).map_err(hw)?;
                let edge = if c.active_low { Edge::Falling } else { Edge::Rising };
                let ev = events.clone();
                input
                    .subscribe(edge, Box::new(move |_| ev.info("clock")))
                    .map_err(hw)?;
                Some(input)
            }
            None => None,
        };

        let slots = pumps.keys().map(|k| (k.clone(), Mutex::new(None))).collect();
        let core = Core {
            pumps,
            modules,
            plugins,
            slots,
            mixer,
            events,
            autofill: AutoFill::new(cfg.controller.auto_fill, cfg.controller.auto_fill_frac_thresh)?,
            clock,
        };
        Ok(Self {
            core: Arc::new(core),
            store,
            data_dir: cfg.data_dir.clone(),
            lock_wait: Duration::from_millis(cfg.controller.lock_wait_ms),
            burst_period: Duration::from_millis(cfg.controller.burst_update_ms),
            journal_period: Duration::from_millis(cfg.controller.journal_ms),
            buttons: Mutex::new(buttons),
            lifecycle: Mutex::new(Lifecycle {
                shutdown_tx: None,
                workers: Vec::new(),
                manual: Vec::new(),
                journal: None,
            }),
            _lick_bus: lick_bus,
            _clock_input: Mutex::new(clock_input),
        })
    }

    // ----- lookups -----

    pub fn pump(&self, name: &str) -> Result<&Arc<Pump>> {
        self.core.pump(name)
    }

    pub fn module(&self, name: &str) -> Result<&Arc<Module>> {
        self.core
            .modules
            .get(name)
            .ok_or_else(|| RewardError::MissingResource(format!("module '{name}'")))
    }

    pub fn pump_names(&self) -> impl Iterator<Item = &str> {
        self.core.pumps.keys().map(String::as_str)
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.core.modules.keys().map(String::as_str)
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.core.events
    }

    pub fn position_store(&self) -> &PositionStore {
        &self.store
    }

    /// The most recent task of `pump`, running or finished.
    pub fn task(&self, pump: &str) -> Result<Option<Arc<PumpTask>>> {
        Ok(self.core.slot(pump)?.lock().clone())
    }

    /// Wait until the active task of `pump` (if any) has finished.
    pub fn wait_pump(&self, pump: &str) -> Result<()> {
        if let Some(task) = self.task(pump)? {
            task.wait(Duration::from_millis(1));
        }
        Ok(())
    }

    pub fn needs_refilling(&self) -> Vec<String> {
        self.core.autofill.pending()
    }

    fn valve(&self, name: &str) -> Result<&Arc<Valve>> {
        if let Some(m) = self.core.modules.get(name) {
            return Ok(&m.valve);
        }
        if let Some(v) = self.core.plugins.valves.get(name) {
            return Ok(v);
        }
        let pump_name = name.strip_suffix(".fill").unwrap_or(name);
        self.core
            .pumps
            .get(pump_name)
            .and_then(|p| p.fill_valve())
            .ok_or_else(|| RewardError::MissingResource(format!("valve '{name}'")))
    }

    fn led(&self, name: &str) -> Result<&Arc<Led>> {
        if let Some(led) = self.core.modules.get(name).and_then(|m| m.led.as_ref()) {
            return Ok(led);
        }
        self.core
            .plugins
            .leds
            .get(name)
            .ok_or_else(|| RewardError::MissingResource(format!("LED '{name}'")))
    }

    fn lickometer(&self, name: &str) -> Result<&Arc<Lickometer>> {
        if let Some(m) = self.core.modules.get(name) {
            return m.lickometer();
        }
        self.core
            .plugins
            .lickometers
            .get(name)
            .ok_or_else(|| RewardError::MissingResource(format!("lickometer '{name}'")))
    }

    fn mixer(&self) -> Result<&AudioMixer> {
        self.core
            .mixer
            .as_ref()
            .ok_or_else(|| RewardError::MissingResource("no speakers configured".into()))
    }

    // ----- delivery -----

    /// Deliver `amount` mL at `module`.
    pub fn trigger_reward(&self, module: &str, amount: f64, opts: RewardOptions) -> Result<()> {
        if opts.sync && opts.enqueue {
            return Err(RewardError::InvalidArgument(
                "sync and enqueue cannot be combined".into(),
            ));
        }
        if opts.sync && opts.triggered {
            return Err(RewardError::InvalidArgument(
                "sync and triggered cannot be combined".into(),
            ));
        }
        let module = self.module(module)?.clone();
        let pump = module.pump.clone();
        let mut slot = self.core.slot(pump.name())?.lock();

        if let Some(active) = slot.as_ref().filter(|t| t.is_alive()).cloned() {
            match active.kind() {
                TaskKind::Fill => {
                    tracing::info!(pump = %pump.name(), "stopping refill for reward");
                    active.stop();
                    active.join();
                }
                _ if opts.force => {
                    tracing::info!(pump = %pump.name(), "stopping active reward (force)");
                    active.stop();
                    active.join();
                }
                TaskKind::Reward if opts.enqueue && !opts.triggered => {
                    if let PumpTask::Reward(task) = &*active {
                        let req = RewardRequest {
                            module: module.clone(),
                            amount,
                        };
                        if task.enqueue(req)? {
                            return Ok(());
                        }
                    }
                    // Drained: the worker is only releasing its locks now.
                    active.wait(Duration::from_millis(1));
                }
                _ => {
                    return Err(RewardError::ResourceLocked(format!(
                        "pump {} is busy",
                        pump.name()
                    )));
                }
            }
        }

        if opts.triggered {
            let task = TriggeredTask::new(module, amount, self.core.ctx());
            let started = task.start();
            *slot = Some(Arc::new(PumpTask::Triggered(task)));
            return started;
        }

        let req = RewardRequest { module, amount };
        let task = RewardTask::new(pump, req, self.core.ctx());
        if opts.sync {
            let task = Arc::new(PumpTask::Reward(task));
            *slot = Some(task.clone());
            drop(slot);
            return match &*task {
                PumpTask::Reward(t) => t.run_sync().map(|_| ()),
                _ => Ok(()),
            };
        }
        let started = task.start();
        *slot = Some(Arc::new(PumpTask::Reward(task)));
        started
    }

    /// Refill the syringe of `pump` through its fill valve.
    pub fn refill_syringe(&self, pump: &str, sync: bool) -> Result<()> {
        let p = self.core.pump(pump)?.clone();
        let mut slot = self.core.slot(pump)?.lock();
        if slot.as_ref().is_some_and(|t| t.is_alive()) {
            return Err(RewardError::ResourceLocked(format!("pump {pump} is busy")));
        }
        let task = FillTask::new(
            p,
            self.core.modules_of(pump),
            self.core.autofill.needs_refilling().clone(),
            self.core.ctx(),
        );
        if sync {
            let task = Arc::new(PumpTask::Fill(task));
            *slot = Some(task.clone());
            drop(slot);
            return match &*task {
                PumpTask::Fill(t) => t.run_sync().map(|_| ()),
                _ => Ok(()),
            };
        }
        let started = task.start();
        *slot = Some(Arc::new(PumpTask::Fill(task)));
        started
    }

    /// Stop the active task of `pump` and wait for it.
    pub fn stop_pump(&self, pump: &str) -> Result<()> {
        let p = self.core.pump(pump)?;
        let active = self.core.slot(pump)?.lock().clone();
        if let Some(task) = active {
            task.stop();
            task.join();
        }
        p.disable();
        tracing::info!(pump, "pump stopped");
        Ok(())
    }

    /// Locks for a compound operation on `modules`: every pump, then every
    /// fill valve, then every delivery valve.
    fn lock_compound(&self, holder: Holder, modules: &[Arc<Module>]) -> Result<LockSet> {
        let mut pumps: IndexMap<String, Arc<Pump>> = IndexMap::new();
        for m in modules {
            pumps.insert(m.pump.name().to_string(), m.pump.clone());
        }
        let mut locks = LockSet::new(holder, LockWait::Timeout(self.lock_wait));
        for p in pumps.values() {
            let pump: &Pump = p;
            locks.take(pump)?;
        }
        for p in pumps.values() {
            if let Some(fill) = p.fill_valve() {
                let fill: &Valve = fill;
                locks.take(fill)?;
            }
        }
        for name in pumps.keys() {
            for m in self.core.modules_of(name) {
                let valve: &Valve = &m.valve;
                locks.take(valve)?;
            }
        }
        Ok(locks)
    }

    fn select_modules(&self, names: Option<&[String]>) -> Result<Vec<Arc<Module>>> {
        match names {
            Some(names) => names.iter().map(|n| self.module(n).cloned()).collect(),
            None => Ok(self.core.modules.values().cloned().collect()),
        }
    }

    /// Fill the tubing of `modules` (all when `None`) from the reservoirs.
    pub fn fill_lines(
        &self,
        modules: Option<&[String]>,
        prime_amount: f64,
        res_amount: f64,
    ) -> Result<()> {
        for (what, v) in [("prime_amount", prime_amount), ("res_amount", res_amount)] {
            if !(v.is_finite() && v >= 0.0) {
                return Err(RewardError::InvalidArgument(format!("{what} must be >= 0, got {v}")));
            }
        }
        let modules = self.select_modules(modules)?;
        let holder = Holder::new();
        let was_auto = self.core.autofill.swap(false);
        let result = self.lock_compound(holder, &modules).and_then(|_locks| {
            let mut pumps: IndexMap<String, Arc<Pump>> = IndexMap::new();
            for m in &modules {
                pumps.insert(m.pump.name().to_string(), m.pump.clone());
            }
            for p in pumps.values() {
                for m in self.core.modules_of(p.name()) {
                    m.valve.close(holder)?;
                }
            }
            // Reservoir priming: draw liquid into the reservoir tubing.
            for p in pumps.values() {
                if let Some(fill) = p.fill_valve()
                    && res_amount > 0.0
                {
                    let room = p.syringe().volume - p.vol_left();
                    let amount = res_amount.min(room);
                    if amount > 0.0 {
                        fill.open(holder)?;
                        let moved =
                            p.move_volume(holder, amount, Direction::Backward, MoveOptions::default());
                        let closed = fill.close(holder);
                        moved?;
                        closed?;
                    }
                }
            }
            // Line priming.
            if prime_amount > 0.0 {
                for m in &modules {
                    self.push_through(holder, m, prime_amount)?;
                }
            }
            // Syringe refill.
            for p in pumps.values() {
                self.refill_now(holder, p)?;
            }
            // Dead volume of every line.
            for m in &modules {
                let dead = m.dead_volume();
                if dead > 0.0 {
                    self.push_through(holder, m, dead)?;
                }
            }
            // Final refill.
            for p in pumps.values() {
                self.refill_now(holder, p)?;
            }
            Ok(())
        });
        self.core.autofill.swap(was_auto);
        match &result {
            Ok(()) => self.core.events.info("fill_lines"),
            Err(e) => tracing::warn!(error = %e, "fill_lines aborted"),
        }
        result
    }

    /// Recover the liquid in the tubing of `modules` back into the reservoirs.
    pub fn empty_lines(&self, modules: Option<&[String]>) -> Result<()> {
        let modules = self.select_modules(modules)?;
        for m in &modules {
            if !m.pump.has_fill_valve() {
                return Err(RewardError::MissingResource(format!(
                    "pump {} has no fill valve",
                    m.pump.name()
                )));
            }
        }
        let holder = Holder::new();
        let was_auto = self.core.autofill.swap(false);
        let result = self.lock_compound(holder, &modules).and_then(|_locks| {
            for m in &modules {
                for sibling in self.core.modules_of(m.pump.name()) {
                    sibling.valve.close(holder)?;
                }
            }
            for m in &modules {
                let pump = &m.pump;
                self.push_to_reservoir_locked(holder, pump, None)?;
                let half_step = 0.5 / pump.steps_per_ml();
                let mut recovered = 0.0;
                loop {
                    let room = pump.syringe().volume - pump.vol_left();
                    let chunk = (m.dead_volume() - recovered).min(room);
                    if chunk < half_step {
                        break;
                    }
                    m.valve.open(holder)?;
                    let moved =
                        pump.move_volume(holder, chunk, Direction::Backward, MoveOptions::default());
                    let closed = m.valve.close(holder);
                    moved?;
                    closed?;
                    self.push_to_reservoir_locked(holder, pump, None)?;
                    recovered += chunk;
                }
                tracing::info!(module = %m.name(), recovered, "line emptied");
            }
            Ok(())
        });
        self.core.autofill.swap(was_auto);
        match &result {
            Ok(()) => self.core.events.info("empty_lines"),
            Err(e) => tracing::warn!(error = %e, "empty_lines aborted"),
        }
        result
    }

    /// Push `amount` mL (the whole syringe when `None`) back to the
    /// reservoir of `pump`.
    pub fn push_to_reservoir(&self, pump: &str, amount: Option<f64>) -> Result<()> {
        let p = self.core.pump(pump)?.clone();
        if !p.has_fill_valve() {
            return Err(RewardError::MissingResource(format!("pump {pump} has no fill valve")));
        }
        let holder = Holder::new();
        let modules = self.core.modules_of(pump);
        let mut locks = LockSet::new(holder, LockWait::Timeout(self.lock_wait));
        let pump: &Pump = &p;
        locks.take(pump)?;
        if let Some(fill) = p.fill_valve() {
            let fill: &Valve = fill;
            locks.take(fill)?;
        }
        for m in &modules {
            let valve: &Valve = &m.valve;
            locks.take(valve)?;
        }
        for m in &modules {
            m.valve.close(holder)?;
        }
        self.push_to_reservoir_locked(holder, &p, amount)
    }

    fn push_to_reservoir_locked(&self, holder: Holder, pump: &Pump, amount: Option<f64>) -> Result<()> {
        let Some(fill) = pump.fill_valve() else {
            return Err(RewardError::MissingResource(format!(
                "pump {} has no fill valve",
                pump.name()
            )));
        };
        let amount = amount.unwrap_or_else(|| pump.vol_left());
        if amount <= 0.0 {
            return Ok(());
        }
        fill.open(holder)?;
        let moved = pump.move_volume(holder, amount, Direction::Forward, MoveOptions::default());
        let closed = fill.close(holder);
        moved?;
        closed
    }

    /// Dispense `amount` through module `m`, refilling from the reservoir
    /// whenever the syringe runs out.
    fn push_through(&self, holder: Holder, m: &Module, amount: f64) -> Result<()> {
        let pump = &m.pump;
        if !pump.has_fill_valve() && amount > pump.vol_left() {
            return Err(RewardError::EndTrack(format!("pump {} is empty", pump.name())));
        }
        let mut left = amount;
        while left > 1e-9 {
            if pump.vol_left() < left.min(pump.syringe().volume) && pump.has_fill_valve() {
                self.refill_now(holder, pump)?;
            }
            let chunk = left.min(pump.vol_left());
            if chunk <= 0.0 {
                return Err(RewardError::EndTrack(format!("pump {} is empty", pump.name())));
            }
            m.valve.open(holder)?;
            let moved = pump.move_volume(holder, chunk, Direction::Forward, MoveOptions::default());
            let closed = m.valve.close(holder);
            moved?;
            closed?;
            left -= chunk;
        }
        Ok(())
    }

    fn refill_now(&self, holder: Holder, pump: &Pump) -> Result<()> {
        let Some(fill) = pump.fill_valve() else {
            return Ok(());
        };
        if pump.at_max_pos() {
            return Ok(());
        }
        fill.open(holder)?;
        let moved = pump.ret_to_max(holder, MoveOptions::default());
        let closed = fill.close(holder);
        moved?;
        closed
    }

    // ----- pump settings -----

    pub fn calibrate(&self, pump: &str) -> Result<()> {
        self.core.pump(pump)?.calibrate(Holder::new())
    }

    pub fn change_syringe(&self, pump: &str, syringe: &str) -> Result<()> {
        self.core.pump(pump)?.change_syringe(Holder::new(), syringe)
    }

    pub fn set_microstep_type(&self, pump: &str, step_type: &str) -> Result<()> {
        let t = step_type.parse::<StepType>()?;
        self.core.pump(pump)?.set_step_type(Holder::new(), t)
    }

    pub fn set_step_speed(&self, pump: &str, step_delay: f64) -> Result<()> {
        self.core.pump(pump)?.set_step_delay(Holder::new(), step_delay)
    }

    /// Returns the resulting step delay.
    pub fn set_flow_rate(&self, pump: &str, flow_rate: f64) -> Result<f64> {
        self.core.pump(pump)?.set_flow_rate(Holder::new(), flow_rate)
    }

    pub fn update_post_delay(&self, module: &str, post_delay: f64) -> Result<()> {
        self.module(module)?.set_post_delay(post_delay)
    }

    // ----- cues and sensors -----

    /// Returns whether the valve is open afterwards.
    pub fn toggle_valve(&self, name: &str, open: Option<bool>) -> Result<bool> {
        self.valve(name)?.toggle(Holder::new(), open)
    }

    /// Returns whether the LED is on afterwards.
    pub fn toggle_led(&self, name: &str, on: Option<bool>) -> Result<bool> {
        self.led(name)?.toggle(Holder::new(), on)
    }

    /// Map speaker or module names to speaker names.
    fn speakers_for(&self, mixer: &AudioMixer, targets: &[String]) -> Result<Vec<String>> {
        targets
            .iter()
            .map(|t| {
                if mixer.has_speaker(t) {
                    return Ok(t.clone());
                }
                self.core
                    .modules
                    .get(t)
                    .and_then(|m| m.speaker.clone())
                    .ok_or_else(|| RewardError::MissingResource(format!("speaker '{t}'")))
            })
            .collect()
    }

    /// `targets` name speakers or modules with a speaker; empty plays on all.
    pub fn play_tone(
        &self,
        targets: &[String],
        freq: f64,
        dur: f64,
        volume: f64,
        force: bool,
    ) -> Result<()> {
        let mixer = self.mixer()?;
        let speakers = self.speakers_for(mixer, targets)?;
        mixer.play_tone(&speakers, freq, dur, volume, force)
    }

    /// Play pre-rendered mono samples in `[-1, 1]`, resampled when `fs`
    /// differs from the mixer rate.
    pub fn play(
        &self,
        targets: &[String],
        signal: &[f32],
        fs: Option<u32>,
        force: bool,
    ) -> Result<()> {
        let mixer = self.mixer()?;
        let speakers = self.speakers_for(mixer, targets)?;
        mixer.play(&speakers, signal, fs, force)
    }

    pub fn stop_audio(&self) -> Result<()> {
        self.mixer()?.stop()
    }

    pub fn reset_licks(&self, name: &str) -> Result<()> {
        self.lickometer(name)?.reset_licks();
        Ok(())
    }

    pub fn reset_all_licks(&self) {
        for l in self.core.lickometers() {
            l.reset_licks();
        }
    }

    // ----- auto-fill -----

    pub fn toggle_auto_fill(&self, on: Option<bool>) -> bool {
        self.core.autofill.toggle(on)
    }

    pub fn set_auto_fill_frac_thresh(&self, value: f64) -> Result<()> {
        self.core.autofill.set_frac_thresh(value)
    }

    /// One pass of the refill check loop.
    pub fn check_refills(&self) {
        self.core.autofill.check(self.core.pumps.values());
    }

    /// One pass of the refill scheduler loop.
    pub fn schedule_refills(&self) {
        self.core.schedule_fills();
    }

    // ----- recording -----

    /// Start the event log under `data_dir` (the configured one by default).
    pub fn record(&self, reset: bool, data_dir: Option<&Path>) -> Result<PathBuf> {
        let dir = data_dir.unwrap_or(&self.data_dir);
        self.core.events.start(dir, reset)
    }

    pub fn stop_recording(&self) {
        self.core.events.stop();
    }

    // ----- lifecycle -----

    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().shutdown_tx.is_some()
    }

    /// Spawn the background workers. Calling twice is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut lc = self.lifecycle.lock();
        if lc.shutdown_tx.is_some() {
            return Ok(());
        }
        let (tx, rx) = xch::bounded::<()>(0);

        let core = self.core.clone();
        lc.workers.push(spawn_periodic("refill-check", AUTO_FILL_PERIOD, rx.clone(), move || {
            core.autofill.check(core.pumps.values());
        })?);
        let core = self.core.clone();
        lc.workers.push(spawn_periodic("refill-scheduler", AUTO_FILL_PERIOD, rx.clone(), move || {
            core.schedule_fills();
        })?);
        let core = self.core.clone();
        let licks = self.core.lickometers();
        lc.workers.push(spawn_periodic("burst-monitor", self.burst_period, rx.clone(), move || {
            let now = core.clock.now();
            for l in &licks {
                l.update(now);
            }
        })?);
        lc.journal = Some(PositionJournal::spawn(
            self.store.clone(),
            self.core.pumps.clone(),
            self.journal_period,
        ));
        for (pump, inputs, settings) in self.buttons.lock().drain(..) {
            if let Some(mc) =
                ManualControl::spawn(pump, inputs, settings, self.core.clock.clone(), rx.clone())?
            {
                lc.manual.push(mc);
            }
        }
        lc.shutdown_tx = Some(tx);
        tracing::info!(
            pumps = self.core.pumps.len(),
            modules = self.core.modules.len(),
            "controller started"
        );
        Ok(())
    }

    /// Stop every task and worker, end recording and flush positions.
    pub fn stop(&self) {
        for (name, slot) in &self.core.slots {
            let active = slot.lock().clone();
            if let Some(task) = active {
                task.stop();
                task.join();
                tracing::debug!(pump = %name, "task stopped");
            }
        }
        self.core.events.stop();
        let mut lc = self.lifecycle.lock();
        lc.shutdown_tx.take();
        for h in lc.workers.drain(..) {
            if let Err(e) = h.join() {
                tracing::warn!(?e, "worker panicked during shutdown");
            }
        }
        for mc in lc.manual.drain(..) {
            mc.join();
        }
        if let Some(mut journal) = lc.journal.take() {
            journal.shutdown();
        } else {
            for (name, pump) in &self.core.pumps {
                if let Err(e) = self.store.save(name, pump.position()) {
                    tracing::error!(pump = %name, error = %e, "failed to persist position");
                }
            }
        }
        tracing::info!("controller stopped");
    }

    // ----- state -----

    /// Snapshot of every resource, pump task and controller flag.
    pub fn status(&self) -> Value {
        let pumps: serde_json::Map<String, Value> = self
            .core
            .pumps
            .iter()
            .map(|(name, p)| {
                let mut v = serde_json::to_value(p.status()).unwrap_or(Value::Null);
                let task = self
                    .core
                    .slots
                    .get(name)
                    .and_then(|s| s.lock().clone())
                    .map(|t| {
                        json!({
                            "kind": t.kind(),
                            "alive": t.is_alive(),
                            "outcome": t.outcome().map(|o| o.to_json()),
                        })
                    });
                if let Value::Object(map) = &mut v {
                    map.insert("task".into(), task.unwrap_or(Value::Null));
                }
                (name.clone(), v)
            })
            .collect();
        let modules: serde_json::Map<String, Value> = self
            .core
            .modules
            .iter()
            .map(|(n, m)| (n.clone(), serde_json::to_value(m.status()).unwrap_or(Value::Null)))
            .collect();
        let plugins = json!({
            "valves": self.core.plugins.valves.iter()
                .map(|(n, v)| (n.clone(), json!(v.is_open())))
                .collect::<serde_json::Map<_, _>>(),
            "leds": self.core.plugins.leds.iter()
                .map(|(n, l)| (n.clone(), json!(l.is_on())))
                .collect::<serde_json::Map<_, _>>(),
            "lickometers": self.core.plugins.lickometers.iter()
                .map(|(n, l)| (n.clone(), serde_json::to_value(l.status()).unwrap_or(Value::Null)))
                .collect::<serde_json::Map<_, _>>(),
        });
        json!({
            "running": self.is_running(),
            "recording": self.core.events.is_recording(),
            "event_file": self.core.events.file(),
            "auto_fill": self.core.autofill.is_enabled(),
            "auto_fill_frac_thresh": self.core.autofill.frac_thresh(),
            "needs_refilling": self.core.autofill.pending(),
            "pumps": pumps,
            "modules": modules,
            "plugins": plugins,
            "audio": self.core.mixer.as_ref().map(|m| serde_json::to_value(m.status()).unwrap_or(Value::Null)),
        })
    }

    /// Read one value of `status()` by dotted path, e.g. `pumps.pumpA.vol_left`.
    pub fn get(&self, path: &str) -> Result<Value> {
        let status = self.status();
        let mut cur = &status;
        for key in path.split('.').filter(|k| !k.is_empty()) {
            cur = match cur {
                Value::Object(map) => map.get(key),
                Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            }
            .ok_or_else(|| RewardError::MissingResource(format!("no state at '{path}'")))?;
        }
        Ok(cur.clone())
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}
