//! Asynchronous delivery engine: reward queues, syringe refills and
//! lick-triggered rewards.
//!
//! Every task runs under its own `Holder`. Locks are taken in the order
//! pump, fill-valve, delivery valve(s) and are released by dropping guards,
//! so every exit path of a worker frees what it took.
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel as xch;
use parking_lot::Mutex;
use serde::Serialize;

use crate::autofill::RefillSet;
use crate::error::{Result, RewardError};
use crate::event_log::EventLog;
use crate::module::Module;
use crate::pump::{Direction, MoveOptions, Pump};
use crate::resource::{Holder, LockWait, Resource, ResourceGuard};
use crate::util::{SharedClock, secs};
use crate::valve::Valve;

/// Fraction of the syringe volume pushed toward the reservoir before the
/// first delivery after a refill.
pub const PREP_FRACTION: f64 = 0.05;

/// Carriage travel (cm) used to prime the port side after a refill.
pub const PRIME_TRAVEL_CM: f64 = 0.05;

/// Poll period of the lick-trigger watcher and idle triggered worker.
const TRIGGER_POLL: Duration = Duration::from_millis(1);

/// Longest uninterrupted sleep inside a worker.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Reward,
    Fill,
    Triggered,
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub kind: TaskKind,
    pub success: bool,
    pub err: Option<RewardError>,
    pub delivered_ml: f64,
}

impl TaskOutcome {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind,
            "success": self.success,
            "err": self.err.as_ref().map(|e| e.kind()),
            "message": self.err.as_ref().map(|e| e.to_string()),
            "delivered_ml": self.delivered_ml,
        })
    }
}

/// Collaborators handed to every task.
#[derive(Clone)]
pub struct TaskContext {
    pub events: Arc<EventLog>,
    pub clock: SharedClock,
}

#[derive(Clone)]
pub struct RewardRequest {
    pub module: Arc<Module>,
    pub amount: f64,
}

impl std::fmt::Debug for RewardRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewardRequest")
            .field("module", &self.module.name())
            .field("amount", &self.amount)
            .finish()
    }
}

/// Lifecycle state shared by the controller and a task's threads.
struct TaskCore {
    kind: TaskKind,
    holder: Holder,
    running: AtomicBool,
    alive: AtomicBool,
    outcome: Mutex<Option<TaskOutcome>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stop_tx: Mutex<Option<xch::Sender<()>>>,
    stop_rx: xch::Receiver<()>,
}

impl TaskCore {
    fn new(kind: TaskKind) -> Arc<Self> {
        let (tx, rx) = xch::bounded(0);
        Arc::new(Self {
            kind,
            holder: Holder::new(),
            running: AtomicBool::new(false),
            alive: AtomicBool::new(false),
            outcome: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
            stop_tx: Mutex::new(Some(tx)),
            stop_rx: rx,
        })
    }

    fn begin(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.alive.store(true, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Record how the task ended. `delivered_ml` counts what actually
    /// moved, including the part of an interrupted request.
    fn finish(&self, delivered_ml: f64, result: Result<()>) -> TaskOutcome {
        let err = result.err();
        if let Some(e) = &err {
            tracing::warn!(task = ?self.kind, error = %e, delivered_ml, "task failed");
        }
        let outcome = TaskOutcome {
            kind: self.kind,
            success: err.is_none(),
            err,
            delivered_ml,
        };
        *self.outcome.lock() = Some(outcome.clone());
        self.running.store(false, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        outcome
    }

    fn signal_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_tx.lock().take();
    }

    /// Sleep up to `d` of real time; true when a stop was requested.
    fn wait_stop(&self, d: Duration) -> bool {
        !matches!(self.stop_rx.recv_timeout(d), Err(xch::RecvTimeoutError::Timeout))
    }

    fn spawn(&self, name: &str, f: impl FnOnce() + Send + 'static) -> Result<()> {
        let h = std::thread::Builder::new().name(name.into()).spawn(f)?;
        self.handles.lock().push(h);
        Ok(())
    }

    fn join(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for h in handles {
            if let Err(e) = h.join() {
                tracing::warn!(?e, task = ?self.kind, "task thread panicked");
            }
        }
    }
}

fn sleep_while_running(core: &TaskCore, clock: &SharedClock, total: Duration) {
    let mut left = total;
    while !left.is_zero() && core.is_running() {
        let slice = left.min(SLEEP_SLICE);
        clock.sleep(slice);
        left -= slice;
    }
}

fn close_quietly(valve: &Valve, holder: Holder) {
    if let Err(e) = valve.close(holder) {
        tracing::error!(valve = %valve.name(), error = %e, "could not close valve on cleanup");
    }
}

fn validate_amount(pump: &Pump, amount: f64) -> Result<()> {
    if !(amount.is_finite() && amount > 0.0) {
        return Err(RewardError::InvalidArgument(format!(
            "amount must be > 0 mL, got {amount}"
        )));
    }
    let volume = pump.syringe().volume;
    if amount > volume {
        return Err(RewardError::EndTrack(format!(
            "{amount} mL does not fit the {volume} mL syringe of pump {}",
            pump.name()
        )));
    }
    Ok(())
}

fn check_module_pump(pump: &Arc<Pump>, module: &Module) -> Result<()> {
    if Arc::ptr_eq(pump, &module.pump) {
        Ok(())
    } else {
        Err(RewardError::InvalidArgument(format!(
            "module {} is not served by pump {}",
            module.name(),
            pump.name()
        )))
    }
}

/// Pump and fill-valve guards, in lock order.
fn lock_pump_side(pump: &Pump, holder: Holder, wait: LockWait) -> Result<Vec<ResourceGuard>> {
    let mut guards = vec![pump.acquire(holder, wait)?];
    if let Some(fill) = pump.fill_valve() {
        guards.push(fill.acquire(holder, wait)?);
    }
    Ok(guards)
}

// ---------------------------------------------------------------------------
// Reward task

struct Queued {
    req: RewardRequest,
    valve_guard: Option<ResourceGuard>,
}

struct RewardQueue {
    pending: VecDeque<Queued>,
    accepting: bool,
}

struct RewardInner {
    pump: Arc<Pump>,
    queue: Mutex<RewardQueue>,
    ctx: TaskContext,
}

/// Ordered rewards from one pump, possibly to several modules.
pub struct RewardTask {
    core: Arc<TaskCore>,
    inner: Arc<RewardInner>,
}

impl RewardTask {
    pub fn new(pump: Arc<Pump>, first: RewardRequest, ctx: TaskContext) -> Self {
        let mut pending = VecDeque::new();
        pending.push_back(Queued {
            req: first,
            valve_guard: None,
        });
        Self {
            core: TaskCore::new(TaskKind::Reward),
            inner: Arc::new(RewardInner {
                pump,
                queue: Mutex::new(RewardQueue {
                    pending,
                    accepting: true,
                }),
                ctx,
            }),
        }
    }

    /// Take pump, fill-valve and first valve locks for the task and run it
    /// on a worker thread.
    pub fn start(&self) -> Result<()> {
        let guards = match self.prepare() {
            Ok(g) => g,
            Err(e) => {
                self.core.finish(0.0, Err(e.clone()));
                return Err(e);
            }
        };
        let epoch = self.inner.pump.stop_epoch();
        self.core.begin();
        let core = self.core.clone();
        let inner = self.inner.clone();
        let spawned = self.core.spawn("reward-task", move || {
            let (delivered, result) = run_rewards(&core, &inner, guards, epoch);
            core.finish(delivered, result);
        });
        if let Err(e) = spawned {
            self.core.finish(0.0, Err(e.clone()));
            return Err(e);
        }
        Ok(())
    }

    /// Deliver on the calling thread; errors propagate.
    pub fn run_sync(&self) -> Result<TaskOutcome> {
        let guards = match self.prepare() {
            Ok(g) => g,
            Err(e) => {
                self.core.finish(0.0, Err(e.clone()));
                return Err(e);
            }
        };
        let epoch = self.inner.pump.stop_epoch();
        self.core.begin();
        let (delivered, result) = run_rewards(&self.core, &self.inner, guards, epoch);
        let outcome = self.core.finish(delivered, result);
        match &outcome.err {
            Some(e) => Err(e.clone()),
            None => Ok(outcome),
        }
    }

    fn prepare(&self) -> Result<Vec<ResourceGuard>> {
        let holder = self.core.holder;
        let pump = &self.inner.pump;
        let mut q = self.inner.queue.lock();
        let first = q
            .pending
            .front_mut()
            .ok_or_else(|| RewardError::InvalidArgument("reward task has no request".into()))?;
        check_module_pump(pump, &first.req.module)?;
        validate_amount(pump, first.req.amount)?;
        let guards = lock_pump_side(pump, holder, LockWait::Immediate)?;
        first.valve_guard = Some(first.req.module.valve.try_acquire(holder)?);
        Ok(guards)
    }

    /// Append a request. Returns `Ok(false)` when the task has already
    /// drained its queue and a new task must be started instead.
    pub fn enqueue(&self, req: RewardRequest) -> Result<bool> {
        check_module_pump(&self.inner.pump, &req.module)?;
        validate_amount(&self.inner.pump, req.amount)?;
        let mut q = self.inner.queue.lock();
        if !q.accepting || !self.core.is_running() {
            return Ok(false);
        }
        let guard = req.module.valve.try_acquire(self.core.holder)?;
        tracing::debug!(module = %req.module.name(), amount = req.amount, "reward enqueued");
        q.pending.push_back(Queued {
            req,
            valve_guard: Some(guard),
        });
        Ok(true)
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.lock().pending.len()
    }

    pub fn stop(&self) {
        self.core.signal_stop();
        self.inner.queue.lock().accepting = false;
        self.inner.pump.disable();
    }
}

fn run_rewards(
    core: &TaskCore,
    inner: &RewardInner,
    guards: Vec<ResourceGuard>,
    epoch: u64,
) -> (f64, Result<()>) {
    let holder = core.holder;
    let pump = &inner.pump;
    let opts = MoveOptions::since(epoch);
    let mut delivered = 0.0;
    // Delivery valve currently open, with the guard of the request it serves.
    let mut open: Option<(Arc<Valve>, Option<ResourceGuard>)> = None;

    let result = (|| -> Result<()> {
        loop {
            let item = {
                let mut q = inner.queue.lock();
                match q.pending.pop_front() {
                    Some(item) => item,
                    None => {
                        q.accepting = false;
                        return Ok(());
                    }
                }
            };
            let Queued { req, valve_guard } = item;
            let valve = req.module.valve.clone();
            // A same-module predecessor may have left this valve open.
            open = Some((valve.clone(), valve_guard));
            if !core.is_running() {
                return Err(RewardError::PumpNotEnabled(format!(
                    "reward on {} stopped",
                    pump.name()
                )));
            }

            if pump.direction() == Direction::Backward
                && let Some(fill) = pump.fill_valve()
            {
                valve.close(holder)?;
                fill.open(holder)?;
                let prep = PREP_FRACTION * pump.syringe().volume;
                pump.move_volume(holder, prep, Direction::Forward, opts)?;
                fill.close(holder)?;
                tracing::debug!(pump = %pump.name(), prep, "pushed prep volume to reservoir");
            }

            valve.open(holder)?;
            if let Some(fill) = pump.fill_valve() {
                fill.close(holder)?;
            }
            let report = match pump.try_move_volume(holder, req.amount, Direction::Forward, opts) {
                Ok(report) => report,
                Err(partial) => {
                    delivered += partial.report.delivered_ml;
                    inner.ctx.events.warn(&format!(
                        "partial_reward,{},{:.4},{:.4}",
                        req.module.name(),
                        partial.report.requested_ml,
                        partial.report.delivered_ml
                    ));
                    return Err(partial.error);
                }
            };
            delivered += report.delivered_ml;
            inner.ctx.events.info(&format!(
                "reward,{},{:.4},{:.4},{:+.4}",
                req.module.name(),
                report.requested_ml,
                report.delivered_ml,
                report.error_ml
            ));
            tracing::info!(
                module = %req.module.name(),
                pump = %pump.name(),
                steps = report.steps,
                delivered_ml = report.delivered_ml,
                "reward delivered"
            );

            let same_next = inner
                .queue
                .lock()
                .pending
                .front()
                .is_some_and(|n| Arc::ptr_eq(&n.req.module, &req.module));
            if same_next {
                // The next request's own guard keeps the valve locked.
                open = None;
            } else {
                sleep_while_running(core, &inner.ctx.clock, secs(req.module.post_delay()));
                valve.close(holder)?;
                open = None;
            }
        }
    })();

    if result.is_err() {
        inner.queue.lock().accepting = false;
        if let Some(fill) = pump.fill_valve() {
            close_quietly(fill, holder);
        }
        if let Some((v, _guard)) = open.take() {
            close_quietly(&v, holder);
        }
    }
    // Queued requests still carry valve guards; a valve left open for a
    // same-module successor is closed before its guard goes.
    let leftovers: Vec<Queued> = inner.queue.lock().pending.drain(..).collect();
    if let Some(first) = leftovers.first() {
        close_quietly(&first.req.module.valve, holder);
    }
    drop(leftovers);
    drop(guards);
    (delivered, result)
}

// ---------------------------------------------------------------------------
// Fill task

/// Refill a pump's syringe from its reservoir and prime the port side.
pub struct FillTask {
    core: Arc<TaskCore>,
    pump: Arc<Pump>,
    modules: Vec<Arc<Module>>,
    refill: RefillSet,
    ctx: TaskContext,
}

impl FillTask {
    /// `modules` are every module served by `pump`.
    pub fn new(pump: Arc<Pump>, modules: Vec<Arc<Module>>, refill: RefillSet, ctx: TaskContext) -> Self {
        Self {
            core: TaskCore::new(TaskKind::Fill),
            pump,
            modules,
            refill,
            ctx,
        }
    }

    fn prepare(&self) -> Result<Vec<ResourceGuard>> {
        if !self.pump.has_fill_valve() {
            return Err(RewardError::MissingResource(format!(
                "pump {} has no fill valve",
                self.pump.name()
            )));
        }
        let holder = self.core.holder;
        let mut guards = lock_pump_side(&self.pump, holder, LockWait::Immediate)?;
        for m in &self.modules {
            guards.push(m.valve.try_acquire(holder)?);
        }
        Ok(guards)
    }

    pub fn start(&self) -> Result<()> {
        let guards = match self.prepare() {
            Ok(g) => g,
            Err(e) => {
                self.core.finish(0.0, Err(e.clone()));
                return Err(e);
            }
        };
        let epoch = self.pump.stop_epoch();
        self.core.begin();
        let core = self.core.clone();
        let pump = self.pump.clone();
        let modules = self.modules.clone();
        let refill = self.refill.clone();
        let ctx = self.ctx.clone();
        let spawned = self.core.spawn("fill-task", move || {
            let (drawn, result) = run_fill(&core, &pump, &modules, &refill, &ctx, guards, epoch);
            core.finish(drawn, result);
        });
        if let Err(e) = spawned {
            self.core.finish(0.0, Err(e.clone()));
            return Err(e);
        }
        Ok(())
    }

    pub fn run_sync(&self) -> Result<TaskOutcome> {
        let guards = match self.prepare() {
            Ok(g) => g,
            Err(e) => {
                self.core.finish(0.0, Err(e.clone()));
                return Err(e);
            }
        };
        let epoch = self.pump.stop_epoch();
        self.core.begin();
        let (drawn, result) = run_fill(
            &self.core,
            &self.pump,
            &self.modules,
            &self.refill,
            &self.ctx,
            guards,
            epoch,
        );
        let outcome = self.core.finish(drawn, result);
        match &outcome.err {
            Some(e) => Err(e.clone()),
            None => Ok(outcome),
        }
    }

    pub fn stop(&self) {
        self.core.signal_stop();
        self.pump.disable();
    }
}

fn run_fill(
    core: &TaskCore,
    pump: &Pump,
    modules: &[Arc<Module>],
    refill: &RefillSet,
    ctx: &TaskContext,
    guards: Vec<ResourceGuard>,
    epoch: u64,
) -> (f64, Result<()>) {
    let holder = core.holder;
    let opts = MoveOptions::since(epoch);
    let Some(fill) = pump.fill_valve() else {
        return (
            0.0,
            Err(RewardError::MissingResource(format!(
                "pump {} has no fill valve",
                pump.name()
            ))),
        );
    };
    let mut drawn = 0.0;
    let result = (|| -> Result<()> {
        for m in modules {
            m.valve.close(holder)?;
        }
        fill.open(holder)?;
        if !pump.at_max_pos() {
            let missing = pump.syringe().volume - pump.vol_left();
            match pump.try_move_volume(holder, missing, Direction::Backward, opts) {
                Ok(report) => drawn = report.delivered_ml,
                Err(partial) => {
                    drawn = partial.report.delivered_ml;
                    ctx.events.warn(&format!(
                        "partial_refill,{},{:.4},{:.4}",
                        pump.name(),
                        partial.report.requested_ml,
                        partial.report.delivered_ml
                    ));
                    return Err(partial.error);
                }
            }
        }
        if !core.is_running() {
            return Err(RewardError::PumpNotEnabled(format!("fill of {} stopped", pump.name())));
        }
        let prime = PRIME_TRAVEL_CM * pump.syringe().ml_per_cm();
        pump.move_volume(holder, prime, Direction::Forward, opts)?;
        fill.close(holder)?;
        Ok(())
    })();
    if result.is_err() {
        close_quietly(fill, holder);
    } else {
        refill.lock().shift_remove(pump.name());
        ctx.events.info(&format!("refill,{}", pump.name()));
        tracing::info!(pump = %pump.name(), vol_left = pump.vol_left(), "syringe refilled");
    }
    drop(guards);
    (drawn, result)
}

// ---------------------------------------------------------------------------
// Lick-triggered task

/// Deliver `amount` step by step while the module's trigger predicate holds.
pub struct TriggeredTask {
    core: Arc<TaskCore>,
    module: Arc<Module>,
    amount: f64,
    ctx: TaskContext,
}

impl TriggeredTask {
    pub fn new(module: Arc<Module>, amount: f64, ctx: TaskContext) -> Self {
        Self {
            core: TaskCore::new(TaskKind::Triggered),
            module,
            amount,
            ctx,
        }
    }

    pub fn start(&self) -> Result<()> {
        let pump = self.module.pump.clone();
        let checked = validate_amount(&pump, self.amount).and_then(|()| {
            self.module.lickometer()?;
            // Check availability; nothing is held while waiting for licks.
            let mut guards = lock_pump_side(&pump, self.core.holder, LockWait::Immediate)?;
            guards.push(self.module.valve.try_acquire(self.core.holder)?);
            Ok(())
        });
        if let Err(e) = checked {
            self.core.finish(0.0, Err(e.clone()));
            return Err(e);
        }
        pump.disable();
        self.core.begin();
        if let Err(e) = self.spawn_threads() {
            self.core.finish(0.0, Err(e.clone()));
            return Err(e);
        }
        Ok(())
    }

    fn spawn_threads(&self) -> Result<()> {
        let core = self.core.clone();
        let module = self.module.clone();
        self.core.spawn("trigger-poller", move || {
            let mut prev = false;
            while !core.wait_stop(TRIGGER_POLL) && core.alive.load(Ordering::SeqCst) {
                let now = module.trigger();
                if now != prev {
                    if now {
                        module.pump.enable();
                    } else {
                        module.pump.disable();
                    }
                    prev = now;
                }
            }
            module.pump.disable();
        })?;

        let core = self.core.clone();
        let module = self.module.clone();
        let amount = self.amount;
        let ctx = self.ctx.clone();
        self.core.spawn("triggered-task", move || {
            run_triggered(&core, &module, amount, &ctx);
        })
    }

    pub fn stop(&self) {
        self.core.signal_stop();
        self.module.pump.disable();
    }
}

fn run_triggered(core: &TaskCore, module: &Module, amount: f64, ctx: &TaskContext) {
    let holder = core.holder;
    let pump = &module.pump;
    let steps_per_ml = pump.steps_per_ml();
    let budget = (amount * steps_per_ml).round() as u64;
    let mut done = 0u64;

    let mut failure = None;
    while done < budget && core.is_running() {
        if !pump.is_enabled() {
            if core.wait_stop(TRIGGER_POLL) {
                break;
            }
            continue;
        }
        let burst = (|| -> Result<()> {
            let _pump_side = lock_pump_side(pump, holder, LockWait::Immediate)?;
            let _valve = module.valve.try_acquire(holder)?;
            module.valve.open(holder)?;
            if let Some(fill) = pump.fill_valve() {
                fill.close(holder)?;
            }
            let stepped = loop {
                if done >= budget || !core.is_running() {
                    break Ok(());
                }
                match pump.single_step(holder, Some(Direction::Forward), false, false) {
                    Ok(()) => done += 1,
                    Err(RewardError::PumpNotEnabled(_)) => break Ok(()),
                    Err(e) => break Err(e),
                }
            };
            module.valve.close(holder)?;
            stepped
        })();
        match burst {
            Ok(()) => {}
            Err(RewardError::ResourceLocked(what)) => {
                tracing::trace!(module = %module.name(), %what, "triggered delivery waiting for locks");
                if core.wait_stop(TRIGGER_POLL) {
                    break;
                }
            }
            Err(e) => {
                close_quietly(&module.valve, holder);
                failure = Some(e);
                break;
            }
        }
    }
    core.alive.store(false, Ordering::SeqCst);
    pump.disable();

    let delivered = done as f64 / steps_per_ml;
    ctx.events.info(&format!(
        "triggered_reward,{},{:.4},{:.4}",
        module.name(),
        amount,
        delivered
    ));
    let result = match failure {
        Some(e) => Err(e),
        None if done < budget => Err(RewardError::IncompleteDelivery {
            requested_ml: amount,
            delivered_ml: delivered,
        }),
        None => Ok(()),
    };
    core.finish(delivered, result);
}

// ---------------------------------------------------------------------------
// Pump task slot

/// The single active task of a pump.
pub enum PumpTask {
    Reward(RewardTask),
    Fill(FillTask),
    Triggered(TriggeredTask),
}

impl PumpTask {
    fn core(&self) -> &TaskCore {
        match self {
            PumpTask::Reward(t) => &t.core,
            PumpTask::Fill(t) => &t.core,
            PumpTask::Triggered(t) => &t.core,
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.core().kind
    }

    pub fn is_alive(&self) -> bool {
        self.core().alive.load(Ordering::SeqCst)
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.core().outcome.lock().clone()
    }

    pub fn stop(&self) {
        match self {
            PumpTask::Reward(t) => t.stop(),
            PumpTask::Fill(t) => t.stop(),
            PumpTask::Triggered(t) => t.stop(),
        }
    }

    /// Wait for every thread of the task.
    pub fn join(&self) {
        self.core().join();
    }

    /// Block until the task is no longer alive, polling every `poll`.
    pub fn wait(&self, poll: Duration) {
        while self.is_alive() {
            std::thread::sleep(poll);
        }
        self.join();
    }
}
