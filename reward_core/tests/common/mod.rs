#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use reward_core::{Controller, ControllerOptions};
use reward_hardware::SimBoard;
use reward_traits::{MonotonicClock, TestClock};
use tempfile::TempDir;

pub const STEP_PIN: u8 = 17;
pub const FILL_PIN: u8 = 22;
pub const VALVE_A: u8 = 23;
pub const LICK_A: u8 = 24;
pub const VALVE_B: u8 = 25;

/// One pump (`pumpA`, BD5mL, Half) with a fill valve feeding modules `A`
/// (with a lickometer) and `B`. `extra` is appended verbatim.
pub fn config(dir: &TempDir, step_delay: f64, extra: &str) -> reward_config::Config {
    config_with_pump(dir, step_delay, "", extra)
}

/// As [`config`], with `pump_extra` added to the `pumpA` table.
pub fn config_with_pump(
    dir: &TempDir,
    step_delay: f64,
    pump_extra: &str,
    extra: &str,
) -> reward_config::Config {
    let root = dir.path().display();
    let text = format!(
        r#"
state_dir = '{root}/state'
data_dir = '{root}/data'

[pumps.pumpA]
step_pin = 17
dir_pin = 27
ms_pins = [5, 6, 13]
syringe = "BD5mL"
step_type = "Half"
step_delay = {step_delay}
pitch = 0.08
fill_valve_pin = 22
{pump_extra}

[modules.A]
pump = "pumpA"
valve_pin = 23
lick_pin = 24
dead_volume = 1.0
post_delay = 0.0

[modules.B]
pump = "pumpA"
valve_pin = 25
post_delay = 0.0
{extra}
"#
    );
    reward_config::load_toml(&text).expect("test config parses")
}

pub struct Rig {
    pub board: Arc<SimBoard>,
    pub ctrl: Controller,
    pub dir: TempDir,
}

/// Controller on a simulated board with an instant clock.
pub fn instant_rig(extra: &str) -> Rig {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = config(&dir, 0.0005, extra);
    let board = Arc::new(SimBoard::new());
    let ctrl = Controller::from_config(
        &cfg,
        board.clone(),
        Arc::new(TestClock::new()),
        ControllerOptions::default(),
    )
    .expect("controller builds");
    Rig { board, ctrl, dir }
}

/// Controller on a simulated board with real step timing (~0.2 ms/step).
pub fn timed_rig(extra: &str) -> Rig {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = config(&dir, 0.0001, extra);
    let board = Arc::new(SimBoard::new());
    let ctrl = Controller::from_config(
        &cfg,
        board.clone(),
        Arc::new(MonotonicClock::new()),
        ControllerOptions::default(),
    )
    .expect("controller builds");
    Rig { board, ctrl, dir }
}

/// Real-time rig whose pump has flush (2), reverse (3) and end (7) buttons,
/// active low with a 5 ms debounce.
pub fn button_rig() -> Rig {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = config_with_pump(
        &dir,
        0.0001,
        "flush_pin = 2\nreverse_pin = 3\nend_pin = 7\ndebounce_ms = 5",
        "",
    );
    let board = Arc::new(SimBoard::new());
    let ctrl = Controller::from_config(
        &cfg,
        board.clone(),
        Arc::new(MonotonicClock::new()),
        ControllerOptions::default(),
    )
    .expect("controller builds");
    Rig { board, ctrl, dir }
}

/// Put the pump carriage at the full end.
pub fn fill_up(rig: &Rig) {
    let pump = rig.ctrl.pump("pumpA").expect("pumpA");
    let max = pump.syringe().max_pos();
    pump.set_position(reward_core::Holder::new(), max)
        .expect("set position");
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
