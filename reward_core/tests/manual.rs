mod common;

use std::time::Duration;

use common::{Rig, button_rig, wait_for};
use reward_core::{Holder, Resource, StepType};

const FLUSH: u8 = 2;
const REVERSE: u8 = 3;
const END: u8 = 7;
const MODE_PINS: [u8; 3] = [5, 6, 13];

fn press(rig: &Rig, pin: u8) {
    rig.board.line(pin).drive(false);
}

fn release(rig: &Rig, pin: u8) {
    rig.board.line(pin).drive(true);
}

fn settled(rig: &Rig) -> bool {
    let pump = rig.ctrl.pump("pumpA").unwrap();
    !pump.status().locked && pump.step_type() == StepType::Half
}

#[test]
fn reverse_hold_refills_at_full_step() {
    let rig = button_rig();
    rig.ctrl.start().unwrap();
    let pump = rig.ctrl.pump("pumpA").unwrap().clone();
    assert_eq!(pump.position(), 0.0);

    press(&rig, REVERSE);
    assert!(wait_for(Duration::from_secs(2), || pump.step_type() == StepType::Full));
    assert!(MODE_PINS.iter().all(|&p| !rig.board.line(p).level()));
    std::thread::sleep(Duration::from_millis(60));
    release(&rig, REVERSE);

    assert!(wait_for(Duration::from_secs(2), || settled(&rig)));
    assert!(pump.position() > 0.0);
    // Half step straps M0 only.
    assert!(rig.board.line(MODE_PINS[0]).level());
    rig.ctrl.stop();
}

#[test]
fn flush_hold_dispenses() {
    let rig = button_rig();
    common::fill_up(&rig);
    rig.ctrl.start().unwrap();
    let pump = rig.ctrl.pump("pumpA").unwrap().clone();
    let full = pump.position();

    press(&rig, FLUSH);
    assert!(wait_for(Duration::from_secs(2), || pump.position() < full));
    release(&rig, FLUSH);

    assert!(wait_for(Duration::from_secs(2), || settled(&rig)));
    assert!(pump.position() < full);
    rig.ctrl.stop();
}

#[test]
fn press_while_pump_is_locked_is_skipped() {
    let rig = button_rig();
    rig.ctrl.start().unwrap();
    let pump = rig.ctrl.pump("pumpA").unwrap().clone();
    let guard = pump.try_acquire(Holder::new()).unwrap();

    press(&rig, REVERSE);
    std::thread::sleep(Duration::from_millis(40));
    release(&rig, REVERSE);
    std::thread::sleep(Duration::from_millis(20));
    drop(guard);

    assert_eq!(pump.position(), 0.0);
    assert_eq!(pump.step_type(), StepType::Half);
    rig.ctrl.stop();
}

#[test]
fn end_switch_calibrates() {
    let rig = button_rig();
    rig.ctrl.start().unwrap();
    let pump = rig.ctrl.pump("pumpA").unwrap().clone();
    pump.set_position(Holder::new(), 1.0).unwrap();
    assert!(!pump.end_known());

    press(&rig, END);
    assert!(wait_for(Duration::from_secs(2), || pump.end_known()));
    release(&rig, END);
    assert_eq!(pump.position(), 0.0);
    rig.ctrl.stop();
}
