mod common;

use std::sync::Arc;
use std::time::Duration;

use reward_core::{Controller, ControllerOptions, Direction, Holder, MoveOptions};
use reward_hardware::SimBoard;
use reward_traits::TestClock;

fn build(dir: &tempfile::TempDir, reset: bool) -> Controller {
    let cfg = common::config(dir, 0.0005, "");
    Controller::from_config(
        &cfg,
        Arc::new(SimBoard::new()),
        Arc::new(TestClock::new()),
        ControllerOptions {
            reset_positions: reset,
        },
    )
    .expect("controller builds")
}

fn stored(ctrl: &Controller) -> f64 {
    let path = ctrl.position_store().path_for("pumpA");
    std::fs::read_to_string(path)
        .expect("position file")
        .trim()
        .parse()
        .expect("decimal position")
}

#[test]
fn journal_follows_moves_and_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let position = {
        let ctrl = build(&dir, false);
        assert_eq!(stored(&ctrl), 0.0);
        ctrl.start().unwrap();
        let pump = ctrl.pump("pumpA").unwrap();
        pump.move_volume(Holder::new(), 1.0, Direction::Backward, MoveOptions::default())
            .unwrap();
        let position = pump.position();
        assert!(common::wait_for(Duration::from_secs(2), || stored(&ctrl) == position));
        pump.move_volume(Holder::new(), 0.25, Direction::Forward, MoveOptions::default())
            .unwrap();
        ctrl.stop();
        // the final flush happens on stop even inside one journal period
        assert_eq!(stored(&ctrl), pump.position());
        pump.position()
    };

    let ctrl = build(&dir, false);
    assert_eq!(ctrl.pump("pumpA").unwrap().position(), position);
}

#[test]
fn reset_flag_zeroes_stored_positions() {
    let dir = tempfile::tempdir().unwrap();
    {
        let ctrl = build(&dir, false);
        ctrl.pump("pumpA")
            .unwrap()
            .set_position(Holder::new(), 2.0)
            .unwrap();
        ctrl.start().unwrap();
        ctrl.stop();
    }
    let ctrl = build(&dir, true);
    assert_eq!(ctrl.pump("pumpA").unwrap().position(), 0.0);
    assert_eq!(stored(&ctrl), 0.0);
}

#[test]
fn garbage_position_file_starts_at_zero() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("state")).unwrap();
    std::fs::write(dir.path().join("state/pumpA.pos"), "not a number").unwrap();
    let ctrl = build(&dir, false);
    assert_eq!(ctrl.pump("pumpA").unwrap().position(), 0.0);
    assert_eq!(stored(&ctrl), 0.0);
}
