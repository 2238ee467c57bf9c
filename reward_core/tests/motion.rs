use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use reward_core::pump::{PumpPins, PumpSettings};
use reward_core::valve::{Polarity, Valve};
use reward_core::{Direction, Holder, MoveOptions, Pump, RewardError, StepType, Syringe};
use reward_hardware::SimBoard;
use reward_traits::{Board, TestClock};
use rstest::rstest;

fn pump(board: &SimBoard, syringe: &str, step_type: StepType) -> Pump {
    let clock = Arc::new(TestClock::new());
    let fill = Valve::new(
        "p.fill",
        board.output(22).unwrap(),
        Polarity::NormallyClosed,
        Duration::from_millis(20),
        clock.clone(),
    )
    .unwrap();
    let pins = PumpPins {
        step: board.output(17).unwrap(),
        dir: board.output(27).unwrap(),
        mode: [
            board.output(5).unwrap(),
            board.output(6).unwrap(),
            board.output(13).unwrap(),
        ],
    };
    let settings = PumpSettings {
        syringe: Syringe::from_key(syringe).unwrap(),
        step_type,
        step_delay: 0.0005,
        pitch: 0.08,
        invert_direction: false,
    };
    Pump::new("p", pins, settings, Some(Arc::new(fill)), clock).unwrap()
}

#[rstest]
#[case("BD1mL", StepType::Full)]
#[case("BD5mL", StepType::Half)]
#[case("BD60mL", StepType::ThirtySecond)]
fn one_step_is_one_pulse(#[case] syringe: &str, #[case] step_type: StepType) {
    let board = SimBoard::new();
    let p = pump(&board, syringe, step_type);
    p.set_position(Holder::new(), p.syringe().max_pos()).unwrap();
    let spm = p.steps_per_ml();

    let report = p
        .move_volume(Holder::new(), 10.0 / spm, Direction::Forward, MoveOptions::default())
        .unwrap();

    assert_eq!(report.steps, 10);
    assert_eq!(board.line(17).rising_writes(), 10);
    assert!(!board.line(17).level());
}

#[test]
fn forward_past_empty_is_refused_before_stepping() {
    let board = SimBoard::new();
    let p = pump(&board, "BD5mL", StepType::Half);
    p.set_position(Holder::new(), 0.5).unwrap();
    let left = p.vol_left();

    let err = p
        .move_volume(Holder::new(), left + 0.01, Direction::Forward, MoveOptions::default())
        .unwrap_err();

    assert!(matches!(err, RewardError::EndTrack(_)));
    assert_eq!(board.line(17).rising_writes(), 0);
    assert_eq!(p.position(), 0.5);
}

#[test]
fn direction_line_follows_inversion() {
    let board = SimBoard::new();
    let p = pump(&board, "BD5mL", StepType::Half);
    p.set_position(Holder::new(), 1.0).unwrap();
    p.move_volume(Holder::new(), 0.01, Direction::Backward, MoveOptions::default())
        .unwrap();
    assert!(!board.line(27).level());
    p.move_volume(Holder::new(), 0.01, Direction::Forward, MoveOptions::default())
        .unwrap();
    assert!(board.line(27).level());
}

#[test]
fn move_stops_when_disabled_since_epoch() {
    let board = SimBoard::new();
    let p = pump(&board, "BD5mL", StepType::Half);
    p.set_position(Holder::new(), 1.0).unwrap();
    let epoch = p.stop_epoch();
    p.disable();

    let err = p
        .move_volume(Holder::new(), 0.1, Direction::Forward, MoveOptions::since(epoch))
        .unwrap_err();

    assert!(matches!(err, RewardError::PumpNotEnabled(_)));
    assert_eq!(board.line(17).rising_writes(), 0);
    assert!(!p.is_enabled());
}

fn direction() -> impl Strategy<Value = Direction> {
    prop_oneof![Just(Direction::Forward), Just(Direction::Backward)]
}

fn step_type() -> impl Strategy<Value = StepType> {
    prop::sample::select(StepType::ALL.to_vec())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn completed_moves_track_quantized_volume(
        st in step_type(),
        start_frac in 0.0f64..=1.0,
        moves in prop::collection::vec((0.001f64..0.6, direction()), 1..6),
    ) {
        let board = SimBoard::new();
        let p = pump(&board, "BD5mL", st);
        let max = p.syringe().max_pos();
        p.set_position(Holder::new(), start_frac * max).unwrap();
        let dps = p.displacement_per_step();

        for (amount, dir) in moves {
            let before = p.position();
            match p.move_volume(Holder::new(), amount, dir, MoveOptions::default()) {
                Ok(report) => {
                    let sign = match dir { Direction::Forward => -1.0, Direction::Backward => 1.0 };
                    let expected = sign * report.steps as f64 * dps;
                    let moved = p.position() - before;
                    // clamping at either end can eat at most one partial step
                    prop_assert!((moved - expected).abs() <= dps / 2.0 + 1e-9,
                        "moved {moved}, expected {expected}");
                }
                Err(RewardError::EndTrack(_)) => {
                    prop_assert_eq!(p.position(), before);
                }
                Err(e) => prop_assert!(false, "unexpected error {e}"),
            }
            prop_assert!(p.position() >= 0.0);
            prop_assert!(p.position() <= max);
        }
    }

    #[test]
    fn forward_moves_never_exceed_vol_left(
        start_frac in 0.0f64..=1.0,
        amount in 0.001f64..6.0,
    ) {
        let board = SimBoard::new();
        let p = pump(&board, "BD5mL", StepType::Quarter);
        p.set_position(Holder::new(), start_frac * p.syringe().max_pos()).unwrap();
        let left = p.vol_left();
        let result = p.move_volume(Holder::new(), amount, Direction::Forward, MoveOptions::default());
        if amount > left + 1e-9 {
            prop_assert!(matches!(result, Err(RewardError::EndTrack(_))));
            prop_assert_eq!(board.line(17).rising_writes(), 0);
        } else {
            prop_assert!(result.is_ok());
        }
    }
}
