use std::sync::Arc;

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use reward_core::audio::{render_tone, resample_linear};
use reward_core::pump::{PumpPins, PumpSettings};
use reward_core::{Direction, Holder, MoveOptions, Pump, StepType, Syringe};
use reward_hardware::SimBoard;
use reward_traits::{Board, TestClock};

fn sim_pump(board: &SimBoard, step_type: StepType) -> Pump {
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
        syringe: Syringe::from_key("BD5mL").unwrap(),
        step_type,
        step_delay: 0.0005,
        pitch: 0.08,
        invert_direction: false,
    };
    Pump::new("bench", pins, settings, None, Arc::new(TestClock::new())).unwrap()
}

fn bench_tone(c: &mut Criterion) {
    c.bench_function("render_tone_1s_44k", |b| {
        b.iter(|| black_box(render_tone(44_100, black_box(6_000.0), 1.0, 0.8)))
    });

    let signal: Vec<f32> = (0..48_000).map(|i| (i as f32 / 48.0).sin()).collect();
    c.bench_function("resample_48k_to_44k", |b| {
        b.iter(|| black_box(resample_linear(black_box(&signal), 48_000, 44_100)))
    });
}

fn bench_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("move_volume");
    for step_type in [StepType::Half, StepType::Sixteenth] {
        group.bench_function(step_type.label(), |b| {
            b.iter_batched(
                || {
                    let board = SimBoard::new();
                    let pump = sim_pump(&board, step_type);
                    pump.set_position(Holder::new(), pump.syringe().max_pos())
                        .unwrap();
                    (board, pump)
                },
                |(_board, pump)| {
                    black_box(
                        pump.move_volume(
                            Holder::new(),
                            0.1,
                            Direction::Forward,
                            MoveOptions::default(),
                        )
                        .unwrap(),
                    )
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_tone, bench_steps);
criterion_main!(benches);
