use std::time::{Duration, Instant};

use reward_hardware::util::{Debouncer, route_to_channel};
use rstest::rstest;

#[test]
fn first_edge_is_always_accepted() {
    let mut d = Debouncer::new(Duration::from_millis(50));
    assert!(d.accept(Instant::now()));
}

#[rstest]
#[case(10, false)]
#[case(49, false)]
#[case(50, true)]
#[case(200, true)]
fn second_edge_respects_window(#[case] gap_ms: u64, #[case] accepted: bool) {
    let mut d = Debouncer::new(Duration::from_millis(50));
    let t0 = Instant::now();
    assert!(d.accept(t0));
    assert_eq!(d.accept(t0 + Duration::from_millis(gap_ms)), accepted);
}

#[test]
fn bounce_train_counts_once() {
    let mut d = Debouncer::new(Duration::from_millis(20));
    let t0 = Instant::now();
    let accepted = (0..10)
        .filter(|i| d.accept(t0 + Duration::from_millis(i * 2)))
        .count();
    assert_eq!(accepted, 1);
}

#[test]
fn mono_signal_lands_on_requested_channel() {
    let left = route_to_channel(&[1, 2, 3], 0);
    assert_eq!(left, vec![1, 0, 2, 0, 3, 0]);
    let right = route_to_channel(&[1, 2], 1);
    assert_eq!(right, vec![0, 1, 0, 2]);
}

#[test]
fn both_channels_duplicate_the_signal() {
    let both = route_to_channel(&[7, -7], reward_hardware::util::BOTH_CHANNELS);
    assert_eq!(both, vec![7, 7, -7, -7]);
}
