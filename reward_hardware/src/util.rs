use std::time::{Duration, Instant};

/// Time-window debouncer for mechanical switches.
///
/// An edge is accepted when no other edge was accepted within `window`.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    last: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Returns true when the edge observed at `now` should be acted on.
    pub fn accept(&mut self, now: Instant) -> bool {
        match self.last {
            Some(prev) if now.saturating_duration_since(prev) < self.window => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Channel value that routes a mono buffer to both sides.
pub const BOTH_CHANNELS: u8 = 2;

/// Interleave a mono buffer into stereo frames, placing the signal on
/// `channel` (0 = left, 1 = right, `BOTH_CHANNELS`) and silence elsewhere.
pub fn route_to_channel(samples: &[i16], channel: u8) -> Vec<i16> {
    let (left, right) = match channel {
        0 => (true, false),
        1 => (false, true),
        _ => (true, true),
    };
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.push(if left { s } else { 0 });
        out.push(if right { s } else { 0 });
    }
    out
}
