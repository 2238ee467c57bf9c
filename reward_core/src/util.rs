//! Clock handle and numeric argument checks shared across reward_core.
use std::sync::Arc;
use std::time::Duration;

use reward_traits::Clock;

/// Clock handle shared by every component of one controller.
pub type SharedClock = Arc<dyn Clock + Send + Sync>;

/// Seconds as a `Duration`; negative or non-finite input yields zero.
#[inline]
pub fn secs(s: f64) -> Duration {
    if s.is_finite() && s > 0.0 {
        Duration::from_secs_f64(s)
    } else {
        Duration::ZERO
    }
}

/// Accept only finite values strictly greater than zero.
pub(crate) fn positive_finite(what: &str, v: f64) -> crate::Result<f64> {
    if v.is_finite() && v > 0.0 {
        Ok(v)
    } else {
        Err(crate::RewardError::InvalidArgument(format!(
            "{what} must be a positive finite number, got {v}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_finite_rejects_zero_and_nan() {
        assert_eq!(positive_finite("x", 0.5).unwrap(), 0.5);
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(positive_finite("x", bad).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn secs_rejects_garbage() {
        assert_eq!(secs(f64::NAN), Duration::ZERO);
        assert_eq!(secs(-1.0), Duration::ZERO);
        assert_eq!(secs(0.02), Duration::from_millis(20));
    }
}
