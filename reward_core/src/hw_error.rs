//! Maps `Box<dyn Error>` from trait boundaries to typed `RewardError`.
//!
//! The traits in `reward_traits` use `Box<dyn Error + Send + Sync>` so any
//! backend can report its own failures; this module converts those to our
//! typed error enum, with an optional feature-gated path for
//! `reward_hardware::HwError` downcasting.

use crate::error::RewardError;

/// Map a trait-boundary error to a typed `RewardError`.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> RewardError {
    #[cfg(feature = "hardware-errors")]
    {
        if let Some(hw) = e.downcast_ref::<reward_hardware::HwError>() {
            return match hw {
                reward_hardware::HwError::Io(io) => RewardError::Io(io.to_string()),
                reward_hardware::HwError::Busy(pin) => {
                    RewardError::ResourceLocked(format!("gpio line {pin}"))
                }
                other => RewardError::Hardware(other.to_string()),
            };
        }
    }

    if let Some(io) = e.downcast_ref::<std::io::Error>() {
        return RewardError::Io(io.to_string());
    }
    RewardError::Hardware(e.to_string())
}

/// Convenience for `map_err` on trait results.
pub(crate) fn hw(e: Box<dyn std::error::Error + Send + Sync>) -> RewardError {
    map_hw_error(&*e)
}
