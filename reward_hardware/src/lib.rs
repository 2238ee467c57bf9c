//! Hardware backends for the reward controller.
//!
//! - `sim`: in-memory board for tests and `--simulate` servers (always built)
//! - `rpi`: Raspberry Pi GPIO / I2C / ALSA backend (`hardware` feature)
pub mod error;
pub mod sim;
pub mod util;

#[cfg(all(feature = "hardware", target_os = "linux"))]
pub mod rpi;

pub use error::HwError;
pub use sim::{PlayedClip, SimAudioState, SimBoard, SimExpanderState, SimLine};

#[cfg(all(feature = "hardware", target_os = "linux"))]
pub use rpi::RpiBoard;
