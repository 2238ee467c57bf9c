#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Core reward delivery logic (hardware-agnostic).
//!
//! Every GPIO line, port expander and audio sink is reached through the
//! `reward_traits` capabilities, so the whole crate runs against
//! `reward_hardware::SimBoard` in tests.
//!
//! ## Architecture
//!
//! - **Resources**: re-entrant holder locks shared by pumps, valves, LEDs and
//!   lickometers (`resource`)
//! - **Motion**: syringe geometry, microstepping and end-of-track safety (`pump`)
//! - **Delivery**: asynchronous reward, refill and lick-triggered tasks, one
//!   per pump (`delivery`)
//! - **Auto-fill**: low-volume detection and refill scheduling (`autofill`)
//! - **Controller**: configuration wiring, commands and status (`controller`)
//!
//! ## Lock order
//!
//! Compound operations take the pump first, then its fill valve, then the
//! delivery valves. Valve locks are never followed by a pump lock.

pub mod audio;
pub mod autofill;
pub mod controller;
pub mod delivery;
pub mod error;
pub mod event_log;
pub mod hw_error;
pub mod led;
pub mod lickometer;
pub mod manual;
pub mod module;
pub mod persist;
pub mod pump;
pub mod resource;
pub mod syringe;
pub mod util;
pub mod valve;

pub use controller::{Controller, ControllerOptions, RewardOptions};
pub use delivery::{PumpTask, TaskKind, TaskOutcome};
pub use error::{Result, RewardError};
pub use event_log::{EventLevel, EventLog};
pub use pump::{Direction, MoveOptions, MoveReport, PartialMove, Pump, PumpStatus, StepType};
pub use resource::{Holder, LockWait, Resource};
pub use syringe::Syringe;
