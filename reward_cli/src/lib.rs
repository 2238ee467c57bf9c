//! Network front end of the reward controller.
//!
//! - `protocol`: request frames, argument decoding and dispatch onto `Controller`
//! - `server`: TCP listener, one thread per connection
//! - `client`: line-oriented shell talking to a server
//! - `telemetry`: tracing subscriber setup
//! - `error_fmt`: user-facing error text and exit codes
pub mod cli;
pub mod client;
pub mod error_fmt;
pub mod protocol;
pub mod rt;
pub mod server;
pub mod telemetry;
