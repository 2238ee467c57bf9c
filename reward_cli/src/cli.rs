//! Command line surface of the `reward` binary.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Set from `--json`; selects the structured error format on exit.
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "reward", version, about = "Fluid reward controller server and client")]
pub struct Cli {
    /// Path to config TOML
    #[arg(long, value_name = "FILE", default_value = "etc/reward_config.toml", global = true)]
    pub config: PathBuf,

    /// Log (and report errors) as JSON lines instead of text
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace); overrides [logging] level
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub cmd: Commands,
}

/// How much of the address space `--rt` pins in RAM.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum RtLock {
    /// Leave paging alone
    None,
    /// Pages resident at startup
    Current,
    /// Resident pages plus every later allocation
    All,
}

impl RtLock {
    #[inline]
    pub fn os_default() -> Self {
        if cfg!(target_os = "linux") {
            RtLock::Current
        } else {
            RtLock::None
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller and serve newline-delimited JSON commands over TCP
    Server {
        /// Listen address (default: [server] host)
        #[arg(long)]
        host: Option<String>,
        /// Listen port (default: [server] port)
        #[arg(long)]
        port: Option<u16>,
        /// Use the in-memory board instead of GPIO / I2C / ALSA
        #[arg(long, action = ArgAction::SetTrue)]
        simulate: bool,
        /// Treat every syringe as empty and overwrite stored positions
        #[arg(long, action = ArgAction::SetTrue)]
        reset_positions: bool,
        /// Run step timing threads with real-time scheduling
        #[arg(
            long,
            action = ArgAction::SetTrue,
            long_help = "Enable real-time mode on supported OSes.\n\nLinux: Attempts SCHED_FIFO priority, pins to one CPU, and calls mlockall to keep step timing free of page faults. May require CAP_SYS_NICE and a raised memlock ulimit.\n\nmacOS: Only mlockall is applied."
        )]
        rt: bool,
        /// Real-time priority for SCHED_FIFO on Linux (1..=max)
        #[arg(long, value_name = "PRIO")]
        rt_prio: Option<i32>,
        /// Memory locking mode for --rt: none, current, or all
        #[arg(long, value_enum, value_name = "MODE")]
        rt_lock: Option<RtLock>,
        /// CPU index to pin the server to when --rt is enabled (Linux only)
        #[arg(long, value_name = "CPU")]
        rt_cpu: Option<usize>,
    },
    /// Interactive shell: raw JSON frames or `command key=value ...`
    Client {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8123)]
        port: u16,
        /// Send these lines instead of reading stdin (repeatable)
        #[arg(short = 'e', long = "exec", value_name = "LINE")]
        exec: Vec<String>,
    },
    /// Load and validate the config, then print a summary
    Check,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn clap_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn client_defaults() {
        let cli = Cli::parse_from(["reward", "client"]);
        match cli.cmd {
            Commands::Client { host, port, exec } => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, 8123);
                assert!(exec.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from(["reward", "server", "--port", "9000", "--json", "--log-level", "debug"]);
        assert!(cli.json);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.cmd, Commands::Server { port: Some(9000), .. }));
    }
}
