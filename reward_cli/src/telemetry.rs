//! Diagnostic logging setup: console layer plus an optional rolling file.

use std::path::Path;

use eyre::eyre;
use reward_config::Logging;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::FILE_GUARD;

/// Install the global subscriber. `RUST_LOG` directives are honoured on top
/// of `level`. Calling twice is an error from `try_init`, reported as such.
pub fn init(json: bool, level: &str, logging: &Logging) -> eyre::Result<()> {
    let level: tracing::Level = level
        .parse()
        .map_err(|_| eyre!("invalid log level '{level}' (error|warn|info|debug|trace)"))?;
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let (json_console, text_console) = if json {
        (Some(fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (None, Some(fmt::layer().compact().with_writer(std::io::stderr)))
    };

    let file_layer = match logging.file.as_deref() {
        Some(path) => {
            let path = Path::new(path);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| eyre!("[logging] file '{}' has no file name", path.display()))?;
            let appender = match logging.rotation.as_deref().unwrap_or("never") {
                "daily" => rolling::daily(dir, name),
                "hourly" => rolling::hourly(dir, name),
                _ => rolling::never(dir, name),
            };
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(fmt::layer().json().with_ansi(false).with_writer(writer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_console)
        .with(text_console)
        .with(file_layer)
        .try_init()
        .map_err(|e| eyre!("initialise logging: {e}"))
}
