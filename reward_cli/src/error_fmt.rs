//! Human-readable error descriptions and structured JSON error formatting.

use reward_core::RewardError;

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    if let Some(re) = err.chain().find_map(|e| e.downcast_ref::<RewardError>()) {
        return match re {
            RewardError::Hardware(msg) => format!(
                "What happened: Hardware access failed ({msg}).\nLikely causes: Wrong pin numbers, missing GPIO/I2C permissions, or the device is not a Raspberry Pi.\nHow to fix: Check the pins in the config, run as a user in the gpio/i2c groups, or start with --simulate."
            ),
            RewardError::Io(msg) => format!(
                "What happened: A file could not be read or written ({msg}).\nLikely causes: state_dir or data_dir missing or not writable.\nHow to fix: Create the directories or point state_dir/data_dir somewhere writable."
            ),
            RewardError::Config(msg) | RewardError::InvalidArgument(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the TOML.\nHow to fix: Edit the config file, then rerun `check` before starting the server."
            ),
            RewardError::MissingResource(msg) => format!(
                "What happened: A referenced resource does not exist ({msg}).\nLikely causes: A module, pump or speaker name is misspelled.\nHow to fix: Compare the names in the config with those used in commands."
            ),
            other => format!(
                "What happened: {other}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    let msg = format!("{err:#}");
    let lower = msg.to_ascii_lowercase();

    if lower.contains("read config") {
        return format!(
            "What happened: The config file could not be read.\nLikely causes: Wrong --config path (default etc/reward_config.toml).\nHow to fix: Pass --config <FILE> pointing at an existing TOML file. Original: {msg}"
        );
    }

    if lower.contains("parse config") || lower.contains("invalid config") {
        return format!(
            "What happened: Configuration is invalid.\nLikely causes: {msg}\nHow to fix: Edit the TOML config and try again."
        );
    }

    if lower.contains("bind ") {
        return format!(
            "What happened: The server could not listen.\nLikely causes: Port already in use or insufficient privileges.\nHow to fix: Stop the other server or pass --port. Original: {msg}"
        );
    }

    if lower.contains("connect ") {
        return format!(
            "What happened: The client could not reach the server.\nLikely causes: Server not running, or wrong --host/--port.\nHow to fix: Start `reward server` first. Original: {msg}"
        );
    }

    if lower.contains("hardware backend not built") {
        return format!("What happened: {msg}.");
    }

    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

fn reason(err: &eyre::Report) -> &'static str {
    match err.chain().find_map(|e| e.downcast_ref::<RewardError>()) {
        Some(re) => re.kind(),
        None => {
            let msg = format!("{err:#}").to_ascii_lowercase();
            if msg.contains("config") {
                "ConfigError"
            } else if msg.contains("bind ") || msg.contains("connect ") {
                "NetworkError"
            } else {
                "Error"
            }
        }
    }
}

/// Stable exit codes: 2 config, 3 hardware, 4 network, 1 anything else.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    match reason(err) {
        "ConfigError" | "ValueError" => 2,
        "HardwareError" => 3,
        "NetworkError" => 4,
        _ => 1,
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    serde_json::json!({ "reason": reason(err), "message": humanize(err) }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::WrapErr;

    #[test]
    fn typed_errors_are_found_through_context() {
        let err: eyre::Report = Err::<(), _>(RewardError::Hardware("gpio busy".into()))
            .wrap_err("open board")
            .unwrap_err();
        assert!(humanize(&err).contains("gpio busy"));
        assert_eq!(exit_code_for_error(&err), 3);
        let v: serde_json::Value = serde_json::from_str(&format_error_json(&err)).unwrap();
        assert_eq!(v["reason"], "HardwareError");
    }

    #[test]
    fn config_messages_map_to_exit_code_two() {
        let err = eyre::eyre!("invalid config r.toml: pumps.p.step_delay must be > 0");
        assert_eq!(exit_code_for_error(&err), 2);
        assert!(humanize(&err).contains("Configuration is invalid"));
    }

    #[test]
    fn unknown_errors_fall_back() {
        let err = eyre::eyre!("boom");
        assert_eq!(exit_code_for_error(&err), 1);
        assert!(humanize(&err).starts_with("Something went wrong."));
    }
}
