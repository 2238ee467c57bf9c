use clap::Parser;
use eyre::WrapErr;
use reward_cli::cli::{Cli, Commands, JSON_MODE, RtLock};
use reward_cli::error_fmt::{exit_code_for_error, format_error_json, humanize};
use reward_cli::server::ServerOptions;
use reward_cli::{client, rt, server, telemetry};
use reward_config::Logging;

fn main() {
    let _ = color_eyre::install();
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);

    if let Err(e) = run(cli) {
        if JSON_MODE.get().copied().unwrap_or(false) {
            eprintln!("{}", format_error_json(&e));
        } else {
            eprintln!("{}", humanize(&e));
        }
        std::process::exit(exit_code_for_error(&e));
    }
}

fn run(cli: Cli) -> eyre::Result<()> {
    match cli.cmd {
        Commands::Server {
            host,
            port,
            simulate,
            reset_positions,
            rt: want_rt,
            rt_prio,
            rt_lock,
            rt_cpu,
        } => {
            let cfg = reward_config::load_file(&cli.config)?;
            let level = cli
                .log_level
                .as_deref()
                .or(cfg.logging.level.as_deref())
                .unwrap_or("info");
            telemetry::init(cli.json, level, &cfg.logging)?;
            rt::setup_rt_once(
                want_rt,
                rt_prio,
                rt_lock.unwrap_or_else(RtLock::os_default),
                rt_cpu,
            );
            let opts = ServerOptions {
                host: host.unwrap_or_else(|| cfg.server.host.clone()),
                port: port.unwrap_or(cfg.server.port),
                simulate,
                reset_positions,
            };
            server::serve(&cfg, &opts).wrap_err("server failed")
        }
        Commands::Client { host, port, exec } => {
            telemetry::init(
                cli.json,
                cli.log_level.as_deref().unwrap_or("warn"),
                &Logging::default(),
            )?;
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            client::run(&host, port, &exec, stdin.lock(), stdout.lock())
        }
        Commands::Check => {
            let cfg = reward_config::load_file(&cli.config)?;
            let summary = serde_json::json!({
                "config": cli.config.display().to_string(),
                "pumps": cfg.pumps.keys().collect::<Vec<_>>(),
                "modules": cfg.modules.keys().collect::<Vec<_>>(),
                "speakers": cfg.speakers.keys().collect::<Vec<_>>(),
                "plugins": cfg.plugins.keys().collect::<Vec<_>>(),
                "listen": format!("{}:{}", cfg.server.host, cfg.server.port),
            });
            if cli.json {
                println!("{summary}");
            } else {
                println!(
                    "config ok: {} pump(s), {} module(s), {} speaker(s), {} plugin(s); listen {}:{}",
                    cfg.pumps.len(),
                    cfg.modules.len(),
                    cfg.speakers.len(),
                    cfg.plugins.len(),
                    cfg.server.host,
                    cfg.server.port
                );
            }
            Ok(())
        }
    }
}
