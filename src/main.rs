//! Sentinel HL entry point: CLI dispatch, logging setup, mode selection.

mod app;
mod clock;
mod config;
mod daemon;
mod manager;
mod network;
mod services;
mod store;
mod system;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use app::cli::{Args, Mode, HELP_TEXT};
use app::logging::{init_tracing, resolve_filter};
use config::persistence::{load_config, ConfigError};
use config::types::SentinelConfig;
use store::JsonDatastore;
use system::executor::CommandExecutor;

/// Exit code for an invalid configuration document.
const EXIT_CONFIG_INVALID: i32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            if err.kind() == clap::error::ErrorKind::DisplayHelp {
                print!("{}", HELP_TEXT);
                std::process::exit(0);
            }
            if err.kind() == clap::error::ErrorKind::DisplayVersion {
                println!("sentinel-hl {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }

            eprintln!("{}", err);
            eprintln!("\nFor more information, try '--help'.");
            std::process::exit(1);
        }
    };

    // Priority: 1. --log-level flag, 2. LOG_LEVEL env, 3. default (info)
    let env_level = std::env::var("LOG_LEVEL").ok();
    let filter = resolve_filter(args.log_level.as_deref(), env_level.as_deref());
    init_tracing(filter, args.log_file.as_deref())?;

    let mode = args.mode();
    let pid_path = daemon::pid_file_path();

    match mode {
        Mode::Reload => {
            if let Err(e) = manager::reload(&CommandExecutor, &pid_path).await {
                error!("Failed to reload: {:#}", e);
                std::process::exit(1);
            }
            return Ok(());
        }
        Mode::ClearCaches => {
            let hosts = JsonDatastore::open(daemon::hosts_store_path())?;
            let ups = JsonDatastore::open(daemon::ups_store_path())?;
            return manager::clear_caches(&hosts, &ups, &CommandExecutor, &pid_path).await;
        }
        _ => {}
    }

    let config = load_or_exit(&args).await;

    match mode {
        Mode::Check => {
            print_summary(&config);
            Ok(())
        }
        Mode::Daemon => {
            info!("Sentinel HL v{} starting in daemon mode", env!("CARGO_PKG_VERSION"));
            manager::run_daemon(args.config.clone(), config).await
        }
        _ => {
            info!("Sentinel HL v{} running a single pass", env!("CARGO_PKG_VERSION"));
            manager::run_once(&config).await
        }
    }
}

/// Load the configuration; a validation failure prints every field error and exits with code 2.
async fn load_or_exit(args: &Args) -> SentinelConfig {
    match load_config(args.config.as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            match e.downcast_ref::<ConfigError>() {
                Some(invalid) => {
                    eprintln!("{}", invalid);
                    std::process::exit(EXIT_CONFIG_INVALID);
                }
                None => {
                    eprintln!("ERROR: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}

fn print_summary(config: &SentinelConfig) {
    println!("Configuration is valid");
    println!("  Hosts: {}", config.hosts.len());
    for host in &config.hosts {
        let address = host.ip.as_deref().or(host.hostname.as_deref()).unwrap_or("-");
        println!("    - {} ({})", host.name, address);
    }
    println!("  UPS units: {}", config.ups.len());
    for ups in &config.ups {
        println!(
            "    - {} ({}@{}:{}) -> [{}]",
            ups.name,
            ups.nut_id,
            ups.nut_host,
            ups.nut_port,
            ups.hosts.join(", ")
        );
    }
    println!("  Shutdown threshold: {}", config.ups_units_policy.shutdown_threshold);
    println!(
        "  Intervals: UPS poll {}s, host check {}s",
        config.ups_poll_interval, config.hosts_check_interval
    );
}
