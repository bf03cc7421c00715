//! Command-line argument definitions (clap) and help text.

use std::path::PathBuf;

use clap::{ArgGroup, Parser};

pub const HELP_TEXT: &str = "
Sentinel HL - UPS-aware homelab power manager
Usage: sentinel-hl [OPTIONS]

Without a mode flag, runs one discovery/poll/check pass and exits.

Options:
  -h, --help                    Print help
  -V, --version                 Print version
Modes:
  -d, --daemon                  Run as a service with periodic UPS polling and host checks
      --reload                  Signal the running daemon to reload its configuration
      --clear-caches            Clear host and UPS caches, then signal the daemon to reload
      --check                   Validate the configuration and print a summary
Configuration & Logs:
  -c, --config <CONFIG>         Configuration file (default: first of /etc/sentinel-hl/config.yml,
                                /etc/opt/sentinel-hl/config.yml, ~/.config/sentinel-hl/config.yml)
      --log-level <LOG_LEVEL>   Log level (TRACE, DEBUG, INFO, WARN, ERROR, CRITICAL)
      --log-file <LOG_FILE>     Append logs to this file instead of stderr
";

#[derive(Parser, Debug, Default)]
#[command(name = "sentinel-hl")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "UPS-aware homelab power manager", long_about = None)]
#[command(group(ArgGroup::new("mode").args(["daemon", "reload", "clear_caches", "check"])))]
pub struct Args {
    // === Modes ===
    /// Run as a service with periodic UPS polling and host checks
    #[arg(short = 'd', long, help_heading = "Modes")]
    pub daemon: bool,

    /// Signal the running daemon to reload its configuration
    #[arg(long, help_heading = "Modes")]
    pub reload: bool,

    /// Clear host and UPS caches, then signal the daemon to reload
    #[arg(long = "clear-caches", help_heading = "Modes")]
    pub clear_caches: bool,

    /// Validate the configuration and print a summary
    #[arg(long, help_heading = "Modes")]
    pub check: bool,

    // === Configuration & Logs ===
    /// Configuration file
    #[arg(short = 'c', long, help_heading = "Configuration & Logs")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR, CRITICAL)
    #[arg(long = "log-level", help_heading = "Configuration & Logs")]
    pub log_level: Option<String>,

    /// Append logs to this file instead of stderr
    #[arg(long = "log-file", help_heading = "Configuration & Logs")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    RunOnce,
    Daemon,
    Reload,
    ClearCaches,
    Check,
}

impl Args {
    pub fn mode(&self) -> Mode {
        if self.daemon {
            Mode::Daemon
        } else if self.reload {
            Mode::Reload
        } else if self.clear_caches {
            Mode::ClearCaches
        } else if self.check {
            Mode::Check
        } else {
            Mode::RunOnce
        }
    }
}
