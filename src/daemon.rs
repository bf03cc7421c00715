//! Daemon paths and submodule re-exports.

pub mod control;
pub mod pid;

use std::path::PathBuf;

pub const APP_NAME: &str = "sentinel-hl";

pub const ROOT_PID_FILE: &str = "/var/run/sentinel-hl.pid";
pub const ROOT_DATA_DIR: &str = "/var/opt/sentinel-hl";

pub const HOSTS_STORE: &str = "hosts.json";
pub const UPS_STORE: &str = "ups.json";

pub fn is_root() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() == 0 }
    }

    #[cfg(not(unix))]
    {
        false
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// `/var/run/sentinel-hl.pid` for root, `~/.sentinel-hl.pid` otherwise.
pub fn pid_file_path() -> PathBuf {
    if is_root() {
        PathBuf::from(ROOT_PID_FILE)
    } else {
        home_dir().join(format!(".{}.pid", APP_NAME))
    }
}

/// Where the host and UPS caches live.
pub fn data_dir() -> PathBuf {
    if is_root() {
        PathBuf::from(ROOT_DATA_DIR)
    } else {
        home_dir().join(format!(".{}", APP_NAME))
    }
}

pub fn hosts_store_path() -> PathBuf {
    data_dir().join(HOSTS_STORE)
}

pub fn ups_store_path() -> PathBuf {
    data_dir().join(UPS_STORE)
}
