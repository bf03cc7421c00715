use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

pub fn get_pid(path: &Path) -> Result<Option<u32>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(path).with_context(|| format!("cannot read PID file {:?}", path))?;
    let pid = content
        .trim()
        .parse::<u32>()
        .with_context(|| format!("invalid PID in {:?}: {:?}", path, content.trim()))?;
    Ok(Some(pid))
}

/// Signal 0 checks the process without touching it.
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[cfg(not(unix))]
    {
        false
    }
}

/// Whether the PID file names a live process. A stale file is removed.
pub fn is_running(path: &Path) -> bool {
    match get_pid(path) {
        Ok(Some(pid)) if is_alive(pid) => true,
        Ok(Some(_)) | Err(_) => {
            if let Err(e) = remove_pid_file(path) {
                warn!("Could not remove stale PID file: {:#}", e);
            }
            false
        }
        Ok(None) => false,
    }
}

pub fn save_pid(path: &Path, pid: u32) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("cannot create {:?}", dir))?;
    }
    fs::write(path, pid.to_string()).with_context(|| format!("cannot write PID file {:?}", path))?;
    Ok(())
}

pub fn remove_pid_file(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("cannot remove PID file {:?}", path))?;
    }
    Ok(())
}
