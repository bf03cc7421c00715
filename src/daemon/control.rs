use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tracing::info;

use crate::daemon::pid::get_pid;
use crate::system::executor::ProcessExecutor;

/// Ask the running daemon to reinitialize (SIGHUP), using the PID from `pid_path`.
pub async fn send_reload_signal(executor: &dyn ProcessExecutor, pid_path: &Path) -> Result<()> {
    let pid = get_pid(pid_path)?.ok_or_else(|| anyhow!("daemon is not running (no PID file at {:?})", pid_path))?;

    let pid = pid.to_string();
    executor
        .execute(&["kill", "-HUP", &pid], None)
        .await
        .with_context(|| format!("failed to signal process {}", pid))?;

    info!("Reload signal sent to process {}", pid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::pid::save_pid;
    use crate::system::executor::testing::{exit_error, FakeExecutor};

    #[tokio::test]
    async fn sends_hup_to_recorded_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.pid");
        save_pid(&path, 4242).unwrap();

        let exec = FakeExecutor::new(|_| Ok(String::new()));
        send_reload_signal(&exec, &path).await.unwrap();

        let calls = exec.calls.lock();
        assert_eq!(calls[0].0, vec!["kill", "-HUP", "4242"]);
        assert!(calls[0].1.is_none());
    }

    #[tokio::test]
    async fn missing_or_invalid_pid_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.pid");
        let exec = FakeExecutor::new(|_| Ok(String::new()));

        assert!(send_reload_signal(&exec, &path).await.is_err());

        std::fs::write(&path, "garbage").unwrap();
        assert!(send_reload_signal(&exec, &path).await.is_err());
        assert_eq!(exec.calls_to("kill"), 0);
    }

    #[tokio::test]
    async fn failed_kill_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.pid");
        save_pid(&path, 4242).unwrap();

        let exec = FakeExecutor::new(|_| Err(exit_error()));
        assert!(send_reload_signal(&exec, &path).await.is_err());
    }
}
