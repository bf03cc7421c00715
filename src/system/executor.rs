//! Subprocess executor for local and ssh-delivered commands.
//! Used for pings, neighbor-table lookups, remote shutdown and reload signals.

use async_trait::async_trait;
use tracing::{debug, trace};

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("command exited with code {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("empty command")]
    EmptyCommand,
}

/// Target for a command delivered over ssh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHost {
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
}

#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    /// Run `argv` locally, or on `remote` over ssh. Returns trimmed stdout.
    async fn execute(&self, argv: &[&str], remote: Option<&RemoteHost>) -> Result<String, ProcessError>;
}

/// Wrap a command for delivery over ssh in batch mode (never prompts for a password).
pub fn build_ssh_argv(argv: &[&str], remote: &RemoteHost) -> Vec<String> {
    let mut cmd: Vec<String> = vec![
        "ssh".into(),
        "-o".into(),
        "PasswordAuthentication=No".into(),
        "-o".into(),
        "BatchMode=yes".into(),
    ];

    if let Some(port) = remote.port {
        cmd.push("-p".into());
        cmd.push(port.to_string());
    }

    match &remote.user {
        Some(user) => cmd.push(format!("{}@{}", user, remote.host)),
        None => cmd.push(remote.host.clone()),
    }

    cmd.push("exec".into());
    cmd.push(shell_words::join(argv));
    cmd
}

/// Executes commands through `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandExecutor;

#[async_trait]
impl ProcessExecutor for CommandExecutor {
    async fn execute(&self, argv: &[&str], remote: Option<&RemoteHost>) -> Result<String, ProcessError> {
        let argv: Vec<String> = match remote {
            Some(remote) => build_ssh_argv(argv, remote),
            None => argv.iter().map(|s| s.to_string()).collect(),
        };

        let (program, args) = argv.split_first().ok_or(ProcessError::EmptyCommand)?;

        debug!("Executing command: {:?}", argv);

        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProcessError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProcessError::Exit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        trace!("Command {} returned {} bytes", program, stdout.len());
        Ok(stdout)
    }
}

/// `ping -c <count> -W <timeout> <ip>`; any failure means unreachable.
pub async fn ping(executor: &dyn ProcessExecutor, ip: &str, count: u32, timeout: u32) -> Result<(), ProcessError> {
    let count = count.to_string();
    let timeout = timeout.to_string();
    executor
        .execute(&["ping", "-c", &count, "-W", &timeout, ip], None)
        .await
        .map(|_| ())
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    type Responder = dyn Fn(&[String]) -> Result<String, ProcessError> + Send + Sync;

    /// Records every invocation and answers through a caller-supplied closure.
    pub struct FakeExecutor {
        pub calls: Mutex<Vec<(Vec<String>, Option<RemoteHost>)>>,
        responder: Box<Responder>,
    }

    impl FakeExecutor {
        pub fn new(responder: impl Fn(&[String]) -> Result<String, ProcessError> + Send + Sync + 'static) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                responder: Box::new(responder),
            }
        }

        pub fn calls_to(&self, program: &str) -> usize {
            self.calls.lock().iter().filter(|(argv, _)| argv[0] == program).count()
        }
    }

    pub fn exit_error() -> ProcessError {
        ProcessError::Exit { code: Some(1), stderr: "unreachable".into() }
    }

    #[async_trait]
    impl ProcessExecutor for FakeExecutor {
        async fn execute(&self, argv: &[&str], remote: Option<&RemoteHost>) -> Result<String, ProcessError> {
            let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
            self.calls.lock().push((argv.clone(), remote.cloned()));
            (self.responder)(&argv)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_argv_includes_port_user_and_quoted_command() {
        let remote = RemoteHost {
            host: "10.0.0.2".into(),
            port: Some(2222),
            user: Some("admin".into()),
        };
        let argv = build_ssh_argv(&["shutdown", "now"], &remote);
        assert_eq!(
            argv,
            vec![
                "ssh", "-o", "PasswordAuthentication=No", "-o", "BatchMode=yes",
                "-p", "2222", "admin@10.0.0.2", "exec", "shutdown now",
            ]
        );
    }

    #[test]
    fn ssh_argv_without_optional_parts() {
        let remote = RemoteHost { host: "nas".into(), port: None, user: None };
        let argv = build_ssh_argv(&["echo", "a b"], &remote);
        assert_eq!(argv[5], "nas");
        assert_eq!(argv[7], "echo 'a b'");
    }

    #[tokio::test]
    async fn command_executor_reports_exit_code() {
        let exec = CommandExecutor;
        assert_eq!(exec.execute(&["echo", "hello"], None).await.unwrap(), "hello");

        match exec.execute(&["sh", "-c", "echo oops >&2; exit 3"], None).await {
            Err(ProcessError::Exit { code, stderr }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
