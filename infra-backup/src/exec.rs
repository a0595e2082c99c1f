//! Command execution on inventory hosts.
//!
//! Local hosts run commands through `sh -c` with `tokio::process`; remote
//! hosts use an `ssh2` session driven from `spawn_blocking`. Both honor a
//! per-operation timeout, and [`with_remote_temp`] guarantees that scratch
//! directories created on a host are removed whether the body succeeds,
//! fails or times out.

use crate::error::BackupError;
use crate::inventory::HostConnection;
use async_trait::async_trait;
use std::future::Future;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("{host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("'{command}' on {host} timed out after {secs}s")]
    Timeout {
        host: String,
        command: String,
        secs: u64,
    },

    #[error("'{program}' on {host} exited with {code}: {stderr}", program = first_word(.command))]
    Failed {
        host: String,
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("SSH error on {host}: {reason}")]
    Ssh { host: String, reason: String },

    #[error("work on {host} cancelled")]
    Cancelled { host: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ExecError> for BackupError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Unreachable { host, reason } => BackupError::RemoteUnreachable { host, reason },
            ExecError::Timeout { command, secs, .. } => BackupError::Timeout {
                secs,
                operation: command,
            },
            ExecError::Failed { host, code, stderr, command } => BackupError::ExtractionFailed {
                host,
                reason: format!("'{}' exited with {code}: {}", first_word(&command), stderr.trim()),
            },
            ExecError::Ssh { host, reason } => BackupError::RemoteUnreachable { host, reason },
            ExecError::Cancelled { .. } => BackupError::Cancelled,
            ExecError::Io(e) => BackupError::Io(e),
        }
    }
}

fn first_word(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or(command)
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Runs commands and moves files on one host.
#[async_trait]
pub trait HostExec: Send + Sync {
    fn host(&self) -> &str;

    /// Run a shell command and capture its output. A non-zero exit is not an error here.
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ExecError>;

    /// Run a shell command, streaming its stdout into a local file.
    async fn run_to_file(&self, command: &str, dest: &Path, timeout: Duration) -> Result<CommandOutput, ExecError>;

    /// Copy a file from the host to a local path. Returns bytes copied.
    async fn fetch(&self, remote: &str, local: &Path, timeout: Duration) -> Result<u64, ExecError>;

    /// Copy a local file onto the host.
    async fn push(&self, local: &Path, remote: &str, timeout: Duration) -> Result<(), ExecError>;

    /// Run a command and fail on non-zero exit.
    async fn run_checked(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ExecError> {
        let output = self.run(command, timeout).await?;
        if !output.success() {
            return Err(ExecError::Failed {
                host: self.host().to_string(),
                command: command.to_string(),
                code: output.code,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }
}

/// Build the executor for a host: direct process spawning for local
/// addresses, SSH otherwise.
pub fn for_host(name: &str, connection: &HostConnection, connect_timeout: Duration) -> Arc<dyn HostExec> {
    if connection.is_local() {
        Arc::new(LocalExec::new(name))
    } else {
        Arc::new(SshExec::new(name, connection.clone(), connect_timeout))
    }
}

/// Quote a string for POSIX `sh`.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | '@' | ','))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Create a scratch directory on the host, run `body` with its path, and
/// remove the directory afterwards on every path, including when the body
/// exceeds `timeout` or `cancel` fires while it runs.
pub async fn with_remote_temp<T, F, Fut>(
    exec: &dyn HostExec,
    prefix: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    body: F,
) -> Result<T, ExecError>
where
    F: FnOnce(String) -> Fut + Send,
    Fut: Future<Output = Result<T, ExecError>> + Send,
{
    let created = exec
        .run_checked(&format!("mktemp -d /tmp/{}.XXXXXX", shell_quote(prefix)), timeout)
        .await?;
    let dir = created.stdout.trim().to_string();
    if dir.is_empty() || !dir.starts_with("/tmp/") {
        return Err(ExecError::Failed {
            host: exec.host().to_string(),
            command: "mktemp".into(),
            code: 0,
            stderr: format!("unexpected temp path '{dir}'"),
        });
    }

    let result = tokio::select! {
        finished = tokio::time::timeout(timeout, body(dir.clone())) => match finished {
            Ok(result) => result,
            Err(_) => Err(ExecError::Timeout {
                host: exec.host().to_string(),
                command: format!("{prefix} extraction"),
                secs: timeout.as_secs(),
            }),
        },
        _ = cancel.cancelled() => {
            warn!(host = exec.host(), dir = %dir, "Cancelled, removing remote temp dir");
            Err(ExecError::Cancelled {
                host: exec.host().to_string(),
            })
        }
    };

    let cleanup = format!("rm -rf {}", shell_quote(&dir));
    match exec.run(&cleanup, Duration::from_secs(60)).await {
        Ok(out) if out.success() => debug!(host = exec.host(), dir = %dir, "Removed remote temp dir"),
        Ok(out) => warn!(host = exec.host(), dir = %dir, stderr = %out.stderr.trim(), "Remote temp cleanup failed"),
        Err(e) => warn!(host = exec.host(), dir = %dir, error = %e, "Remote temp cleanup failed"),
    }

    result
}

// ── Local ──

pub struct LocalExec {
    name: String,
}

impl LocalExec {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string() }
    }

    fn command(command: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command).kill_on_drop(true);
        cmd
    }

    fn timeout_error(&self, command: &str, timeout: Duration) -> ExecError {
        ExecError::Timeout {
            host: self.name.clone(),
            command: first_word(command).to_string(),
            secs: timeout.as_secs(),
        }
    }
}

#[async_trait]
impl HostExec for LocalExec {
    fn host(&self) -> &str {
        &self.name
    }

    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ExecError> {
        let mut cmd = Self::command(command);
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let child = cmd.output();

        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| self.timeout_error(command, timeout))??;

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_to_file(&self, command: &str, dest: &Path, timeout: Duration) -> Result<CommandOutput, ExecError> {
        let file = std::fs::File::create(dest)?;
        let mut child = Self::command(command)
            .stdin(Stdio::null())
            .stdout(Stdio::from(file))
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stderr_pipe = child.stderr.take();
        let wait = async {
            let mut stderr = String::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                pipe.read_to_string(&mut stderr).await?;
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, stderr))
        };

        let (status, stderr) = tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| self.timeout_error(command, timeout))??;

        Ok(CommandOutput {
            code: status.code().unwrap_or(-1),
            stdout: String::new(),
            stderr,
        })
    }

    async fn fetch(&self, remote: &str, local: &Path, timeout: Duration) -> Result<u64, ExecError> {
        tokio::time::timeout(timeout, tokio::fs::copy(remote, local))
            .await
            .map_err(|_| self.timeout_error("copy", timeout))?
            .map_err(ExecError::from)
    }

    async fn push(&self, local: &Path, remote: &str, timeout: Duration) -> Result<(), ExecError> {
        tokio::time::timeout(timeout, tokio::fs::copy(local, remote))
            .await
            .map_err(|_| self.timeout_error("copy", timeout))??;
        Ok(())
    }
}

// ── SSH ──

pub struct SshExec {
    name: String,
    connection: HostConnection,
    connect_timeout: Duration,
}

impl SshExec {
    pub fn new(name: &str, connection: HostConnection, connect_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            connection,
            connect_timeout,
        }
    }

    fn ssh_error(host: &str, e: impl std::fmt::Display) -> ExecError {
        ExecError::Ssh {
            host: host.to_string(),
            reason: e.to_string(),
        }
    }

    /// Open an authenticated session. Blocking.
    fn session(name: &str, conn: &HostConnection, connect_timeout: Duration, op_timeout: Duration) -> Result<ssh2::Session, ExecError> {
        let unreachable = |reason: String| ExecError::Unreachable {
            host: name.to_string(),
            reason,
        };

        let addr = (conn.address.as_str(), conn.port)
            .to_socket_addrs()
            .map_err(|e| unreachable(e.to_string()))?
            .next()
            .ok_or_else(|| unreachable("address did not resolve".into()))?;
        let tcp = TcpStream::connect_timeout(&addr, connect_timeout).map_err(|e| unreachable(e.to_string()))?;

        let mut sess = ssh2::Session::new().map_err(|e| Self::ssh_error(name, e))?;
        sess.set_tcp_stream(tcp);
        sess.set_timeout(op_timeout.as_millis().min(u32::MAX as u128) as u32);
        sess.handshake().map_err(|e| unreachable(format!("handshake: {e}")))?;

        match &conn.key_path {
            Some(key) => sess.userauth_pubkey_file(&conn.user, None, key, None),
            None => sess.userauth_agent(&conn.user),
        }
        .map_err(|e| unreachable(format!("authentication failed: {e}")))?;

        if !sess.authenticated() {
            return Err(unreachable("authentication failed".into()));
        }
        Ok(sess)
    }

    /// Run `f` against a fresh session on the blocking pool, bounded by `timeout`.
    async fn blocking<T, F>(&self, label: &str, timeout: Duration, f: F) -> Result<T, ExecError>
    where
        T: Send + 'static,
        F: FnOnce(&ssh2::Session, &str) -> Result<T, ExecError> + Send + 'static,
    {
        let name = self.name.clone();
        let conn = self.connection.clone();
        let connect_timeout = self.connect_timeout;

        let task = tokio::task::spawn_blocking(move || {
            let sess = Self::session(&name, &conn, connect_timeout, timeout)?;
            f(&sess, &name)
        });

        match tokio::time::timeout(timeout + connect_timeout, task).await {
            Ok(joined) => joined.map_err(|e| Self::ssh_error(&self.name, e))?,
            Err(_) => Err(ExecError::Timeout {
                host: self.name.clone(),
                command: label.to_string(),
                secs: timeout.as_secs(),
            }),
        }
    }

    fn exec_channel(
        sess: &ssh2::Session,
        host: &str,
        command: &str,
        sink: &mut dyn std::io::Write,
    ) -> Result<CommandOutput, ExecError> {
        let mut channel = sess.channel_session().map_err(|e| Self::ssh_error(host, e))?;
        channel.exec(command).map_err(|e| Self::ssh_error(host, e))?;

        std::io::copy(&mut channel, sink)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;

        channel.wait_close().map_err(|e| Self::ssh_error(host, e))?;
        let code = channel.exit_status().map_err(|e| Self::ssh_error(host, e))?;
        Ok(CommandOutput {
            code,
            stdout: String::new(),
            stderr,
        })
    }
}

#[async_trait]
impl HostExec for SshExec {
    fn host(&self) -> &str {
        &self.name
    }

    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ExecError> {
        let cmd = command.to_string();
        self.blocking(first_word(command), timeout, move |sess, host| {
            let mut stdout = Vec::new();
            let mut output = Self::exec_channel(sess, host, &cmd, &mut stdout)?;
            output.stdout = String::from_utf8_lossy(&stdout).into_owned();
            Ok(output)
        })
        .await
    }

    async fn run_to_file(&self, command: &str, dest: &Path, timeout: Duration) -> Result<CommandOutput, ExecError> {
        let cmd = command.to_string();
        let dest = dest.to_path_buf();
        self.blocking(first_word(command), timeout, move |sess, host| {
            let mut file = std::fs::File::create(&dest)?;
            Self::exec_channel(sess, host, &cmd, &mut file)
        })
        .await
    }

    async fn fetch(&self, remote: &str, local: &Path, timeout: Duration) -> Result<u64, ExecError> {
        let remote = PathBuf::from(remote);
        let local = local.to_path_buf();
        self.blocking("sftp fetch", timeout, move |sess, host| {
            let sftp = sess.sftp().map_err(|e| Self::ssh_error(host, e))?;
            let mut src = sftp.open(&remote).map_err(|e| Self::ssh_error(host, e))?;
            let mut dst = std::fs::File::create(&local)?;
            Ok(std::io::copy(&mut src, &mut dst)?)
        })
        .await
    }

    async fn push(&self, local: &Path, remote: &str, timeout: Duration) -> Result<(), ExecError> {
        let remote = PathBuf::from(remote);
        let local = local.to_path_buf();
        self.blocking("sftp push", timeout, move |sess, host| {
            let sftp = sess.sftp().map_err(|e| Self::ssh_error(host, e))?;
            let mut src = std::fs::File::open(&local)?;
            let mut dst = sftp.create(&remote).map_err(|e| Self::ssh_error(host, e))?;
            std::io::copy(&mut src, &mut dst)?;
            Ok(())
        })
        .await
    }
}
