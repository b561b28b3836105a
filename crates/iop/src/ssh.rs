//! SSH transport.
//!
//! A thin wrapper over a multiplexed `openssh` session: run a command
//! and capture its output, or stream a local file to a remote path.
//! Everything the orchestrator does on a server funnels through here.

use std::path::Path;

use openssh::{KnownHosts, Session, SessionBuilder, Stdio};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::config::SshConfig;
use crate::errors::SshError;
use crate::progress::ProgressSender;

const UPLOAD_CHUNK: usize = 64 * 1024;

pub struct SshSession {
    session: Session,
    host: String,
}

#[derive(Debug)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl SshSession {
    pub async fn connect(config: &SshConfig, host: &str) -> Result<Self, SshError> {
        let mut builder = SessionBuilder::default();
        builder
            .user(config.username.clone())
            .port(config.port)
            .known_hosts_check(KnownHosts::Accept);
        if let Some(key) = &config.key_file {
            builder.keyfile(key);
        }

        let session = builder
            .connect_mux(host)
            .await
            .map_err(|source| SshError::Connect {
                host: host.to_string(),
                source,
            })?;

        debug!(host, user = %config.username, "ssh session established");
        Ok(Self {
            session,
            host: host.to_string(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Run a command, capturing output regardless of exit status.
    pub async fn exec(&self, program: &str, args: &[&str]) -> Result<CommandOutput, SshError> {
        let mut command = self.session.command(program);
        command.args(args);
        let output = command
            .output()
            .await
            .map_err(|source| SshError::Spawn {
                host: self.host.clone(),
                source,
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run a command and fail on a nonzero exit, returning stdout.
    pub async fn exec_ok(&self, program: &str, args: &[&str]) -> Result<String, SshError> {
        let output = self.exec(program, args).await?;
        if !output.success() {
            return Err(SshError::CommandFailed {
                host: self.host.clone(),
                command: format!("{program} {}", args.join(" ")),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Stream a local file to a remote path, reporting byte progress.
    /// The transfer runs through a remote `cat` so no sftp subsystem is
    /// required on the server.
    pub async fn upload(
        &self,
        local: &Path,
        remote: &str,
        progress: &ProgressSender,
    ) -> Result<(), SshError> {
        let upload_err = |message: String| SshError::Upload {
            host: self.host.clone(),
            path: remote.to_string(),
            message,
        };

        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| upload_err(format!("open {}: {e}", local.display())))?;
        let total = file
            .metadata()
            .await
            .map_err(|e| upload_err(e.to_string()))?
            .len();

        let script = format!("cat > {}", shell_quote(remote));
        let mut child = self
            .session
            .command("sh")
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .await
            .map_err(|source| SshError::Spawn {
                host: self.host.clone(),
                source,
            })?;

        let mut stdin = child
            .stdin()
            .take()
            .ok_or_else(|| upload_err("remote stdin unavailable".to_string()))?;

        let mut transferred = 0u64;
        let mut buffer = vec![0u8; UPLOAD_CHUNK];
        loop {
            let n = file
                .read(&mut buffer)
                .await
                .map_err(|e| upload_err(e.to_string()))?;
            if n == 0 {
                break;
            }
            stdin
                .write_all(&buffer[..n])
                .await
                .map_err(|e| upload_err(e.to_string()))?;
            transferred += n as u64;
            progress.report(transferred, total);
        }
        stdin
            .shutdown()
            .await
            .map_err(|e| upload_err(e.to_string()))?;
        drop(stdin);

        let status = child
            .wait()
            .await
            .map_err(|e| upload_err(e.to_string()))?;
        if !status.success() {
            return Err(upload_err(format!(
                "remote cat exited with {:?}",
                status.code()
            )));
        }
        Ok(())
    }

    pub async fn close(self) -> Result<(), SshError> {
        self.session.close().await.map_err(|source| SshError::Spawn {
            host: self.host.clone(),
            source,
        })
    }
}

/// Single-quote a string for `sh -c`.
pub fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_wraps_and_escapes() {
        assert_eq!(shell_quote("/tmp/a.tar.gz"), "'/tmp/a.tar.gz'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
