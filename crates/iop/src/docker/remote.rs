//! Remote container engine driver.
//!
//! Same CLI surface as the local driver, transported over the ssh
//! session. Container reads go through `docker inspect` because its
//! JSON carries complete label maps and per-network alias lists, which
//! `docker ps --format` does not.

use std::collections::BTreeMap;

use tracing::debug;

use super::ContainerDetails;
use crate::errors::DockerError;
use crate::ssh::{CommandOutput, SshSession, shell_quote};

pub struct RemoteDocker<'a> {
    ssh: &'a SshSession,
}

/// Everything needed to create one container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    /// Resolved `host:container` mounts.
    pub volumes: Vec<String>,
    pub ports: Vec<String>,
    /// Network to join at creation; `None` leaves the engine default.
    pub network: Option<String>,
    pub aliases: Vec<String>,
    pub command: Option<String>,
}

impl<'a> RemoteDocker<'a> {
    pub fn new(ssh: &'a SshSession) -> Self {
        Self { ssh }
    }

    pub fn host(&self) -> &str {
        self.ssh.host()
    }

    async fn docker(&self, args: &[String]) -> Result<String, DockerError> {
        debug!(host = self.ssh.host(), "docker {}", args.join(" "));
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        Ok(self.ssh.exec_ok("docker", &refs).await?)
    }

    async fn docker_raw(&self, args: &[String]) -> Result<CommandOutput, DockerError> {
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        Ok(self.ssh.exec("docker", &refs).await?)
    }

    pub async fn version(&self) -> Result<String, DockerError> {
        let out = self
            .docker(&svec(&["version", "--format", "{{.Server.Version}}"]))
            .await?;
        Ok(out.trim().to_string())
    }

    // -- containers ---------------------------------------------------------

    /// Ids of containers matching every `key=value` filter.
    pub async fn container_ids(
        &self,
        filters: &[(&str, &str)],
        all: bool,
    ) -> Result<Vec<String>, DockerError> {
        let mut args = vec!["ps".to_string(), "-q".to_string()];
        if all {
            args.push("-a".to_string());
        }
        for (key, value) in filters {
            args.push("--filter".to_string());
            args.push(format!("{key}={value}"));
        }
        let out = self.docker(&args).await?;
        Ok(out.split_whitespace().map(str::to_string).collect())
    }

    pub async fn inspect(&self, ids: &[String]) -> Result<Vec<ContainerDetails>, DockerError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = svec(&["inspect"]);
        args.extend(ids.iter().cloned());
        let out = self.docker(&args).await?;
        serde_json::from_str(&out).map_err(|e| DockerError::BadOutput {
            command: "inspect".to_string(),
            message: e.to_string(),
        })
    }

    /// Inspect every container (running or not) carrying the given
    /// label filters.
    pub async fn containers_by_label(
        &self,
        filters: &[(&str, &str)],
    ) -> Result<Vec<ContainerDetails>, DockerError> {
        let label_filters: Vec<(&str, String)> = filters
            .iter()
            .map(|(key, value)| ("label", format!("{key}={value}")))
            .collect();
        let borrowed: Vec<(&str, &str)> = label_filters
            .iter()
            .map(|(k, v)| (*k, v.as_str()))
            .collect();
        let ids = self.container_ids(&borrowed, true).await?;
        self.inspect(&ids).await
    }

    /// Inspect one container by name; `None` when it does not exist.
    pub async fn inspect_named(
        &self,
        name: &str,
    ) -> Result<Option<ContainerDetails>, DockerError> {
        let args = svec(&["inspect", name]);
        let output = self.docker_raw(&args).await?;
        if !output.success() {
            return Ok(None);
        }
        let mut parsed: Vec<ContainerDetails> =
            serde_json::from_str(&output.stdout).map_err(|e| DockerError::BadOutput {
                command: format!("inspect {name}"),
                message: e.to_string(),
            })?;
        Ok(parsed.pop())
    }

    pub async fn create(&self, spec: &ContainerSpec) -> Result<(), DockerError> {
        let mut args = svec(&["create", "--name", &spec.name, "--restart", "unless-stopped"]);
        if let Some(network) = &spec.network {
            args.push("--network".to_string());
            args.push(network.clone());
            for alias in &spec.aliases {
                args.push("--network-alias".to_string());
                args.push(alias.clone());
            }
        }
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &spec.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        for volume in &spec.volumes {
            args.push("-v".to_string());
            args.push(volume.clone());
        }
        for port in &spec.ports {
            args.push("-p".to_string());
            args.push(port.clone());
        }
        args.push(spec.image.clone());
        if let Some(command) = &spec.command {
            args.extend(command.split_whitespace().map(str::to_string));
        }
        self.docker(&args).await.map(|_| ())
    }

    pub async fn start(&self, name: &str) -> Result<(), DockerError> {
        self.docker(&svec(&["start", name])).await.map(|_| ())
    }

    /// SIGTERM, wait up to `timeout_secs`, then SIGKILL.
    pub async fn stop(&self, names: &[String], timeout_secs: u32) -> Result<(), DockerError> {
        if names.is_empty() {
            return Ok(());
        }
        let mut args = svec(&["stop", "-t"]);
        args.push(timeout_secs.to_string());
        args.extend(names.iter().cloned());
        self.docker(&args).await.map(|_| ())
    }

    pub async fn remove(&self, names: &[String], force: bool) -> Result<(), DockerError> {
        if names.is_empty() {
            return Ok(());
        }
        let mut args = svec(&["rm"]);
        if force {
            args.push("-f".to_string());
        }
        args.extend(names.iter().cloned());
        self.docker(&args).await.map(|_| ())
    }

    pub async fn exec(&self, container: &str, inner: &[&str]) -> Result<CommandOutput, DockerError> {
        let mut args = svec(&["exec", container]);
        args.extend(inner.iter().map(|s| s.to_string()));
        self.docker_raw(&args).await
    }

    /// Recent log lines of a container; docker writes them to stderr
    /// for containers without a tty, so both streams are returned.
    pub async fn logs(&self, container: &str, tail: u32) -> Result<String, DockerError> {
        let mut args = svec(&["logs", "--tail"]);
        args.push(tail.to_string());
        args.push(container.to_string());
        let output = self.docker_raw(&args).await?;
        if !output.success() {
            return Err(DockerError::BadOutput {
                command: format!("logs {container}"),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(format!("{}{}", output.stdout, output.stderr))
    }

    // -- networks -----------------------------------------------------------

    pub async fn network_exists(&self, network: &str) -> Result<bool, DockerError> {
        let output = self
            .docker_raw(&svec(&["network", "inspect", network]))
            .await?;
        Ok(output.success())
    }

    pub async fn create_network(&self, network: &str) -> Result<(), DockerError> {
        self.docker(&svec(&["network", "create", network]))
            .await
            .map(|_| ())
    }

    pub async fn network_disconnect(
        &self,
        network: &str,
        container: &str,
    ) -> Result<(), DockerError> {
        self.docker(&svec(&["network", "disconnect", network, container]))
            .await
            .map(|_| ())
    }

    pub async fn network_connect(
        &self,
        network: &str,
        container: &str,
        aliases: &[String],
    ) -> Result<(), DockerError> {
        let mut args = svec(&["network", "connect"]);
        for alias in aliases {
            args.push("--alias".to_string());
            args.push(alias.clone());
        }
        args.push(network.to_string());
        args.push(container.to_string());
        self.docker(&args).await.map(|_| ())
    }

    // -- images -------------------------------------------------------------

    pub async fn image_digest(&self, reference: &str) -> Result<Option<String>, DockerError> {
        let output = self
            .docker_raw(&svec(&["image", "inspect", "--format", "{{.Id}}", reference]))
            .await?;
        if output.success() {
            Ok(Some(output.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    pub async fn load_image(&self, archive: &str) -> Result<(), DockerError> {
        self.docker(&svec(&["load", "-i", archive])).await.map(|_| ())
    }

    pub async fn tag(&self, source: &str, target: &str) -> Result<(), DockerError> {
        self.docker(&svec(&["tag", source, target])).await.map(|_| ())
    }

    pub async fn pull(&self, image: &str) -> Result<(), DockerError> {
        self.docker(&svec(&["pull", image])).await.map(|_| ())
    }

    pub async fn login(
        &self,
        registry: &str,
        username: &str,
        password: &str,
    ) -> Result<(), DockerError> {
        // --password-stdin keeps the secret out of the remote argv.
        let script = format!(
            "printf %s {} | docker login -u {} --password-stdin {}",
            shell_quote(password),
            shell_quote(username),
            shell_quote(registry)
        );
        self.ssh.exec_ok("sh", &["-c", &script]).await?;
        Ok(())
    }

    // -- host helpers -------------------------------------------------------

    /// Absolute home directory of the ssh user, for rewriting relative
    /// volume paths.
    pub async fn home_dir(&self) -> Result<String, DockerError> {
        let out = self.ssh.exec_ok("sh", &["-c", "printf %s \"$HOME\""]).await?;
        Ok(out.trim().to_string())
    }

    pub async fn make_dirs(&self, path: &str) -> Result<(), DockerError> {
        let script = format!("mkdir -p {}", shell_quote(path));
        self.ssh.exec_ok("sh", &["-c", &script]).await?;
        Ok(())
    }

    pub async fn remove_file(&self, path: &str) -> Result<(), DockerError> {
        let script = format!("rm -f {}", shell_quote(path));
        self.ssh.exec_ok("sh", &["-c", &script]).await?;
        Ok(())
    }

    /// Whether the remote can decompress gzip archives.
    pub async fn has_gzip(&self) -> bool {
        self.ssh
            .exec("sh", &["-c", "command -v gzip"])
            .await
            .map(|out| out.success())
            .unwrap_or(false)
    }
}

fn svec(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
