//! Deployment engine.
//!
//! `blue_green` is the zero-downtime path for ingress services;
//! `stop_start` replaces infrastructure services in place. Both build
//! container specs through the shared helpers here so labels, env, and
//! volume resolution never drift apart.

pub mod blue_green;
pub mod preflight;
pub mod reconcile;
pub mod stop_start;
pub mod transfer;

pub use preflight::ServerEnv;

use std::collections::BTreeMap;

use crate::config::{ProjectConfig, Secrets, Service, ServiceKind};
use crate::docker::resolve_env;
use crate::fingerprint::Fingerprint;
use iop_common::labels;

/// How long a superseded container gets to finish in-flight work
/// before it is killed.
pub const DRAIN_TIMEOUT_SECS: u32 = 30;

/// Everything the per-service deploy steps need about one service on
/// one server.
pub struct DeployTarget<'a> {
    pub config: &'a ProjectConfig,
    pub service: &'a Service,
    /// Image reference to run: the release tag for built services, the
    /// configured reference for external ones.
    pub image: String,
    pub fingerprint: &'a Fingerprint,
    pub secrets: &'a Secrets,
    pub env: &'a ServerEnv,
}

impl DeployTarget<'_> {
    pub fn project(&self) -> &str {
        &self.config.name
    }

    /// The full label set of §container-labels; every created
    /// container carries all of these.
    pub fn container_labels(
        &self,
        color: Option<labels::Color>,
        replica: u32,
    ) -> BTreeMap<String, String> {
        let mut map = self.fingerprint.labels();
        map.insert(labels::MANAGED.to_string(), "true".to_string());
        map.insert(labels::PROJECT.to_string(), self.project().to_string());
        map.insert(labels::REPLICA.to_string(), replica.to_string());
        map.insert(labels::ACTIVE.to_string(), "true".to_string());
        match (&self.service.kind, color) {
            (ServiceKind::Ingress(_), Some(color)) => {
                map.insert(labels::TYPE.to_string(), labels::TYPE_APP.to_string());
                map.insert(labels::APP.to_string(), self.service.name.clone());
                map.insert(labels::COLOR.to_string(), color.to_string());
            }
            _ => {
                map.insert(labels::TYPE.to_string(), labels::TYPE_SERVICE.to_string());
                map.insert(labels::SERVICE.to_string(), self.service.name.clone());
            }
        }
        map
    }

    pub fn resolved_env(&self) -> BTreeMap<String, String> {
        resolve_env(
            &self.service.env_plain,
            &self.service.env_secrets,
            self.secrets,
        )
    }

    /// Volume mounts with relative host paths rewritten into the
    /// project directory on the server.
    pub fn resolved_volumes(&self) -> Vec<String> {
        self.service
            .volumes
            .iter()
            .map(|mount| resolve_volume(mount, &self.env.project_dir))
            .collect()
    }
}

fn resolve_volume(mount: &str, project_dir: &str) -> String {
    match mount.split_once(':') {
        Some((host_path, rest)) if !host_path.starts_with('/') => {
            let trimmed = host_path.strip_prefix("./").unwrap_or(host_path);
            format!("{project_dir}/{trimmed}:{rest}")
        }
        _ => mount.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_volume_paths_land_in_the_project_dir() {
        let dir = "/home/iop/.iop/projects/demo";
        assert_eq!(
            resolve_volume("./data:/var/lib/data", dir),
            "/home/iop/.iop/projects/demo/data:/var/lib/data"
        );
        assert_eq!(
            resolve_volume("uploads:/srv/uploads:ro", dir),
            "/home/iop/.iop/projects/demo/uploads:/srv/uploads:ro"
        );
        assert_eq!(
            resolve_volume("/abs/path:/data", dir),
            "/abs/path:/data"
        );
    }
}
