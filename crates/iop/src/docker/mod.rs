//! Container engine access.
//!
//! Every operation is a `docker` CLI invocation: locally through
//! `tokio::process`, remotely as the same argv over ssh. The inspect
//! output subset modelled here is the contract the reconciler and the
//! blue-green engine rely on.

mod local;
mod remote;

pub use local::LocalDocker;
pub use remote::{ContainerSpec, RemoteDocker};

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use iop_common::labels;

/// The slice of `docker inspect` output the orchestrator reads.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerDetails {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "State")]
    pub state: ContainerState,
    #[serde(rename = "Config")]
    pub config: ContainerConfig,
    #[serde(rename = "NetworkSettings", default)]
    pub network_settings: NetworkSettings,
    #[serde(rename = "HostConfig", default)]
    pub host_config: HostConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerState {
    #[serde(rename = "Running", default)]
    pub running: bool,
    #[serde(rename = "Status", default)]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkSettings {
    #[serde(rename = "Networks", default)]
    pub networks: HashMap<String, NetworkAttachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkAttachment {
    #[serde(rename = "Aliases", default)]
    pub aliases: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostConfig {
    #[serde(rename = "PortBindings", default)]
    pub port_bindings: HashMap<String, Option<Vec<PortBinding>>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortBinding {
    #[serde(rename = "HostPort", default)]
    pub host_port: String,
}

impl ContainerDetails {
    /// Container name without the leading slash docker puts there.
    pub fn short_name(&self) -> &str {
        self.name.strip_prefix('/').unwrap_or(&self.name)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.config.labels.get(key).map(String::as_str)
    }

    pub fn color(&self) -> Option<labels::Color> {
        self.label(labels::COLOR)
            .and_then(|raw| labels::Color::from_str(raw).ok())
    }

    /// Aliases this container carries on the given network.
    pub fn aliases_on(&self, network: &str) -> Vec<String> {
        self.network_settings
            .networks
            .get(network)
            .and_then(|attachment| attachment.aliases.clone())
            .unwrap_or_default()
    }

    /// Host ports this container publishes.
    pub fn published_ports(&self) -> Vec<u16> {
        self.host_config
            .port_bindings
            .values()
            .flatten()
            .flatten()
            .filter_map(|binding| binding.host_port.parse().ok())
            .collect()
    }
}

/// Environment for a container: plain entries plus resolved secrets,
/// as a sorted map so label hashing and argv order are deterministic.
pub fn resolve_env(
    plain: &[String],
    secret_keys: &[String],
    secrets: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for entry in plain {
        if let Some((key, value)) = entry.split_once('=') {
            env.insert(key.to_string(), value.to_string());
        }
    }
    for key in secret_keys {
        if let Some(value) = secrets.get(key) {
            env.insert(key.clone(), value.clone());
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSPECT: &str = r#"{
        "Id": "abc123",
        "Name": "/demo-web-blue-1",
        "State": {"Running": true, "Status": "running"},
        "Config": {
            "Image": "demo-web:r1",
            "Labels": {"iop.project": "demo", "iop.color": "blue"}
        },
        "NetworkSettings": {
            "Networks": {
                "demo-network": {"Aliases": ["web", "demo-web"]}
            }
        },
        "HostConfig": {
            "PortBindings": {"5432/tcp": [{"HostPort": "5432"}]}
        }
    }"#;

    #[test]
    fn inspect_subset_parses() {
        let details: ContainerDetails = serde_json::from_str(INSPECT).unwrap();
        assert_eq!(details.short_name(), "demo-web-blue-1");
        assert_eq!(details.label("iop.project"), Some("demo"));
        assert_eq!(details.color(), Some(labels::Color::Blue));
        assert_eq!(details.aliases_on("demo-network"), vec!["web", "demo-web"]);
        assert!(details.aliases_on("other-network").is_empty());
        assert_eq!(details.published_ports(), vec![5432]);
    }

    #[test]
    fn env_resolution_merges_and_sorts() {
        let mut secrets = BTreeMap::new();
        secrets.insert("TOKEN".to_string(), "s3cret".to_string());
        secrets.insert("UNUSED".to_string(), "x".to_string());

        let env = resolve_env(
            &["B=2".to_string(), "A=1".to_string()],
            &["TOKEN".to_string()],
            &secrets,
        );
        let keys: Vec<&str> = env.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["A", "B", "TOKEN"]);
        assert_eq!(env["TOKEN"], "s3cret");
    }
}
