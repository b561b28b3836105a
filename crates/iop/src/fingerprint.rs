//! Service fingerprints.
//!
//! A fingerprint summarizes everything about a service that would, if
//! changed, warrant redeployment. It is computed over a canonical JSON
//! rendering with every list sorted, so env/port/volume reordering in
//! the config file never forces a deploy.

use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::config::{ImageSource, Secrets, Service};
use iop_common::labels;

/// Hex length stored in labels; enough to make collisions a non-issue
/// for per-project service counts.
const HASH_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fingerprint {
    Built {
        config_hash: String,
        secrets_hash: String,
        local_image_hash: String,
        /// Absent before the first transfer to this server.
        server_image_hash: Option<String>,
    },
    External {
        config_hash: String,
        secrets_hash: String,
        image_reference: String,
    },
}

impl Fingerprint {
    pub fn config_hash(&self) -> &str {
        match self {
            Fingerprint::Built { config_hash, .. } => config_hash,
            Fingerprint::External { config_hash, .. } => config_hash,
        }
    }

    pub fn secrets_hash(&self) -> &str {
        match self {
            Fingerprint::Built { secrets_hash, .. } => secrets_hash,
            Fingerprint::External { secrets_hash, .. } => secrets_hash,
        }
    }

    /// The label set written onto every created container; the
    /// reconciler reads these back verbatim.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(
            labels::CONFIG_HASH.to_string(),
            self.config_hash().to_string(),
        );
        map.insert(
            labels::SECRETS_HASH.to_string(),
            self.secrets_hash().to_string(),
        );
        match self {
            Fingerprint::Built {
                local_image_hash,
                server_image_hash,
                ..
            } => {
                map.insert(
                    labels::FINGERPRINT_TYPE.to_string(),
                    labels::FINGERPRINT_BUILT.to_string(),
                );
                map.insert(
                    labels::LOCAL_IMAGE_HASH.to_string(),
                    local_image_hash.clone(),
                );
                map.insert(
                    labels::SERVER_IMAGE_HASH.to_string(),
                    server_image_hash
                        .clone()
                        .unwrap_or_else(|| local_image_hash.clone()),
                );
            }
            Fingerprint::External {
                image_reference, ..
            } => {
                map.insert(
                    labels::FINGERPRINT_TYPE.to_string(),
                    labels::FINGERPRINT_EXTERNAL.to_string(),
                );
                map.insert(
                    labels::IMAGE_REFERENCE.to_string(),
                    image_reference.clone(),
                );
            }
        }
        map
    }
}

/// Stable hash over the service configuration tuple.
pub fn config_hash(service: &Service) -> String {
    let source = match &service.source {
        ImageSource::Image(reference) => json!({ "image": reference }),
        ImageSource::Build(build) => json!({
            "context": build.context,
            "dockerfile": build.dockerfile,
            // BTreeMap: serializes with sorted keys
            "args": build.args,
        }),
    };

    let ingress = service.ingress().map(|ingress| {
        let mut hosts = ingress.hosts.clone();
        hosts.sort_unstable();
        json!({
            "hosts": hosts,
            "app_port": ingress.app_port,
            "health_path": ingress.health_path,
            "ssl": ingress.ssl,
        })
    });

    let canonical = json!({
        "source": source,
        "env": sorted(&service.env_plain),
        "secret_keys": sorted(&service.env_secrets),
        "ports": sorted(&service.ports),
        "volumes": sorted(&service.volumes),
        "ingress": ingress,
        "command": service.command,
        "replicas": service.replicas,
    });

    short_hash(canonical.to_string().as_bytes())
}

/// Hash over the values of the referenced secret keys, in sorted key
/// order. Changing a secret's value redeploys every service using it.
pub fn secrets_hash(service: &Service, secrets: &Secrets) -> String {
    let mut keys = service.env_secrets.clone();
    keys.sort_unstable();

    let mut hasher = Sha256::new();
    for key in &keys {
        hasher.update(key.as_bytes());
        hasher.update([0]);
        if let Some(value) = secrets.get(key) {
            hasher.update(value.as_bytes());
        }
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())[..HASH_LEN].to_string()
}

fn sorted(list: &[String]) -> Vec<String> {
    let mut out = list.to_vec();
    out.sort_unstable();
    out
}

fn short_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())[..HASH_LEN].to_string()
}
