//! Proxy runtime configuration.
//!
//! Loaded from an optional TOML file merged with `IOP_PROXY_`-prefixed
//! environment variables. The public listener ports are fixed by design
//! (80/443); what varies is where state lives, the admin bind address,
//! and the ACME contact. The staging toggle is *not* configuration: it
//! lives in the state snapshot so that flipping it at runtime survives
//! restarts.

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::errors::ProxyError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Root of the on-disk layout: `state.json`, `certs/`, `acme/`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Admin API bind address. Loopback by design; the orchestrator
    /// reaches it through `docker exec`.
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,

    /// Contact mailto for the ACME account, e.g. `admin@example.com`.
    #[serde(default)]
    pub acme_contact: Option<String>,

    /// Default reverse-proxy timeout in seconds, per-route overridable.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            admin_addr: default_admin_addr(),
            acme_contact: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/iop-proxy")
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_request_timeout() -> u64 {
    30
}

impl ProxyConfig {
    /// Merge the TOML file (if present) with environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ProxyError> {
        let mut figment = Figment::from(figment::providers::Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("IOP_PROXY_"))
            .extract()
            .map_err(|e| ProxyError::configuration(e.to_string()))
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.data_dir.join("certs")
    }

    pub fn account_key_path(&self) -> PathBuf {
        self.data_dir.join("acme").join("account.key")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ProxyConfig::load(None).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/iop-proxy"));
        assert_eq!(config.admin_addr.port(), 8080);
        assert!(config.admin_addr.ip().is_loopback());
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn layout_paths_derive_from_data_dir() {
        let config = ProxyConfig {
            data_dir: PathBuf::from("/tmp/iop-test"),
            ..ProxyConfig::default()
        };
        assert_eq!(config.state_path(), PathBuf::from("/tmp/iop-test/state.json"));
        assert_eq!(
            config.account_key_path(),
            PathBuf::from("/tmp/iop-test/acme/account.key")
        );
    }
}
