//! Container label schema and naming rules.
//!
//! Every container the orchestrator creates carries the full label set
//! defined here. Labels are immutable after creation; the reconciler
//! reads them back to decide whether a service needs redeployment, and
//! the blue-green engine reads them to find the current color group.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// `iop.managed=true` marks every container owned by the tool.
pub const MANAGED: &str = "iop.managed";
/// Project the container belongs to.
pub const PROJECT: &str = "iop.project";
/// `app` (has an ingress) or `service` (infrastructure).
pub const TYPE: &str = "iop.type";
/// Service name for ingress services.
pub const APP: &str = "iop.app";
/// Service name for infrastructure services.
pub const SERVICE: &str = "iop.service";
/// `blue` or `green`; only set on ingress services.
pub const COLOR: &str = "iop.color";
/// 1-based replica index.
pub const REPLICA: &str = "iop.replica";
/// Whether the container was created as part of the promoted color.
pub const ACTIVE: &str = "iop.active";
/// Hash of the service configuration tuple.
pub const CONFIG_HASH: &str = "iop.config-hash";
/// `built` or `external`.
pub const FINGERPRINT_TYPE: &str = "iop.fingerprint-type";
/// Hash over the values of referenced secret keys.
pub const SECRETS_HASH: &str = "iop.secrets-hash";
/// Digest of the locally built image (built services).
pub const LOCAL_IMAGE_HASH: &str = "iop.local-image-hash";
/// Digest of the image present on the server (built services).
pub const SERVER_IMAGE_HASH: &str = "iop.server-image-hash";
/// Image reference (external services).
pub const IMAGE_REFERENCE: &str = "iop.image-reference";

pub const TYPE_APP: &str = "app";
pub const TYPE_SERVICE: &str = "service";
pub const FINGERPRINT_BUILT: &str = "built";
pub const FINGERPRINT_EXTERNAL: &str = "external";

/// Service names that collide with CLI subcommands and are rejected by
/// configuration validation.
pub const RESERVED_SERVICE_NAMES: &[&str] = &["init", "status", "proxy"];

/// Name of the edge proxy container on every server.
pub const PROXY_CONTAINER: &str = "iop-proxy";

/// The blue-green color of a container group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Blue,
    Green,
}

impl Color {
    /// The color a new deployment should target given the currently
    /// active one. Fresh services start blue.
    pub fn opposite(self) -> Color {
        match self {
            Color::Blue => Color::Green,
            Color::Green => Color::Blue,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Color::Blue => "blue",
            Color::Green => "green",
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Color {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blue" => Ok(Color::Blue),
            "green" => Ok(Color::Green),
            other => Err(format!("not a color: {other}")),
        }
    }
}

/// Naming rules shared by the orchestrator and the proxy.
///
/// All derived names funnel through this module so that the proxy's
/// upstream host (`{project}-{service}`) and the aliases the deployer
/// binds always agree.
pub mod names {
    use super::Color;

    /// Lowercase, and collapse anything outside `[a-z0-9-]` to `-`.
    /// Used for directory names and network names derived from the
    /// user-chosen project name.
    pub fn sanitize(name: &str) -> String {
        let mut out = String::with_capacity(name.len());
        for c in name.chars() {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' {
                out.push(c);
            } else {
                out.push('-');
            }
        }
        out.trim_matches('-').to_string()
    }

    /// The per-project container network.
    pub fn project_network(project: &str) -> String {
        format!("{}-network", sanitize(project))
    }

    /// Intra-project discovery alias for a service.
    pub fn service_alias(service: &str) -> String {
        service.to_string()
    }

    /// Globally unique alias; the proxy uses it as the upstream host.
    pub fn qualified_alias(project: &str, service: &str) -> String {
        format!("{}-{}", sanitize(project), service)
    }

    /// Temporary alias carried by not-yet-promoted replicas so they can
    /// be probed without receiving live traffic.
    pub fn temp_alias(service: &str, color: Color) -> String {
        format!("{service}-{color}-temp")
    }

    /// Qualified form of [`temp_alias`].
    pub fn qualified_temp_alias(project: &str, service: &str, color: Color) -> String {
        format!("{}-{}-{}-temp", sanitize(project), service, color)
    }

    /// Container name for one replica of an ingress service.
    pub fn replica_container(project: &str, service: &str, color: Color, replica: u32) -> String {
        format!("{}-{}-{}-{}", sanitize(project), service, color, replica)
    }

    /// Fixed container name for an infrastructure service.
    pub fn service_container(project: &str, service: &str) -> String {
        format!("{}-{}", sanitize(project), service)
    }

    /// Server-side project directory, relative to the remote home.
    pub fn project_dir(project: &str) -> String {
        format!(".iop/projects/{}", sanitize(project))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_opposite_flips() {
        assert_eq!(Color::Blue.opposite(), Color::Green);
        assert_eq!(Color::Green.opposite(), Color::Blue);
    }

    #[test]
    fn color_round_trips_through_str() {
        for color in [Color::Blue, Color::Green] {
            assert_eq!(color.as_str().parse::<Color>().unwrap(), color);
        }
        assert!("teal".parse::<Color>().is_err());
    }

    #[test]
    fn sanitize_collapses_odd_characters() {
        assert_eq!(names::sanitize("My App_2"), "my-app-2");
        assert_eq!(names::sanitize("demo"), "demo");
        assert_eq!(names::sanitize("--edge--"), "edge");
    }

    #[test]
    fn alias_naming_agrees_between_sides() {
        assert_eq!(names::project_network("demo"), "demo-network");
        assert_eq!(names::qualified_alias("demo", "web"), "demo-web");
        assert_eq!(names::temp_alias("web", Color::Green), "web-green-temp");
        assert_eq!(
            names::replica_container("demo", "web", Color::Blue, 1),
            "demo-web-blue-1"
        );
    }
}
