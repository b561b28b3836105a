//! Deciding what to (re)deploy.
//!
//! The desired fingerprint is compared against the labels of the most
//! relevant container on the server. Unchanged services are skipped;
//! that is what makes `iop deploy` safe to run in a loop.

use std::fmt;

use crate::docker::ContainerDetails;
use crate::fingerprint::Fingerprint;
use iop_common::labels;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Deploy(DeployReason),
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployReason {
    Initial,
    ConfigChanged,
    SecretsChanged,
    ImageChanged,
}

impl fmt::Display for DeployReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeployReason::Initial => "initial",
            DeployReason::ConfigChanged => "config changed",
            DeployReason::SecretsChanged => "secrets changed",
            DeployReason::ImageChanged => "image changed",
        })
    }
}

impl Decision {
    pub fn reason_str(&self) -> String {
        match self {
            Decision::Deploy(reason) => reason.to_string(),
            Decision::Skip => "up-to-date".to_string(),
        }
    }
}

/// The §-rules, in order: missing, config, secrets, image.
pub fn decide(desired: &Fingerprint, current: Option<&ContainerDetails>) -> Decision {
    let Some(current) = current else {
        return Decision::Deploy(DeployReason::Initial);
    };

    if current.label(labels::CONFIG_HASH) != Some(desired.config_hash()) {
        return Decision::Deploy(DeployReason::ConfigChanged);
    }
    if current.label(labels::SECRETS_HASH) != Some(desired.secrets_hash()) {
        return Decision::Deploy(DeployReason::SecretsChanged);
    }

    match desired {
        Fingerprint::Built {
            local_image_hash, ..
        } => {
            if current.label(labels::SERVER_IMAGE_HASH) != Some(local_image_hash.as_str()) {
                return Decision::Deploy(DeployReason::ImageChanged);
            }
        }
        Fingerprint::External {
            image_reference, ..
        } => {
            if current.label(labels::IMAGE_REFERENCE) != Some(image_reference.as_str()) {
                return Decision::Deploy(DeployReason::ImageChanged);
            }
        }
    }

    Decision::Skip
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(labels_json: &str) -> ContainerDetails {
        serde_json::from_str(&format!(
            r#"{{
                "Id": "abc",
                "Name": "/demo-web-blue-1",
                "State": {{"Running": true, "Status": "running"}},
                "Config": {{"Image": "demo-web:r1", "Labels": {labels_json}}}
            }}"#
        ))
        .unwrap()
    }

    fn built(local: &str) -> Fingerprint {
        Fingerprint::Built {
            config_hash: "cfg0".into(),
            secrets_hash: "sec0".into(),
            local_image_hash: local.into(),
            server_image_hash: None,
        }
    }

    #[test]
    fn missing_container_is_initial() {
        assert_eq!(
            decide(&built("sha256:a"), None),
            Decision::Deploy(DeployReason::Initial)
        );
    }

    #[test]
    fn matching_labels_skip() {
        let current = container(
            r#"{"iop.config-hash": "cfg0", "iop.secrets-hash": "sec0",
                "iop.server-image-hash": "sha256:a", "iop.fingerprint-type": "built"}"#,
        );
        assert_eq!(decide(&built("sha256:a"), Some(&current)), Decision::Skip);
    }

    #[test]
    fn config_change_wins_over_image_change() {
        let current = container(
            r#"{"iop.config-hash": "other", "iop.secrets-hash": "sec0",
                "iop.server-image-hash": "sha256:old"}"#,
        );
        assert_eq!(
            decide(&built("sha256:new"), Some(&current)),
            Decision::Deploy(DeployReason::ConfigChanged)
        );
    }

    #[test]
    fn secrets_change_is_detected() {
        let current = container(
            r#"{"iop.config-hash": "cfg0", "iop.secrets-hash": "rotated",
                "iop.server-image-hash": "sha256:a"}"#,
        );
        assert_eq!(
            decide(&built("sha256:a"), Some(&current)),
            Decision::Deploy(DeployReason::SecretsChanged)
        );
    }

    #[test]
    fn new_image_digest_redeploys() {
        let current = container(
            r#"{"iop.config-hash": "cfg0", "iop.secrets-hash": "sec0",
                "iop.server-image-hash": "sha256:old"}"#,
        );
        assert_eq!(
            decide(&built("sha256:new"), Some(&current)),
            Decision::Deploy(DeployReason::ImageChanged)
        );
    }

    #[test]
    fn external_reference_change_redeploys() {
        let desired = Fingerprint::External {
            config_hash: "cfg0".into(),
            secrets_hash: "sec0".into(),
            image_reference: "postgres:17".into(),
        };
        let current = container(
            r#"{"iop.config-hash": "cfg0", "iop.secrets-hash": "sec0",
                "iop.image-reference": "postgres:16"}"#,
        );
        assert_eq!(
            decide(&desired, Some(&current)),
            Decision::Deploy(DeployReason::ImageChanged)
        );

        let same = container(
            r#"{"iop.config-hash": "cfg0", "iop.secrets-hash": "sec0",
                "iop.image-reference": "postgres:17"}"#,
        );
        assert_eq!(decide(&desired, Some(&same)), Decision::Skip);
    }
}
