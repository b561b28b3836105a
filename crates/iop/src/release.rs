//! Release identifiers.
//!
//! One per orchestrator run: the current git revision plus a UTC
//! timestamp. Used as the tag for locally built images and as an
//! idempotency key in logs. Uncommitted trees still deploy; the
//! fingerprint, not the release id, decides whether anything changed.

use chrono::Utc;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub id: String,
}

impl Release {
    pub async fn derive() -> Self {
        let revision = git_short_revision().await.unwrap_or_else(|| {
            debug!("[CLI] no git revision available, using 'nogit'");
            "nogit".to_string()
        });
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        Self {
            id: format!("{revision}-{stamp}"),
        }
    }

    /// Tag for a built service image.
    pub fn image_tag(&self, project: &str, service: &str) -> String {
        format!("{project}-{service}:{}", self.id)
    }
}

impl std::fmt::Display for Release {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

async fn git_short_revision() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let revision = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if revision.is_empty() { None } else { Some(revision) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn release_id_has_revision_and_stamp() {
        let release = Release::derive().await;
        let (revision, stamp) = release.id.split_once('-').expect("rev-stamp format");
        assert!(!revision.is_empty());
        assert_eq!(stamp.len(), 14);
        assert!(stamp.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn image_tag_embeds_project_and_service() {
        let release = Release { id: "abc123-20260101000000".to_string() };
        assert_eq!(
            release.image_tag("demo", "web"),
            "demo-web:abc123-20260101000000"
        );
    }
}
