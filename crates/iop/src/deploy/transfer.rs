//! Shipping a locally built image to a server.
//!
//! save → gzip → upload → load, with byte-level progress from the
//! upload. Both archive files are deleted whether the transfer
//! succeeds or not. When the remote cannot decompress gzip the archive
//! is shipped uncompressed; `docker load` reads both.

use tracing::info;

use crate::docker::{LocalDocker, RemoteDocker};
use crate::errors::TransferError;
use crate::progress::{ProgressSender, spawn_logger};
use crate::ssh::SshSession;

pub async fn transfer_image(
    ssh: &SshSession,
    local: &LocalDocker,
    image: &str,
) -> Result<(), TransferError> {
    let docker = RemoteDocker::new(ssh);
    let host = ssh.host().to_string();

    let compress = docker.has_gzip().await;
    if !compress {
        info!("[CLI] [{host}] remote has no gzip, shipping uncompressed archive");
    }

    let suffix = if compress { "tar.gz" } else { "tar" };
    let archive_name = format!("iop-{}.{suffix}", sanitize_ref(image));
    let local_dir = tempfile::tempdir()?;
    let local_path = local_dir.path().join(&archive_name);
    let remote_path = format!("/tmp/{archive_name}");

    let result = async {
        let bytes = local.save(image, &local_path, compress).await?;
        info!("[CLI] [{host}] image {image} saved ({bytes} bytes)");

        let (progress, events) = ProgressSender::channel();
        let logger = spawn_logger(events, format!("[{host}] uploading {image}"));
        let upload = ssh.upload(&local_path, &remote_path, &progress).await;
        drop(progress);
        let _ = logger.await;
        upload?;

        docker.load_image(&remote_path).await?;
        info!("[CLI] [{host}] image {image} loaded");
        Ok(())
    }
    .await;

    // Cleanup both ends regardless of outcome; the tempdir handles the
    // local file, the remote needs an explicit rm.
    if let Err(e) = docker.remove_file(&remote_path).await {
        tracing::debug!("[CLI] [{host}] could not remove remote archive: {e}");
    }

    result
}

fn sanitize_ref(image: &str) -> String {
    image
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_refs_become_safe_file_names() {
        assert_eq!(sanitize_ref("demo-web:abc123-20260101"), "demo-web-abc123-20260101");
        assert_eq!(sanitize_ref("ghcr.io/org/app:1.2"), "ghcr.io-org-app-1.2");
    }
}
