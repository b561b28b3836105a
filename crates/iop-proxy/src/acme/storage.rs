//! On-disk certificate and account material.
//!
//! Layout under the data dir:
//!
//! ```text
//! certs/{host}/cert.pem    leaf certificate
//! certs/{host}/chain.pem   full chain as returned by the directory
//! certs/{host}/key.pem     private key
//! acme/account.key         serialized account credentials + directory
//! ```
//!
//! PEM files are written whole then renamed; they are read-only until
//! replaced.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::errors::StateError;

/// Account credentials bound to the directory they were created
/// against. Staging and production accounts are not interchangeable.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoredAccount {
    pub directory_url: String,
    pub credentials: serde_json::Value,
}

pub fn host_dir(certs_dir: &Path, host: &str) -> PathBuf {
    certs_dir.join(host)
}

/// Persist the issued material for a host.
pub async fn write_certificate(
    certs_dir: &Path,
    host: &str,
    chain_pem: &str,
    key_pem: &str,
) -> Result<(), StateError> {
    let dir = host_dir(certs_dir, host);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| StateError::io(dir.display().to_string(), e))?;

    // The leaf is the first PEM block of the chain.
    let leaf = first_pem_block(chain_pem).unwrap_or(chain_pem);

    write_atomic(&dir.join("cert.pem"), leaf.as_bytes()).await?;
    write_atomic(&dir.join("chain.pem"), chain_pem.as_bytes()).await?;
    write_atomic(&dir.join("key.pem"), key_pem.as_bytes()).await?;
    Ok(())
}

/// Remove a host's certificate directory, if any.
pub async fn remove_certificate(certs_dir: &Path, host: &str) -> Result<(), StateError> {
    let dir = host_dir(certs_dir, host);
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StateError::io(dir.display().to_string(), e)),
    }
}

pub async fn load_account(path: &Path) -> Result<Option<StoredAccount>, StateError> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => {
            let stored = serde_json::from_str(&raw)?;
            Ok(Some(stored))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StateError::io(path.display().to_string(), e)),
    }
}

pub async fn store_account(path: &Path, account: &StoredAccount) -> Result<(), StateError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StateError::io(parent.display().to_string(), e))?;
    }
    let bytes = serde_json::to_vec_pretty(account)?;
    write_atomic(path, &bytes).await
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StateError> {
    let tmp = path.with_extension("tmp");
    let io = |e| StateError::io(path.display().to_string(), e);

    let mut file = tokio::fs::File::create(&tmp).await.map_err(io)?;
    file.write_all(bytes).await.map_err(io)?;
    file.sync_all().await.map_err(io)?;
    drop(file);
    tokio::fs::rename(&tmp, path).await.map_err(io)
}

fn first_pem_block(pem: &str) -> Option<&str> {
    let end = "-----END CERTIFICATE-----";
    pem.find(end).map(|idx| &pem[..idx + end.len()])
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAIN: &str = "-----BEGIN CERTIFICATE-----\nleaf\n-----END CERTIFICATE-----\n-----BEGIN CERTIFICATE-----\nintermediate\n-----END CERTIFICATE-----\n";

    #[tokio::test]
    async fn writes_leaf_chain_and_key() {
        let dir = tempfile::tempdir().unwrap();
        write_certificate(dir.path(), "demo.example", CHAIN, "key material")
            .await
            .unwrap();

        let leaf = std::fs::read_to_string(dir.path().join("demo.example/cert.pem")).unwrap();
        assert!(leaf.contains("leaf"));
        assert!(!leaf.contains("intermediate"));

        let chain = std::fs::read_to_string(dir.path().join("demo.example/chain.pem")).unwrap();
        assert!(chain.contains("intermediate"));

        remove_certificate(dir.path(), "demo.example").await.unwrap();
        assert!(!dir.path().join("demo.example").exists());
        // Removing twice is fine.
        remove_certificate(dir.path(), "demo.example").await.unwrap();
    }

    #[tokio::test]
    async fn account_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acme/account.key");
        assert!(load_account(&path).await.unwrap().is_none());

        let account = StoredAccount {
            directory_url: "https://acme-staging-v02.api.letsencrypt.org/directory".to_string(),
            credentials: serde_json::json!({"key": "material"}),
        };
        store_account(&path, &account).await.unwrap();

        let loaded = load_account(&path).await.unwrap().unwrap();
        assert_eq!(loaded.directory_url, account.directory_url);
        assert_eq!(loaded.credentials["key"], "material");
    }
}
