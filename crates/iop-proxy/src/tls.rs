//! TLS certificate registry and SNI resolution.
//!
//! The registry maps host names to ready-to-serve `rustls` certified
//! keys. The SNI resolver consults it during every handshake; a miss
//! terminates the handshake, because serving a certificate for the
//! wrong identity is worse than failing the connection.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, warn};

use crate::errors::TlsError;

/// Validity window extracted from a leaf certificate.
#[derive(Debug, Clone, Copy)]
pub struct CertValidity {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Host → certified key map behind a sync lock, because the rustls
/// resolver callback is synchronous.
pub struct CertStore {
    certs_dir: PathBuf,
    keys: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl CertStore {
    pub fn new(certs_dir: PathBuf) -> Self {
        Self {
            certs_dir,
            keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn certs_dir(&self) -> &PathBuf {
        &self.certs_dir
    }

    /// Parse a PEM chain and key and make them servable for `host`.
    /// Returns the leaf validity so the caller can record it.
    pub fn install(
        &self,
        host: &str,
        chain_pem: &str,
        key_pem: &str,
    ) -> Result<CertValidity, TlsError> {
        let chain = parse_chain(host, chain_pem)?;
        let key = parse_key(host, key_pem)?;
        let validity = leaf_validity(host, &chain)?;

        let signing_key = any_supported_type(&key).map_err(|source| TlsError::Rejected {
            host: host.to_string(),
            source,
        })?;
        let certified = Arc::new(CertifiedKey::new(chain, signing_key));

        self.keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(host.to_ascii_lowercase(), certified);
        debug!(host, "[CERT] installed certificate for serving");
        Ok(validity)
    }

    /// Load the persisted chain and key for a host, if present.
    pub async fn load_from_disk(&self, host: &str) -> Result<Option<CertValidity>, TlsError> {
        let dir = self.certs_dir.join(host);
        let chain_path = dir.join("chain.pem");
        let key_path = dir.join("key.pem");

        let chain = match tokio::fs::read_to_string(&chain_path).await {
            Ok(pem) => pem,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(TlsError::Io {
                    path: chain_path.display().to_string(),
                    source: e,
                });
            }
        };
        let key = tokio::fs::read_to_string(&key_path)
            .await
            .map_err(|e| TlsError::Io {
                path: key_path.display().to_string(),
                source: e,
            })?;

        self.install(host, &chain, &key).map(Some)
    }

    pub fn remove(&self, host: &str) {
        self.keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&host.to_ascii_lowercase());
    }

    pub fn contains(&self, host: &str) -> bool {
        self.keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&host.to_ascii_lowercase())
    }

    fn lookup(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        self.keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&host.to_ascii_lowercase())
            .cloned()
    }
}

impl std::fmt::Debug for CertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hosts = self
            .keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        f.debug_struct("CertStore").field("hosts", &hosts).finish()
    }
}

/// SNI lookup against the registry. No fallback certificate: unknown
/// names fail the handshake.
#[derive(Debug)]
pub struct SniResolver {
    store: Arc<CertStore>,
}

impl SniResolver {
    pub fn new(store: Arc<CertStore>) -> Self {
        Self { store }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        let key = self.store.lookup(name);
        if key.is_none() {
            warn!(host = name, "[PROXY] tls handshake for unknown host");
        }
        key
    }
}

/// Server config with SNI resolution over the registry.
pub fn server_config(store: Arc<CertStore>) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|source| TlsError::Rejected {
            host: "*".to_string(),
            source,
        })?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver::new(store)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

fn parse_chain(host: &str, pem: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let chain: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut pem.as_bytes())
            .collect::<Result<_, _>>()
            .map_err(|e| TlsError::Pem {
                path: format!("chain for {host}"),
                message: e.to_string(),
            })?;
    if chain.is_empty() {
        return Err(TlsError::Pem {
            path: format!("chain for {host}"),
            message: "no certificates in pem".to_string(),
        });
    }
    Ok(chain)
}

fn parse_key(host: &str, pem: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| TlsError::Pem {
            path: format!("key for {host}"),
            message: e.to_string(),
        })?
        .ok_or_else(|| TlsError::NoKey {
            path: format!("key for {host}"),
        })
}

fn leaf_validity(host: &str, chain: &[CertificateDer<'static>]) -> Result<CertValidity, TlsError> {
    let (_, leaf) = x509_parser::parse_x509_certificate(chain[0].as_ref()).map_err(|e| {
        TlsError::Pem {
            path: format!("leaf for {host}"),
            message: e.to_string(),
        }
    })?;
    let validity = leaf.validity();
    let to_utc = |t: &x509_parser::time::ASN1Time| {
        DateTime::<Utc>::from_timestamp(t.timestamp(), 0).unwrap_or_else(Utc::now)
    };
    Ok(CertValidity {
        not_before: to_utc(&validity.not_before),
        not_after: to_utc(&validity.not_after),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(host: &str) -> (String, String) {
        let cert = rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
        (cert.serialize_pem().unwrap(), cert.serialize_private_key_pem())
    }

    #[test]
    fn install_and_lookup_round_trip() {
        let store = CertStore::new(PathBuf::from("/nonexistent"));
        let (chain, key) = self_signed("demo.example");

        let validity = store.install("Demo.Example", &chain, &key).unwrap();
        assert!(validity.not_after > validity.not_before);
        assert!(store.contains("demo.example"));
        assert!(store.lookup("demo.example").is_some());
        assert!(store.lookup("other.example").is_none());

        store.remove("demo.example");
        assert!(!store.contains("demo.example"));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        let store = CertStore::new(PathBuf::from("/nonexistent"));
        let err = store.install("demo.example", "not pem", "also not pem");
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn missing_disk_material_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertStore::new(dir.path().to_path_buf());
        let loaded = store.load_from_disk("demo.example").await.unwrap();
        assert!(loaded.is_none());
    }
}
