//! Error types for the edge proxy.
//!
//! Layered the same way the process is: the state store, the ACME
//! controller, and the admin API each have their own error enum, all of
//! which fold into [`ProxyError`] at the top.

use thiserror::Error;

/// Top-level proxy error.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("acme error: {0}")]
    Acme(#[from] AcmeError),

    #[error("tls error: {0}")]
    Tls(#[from] TlsError),

    #[error("admin error: {0}")]
    Admin(#[from] AdminError),

    #[error("listener error on {addr}: {source}")]
    Listener {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl ProxyError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

/// Failures while reading or persisting the state snapshot.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The snapshot exists but does not parse. The store refuses to
    /// start rather than overwrite it.
    #[error("state file {path} is corrupt at byte offset {offset}: {message}")]
    Corrupt {
        path: String,
        offset: usize,
        message: String,
    },

    #[error("unsupported schema version {found} (expected {expected})")]
    SchemaVersion { found: u32, expected: u32 },

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("state store is shut down")]
    Closed,
}

impl StateError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures in the certificate lifecycle. These are recorded on the
/// certificate record and retried; they never take down the proxy.
#[derive(Error, Debug)]
pub enum AcmeError {
    #[error("account setup failed: {0}")]
    Account(String),

    #[error("order rejected for {host}: {message}")]
    OrderRejected { host: String, message: String },

    #[error("challenge validation failed for {host}: {message}")]
    ChallengeFailed { host: String, message: String },

    #[error("order for {host} did not complete within the deadline")]
    Deadline { host: String },

    #[error("certificate storage failed: {0}")]
    Storage(#[from] StateError),

    #[error("csr generation failed: {0}")]
    Csr(String),

    #[error("directory error: {0}")]
    Directory(#[from] instant_acme::Error),

    #[error("certificate for {host} could not be parsed: {message}")]
    BadCertificate { host: String, message: String },
}

/// TLS material handling failures.
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("no usable key in {path}")]
    NoKey { path: String },

    #[error("pem decode failed for {path}: {message}")]
    Pem { path: String, message: String },

    #[error("rustls rejected the material for {host}: {source}")]
    Rejected {
        host: String,
        #[source]
        source: rustls::Error,
    },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Admin API request failures, reported to the caller with no state
/// change.
#[derive(Error, Debug)]
pub enum AdminError {
    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("invalid target '{target}': {message}")]
    InvalidTarget { target: String, message: String },

    #[error("host {host} already belongs to project {owner}")]
    HostCollision { host: String, owner: String },

    #[error("invalid host name: {0}")]
    InvalidHost(String),

    #[error("persist failed: {0}")]
    Persist(#[from] StateError),
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
