use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Supported coordination backends.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Consul,
    Etcd,
    #[serde(rename = "zk")]
    #[value(name = "zk")]
    Zookeeper,
    Boltdb,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Consul => write!(f, "consul"),
            Backend::Etcd => write!(f, "etcd"),
            Backend::Zookeeper => write!(f, "zk"),
            Backend::Boltdb => write!(f, "boltdb"),
        }
    }
}

impl FromStr for Backend {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "consul" => Ok(Backend::Consul),
            "etcd" => Ok(Backend::Etcd),
            "zk" | "zookeeper" => Ok(Backend::Zookeeper),
            "boltdb" => Ok(Backend::Boltdb),
            other => Err(StoreError::BackendNotSupported(format!(
                "consul, etcd, zk, boltdb (got {})",
                other
            ))),
        }
    }
}

/// Client TLS material, handed to the backend client untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub ca_file: Option<PathBuf>,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Client configuration shared by all backends.
///
/// Flatten it into a binary's `clap` parser, or load it with serde.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection timeout in milliseconds (backend default when unset)
    #[arg(long = "kv-connection-timeout-ms", env = "KV_CONNECTION_TIMEOUT_MS")]
    #[serde(default)]
    pub connection_timeout_ms: Option<u64>,

    /// CA certificate used to verify the backend
    #[arg(long = "kv-tls-ca-file", env = "KV_TLS_CA_FILE")]
    #[serde(default)]
    pub tls_ca_file: Option<PathBuf>,

    /// Client certificate
    #[arg(long = "kv-tls-cert-file", env = "KV_TLS_CERT_FILE")]
    #[serde(default)]
    pub tls_cert_file: Option<PathBuf>,

    /// Client private key
    #[arg(long = "kv-tls-key-file", env = "KV_TLS_KEY_FILE")]
    #[serde(default)]
    pub tls_key_file: Option<PathBuf>,

    /// Bucket name (file-backed stores only)
    #[arg(long = "kv-bucket", env = "KV_BUCKET")]
    #[serde(default)]
    pub bucket: Option<String>,

    /// Keep the backend connection open between calls (file-backed stores only)
    #[arg(long = "kv-persist-connection", env = "KV_PERSIST_CONNECTION")]
    #[serde(default)]
    pub persist_connection: bool,

    /// Username for backends with authentication
    #[arg(long = "kv-username", env = "KV_USERNAME")]
    #[serde(default)]
    pub username: Option<String>,

    /// Password for backends with authentication
    #[arg(long = "kv-password", env = "KV_PASSWORD", hide_env_values = true)]
    #[serde(default)]
    pub password: Option<String>,
}

impl StoreConfig {
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// The configured connection timeout. Zero counts as unset.
    pub fn connection_timeout(&self) -> Option<Duration> {
        self.connection_timeout_ms
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
    }

    /// Client TLS material, when both certificate and key are configured.
    pub fn tls(&self) -> Option<TlsConfig> {
        match (&self.tls_cert_file, &self.tls_key_file) {
            (Some(cert_file), Some(key_file)) => Some(TlsConfig {
                ca_file: self.tls_ca_file.clone(),
                cert_file: cert_file.clone(),
                key_file: key_file.clone(),
            }),
            _ => None,
        }
    }
}
