//! Configuration management

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use qmc_crypto::PeerIdentity;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What happens to the PSK signature file once the node has restarted on
/// the new key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureRetention {
    /// Delete the signature after the restart; late peers get a 404.
    DeleteAfterRestart,
    /// Keep serving the signature until the next rotation replaces it.
    Keep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QkdProviderKind {
    /// ETSI GS QKD 014 key delivery API.
    #[serde(rename = "etsi014")]
    Etsi014,
    /// QNu Labs key manager, always behind mutual TLS.
    #[serde(rename = "qnulabs")]
    QnuLabs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyEncoding {
    Base64,
    Hex,
}

/// Connection parameters of the QKD key manager shared with one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QkdConfig {
    pub provider: QkdProviderKind,
    pub url: String,
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub cert_key_path: Option<PathBuf>,
    #[serde(default)]
    pub key_encoding: Option<KeyEncoding>,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl QkdConfig {
    pub fn etsi014(url: impl Into<String>) -> Self {
        Self {
            provider: QkdProviderKind::Etsi014,
            url: url.into(),
            client_cert_path: None,
            cert_key_path: None,
            key_encoding: None,
            accept_invalid_certs: false,
        }
    }

    /// Encoding of key material in provider responses.
    pub fn key_encoding(&self) -> KeyEncoding {
        self.key_encoding.unwrap_or(match self.provider {
            QkdProviderKind::Etsi014 => KeyEncoding::Base64,
            QkdProviderKind::QnuLabs => KeyEncoding::Hex,
        })
    }
}

/// A known counterpart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub server_addr: String,
    pub qkd: QkdConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            max_attempts: None,
        }
    }
}

/// Runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub local_peer_id: String,
    pub local_server_addr: SocketAddr,
    pub external_server_addr: SocketAddr,
    pub psk_file_path: PathBuf,
    pub psk_sig_file_path: PathBuf,
    pub node_key_file_path: PathBuf,
    pub node_logs_path: PathBuf,
    pub runner_logs_path: Option<PathBuf>,
    pub key_rotation_time_secs: u64,
    pub qrng_api_key: String,
    pub qrng_base_url: String,
    pub node_rpc_url: String,
    pub request_timeout_secs: u64,
    pub restart_settle_secs: u64,
    pub terminate_grace_secs: u64,
    pub liveness_interval_secs: u64,
    pub signature_retention: SignatureRetention,
    pub retry: RetryConfig,
    pub peers: BTreeMap<String, PeerConfig>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            local_peer_id: String::new(),
            local_server_addr: SocketAddr::from(([127, 0, 0, 1], 5001)),
            external_server_addr: SocketAddr::from(([0, 0, 0, 0], 5002)),
            psk_file_path: PathBuf::from("psk"),
            psk_sig_file_path: PathBuf::from("psk_sig"),
            node_key_file_path: PathBuf::from(".node_key"),
            node_logs_path: PathBuf::from("node.log"),
            runner_logs_path: None,
            key_rotation_time_secs: 600,
            qrng_api_key: String::new(),
            qrng_base_url: "https://qrng.qbck.io".to_string(),
            node_rpc_url: "http://127.0.0.1:9933".to_string(),
            request_timeout_secs: 10,
            restart_settle_secs: 1,
            terminate_grace_secs: 10,
            liveness_interval_secs: 30,
            signature_retention: SignatureRetention::DeleteAfterRestart,
            retry: RetryConfig::default(),
            peers: BTreeMap::new(),
        }
    }
}

impl RunnerConfig {
    /// Load configuration from an optional TOML file, then environment
    /// variables, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(peer_id) = std::env::var("QMC_LOCAL_PEER_ID") {
            self.local_peer_id = peer_id;
        }

        if let Ok(addr) = std::env::var("QMC_LOCAL_SERVER_ADDR") {
            self.local_server_addr = addr
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid local_server_addr: {}", e)))?;
        }

        if let Ok(addr) = std::env::var("QMC_EXTERNAL_SERVER_ADDR") {
            self.external_server_addr = addr
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid external_server_addr: {}", e)))?;
        }

        if let Ok(secs) = std::env::var("QMC_KEY_ROTATION_TIME") {
            self.key_rotation_time_secs = secs
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid key_rotation_time: {}", e)))?;
        }

        if let Ok(key) = std::env::var("QMC_QRNG_API_KEY") {
            self.qrng_api_key = key;
        }

        if let Ok(url) = std::env::var("QMC_NODE_RPC_URL") {
            self.node_rpc_url = url;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        PeerIdentity::parse(&self.local_peer_id)
            .map_err(|e| ConfigError::Invalid(format!("local_peer_id: {}", e)))?;

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be > 0".to_string()));
        }

        if self.liveness_interval_secs == 0 {
            return Err(ConfigError::Invalid("liveness_interval_secs must be > 0".to_string()));
        }

        if self.retry.initial_backoff_ms == 0 || self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(ConfigError::Invalid(
                "retry backoff must satisfy 0 < initial_backoff_ms <= max_backoff_ms".to_string(),
            ));
        }

        if self.retry.max_attempts == Some(0) {
            return Err(ConfigError::Invalid("retry.max_attempts must be > 0".to_string()));
        }

        check_http_url("node_rpc_url", &self.node_rpc_url)?;

        for (peer_id, peer) in &self.peers {
            PeerIdentity::parse(peer_id)
                .map_err(|e| ConfigError::Invalid(format!("peer {}: {}", peer_id, e)))?;
            check_http_url(&format!("peers.{}.server_addr", peer_id), &peer.server_addr)?;
            check_http_url(&format!("peers.{}.qkd.url", peer_id), &peer.qkd.url)?;

            match (&peer.qkd.client_cert_path, &peer.qkd.cert_key_path) {
                (Some(_), None) | (None, Some(_)) => {
                    return Err(ConfigError::Invalid(format!(
                        "peers.{}.qkd: client_cert_path and cert_key_path must be set together",
                        peer_id
                    )));
                }
                (None, None) if peer.qkd.provider == QkdProviderKind::QnuLabs => {
                    return Err(ConfigError::Invalid(format!(
                        "peers.{}.qkd: the qnulabs provider requires a client certificate",
                        peer_id
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }

    pub fn local_identity(&self) -> Result<PeerIdentity, ConfigError> {
        PeerIdentity::parse(&self.local_peer_id)
            .map_err(|e| ConfigError::Invalid(format!("local_peer_id: {}", e)))
    }

    pub fn peer(&self, peer_id: &str) -> Option<&PeerConfig> {
        self.peers.get(peer_id)
    }

    pub fn key_rotation_time(&self) -> Duration {
        Duration::from_secs(self.key_rotation_time_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_secs(self.restart_settle_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            max_attempts: self.retry.max_attempts,
        }
    }

    /// Arguments the runner appends to the managed node's command line.
    pub fn node_args(&self) -> Vec<String> {
        vec![
            "--psk-file".to_string(),
            self.psk_file_path.display().to_string(),
            "--runner-port".to_string(),
            self.local_server_addr.port().to_string(),
            "--node-key-file".to_string(),
            self.node_key_file_path.display().to_string(),
        ]
    }
}

fn check_http_url(field: &str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value)
        .map_err(|e| ConfigError::Invalid(format!("{} is not a valid URL: {}", field, e)))?;
    if !matches!(url.scheme(), "http" | "https") || url.host().is_none() {
        return Err(ConfigError::Invalid(format!(
            "{} must be an http(s) URL with a host",
            field
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const ALICE: &str = "12D3KooWKzWKFojk7A1Hw23dpiQRbLs6HrXFf4EGLsN4oZ1WsWCc";
    const BOB: &str = "12D3KooWQ4b1BHDUUW8VbWSCrS4RcdtRL6C8VEVb9Ye59uRp63Y1";

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_parse_full_config() {
        let file = write_config(&format!(
            r#"
local_peer_id = "{ALICE}"
local_server_addr = "127.0.0.1:5003"
key_rotation_time_secs = 1
signature_retention = "keep"

[retry]
initial_backoff_ms = 50
max_backoff_ms = 200
max_attempts = 5

[peers.{BOB}]
server_addr = "http://localhost:5004"

[peers.{BOB}.qkd]
provider = "etsi014"
url = "http://localhost:9182/api/v1/keys/Bob1SAE"
"#
        ));

        let config = RunnerConfig::from_toml(file.path()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.local_server_addr.port(), 5003);
        assert_eq!(config.key_rotation_time(), Duration::from_secs(1));
        assert_eq!(config.signature_retention, SignatureRetention::Keep);
        assert_eq!(config.retry_policy().max_attempts, Some(5));
        assert_eq!(config.psk_file_path, PathBuf::from("psk"));

        let bob = config.peer(BOB).unwrap();
        assert_eq!(bob.qkd.provider, QkdProviderKind::Etsi014);
        assert_eq!(bob.qkd.key_encoding(), KeyEncoding::Base64);
    }

    #[test]
    fn test_missing_local_peer_id_is_invalid() {
        let config = RunnerConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_peer_id_is_invalid() {
        let mut config = RunnerConfig {
            local_peer_id: ALICE.to_string(),
            ..Default::default()
        };
        config.peers.insert(
            "not-a-peer".to_string(),
            PeerConfig {
                server_addr: "http://localhost:5004".to_string(),
                qkd: QkdConfig::etsi014("http://localhost:9182"),
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_qkd_url_is_invalid() {
        let mut config = RunnerConfig {
            local_peer_id: ALICE.to_string(),
            ..Default::default()
        };
        config.peers.insert(
            BOB.to_string(),
            PeerConfig {
                server_addr: "http://localhost:5004".to_string(),
                qkd: QkdConfig::etsi014("http:/invalid schema"),
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_vendor_provider_requires_certificate() {
        let mut qkd = QkdConfig::etsi014("https://qkd.example");
        qkd.provider = QkdProviderKind::QnuLabs;
        let mut config = RunnerConfig {
            local_peer_id: ALICE.to_string(),
            ..Default::default()
        };
        config.peers.insert(
            BOB.to_string(),
            PeerConfig {
                server_addr: "http://localhost:5004".to_string(),
                qkd: qkd.clone(),
            },
        );
        assert!(config.validate().is_err());

        qkd.client_cert_path = Some(PathBuf::from("client.crt"));
        qkd.cert_key_path = Some(PathBuf::from("client.key"));
        config.peers.get_mut(BOB).unwrap().qkd = qkd;
        config.validate().unwrap();
        assert_eq!(config.peer(BOB).unwrap().qkd.key_encoding(), KeyEncoding::Hex);
    }

    #[test]
    fn test_node_args() {
        let config = RunnerConfig::default();
        assert_eq!(
            config.node_args(),
            vec!["--psk-file", "psk", "--runner-port", "5001", "--node-key-file", ".node_key"]
        );
    }

    #[test]
    fn test_example_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/runner.example.toml");
        let config = RunnerConfig::from_toml(path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.runner_logs_path, Some(PathBuf::from("runner.log")));
    }
}
