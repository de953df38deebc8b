//! File-backed PSK, signature and node key storage.
//!
//! The presence of these files drives the protocol: a missing PSK file
//! means the node has to bootstrap, a missing signature file means there is
//! nothing to serve to peers.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use qmc_crypto::NodeKey;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::RunnerConfig;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("node key in {path} is unusable: {reason}")]
    NodeKey { path: PathBuf, reason: String },
}

/// Paths of the three files the runner shares with the managed node.
///
/// Clones share one lock, so a reader of the value/signature pair never
/// observes half of a write.
#[derive(Debug, Clone)]
pub struct FileStore {
    psk_path: PathBuf,
    signature_path: PathBuf,
    node_key_path: PathBuf,
    pair: Arc<RwLock<()>>,
}

impl FileStore {
    pub fn new(
        psk_path: impl Into<PathBuf>,
        signature_path: impl Into<PathBuf>,
        node_key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            psk_path: psk_path.into(),
            signature_path: signature_path.into(),
            node_key_path: node_key_path.into(),
            pair: Arc::default(),
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(
            &config.psk_file_path,
            &config.psk_sig_file_path,
            &config.node_key_file_path,
        )
    }

    pub fn psk_path(&self) -> &Path {
        &self.psk_path
    }

    pub async fn psk_exists(&self) -> bool {
        exists(&self.psk_path).await
    }

    /// Persist a rotation result. The value is written before the signature,
    /// so a reader that sees a signature always sees the matching value.
    pub async fn write_psk(&self, value: &str, signature: &str) -> Result<(), StoreError> {
        let _pair = self.pair.write().await;
        write_atomic(&self.psk_path, value).await?;
        write_atomic(&self.signature_path, signature).await?;
        debug!("Persisted PSK to {}", self.psk_path.display());
        Ok(())
    }

    pub async fn read_psk(&self) -> Result<String, StoreError> {
        read_trimmed(&self.psk_path).await
    }

    pub async fn read_signature(&self) -> Result<String, StoreError> {
        read_trimmed(&self.signature_path).await
    }

    /// The stored value and signature, or `None` if either is missing.
    pub async fn load_current(&self) -> Result<Option<(String, String)>, StoreError> {
        let _pair = self.pair.read().await;
        let psk = match self.read_psk().await {
            Ok(psk) => psk,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        match self.read_signature().await {
            Ok(signature) => Ok(Some((psk, signature))),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete the signature file. Missing files are not an error.
    pub async fn remove_signature(&self) -> Result<(), StoreError> {
        let _pair = self.pair.write().await;
        remove_if_exists(&self.signature_path).await
    }

    /// Delete both the PSK and its signature.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let _pair = self.pair.write().await;
        remove_if_exists(&self.psk_path).await?;
        remove_if_exists(&self.signature_path).await
    }

    pub async fn load_node_key(&self) -> Result<NodeKey, StoreError> {
        let hex = read_trimmed(&self.node_key_path).await?;
        NodeKey::from_hex(&hex).map_err(|e| StoreError::NodeKey {
            path: self.node_key_path.clone(),
            reason: e.to_string(),
        })
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn read_trimmed(path: &Path) -> Result<String, StoreError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content.trim().to_string()),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(path.to_path_buf())),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Write to a sibling temp file and rename it into place.
async fn write_atomic(path: &Path, content: &str) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, content).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)
}

async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
