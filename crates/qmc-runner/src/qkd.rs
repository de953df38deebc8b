//! QKD key manager clients.
//!
//! Both supported providers expose `enc_keys` / `dec_keys` endpoints and
//! differ in request size, response envelope and default key encoding.
//! The provider kind is fixed when the configuration is loaded.

use std::time::Duration;

use qmc_crypto::codec::{self, CodecError};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::{KeyEncoding, QkdConfig, QkdProviderKind};

#[derive(Debug, Error)]
pub enum QkdError {
    /// The request URL is malformed; nothing was sent
    #[error("invalid QKD endpoint: {0}")]
    InvalidEndpoint(String),
    /// Network failure or error status from the key manager
    #[error("QKD provider unavailable: {0}")]
    Unavailable(String),
    /// The key manager answered with an unexpected body
    #[error("malformed QKD response: {0}")]
    MalformedResponse(String),
    /// Client certificate or key could not be loaded
    #[error("QKD client certificate error: {0}")]
    Certificate(String),
}

impl From<reqwest::Error> for QkdError {
    fn from(err: reqwest::Error) -> Self {
        QkdError::Unavailable(err.to_string())
    }
}

/// A key handed out by the key manager, normalized to lowercase hex.
#[derive(Clone, PartialEq, Eq)]
pub struct QkdKey {
    pub key_id: String,
    pub key_hex: String,
}

impl std::fmt::Debug for QkdKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QkdKey")
            .field("key_id", &self.key_id)
            .field("key_hex", &"<redacted>")
            .finish()
    }
}

#[derive(Deserialize)]
struct KeyContainer {
    keys: Vec<RawKey>,
}

#[derive(Deserialize)]
struct RawKey {
    #[serde(rename = "key_ID")]
    key_id: KeyId,
    key: String,
}

/// Key managers disagree on whether identifiers are strings or numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum KeyId {
    Text(String),
    Number(u64),
}

impl KeyId {
    fn into_string(self) -> String {
        match self {
            KeyId::Text(id) => id,
            KeyId::Number(id) => id.to_string(),
        }
    }
}

/// Client for the key manager shared with one peer.
#[derive(Clone)]
pub struct QkdProvider {
    kind: QkdProviderKind,
    base_url: String,
    encoding: KeyEncoding,
    client: reqwest::Client,
}

impl std::fmt::Debug for QkdProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QkdProvider")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl QkdProvider {
    /// Build a provider from its configuration, loading the client
    /// certificate when one is configured.
    pub fn from_config(config: &QkdConfig, timeout: Duration) -> Result<Self, QkdError> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .connect_timeout(timeout);

        match (&config.client_cert_path, &config.cert_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let mut pem = std::fs::read(cert_path).map_err(|e| {
                    QkdError::Certificate(format!("{}: {}", cert_path.display(), e))
                })?;
                pem.push(b'\n');
                pem.extend(std::fs::read(key_path).map_err(|e| {
                    QkdError::Certificate(format!("{}: {}", key_path.display(), e))
                })?);
                let identity = reqwest::Identity::from_pem(&pem)
                    .map_err(|e| QkdError::Certificate(e.to_string()))?;
                builder = builder.identity(identity);
            }
            _ if config.provider == QkdProviderKind::QnuLabs => {
                return Err(QkdError::Certificate(
                    "the qnulabs provider requires a client certificate".to_string(),
                ));
            }
            _ => {}
        }

        if config.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build().map_err(|e| QkdError::Certificate(e.to_string()))?;
        Ok(Self::with_client(
            config.provider,
            &config.url,
            config.key_encoding(),
            client,
        ))
    }

    /// Build a provider around an existing HTTP client.
    pub fn with_client(
        kind: QkdProviderKind,
        base_url: &str,
        encoding: KeyEncoding,
        client: reqwest::Client,
    ) -> Self {
        Self {
            kind,
            base_url: base_url.trim_end_matches('/').to_string(),
            encoding,
            client,
        }
    }

    pub fn kind(&self) -> QkdProviderKind {
        self.kind
    }

    /// Request a fresh key to encrypt with.
    pub async fn get_enc_key(&self) -> Result<QkdKey, QkdError> {
        let size = match self.kind {
            QkdProviderKind::Etsi014 => 256,
            QkdProviderKind::QnuLabs => 64,
        };
        let url = self.endpoint("enc_keys", ("size", &size.to_string()))?;
        let body = self.call(url).await?;
        let raw = Self::first_key(body)?;
        self.normalize(raw)
    }

    /// Request the key matching `key_id` to decrypt with.
    pub async fn get_dec_key(&self, key_id: &str) -> Result<QkdKey, QkdError> {
        let url = self.endpoint("dec_keys", ("key_ID", key_id))?;
        let body = self.call(url).await?;
        let raw = match self.kind {
            QkdProviderKind::Etsi014 => Self::first_key(body)?,
            QkdProviderKind::QnuLabs => serde_json::from_value::<RawKey>(body)
                .map_err(|e| QkdError::MalformedResponse(e.to_string()))?,
        };
        self.normalize(raw)
    }

    fn endpoint(&self, path: &str, (name, value): (&str, &str)) -> Result<Url, QkdError> {
        let raw = format!("{}/{}", self.base_url, path);
        let mut url =
            Url::parse(&raw).map_err(|e| QkdError::InvalidEndpoint(format!("{}: {}", raw, e)))?;
        if !matches!(url.scheme(), "http" | "https") || url.host().is_none() {
            return Err(QkdError::InvalidEndpoint(raw));
        }
        url.query_pairs_mut().append_pair(name, value);
        Ok(url)
    }

    async fn call(&self, url: Url) -> Result<serde_json::Value, QkdError> {
        debug!("Calling QKD at {}", url);
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(QkdError::Unavailable(format!("HTTP {}", status)));
        }
        response
            .json()
            .await
            .map_err(|e| QkdError::MalformedResponse(e.to_string()))
    }

    fn first_key(body: serde_json::Value) -> Result<RawKey, QkdError> {
        let container: KeyContainer = serde_json::from_value(body)
            .map_err(|e| QkdError::MalformedResponse(e.to_string()))?;
        container
            .keys
            .into_iter()
            .next()
            .ok_or_else(|| QkdError::MalformedResponse("empty key list".to_string()))
    }

    fn normalize(&self, raw: RawKey) -> Result<QkdKey, QkdError> {
        let key_hex = match self.encoding {
            KeyEncoding::Base64 => codec::base64_to_hex(&raw.key),
            KeyEncoding::Hex => normalize_hex(&raw.key),
        }
        .map_err(|e| QkdError::MalformedResponse(e.to_string()))?;

        Ok(QkdKey {
            key_id: raw.key_id.into_string(),
            key_hex,
        })
    }
}

fn normalize_hex(value: &str) -> Result<String, CodecError> {
    let digits = codec::trim_0x_prefix(value.trim());
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(CodecError::InvalidHex(value.to_string()));
    }
    Ok(digits.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    const KEY_B64: &str = "qV4XorklC1EbehIbsovSaRGlWhyw3jETpt/laDSr3BQ=";
    const KEY_HEX: &str = "a95e17a2b9250b511b7a121bb28bd26911a55a1cb0de3113a6dfe56834abdc14";

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn provider(kind: QkdProviderKind, url: &str, encoding: KeyEncoding) -> QkdProvider {
        QkdProvider::with_client(kind, url, encoding, reqwest::Client::new())
    }

    #[tokio::test]
    async fn test_etsi014_keys() {
        let router = Router::new()
            .route(
                "/api/v1/keys/Bob/enc_keys",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    assert_eq!(q.get("size").map(String::as_str), Some("256"));
                    Json(json!({"keys": [{"key_ID": "id-1", "key": KEY_B64}]}))
                }),
            )
            .route(
                "/api/v1/keys/Bob/dec_keys",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    let id = q.get("key_ID").cloned().unwrap_or_default();
                    Json(json!({"keys": [{"key_ID": id, "key": KEY_B64}]}))
                }),
            );
        let base = serve(router).await;
        let qkd = provider(
            QkdProviderKind::Etsi014,
            &format!("{}/api/v1/keys/Bob/", base),
            KeyEncoding::Base64,
        );

        let enc = qkd.get_enc_key().await.unwrap();
        assert_eq!(enc.key_id, "id-1");
        assert_eq!(enc.key_hex, KEY_HEX);

        let dec = qkd.get_dec_key("id-1").await.unwrap();
        assert_eq!(dec, enc);
    }

    #[tokio::test]
    async fn test_vendor_envelope_and_numeric_ids() {
        let router = Router::new()
            .route(
                "/enc_keys",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    assert_eq!(q.get("size").map(String::as_str), Some("64"));
                    Json(json!({"keys": [{"key_ID": 42, "key": KEY_HEX.to_uppercase()}]}))
                }),
            )
            .route(
                "/dec_keys",
                get(|| async { Json(json!({"key_ID": 42, "key": KEY_HEX})) }),
            );
        let base = serve(router).await;
        let qkd = provider(QkdProviderKind::QnuLabs, &base, KeyEncoding::Hex);

        let enc = qkd.get_enc_key().await.unwrap();
        assert_eq!(enc.key_id, "42");
        assert_eq!(enc.key_hex, KEY_HEX);

        let dec = qkd.get_dec_key("42").await.unwrap();
        assert_eq!(dec, enc);
    }

    #[tokio::test]
    async fn test_invalid_endpoint_fails_before_network() {
        let qkd = provider(QkdProviderKind::Etsi014, "http:/invalid schema", KeyEncoding::Base64);
        assert!(matches!(qkd.get_enc_key().await, Err(QkdError::InvalidEndpoint(_))));

        let qkd = provider(QkdProviderKind::Etsi014, "ftp://qkd.example", KeyEncoding::Base64);
        assert!(matches!(qkd.get_dec_key("1").await, Err(QkdError::InvalidEndpoint(_))));
    }

    #[tokio::test]
    async fn test_error_status_is_unavailable() {
        let router = Router::new().route(
            "/enc_keys",
            get(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "down") }),
        );
        let base = serve(router).await;
        let qkd = provider(QkdProviderKind::Etsi014, &base, KeyEncoding::Base64);
        assert!(matches!(qkd.get_enc_key().await, Err(QkdError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_unexpected_body_is_malformed() {
        let router = Router::new()
            .route("/enc_keys", get(|| async { Json(json!({"keys": []})) }))
            .route("/dec_keys", get(|| async { Json(json!({"keys": [{"key_ID": "1", "key": "%%%"}]})) }));
        let base = serve(router).await;
        let qkd = provider(QkdProviderKind::Etsi014, &base, KeyEncoding::Base64);
        assert!(matches!(qkd.get_enc_key().await, Err(QkdError::MalformedResponse(_))));
        assert!(matches!(qkd.get_dec_key("1").await, Err(QkdError::MalformedResponse(_))));
    }

    #[test]
    fn test_vendor_provider_without_certificate_is_rejected() {
        let mut config = QkdConfig::etsi014("https://qkd.example");
        config.provider = QkdProviderKind::QnuLabs;
        assert!(matches!(
            QkdProvider::from_config(&config, Duration::from_secs(1)),
            Err(QkdError::Certificate(_))
        ));
    }
}
