//! Fresh PSK values from a QRNG service, with a local fallback.

use std::time::Duration;

use qmc_crypto::codec::canonical_psk_hex;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::RunnerConfig;
use crate::error::RunnerError;

/// Bytes of entropy per PSK.
const PSK_BYTES: usize = 32;

#[derive(Deserialize)]
struct QrngResponse {
    data: QrngData,
}

#[derive(Deserialize)]
struct QrngData {
    result: Vec<String>,
}

#[derive(Clone)]
pub struct PskGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl PskGenerator {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn from_config(config: &RunnerConfig) -> Result<Self, RunnerError> {
        Ok(Self::new(
            &config.qrng_base_url,
            &config.qrng_api_key,
            config.request_timeout(),
        )?)
    }

    /// A canonical 64-digit PSK value. Never fails: any QRNG problem falls
    /// back to the operating system's CSPRNG.
    pub async fn generate(&self) -> String {
        info!("Calling QRNG API to get new PSK...");
        match self.fetch().await {
            Ok(value) => {
                debug!("Generated PSK from QRNG");
                value
            }
            Err(reason) => {
                warn!("Failed to get key from QRNG ({}), using local random PSK", reason);
                local_random_hex()
            }
        }
    }

    async fn fetch(&self) -> Result<String, String> {
        if self.api_key.is_empty() {
            return Err("no API key configured".to_string());
        }

        let raw = format!(
            "{}/{}/qbck/block/hex?size=1&length={}",
            self.base_url, self.api_key, PSK_BYTES
        );
        let url = Url::parse(&raw).map_err(|e| format!("invalid URL: {}", e))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        let body: QrngResponse = response.json().await.map_err(|e| e.to_string())?;
        let value = body
            .data
            .result
            .into_iter()
            .next()
            .ok_or_else(|| "empty result".to_string())?;

        canonical_psk_hex(&value).map_err(|e| e.to_string())
    }
}

fn local_random_hex() -> String {
    let mut bytes = [0u8; PSK_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
