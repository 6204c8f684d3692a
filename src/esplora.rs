//! Esplora API Client
//!
//! The engine's only view of the chain: address UTXOs, address mempool,
//! transaction lookup and raw broadcast. `ChainBackend` is the seam the
//! engine depends on; `EsploraClient` is the HTTP implementation.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::wallet::types::{MempoolTx, Utxo};

/// Esplora API endpoints
pub const MAINNET_URL: &str = "https://blockstream.info/api";
pub const TESTNET_URL: &str = "https://blockstream.info/testnet/api";
pub const SIGNET_URL: &str = "https://mempool.space/signet/api";

/// Per-request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Chain queries and broadcast used by the engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainBackend: Send + Sync {
    /// `GET /address/{addr}/utxo`
    async fn get_address_utxos(&self, address: &str) -> Result<Vec<Utxo>, EsploraError>;

    /// `GET /address/{addr}/txs/mempool`
    async fn get_address_mempool(&self, address: &str) -> Result<Vec<MempoolTx>, EsploraError>;

    /// `GET /tx/{txid}`: true on 200, false on 404
    async fn tx_exists(&self, txid: &str) -> Result<bool, EsploraError>;

    /// `POST /tx`: returns the txid reported by the endpoint
    async fn broadcast_tx(&self, tx_hex: &str) -> Result<String, EsploraError>;
}

/// Esplora HTTP client
#[derive(Debug, Clone)]
pub struct EsploraClient {
    client: Client,
    base_url: String,
}

impl EsploraClient {
    /// Create a new client with custom URL
    pub fn new(base_url: &str) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

/// 400/404 mean the indexer rejects the address; anything else is unexpected
fn check_address_status(status: StatusCode, address: &str) -> Result<(), EsploraError> {
    match status {
        status if status.is_success() => Ok(()),
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
            Err(EsploraError::AddressNotFound(address.to_string()))
        }
        status => Err(EsploraError::UnexpectedStatus(status.as_u16())),
    }
}

#[async_trait]
impl ChainBackend for EsploraClient {
    async fn get_address_utxos(&self, address: &str) -> Result<Vec<Utxo>, EsploraError> {
        let url = format!("{}/address/{}/utxo", self.base_url, address);
        let resp = self.client.get(&url).send().await?;

        check_address_status(resp.status(), address)?;

        let text = resp.text().await?;
        let utxos: Vec<EsploraUtxo> = serde_json::from_str(&text)
            .map_err(|e| EsploraError::ParseError(format!("utxo list: {}", e)))?;

        Ok(utxos
            .into_iter()
            .map(|u| Utxo::new(u.txid, u.vout, u.value))
            .collect())
    }

    async fn get_address_mempool(&self, address: &str) -> Result<Vec<MempoolTx>, EsploraError> {
        let url = format!("{}/address/{}/txs/mempool", self.base_url, address);
        let resp = self.client.get(&url).send().await?;

        check_address_status(resp.status(), address)?;

        let text = resp.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| EsploraError::ParseError(format!("mempool list: {}", e)))
    }

    async fn tx_exists(&self, txid: &str) -> Result<bool, EsploraError> {
        let url = format!("{}/tx/{}", self.base_url, txid);
        let resp = self.client.get(&url).send().await?;

        match resp.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(EsploraError::UnexpectedStatus(status.as_u16())),
        }
    }

    async fn broadcast_tx(&self, tx_hex: &str) -> Result<String, EsploraError> {
        let url = format!("{}/tx", self.base_url);
        let resp = self.client.post(&url).body(tx_hex.to_string()).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(EsploraError::BroadcastFailed(error_text));
        }

        let txid = resp.text().await?;
        Ok(txid.trim().to_string())
    }
}

/// UTXO entry as returned by `/address/{addr}/utxo`
#[derive(Debug, Clone, Deserialize)]
struct EsploraUtxo {
    txid: String,
    vout: u32,
    value: u64,
}

/// Esplora error types
#[derive(Debug, thiserror::Error)]
pub enum EsploraError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Address not found: {0}")]
    AddressNotFound(String),

    #[error("Unexpected status: {0}")]
    UnexpectedStatus(u16),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Broadcast failed: {0}")]
    BroadcastFailed(String),
}
