//! Environment-based Configuration for the xBridge wallet
//!
//! All sensitive values (keys) MUST come from environment variables, never
//! from hardcoded values. A `.env` file is loaded first when present.
//!
//! # Environment Variables
//!
//! ## Network Configuration
//! - `WALLET_NETWORK` - "mainnet", "testnet", "signet" or "regtest" (default: "testnet")
//! - `WALLET_ESPLORA_URL` - Esplora API endpoint URL (per-network default)
//! - `WALLET_FEE_API` - Fee estimator base URL; "none" serves fixed rates
//!
//! ## Signing Configuration
//! - `WALLET_SIGNER_KEY` - WIF or 32-byte hex secret key. Optional: without
//!   it, receive-only commands work and spends fail with `NoCredential`.
//!
//! ## Optional Settings
//! - `WALLET_BRIDGE_MIN_SATS` - Bridge deposits must exceed this (default: 10000)
//! - `WALLET_VISIBILITY_TIMEOUT_SECS` - Post-broadcast polling budget (default: 60)
//! - `WALLET_LOG_LEVEL` - Logging level (debug, info, warn, error)
//! - `WALLET_LOG_JSON` - Set to "1" for JSON logs (always on for mainnet)

use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::esplora;
use crate::fees;
use crate::wallet::types::BRIDGE_MIN_SATS;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Network environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            _ => Err(ConfigError::InvalidValue(
                "WALLET_NETWORK".to_string(),
                format!("unknown network: {}", s),
            )),
        }
    }
}

impl Network {
    /// Get default Esplora API for this network
    pub fn default_esplora_url(&self) -> &'static str {
        match self {
            Network::Mainnet => esplora::MAINNET_URL,
            Network::Testnet => esplora::TESTNET_URL,
            Network::Signet => esplora::SIGNET_URL,
            Network::Regtest => "http://127.0.0.1:3002",
        }
    }

    /// Default fee estimator; regtest has none
    pub fn default_fee_api(&self) -> Option<&'static str> {
        match self {
            Network::Mainnet => Some(fees::MAINNET_FEE_URL),
            Network::Testnet => Some(fees::TESTNET_FEE_URL),
            Network::Signet => Some(fees::SIGNET_FEE_URL),
            Network::Regtest => None,
        }
    }

    /// Get bitcoin network enum
    pub fn bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Signet => bitcoin::Network::Signet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct WalletConfig {
    /// Network environment
    pub network: Network,

    /// Esplora API endpoint
    pub esplora_url: String,

    /// Fee estimator endpoint (`None` = fixed rates)
    pub fee_api: Option<String>,

    /// Signing key (WIF or hex)
    pub signer_key: Option<String>,

    /// Bridge minimum in satoshis
    pub bridge_min_sats: u64,

    /// How long `--wait` polls for a broadcast transaction
    pub visibility_timeout: Duration,

    /// Log level
    pub log_level: String,

    /// JSON log output
    pub log_json: bool,
}

impl WalletConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let network: Network = env::var("WALLET_NETWORK")
            .unwrap_or_else(|_| "testnet".to_string())
            .parse()?;

        let esplora_url = env::var("WALLET_ESPLORA_URL")
            .unwrap_or_else(|_| network.default_esplora_url().to_string());

        let fee_api = match env::var("WALLET_FEE_API") {
            Ok(value) if value.eq_ignore_ascii_case("none") || value.is_empty() => None,
            Ok(value) => Some(value),
            Err(_) => network.default_fee_api().map(str::to_string),
        };

        let signer_key = env::var("WALLET_SIGNER_KEY").ok().filter(|k| !k.trim().is_empty());

        let bridge_min_sats = parse_var("WALLET_BRIDGE_MIN_SATS", BRIDGE_MIN_SATS)?;
        let visibility_timeout =
            Duration::from_secs(parse_var("WALLET_VISIBILITY_TIMEOUT_SECS", 60)?);

        let log_level = env::var("WALLET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_json = env::var("WALLET_LOG_JSON").map(|v| v == "1").unwrap_or(false)
            || network == Network::Mainnet;

        Ok(Self {
            network,
            esplora_url,
            fee_api,
            signer_key,
            bridge_min_sats,
            visibility_timeout,
            log_level,
            log_json,
        })
    }

    /// Print configuration summary (hiding sensitive values)
    pub fn print_summary(&self) {
        println!("=== xBridge Wallet Configuration ===");
        println!("Network: {:?}", self.network);
        println!("Esplora API: {}", self.esplora_url);
        println!("Fee API: {}", self.fee_api.as_deref().unwrap_or("fixed rates"));
        println!(
            "Signer Key: {}",
            if self.signer_key.is_some() { "configured" } else { "not set (receive-only)" }
        );
        println!("Bridge Minimum: {} sats", self.bridge_min_sats);
        println!("Visibility Timeout: {}s", self.visibility_timeout.as_secs());
        println!("Log Level: {}", self.log_level);
        println!("====================================");
    }
}

fn parse_var(name: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| {
            ConfigError::InvalidValue(name.to_string(), format!("not a number: {}", value))
        }),
        Err(_) => Ok(default),
    }
}
