//! xBridge Wallet - Self-custodied Bitcoin spending engine
//!
//! Spends from a single P2WPKH key against a lagging Esplora indexer:
//!
//! 1. **UTXO Ledger** - reservations, local spends and pending change
//! 2. **Coin Selector / Builder** - fee-aware selection, bridge memo outputs
//! 3. **PSBT Reconciler** - validates, signs or rebuilds venue PSBTs
//! 4. **Watcher** - startup recovery and post-broadcast visibility
//!
//! The fee oracle and the Esplora client are the only network dependencies.

pub mod config;
pub mod error;
pub mod esplora;
pub mod fees;
pub mod logging;
pub mod retry;
pub mod wallet;

// Re-exports: errors
pub use error::{Result, WalletError};

// Re-exports: chain access
pub use esplora::{ChainBackend, EsploraClient, EsploraError};
pub use fees::{FeeOracle, FeeRates};

// Re-exports: engine
pub use wallet::{
    BroadcastResult, Engine, FeeTier, PaymentRequest, SingleKeySigner, TxSigner, Utxo,
};

/// Satoshi conversion helpers
pub mod units {
    pub const SATS_PER_BTC: u64 = 100_000_000;

    pub fn sats_to_btc(sats: u64) -> f64 {
        sats as f64 / SATS_PER_BTC as f64
    }

    pub fn format_sats(sats: u64) -> String {
        format!("{} sats ({:.8} BTC)", sats, sats_to_btc(sats))
    }
}
