//! Spending Engine
//!
//! Builds, signs and broadcasts transactions from a single P2WPKH key while
//! the indexer lags behind what has actually been spent.
//!
//! # Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         SPEND FLOW                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  1. Startup recovery                                            │
//! │     └── Address mempool -> ledger spends + pending change       │
//! │                                                                 │
//! │  2. Candidate set                                               │
//! │     └── Indexer UTXOs + pending change                          │
//! │     └── minus mempool-pending, reserved, spent locally          │
//! │                                                                 │
//! │  3. Select + reserve (one ledger lock)                          │
//! │     └── Largest-first, fee from estimated vsize                 │
//! │                                                                 │
//! │  4. Build, sign, broadcast                                      │
//! │     └── [recipient, change?, OP_RETURN(memo)?]                  │
//! │                                                                 │
//! │  5. Commit or release                                           │
//! │     └── Success: record spend + change                          │
//! │     └── Failure: release reservation                            │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use xbridge_wallet::{config::WalletConfig, wallet::{Engine, PaymentRequest}};
//!
//! let engine = Engine::from_config(&WalletConfig::from_env()?)?;
//! engine.recover_on_startup().await?;
//!
//! let result = engine
//!     .pay(PaymentRequest::new("tb1q...", 50_000).with_memo(b"=:ETH.ETH:0x...".to_vec()))
//!     .await?;
//! engine.wait_for_visibility(&result.txid).await;
//! ```

pub mod builder;
pub mod ledger;
pub mod reconciler;
pub mod selector;
pub mod service;
pub mod signer;
pub mod types;
pub mod watcher;

// Re-exports
pub use builder::{TxBuilder, UnsignedTx};
pub use ledger::{Availability, LedgerSnapshot, RecoveryStats, SpentStatus, UtxoLedger};
pub use reconciler::{external_totals, parse_psbt, ExternalOutputs, ExternalTotals};
pub use selector::{estimate_vsize, CoinSelector, OutputPlan, Selection};
pub use service::{Engine, SpendableSummary};
pub use signer::{SignerError, SingleKeySigner, TxSigner};
pub use types::{
    BroadcastResult, Conflict, ConflictReason, ExclusionCounts, FeeTier, MempoolTx,
    PaymentRequest, Utxo,
};
pub use watcher::{ChainWatcher, WatcherConfig};
