//! Wallet Types
//!
//! Shared types for the spending engine.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Outputs at or below this value are uneconomical to create
pub const DUST_THRESHOLD_SATS: u64 = 546;

/// Bridge deposits must carry strictly more than this
pub const BRIDGE_MIN_SATS: u64 = 10_000;

/// Largest memo payload an OP_RETURN output may carry
pub const MAX_MEMO_BYTES: usize = 80;

/// 21M BTC; no amount or output sum may exceed it
pub const MAX_MONEY_SATS: u64 = 21_000_000 * 100_000_000;

/// Sum of `values`, or `None` past `MAX_MONEY_SATS`
pub fn checked_total(values: impl IntoIterator<Item = u64>) -> Option<u64> {
    values
        .into_iter()
        .try_fold(0u64, |acc, value| acc.checked_add(value))
        .filter(|&total| total <= MAX_MONEY_SATS)
}

/// Unspent transaction output as reported by the indexer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Utxo {
    /// Funding transaction id (hex)
    pub txid: String,
    /// Output index
    pub vout: u32,
    /// Value in satoshis
    pub value: u64,
}

impl Utxo {
    pub fn new(txid: impl Into<String>, vout: u32, value: u64) -> Self {
        Self {
            txid: txid.into(),
            vout,
            value,
        }
    }

    /// Identity key (`txid:vout`)
    pub fn key(&self) -> String {
        outpoint_key(&self.txid, self.vout)
    }
}

/// Build the `txid:vout` identity key
pub fn outpoint_key(txid: &str, vout: u32) -> String {
    format!("{}:{}", txid, vout)
}

/// Fee urgency requested by a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeTier {
    Priority,
    #[default]
    Normal,
    Economy,
}

impl FromStr for FeeTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "priority" | "fast" | "fastest" => Ok(FeeTier::Priority),
            "normal" | "default" => Ok(FeeTier::Normal),
            "economy" | "slow" => Ok(FeeTier::Economy),
            other => Err(format!("unknown fee tier: {}", other)),
        }
    }
}

impl std::fmt::Display for FeeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Priority => write!(f, "priority"),
            Self::Normal => write!(f, "normal"),
            Self::Economy => write!(f, "economy"),
        }
    }
}

/// Why a declared input cannot be spent right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// Consumed by a transaction this process broadcast
    SpentLocally,
    /// Claimed by an in-flight build
    Reserved,
    /// Spent by a transaction sitting in the address mempool
    Mempool,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SpentLocally => write!(f, "spent_locally"),
            Self::Reserved => write!(f, "reserved"),
            Self::Mempool => write!(f, "mempool"),
        }
    }
}

/// A single input conflict found while validating an external PSBT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub txid: String,
    pub vout: u32,
    pub reason: ConflictReason,
    /// Set for `SpentLocally`: the transaction that superseded this input
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spent_in_txid: Option<String>,
}

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} ({})", self.txid, self.vout, self.reason)?;
        if let Some(ref txid) = self.spent_in_txid {
            write!(f, " by {}", txid)?;
        }
        Ok(())
    }
}

/// Per-reason counts of candidates dropped before selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionCounts {
    pub external_pending: usize,
    pub reserved: usize,
    pub spent_locally: usize,
}

impl std::fmt::Display for ExclusionCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "excluded: {} mempool-pending, {} reserved, {} spent locally",
            self.external_pending, self.reserved, self.spent_locally
        )
    }
}

/// Input of a transaction in the address mempool
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MempoolVin {
    pub txid: String,
    pub vout: u32,
}

/// Output of a transaction in the address mempool
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MempoolVout {
    #[serde(default)]
    pub scriptpubkey_address: Option<String>,
    pub value: u64,
}

/// Unconfirmed transaction touching the watched address
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MempoolTx {
    pub txid: String,
    pub vin: Vec<MempoolVin>,
    pub vout: Vec<MempoolVout>,
}

/// A caller's request to pay a single recipient
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    /// Destination address (must match the engine's network)
    pub recipient: String,
    /// Amount in satoshis
    pub amount_sats: u64,
    /// Bridge memo; presence makes this a bridge deposit
    pub memo: Option<Vec<u8>>,
    /// Fee urgency
    pub tier: FeeTier,
}

impl PaymentRequest {
    pub fn new(recipient: impl Into<String>, amount_sats: u64) -> Self {
        Self {
            recipient: recipient.into(),
            amount_sats,
            memo: None,
            tier: FeeTier::default(),
        }
    }

    pub fn with_memo(mut self, memo: impl Into<Vec<u8>>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    pub fn with_tier(mut self, tier: FeeTier) -> Self {
        self.tier = tier;
        self
    }
}

/// Outcome of a broadcast performed by the engine
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastResult {
    pub txid: String,
    /// Raw signed transaction (hex)
    pub tx_hex: String,
    /// Fee actually paid, including any absorbed dust change
    pub fee: u64,
    /// Sum of non-change, non-memo outputs
    pub sent: u64,
    /// Outputs `(vout, value)` paid back to the engine
    pub change: Vec<(u32, u64)>,
    /// Inputs consumed
    pub inputs: Vec<Utxo>,
}
