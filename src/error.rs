//! Common Error Types
//!
//! Unified error taxonomy for the spending engine.

use thiserror::Error;

use crate::config::ConfigError;
use crate::esplora::EsploraError;
use crate::wallet::signer::SignerError;
use crate::wallet::types::{Conflict, ExclusionCounts};

/// Broadcast rejections that mean "an input is already gone"
const STALE_INPUT_SIGNATURES: &[&str] = &[
    "bad-txns-inputs-missingorspent",
    "missing-inputs",
    "missing inputs",
    "txn-mempool-conflict",
    "insufficient fee, rejecting replacement",
];

/// Root error type for the engine
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("no signing key configured")]
    NoCredential,

    #[error("no UTXOs found")]
    NoUtxosFound,

    #[error("insufficient funds: have {have} sats, need {need} sats ({exclusions})")]
    InsufficientFunds {
        have: u64,
        need: u64,
        exclusions: ExclusionCounts,
    },

    #[error("all {candidates} candidate UTXOs are unavailable ({exclusions})")]
    AllCandidatesUnavailable {
        candidates: usize,
        exclusions: ExclusionCounts,
    },

    #[error("UTXO conflict: {}", format_conflicts(.0))]
    UtxoConflict(Vec<Conflict>),

    #[error("memo too long: {len} bytes (max {max})")]
    MemoTooLong { len: usize, max: usize },

    #[error("amount {amount} sats is at or below the dust threshold of {threshold} sats")]
    BelowDustThreshold { amount: u64, threshold: u64 },

    #[error("bridge deposit of {amount} sats must exceed {minimum} sats")]
    BelowBridgeMinimum { amount: u64, minimum: u64 },

    #[error("amount exceeds the {maximum} sat money supply")]
    AmountOutOfRange { maximum: u64 },

    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),

    #[error("failed to sign input {index}: {reason}")]
    SignInputFailed { index: usize, reason: String },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid PSBT: {0}")]
    InvalidPsbt(String),

    #[error("build error: {0}")]
    Build(String),

    #[error("chain backend error: {0}")]
    Chain(EsploraError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<EsploraError> for WalletError {
    fn from(err: EsploraError) -> Self {
        match err {
            EsploraError::BroadcastFailed(body) => WalletError::BroadcastRejected(body),
            other => WalletError::Chain(other),
        }
    }
}

impl From<SignerError> for WalletError {
    fn from(err: SignerError) -> Self {
        match err.input_index() {
            Some(index) => WalletError::SignInputFailed {
                index,
                reason: err.to_string(),
            },
            None => WalletError::Build(err.to_string()),
        }
    }
}

impl WalletError {
    /// Conflicts carried by a `UtxoConflict`, empty otherwise
    pub fn conflicts(&self) -> &[Conflict] {
        match self {
            WalletError::UtxoConflict(conflicts) => conflicts,
            _ => &[],
        }
    }

    /// Whether a fresh input selection could succeed where this attempt failed.
    ///
    /// Only stale-input signatures qualify; everything else is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            WalletError::UtxoConflict(_) => true,
            WalletError::BroadcastRejected(body) => {
                let body = body.to_lowercase();
                STALE_INPUT_SIGNATURES.iter().any(|sig| body.contains(sig))
            }
            _ => false,
        }
    }

    /// Stable code for logs
    pub fn error_code(&self) -> &'static str {
        match self {
            WalletError::NoCredential => "NO_CREDENTIAL",
            WalletError::NoUtxosFound => "NO_UTXOS_FOUND",
            WalletError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            WalletError::AllCandidatesUnavailable { .. } => "ALL_CANDIDATES_UNAVAILABLE",
            WalletError::UtxoConflict(_) => "UTXO_CONFLICT",
            WalletError::MemoTooLong { .. } => "MEMO_TOO_LONG",
            WalletError::BelowDustThreshold { .. } => "BELOW_DUST_THRESHOLD",
            WalletError::BelowBridgeMinimum { .. } => "BELOW_BRIDGE_MINIMUM",
            WalletError::AmountOutOfRange { .. } => "AMOUNT_OUT_OF_RANGE",
            WalletError::BroadcastRejected(_) => "BROADCAST_REJECTED",
            WalletError::SignInputFailed { .. } => "SIGN_INPUT_FAILED",
            WalletError::InvalidAddress(_) => "INVALID_ADDRESS",
            WalletError::InvalidPsbt(_) => "INVALID_PSBT",
            WalletError::Build(_) => "BUILD_ERROR",
            WalletError::Chain(_) => "CHAIN_ERROR",
            WalletError::Config(_) => "CONFIG_ERROR",
        }
    }
}

fn format_conflicts(conflicts: &[Conflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias using WalletError
pub type Result<T> = std::result::Result<T, WalletError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::types::ConflictReason;

    #[test]
    fn test_broadcast_failure_maps_to_rejection() {
        let err: WalletError = EsploraError::BroadcastFailed("sendrawtransaction RPC error".into()).into();
        assert!(matches!(err, WalletError::BroadcastRejected(_)));
        assert_eq!(err.error_code(), "BROADCAST_REJECTED");
    }

    #[test]
    fn test_signer_failure_keeps_input_index() {
        let err: WalletError = SignerError::ForeignInput(2).into();
        assert!(matches!(err, WalletError::SignInputFailed { index: 2, .. }));

        let err: WalletError = SignerError::ExtractFailed("absurd fee".into()).into();
        assert_eq!(err.error_code(), "BUILD_ERROR");
    }

    #[test]
    fn test_retryable_errors() {
        let conflict = WalletError::UtxoConflict(vec![Conflict {
            txid: "aa".into(),
            vout: 0,
            reason: ConflictReason::Mempool,
            spent_in_txid: None,
        }]);
        assert!(conflict.is_retryable());
        assert!(conflict.to_string().contains("aa:0 (mempool)"));

        let stale = WalletError::BroadcastRejected(
            r#"sendrawtransaction RPC error: {"code":-25,"message":"bad-txns-inputs-missingorspent"}"#.into(),
        );
        assert!(stale.is_retryable());

        let low_fee = WalletError::BroadcastRejected("min relay fee not met".into());
        assert!(!low_fee.is_retryable());
        assert!(!WalletError::NoCredential.is_retryable());
        assert!(!WalletError::InsufficientFunds {
            have: 1,
            need: 2,
            exclusions: ExclusionCounts::default()
        }
        .is_retryable());
    }
}
