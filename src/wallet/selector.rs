//! Coin Selector
//!
//! Picks inputs for a payment from the indexer-reported UTXO set after
//! removing everything the ledger or the address mempool says is taken.
//! Largest-first greedy accumulation keeps input counts (and fees) low.

use std::collections::HashSet;
use std::time::Instant;

use crate::error::WalletError;
use crate::wallet::ledger::{Availability, UtxoLedger};
use crate::wallet::types::{ExclusionCounts, Utxo, DUST_THRESHOLD_SATS};

/// Virtual size of one P2WPKH input
pub const INPUT_VSIZE: f64 = 68.0;
/// Virtual size of one standard output
pub const OUTPUT_VSIZE: f64 = 31.0;
/// Version, locktime, counts and segwit marker
pub const TX_OVERHEAD_VSIZE: f64 = 10.5;

/// Shape of the outputs a transaction will carry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputPlan {
    /// Non-change, non-memo outputs
    pub payees: usize,
    /// Payload length of each OP_RETURN output
    pub memo_sizes: Vec<usize>,
}

impl OutputPlan {
    /// One recipient, no memo
    pub fn single() -> Self {
        Self {
            payees: 1,
            memo_sizes: Vec::new(),
        }
    }

    /// One recipient plus an OP_RETURN memo
    pub fn with_memo(memo_len: usize) -> Self {
        Self {
            payees: 1,
            memo_sizes: vec![memo_len],
        }
    }

    /// Outputs counted at the standard size: payees plus change
    pub fn standard_outputs(&self) -> usize {
        self.payees + 1
    }
}

/// vsize units added by an OP_RETURN output carrying `memo_len` bytes
pub fn memo_output_vsize(memo_len: usize) -> f64 {
    let script_len_prefix = if memo_len > 75 { 2.0 } else { 1.0 };
    // value-prefix + script-len + OP_RETURN + push + payload + value
    1.0 + script_len_prefix + 1.0 + 1.0 + memo_len as f64 + 8.0
}

/// `ceil(10.5 + 68·inputs + 31·outputs + memo overhead)`
pub fn estimate_vsize(inputs: usize, plan: &OutputPlan) -> u64 {
    let memo: f64 = plan.memo_sizes.iter().map(|&len| memo_output_vsize(len)).sum();
    let vsize = TX_OVERHEAD_VSIZE
        + INPUT_VSIZE * inputs as f64
        + OUTPUT_VSIZE * plan.standard_outputs() as f64
        + memo;
    vsize.ceil() as u64
}

/// Chosen inputs and the fee they pay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub inputs: Vec<Utxo>,
    /// Target amount (sum of payee outputs)
    pub amount: u64,
    /// Sum of input values
    pub total_in: u64,
    /// Estimated vsize for the chosen input count
    pub vsize: u64,
    /// `fee_rate × vsize`
    pub fee: u64,
    /// Change back to self; `None` when at or below dust
    pub change: Option<u64>,
}

impl Selection {
    /// Fee actually paid once dust change is folded in
    pub fn effective_fee(&self) -> u64 {
        self.total_in - self.amount - self.change.unwrap_or(0)
    }
}

/// Greedy largest-first coin selector
#[derive(Debug, Clone)]
pub struct CoinSelector {
    dust_threshold: u64,
}

impl CoinSelector {
    pub fn new() -> Self {
        Self {
            dust_threshold: DUST_THRESHOLD_SATS,
        }
    }

    /// Drop candidates that are mempool-pending, reserved or spent by us.
    ///
    /// Duplicated outpoints (indexer set merged with pending change) are kept once.
    pub fn filter_candidates(
        &self,
        candidates: &[Utxo],
        external_pending: &HashSet<String>,
        ledger: &mut UtxoLedger,
        now: Instant,
    ) -> (Vec<Utxo>, ExclusionCounts) {
        let mut seen = HashSet::new();
        let mut available = Vec::new();
        let mut exclusions = ExclusionCounts::default();

        for utxo in candidates {
            let key = utxo.key();
            if !seen.insert(key.clone()) {
                continue;
            }

            if external_pending.contains(&key) {
                exclusions.external_pending += 1;
                continue;
            }

            match ledger.availability_at(&key, now) {
                Availability::Available => available.push(utxo.clone()),
                Availability::Reserved => exclusions.reserved += 1,
                Availability::Spent { .. } => exclusions.spent_locally += 1,
            }
        }

        (available, exclusions)
    }

    /// Select inputs covering `amount` plus fee at `fee_rate` sat/vB.
    ///
    /// Does not reserve; callers reserve the returned inputs while still
    /// holding the ledger.
    pub fn select(
        &self,
        candidates: &[Utxo],
        external_pending: &HashSet<String>,
        ledger: &mut UtxoLedger,
        amount: u64,
        fee_rate: u64,
        plan: &OutputPlan,
    ) -> Result<Selection, WalletError> {
        if candidates.is_empty() {
            return Err(WalletError::NoUtxosFound);
        }

        ledger.sweep_expired();
        let (mut available, exclusions) =
            self.filter_candidates(candidates, external_pending, ledger, Instant::now());

        if available.is_empty() {
            return Err(WalletError::AllCandidatesUnavailable {
                candidates: candidates.len(),
                exclusions,
            });
        }

        available.sort_by(|a, b| b.value.cmp(&a.value).then_with(|| a.key().cmp(&b.key())));

        let mut inputs = Vec::new();
        let mut total_in = 0u64;

        for utxo in available {
            total_in = total_in.saturating_add(utxo.value);
            inputs.push(utxo);

            let vsize = estimate_vsize(inputs.len(), plan);
            let fee = fee_rate.saturating_mul(vsize);

            if total_in >= amount.saturating_add(fee) {
                return Ok(self.finish(inputs, amount, total_in, vsize, fee));
            }
        }

        let need = amount.saturating_add(fee_rate.saturating_mul(estimate_vsize(inputs.len(), plan)));
        Err(WalletError::InsufficientFunds {
            have: total_in,
            need,
            exclusions,
        })
    }

    fn finish(
        &self,
        inputs: Vec<Utxo>,
        amount: u64,
        total_in: u64,
        vsize: u64,
        fee: u64,
    ) -> Selection {
        let change = total_in - amount - fee;
        let change = (change > self.dust_threshold).then_some(change);

        tracing::debug!(
            target: "xbridge_wallet::selector",
            inputs = inputs.len(),
            total_in,
            amount,
            fee,
            vsize,
            change = change.unwrap_or(0),
            "selected inputs"
        );

        Selection {
            inputs,
            amount,
            total_in,
            vsize,
            fee,
            change,
        }
    }
}

impl Default for CoinSelector {
    fn default() -> Self {
        Self::new()
    }
}
