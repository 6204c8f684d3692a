//! External PSBT Reconciler
//!
//! PSBTs assembled by an outside venue are built from that venue's view of
//! our UTXO set, which can lag behind what this engine has already spent.
//! Inputs are checked against the ledger first and only then against the
//! address mempool, so the most specific reason wins.
//!
//! When the declared inputs are stale, `build_from_external_outputs` keeps
//! the venue's payee and memo outputs verbatim and reselects inputs.

use bitcoin::{psbt::Psbt, Script, TxOut};
use std::collections::HashSet;
use std::str::FromStr;

use crate::error::WalletError;
use crate::logging::{self, EventCategory};
use crate::retry::with_retry;
use crate::wallet::ledger::{Availability, UtxoLedger};
use crate::wallet::service::{op_return_payload_len, pending_spends, Engine};
use crate::wallet::signer::{extract_signed, TxSigner};
use crate::wallet::types::*;

/// Decode a PSBT given as base64 or hex
pub fn parse_psbt(text: &str) -> Result<Psbt, WalletError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(WalletError::InvalidPsbt("empty input".to_string()));
    }

    if text.len() % 2 == 0 && text.chars().all(|c| c.is_ascii_hexdigit()) {
        let bytes = hex::decode(text).map_err(|e| WalletError::InvalidPsbt(e.to_string()))?;
        return Psbt::deserialize(&bytes).map_err(|e| WalletError::InvalidPsbt(e.to_string()));
    }

    Psbt::from_str(text).map_err(|e| WalletError::InvalidPsbt(e.to_string()))
}

/// Inputs a PSBT declares, valued from their `witness_utxo` (0 when absent)
pub fn declared_inputs(psbt: &Psbt) -> Vec<Utxo> {
    psbt.unsigned_tx
        .input
        .iter()
        .zip(&psbt.inputs)
        .map(|(txin, input)| {
            let value = input
                .witness_utxo
                .as_ref()
                .map(|out| out.value.to_sat())
                .unwrap_or(0);
            Utxo::new(
                txin.previous_output.txid.to_string(),
                txin.previous_output.vout,
                value,
            )
        })
        .collect()
}

/// Ledger conflicts: spent by us first, then reserved
pub fn local_conflicts(ledger: &mut UtxoLedger, inputs: &[Utxo]) -> Vec<Conflict> {
    inputs
        .iter()
        .filter_map(|utxo| {
            let (reason, spent_in_txid) = match ledger.availability(&utxo.key()) {
                Availability::Available => return None,
                Availability::Spent { spent_in_txid } => {
                    (ConflictReason::SpentLocally, Some(spent_in_txid))
                }
                Availability::Reserved => (ConflictReason::Reserved, None),
            };
            Some(Conflict {
                txid: utxo.txid.clone(),
                vout: utxo.vout,
                reason,
                spent_in_txid,
            })
        })
        .collect()
}

/// Inputs already consumed by a transaction in the address mempool
pub fn mempool_conflicts(inputs: &[Utxo], pending: &HashSet<String>) -> Vec<Conflict> {
    inputs
        .iter()
        .filter(|utxo| pending.contains(&utxo.key()))
        .map(|utxo| Conflict {
            txid: utxo.txid.clone(),
            vout: utxo.vout,
            reason: ConflictReason::Mempool,
            spent_in_txid: None,
        })
        .collect()
}

/// A venue PSBT's outputs, sorted by what a rebuild does with them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalOutputs {
    /// Kept verbatim, in original order
    pub payees: Vec<TxOut>,
    /// OP_RETURN outputs, kept verbatim
    pub memos: Vec<TxOut>,
    /// Outputs paying our own script; replaced by fresh change
    pub dropped: Vec<TxOut>,
}

pub fn split_external_outputs(psbt: &Psbt, own_script: &Script) -> ExternalOutputs {
    let mut split = ExternalOutputs::default();

    for output in &psbt.unsigned_tx.output {
        if output.script_pubkey.is_op_return() {
            split.memos.push(output.clone());
        } else if output.script_pubkey.as_script() == own_script {
            split.dropped.push(output.clone());
        } else {
            split.payees.push(output.clone());
        }
    }

    split
}

/// Where an external PSBT's value goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTotals {
    /// `(vout, value)` of outputs paying our own script
    pub change: Vec<(u32, u64)>,
    /// Value paid to everyone else
    pub sent: u64,
    /// Declared inputs minus all outputs
    pub fee: u64,
}

/// Sum a PSBT's inputs and outputs, rejecting totals past the money supply
pub fn external_totals(psbt: &Psbt, own_script: &Script) -> Result<ExternalTotals, WalletError> {
    let outputs = &psbt.unsigned_tx.output;
    let out_of_range = || WalletError::InvalidPsbt("values exceed the money supply".to_string());

    let total_out =
        checked_total(outputs.iter().map(|out| out.value.to_sat())).ok_or_else(out_of_range)?;
    let total_in =
        checked_total(declared_inputs(psbt).iter().map(|u| u.value)).ok_or_else(out_of_range)?;

    let change: Vec<(u32, u64)> = outputs
        .iter()
        .enumerate()
        .filter(|(_, out)| out.script_pubkey.as_script() == own_script)
        .map(|(vout, out)| (vout as u32, out.value.to_sat()))
        .collect();
    let sent: u64 = outputs
        .iter()
        .filter(|out| {
            out.script_pubkey.as_script() != own_script && !out.script_pubkey.is_op_return()
        })
        .map(|out| out.value.to_sat())
        .sum();

    Ok(ExternalTotals {
        change,
        sent,
        fee: total_in.saturating_sub(total_out),
    })
}

impl Engine {
    /// Check every declared input of `psbt`.
    ///
    /// The mempool is only consulted when the ledger reports nothing.
    pub async fn validate(&self, psbt: &Psbt) -> Result<Vec<Utxo>, WalletError> {
        let signer = self.signer()?;
        let inputs = declared_inputs(psbt);
        if inputs.is_empty() {
            return Err(WalletError::InvalidPsbt("no inputs".to_string()));
        }

        let local = {
            let mut ledger = self.ledger.lock().await;
            ledger.sweep_expired();
            local_conflicts(&mut ledger, &inputs)
        };
        if !local.is_empty() {
            logging::log_conflict_event(&logging::generate_correlation_id(), &local);
            return Err(WalletError::UtxoConflict(local));
        }

        let mempool = self
            .chain
            .get_address_mempool(&signer.address().to_string())
            .await?;
        let external = mempool_conflicts(&inputs, &pending_spends(&mempool));
        if !external.is_empty() {
            logging::log_conflict_event(&logging::generate_correlation_id(), &external);
            return Err(WalletError::UtxoConflict(external));
        }

        Ok(inputs)
    }

    /// Sign and broadcast an externally built PSBT as-is.
    ///
    /// Outputs paying our own script are recorded as pending change.
    pub async fn sign_and_broadcast(&self, psbt: Psbt) -> Result<BroadcastResult, WalletError> {
        let signer = self.signer()?;
        let correlation_id = logging::generate_correlation_id();
        let totals = external_totals(&psbt, &signer.script_pubkey())?;
        let inputs = self.validate(&psbt).await?;

        // Validation awaited the mempool; re-check before claiming
        {
            let mut ledger = self.ledger.lock().await;
            let conflicts = local_conflicts(&mut ledger, &inputs);
            if !conflicts.is_empty() {
                logging::log_conflict_event(&correlation_id, &conflicts);
                return Err(WalletError::UtxoConflict(conflicts));
            }
            ledger.reserve(&inputs);
        }

        match self.sign_external(signer.as_ref(), psbt, &inputs, totals).await {
            Ok(result) => {
                logging::log_spend_event(
                    EventCategory::Reconcile,
                    "external_psbt_broadcast",
                    &correlation_id,
                    logging::SpendOutcome {
                        amount_sats: result.sent,
                        fee_sats: result.fee,
                        inputs: result.inputs.len(),
                        txid: Some(result.txid.as_str()),
                        error: None,
                    },
                );
                Ok(result)
            }
            Err(e) => {
                self.rollback(&inputs, &e).await;
                let message = e.to_string();
                logging::log_spend_event(
                    EventCategory::Reconcile,
                    "external_psbt_failed",
                    &correlation_id,
                    logging::SpendOutcome {
                        amount_sats: 0,
                        fee_sats: 0,
                        inputs: inputs.len(),
                        txid: None,
                        error: Some((e.error_code(), message.as_str())),
                    },
                );
                Err(e)
            }
        }
    }

    async fn sign_external(
        &self,
        signer: &dyn TxSigner,
        mut psbt: Psbt,
        inputs: &[Utxo],
        totals: ExternalTotals,
    ) -> Result<BroadcastResult, WalletError> {
        signer.sign_psbt(&mut psbt)?;
        let tx = extract_signed(psbt)?;

        self.broadcast_and_commit(&tx, inputs, totals.change, totals.sent, totals.fee)
            .await
    }

    /// Rebuild a venue PSBT with fresh inputs.
    ///
    /// Payee and memo outputs are kept verbatim, outputs to self are dropped
    /// and a new change output goes between the payees and the memos.
    pub async fn build_from_external_outputs(
        &self,
        psbt: &Psbt,
        tier: FeeTier,
    ) -> Result<BroadcastResult, WalletError> {
        let signer = self.signer()?;
        let split = split_external_outputs(psbt, &signer.script_pubkey());

        if split.payees.is_empty() {
            return Err(WalletError::InvalidPsbt("no payee outputs to keep".to_string()));
        }
        let kept = split.payees.iter().chain(&split.memos);
        if checked_total(kept.map(|out| out.value.to_sat())).is_none() {
            return Err(WalletError::InvalidPsbt(
                "output values exceed the money supply".to_string(),
            ));
        }
        if let Some(dust) = split
            .payees
            .iter()
            .find(|out| out.value.to_sat() <= DUST_THRESHOLD_SATS)
        {
            return Err(WalletError::BelowDustThreshold {
                amount: dust.value.to_sat(),
                threshold: DUST_THRESHOLD_SATS,
            });
        }
        if let Some(len) = split
            .memos
            .iter()
            .map(|memo| op_return_payload_len(&memo.script_pubkey))
            .find(|&len| len > MAX_MEMO_BYTES)
        {
            return Err(WalletError::MemoTooLong {
                len,
                max: MAX_MEMO_BYTES,
            });
        }

        tracing::info!(
            target: "xbridge_wallet::reconcile",
            payees = split.payees.len(),
            memos = split.memos.len(),
            dropped = split.dropped.len(),
            %tier,
            "rebuilding external PSBT with fresh inputs"
        );

        self.spend(signer, split.payees, split.memos, tier, EventCategory::Reconcile)
            .await
    }

    /// `build_from_external_outputs`, retried on stale-input failures.
    ///
    /// The ledger is refreshed from the address mempool before each retry.
    pub async fn rebuild_with_retry(
        &self,
        psbt: &Psbt,
        tier: FeeTier,
    ) -> Result<BroadcastResult, WalletError> {
        with_retry(self.retry, WalletError::is_retryable, |attempt| async move {
            if attempt > 1 {
                self.recover_on_startup().await?;
            }
            self.build_from_external_outputs(psbt, tier).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::esplora::{EsploraError, MockChainBackend};
    use crate::wallet::builder::TxBuilder;
    use crate::wallet::service::tests::*;
    use crate::wallet::signer::SingleKeySigner;
    use bitcoin::{Amount, Network, ScriptBuf};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn payee(value: u64) -> TxOut {
        TxOut {
            value: Amount::from_sat(value),
            script_pubkey: SingleKeySigner::from_seed(b"recipient", Network::Regtest).script_pubkey(),
        }
    }

    /// PSBT with `outputs` in the given order, inputs locked to `owner`
    fn venue_psbt(inputs: &[Utxo], owner: &ScriptBuf, outputs: &[TxOut]) -> Psbt {
        TxBuilder::new(Network::Regtest)
            .build_psbt(inputs, owner, outputs, None, &[])
            .unwrap()
            .psbt
    }

    #[test]
    fn test_parse_psbt_base64_and_hex() {
        let psbt = venue_psbt(
            &[Utxo::new(txid(1), 0, 50_000)],
            &own_signer().script_pubkey(),
            &[payee(40_000)],
        );

        assert_eq!(parse_psbt(&psbt.to_string()).unwrap(), psbt);
        assert_eq!(parse_psbt(&hex::encode(psbt.serialize())).unwrap(), psbt);
        assert!(matches!(parse_psbt("not a psbt"), Err(WalletError::InvalidPsbt(_))));
        assert!(matches!(parse_psbt("  "), Err(WalletError::InvalidPsbt(_))));
    }

    #[test]
    fn test_split_external_outputs() {
        let own = own_signer().script_pubkey();
        let memo = TxBuilder::memo_output(&[0x11; 20]).unwrap();
        let psbt = venue_psbt(
            &[Utxo::new(txid(1), 0, 120_000)],
            &own,
            &[payee(100_000), memo.clone(), TxOut { value: Amount::from_sat(8_000), script_pubkey: own.clone() }],
        );

        let split = split_external_outputs(&psbt, &own);
        assert_eq!(split.payees, vec![payee(100_000)]);
        assert_eq!(split.memos, vec![memo]);
        assert_eq!(split.dropped.len(), 1);
    }

    #[tokio::test]
    async fn test_local_conflicts_take_priority_over_mempool() {
        let mut chain = MockChainBackend::new();
        chain.expect_get_address_mempool().times(0);
        let engine = engine_with(chain);

        let spent = Utxo::new(txid(1), 0, 50_000);
        let reserved = Utxo::new(txid(2), 0, 30_000);
        let free = Utxo::new(txid(3), 0, 20_000);
        {
            let mut ledger = engine.ledger.lock().await;
            ledger.record_spent(&[spent.clone()], &txid(0xaa));
            ledger.reserve(&[reserved.clone()]);
        }

        let psbt = venue_psbt(
            &[spent, reserved, free],
            &own_signer().script_pubkey(),
            &[payee(90_000)],
        );
        let err = engine.validate(&psbt).await.unwrap_err();
        let conflicts = err.conflicts();

        assert_eq!(conflicts.len(), 2);
        assert_eq!(conflicts[0].reason, ConflictReason::SpentLocally);
        assert_eq!(conflicts[0].spent_in_txid, Some(txid(0xaa)));
        assert_eq!(conflicts[1].reason, ConflictReason::Reserved);
        assert_eq!(conflicts[1].spent_in_txid, None);
    }

    #[tokio::test]
    async fn test_mempool_conflict() {
        let mut chain = MockChainBackend::new();
        chain.expect_get_address_mempool().times(1).returning(|_| {
            Ok(vec![MempoolTx {
                txid: txid(0xbb),
                vin: vec![MempoolVin { txid: txid(1), vout: 0 }],
                vout: vec![],
            }])
        });
        let engine = engine_with(chain);

        let psbt = venue_psbt(
            &[Utxo::new(txid(1), 0, 50_000)],
            &own_signer().script_pubkey(),
            &[payee(40_000)],
        );
        let err = engine.validate(&psbt).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.conflicts().len(), 1);
        assert_eq!(err.conflicts()[0].reason, ConflictReason::Mempool);
    }

    #[tokio::test]
    async fn test_sign_and_broadcast_records_spend_and_change() {
        let mut chain = MockChainBackend::new();
        chain.expect_get_address_mempool().returning(|_| Ok(vec![]));
        let broadcasts = expect_broadcasts(&mut chain);
        let engine = engine_with(chain);

        let own = own_signer().script_pubkey();
        let input = Utxo::new(txid(1), 0, 50_000);
        let psbt = venue_psbt(
            &[input.clone()],
            &own,
            &[payee(30_000), TxOut { value: Amount::from_sat(18_000), script_pubkey: own.clone() }],
        );

        let result = engine.sign_and_broadcast(psbt).await.unwrap();
        assert_eq!(result.sent, 30_000);
        assert_eq!(result.fee, 2_000);
        assert_eq!(result.change, vec![(1, 18_000)]);
        assert_eq!(broadcasts.lock().unwrap().len(), 1);

        let mut ledger = engine.ledger.lock().await;
        assert!(ledger.is_spent_by_us(&input.key()).spent);
        assert_eq!(ledger.pending_change(), vec![Utxo::new(result.txid.clone(), 1, 18_000)]);

        // A second submission of the same PSBT is now a local conflict
        drop(ledger);
        let again = venue_psbt(&[input], &own, &[payee(30_000)]);
        let err = engine.sign_and_broadcast(again).await.unwrap_err();
        assert_eq!(err.conflicts()[0].reason, ConflictReason::SpentLocally);
    }

    #[tokio::test]
    async fn test_foreign_input_releases_reservation() {
        let mut chain = MockChainBackend::new();
        chain.expect_get_address_mempool().returning(|_| Ok(vec![]));
        chain.expect_broadcast_tx().times(0);
        let engine = engine_with(chain);

        let stranger = SingleKeySigner::from_seed(b"stranger", Network::Regtest);
        let input = Utxo::new(txid(1), 0, 50_000);
        let psbt = venue_psbt(&[input.clone()], &stranger.script_pubkey(), &[payee(40_000)]);

        let err = engine.sign_and_broadcast(psbt).await.unwrap_err();
        assert!(matches!(err, WalletError::SignInputFailed { index: 0, .. }));
        assert!(engine.ledger.lock().await.is_available(&input));
    }

    #[tokio::test]
    async fn test_rebuild_keeps_payees_and_memo() {
        let mut chain = MockChainBackend::new();
        chain
            .expect_get_address_utxos()
            .returning(|_| Ok(vec![Utxo::new(txid(4), 0, 200_000)]));
        chain.expect_get_address_mempool().returning(|_| Ok(vec![]));
        let broadcasts = expect_broadcasts(&mut chain);
        let engine = engine_with(chain);

        let own = own_signer().script_pubkey();
        let memo = TxBuilder::memo_output(&[0x22; 20]).unwrap();
        let stale = venue_psbt(
            &[Utxo::new(txid(9), 1, 120_000)],
            &own,
            &[payee(100_000), memo.clone(), TxOut { value: Amount::from_sat(8_000), script_pubkey: own.clone() }],
        );

        let result = engine
            .build_from_external_outputs(&stale, FeeTier::Normal)
            .await
            .unwrap();

        let tx = decode(&broadcasts.lock().unwrap()[0]);
        assert_eq!(tx.output.len(), 3);
        assert_eq!(tx.output[0], payee(100_000));
        assert_eq!(tx.output[1].script_pubkey, own);
        assert_eq!(tx.output[2], memo);

        // 173 vB at 10 sat/vB
        assert_eq!(result.fee, 1_730);
        assert_eq!(result.change, vec![(1, 98_270)]);
        assert_eq!(result.inputs, vec![Utxo::new(txid(4), 0, 200_000)]);
    }

    #[tokio::test]
    async fn test_rebuild_with_retry_recovers_from_stale_input() {
        let utxo_calls = Arc::new(AtomicU32::new(0));
        let broadcast_calls = Arc::new(AtomicU32::new(0));

        let mut chain = MockChainBackend::new();
        let counter = utxo_calls.clone();
        chain.expect_get_address_utxos().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(vec![Utxo::new(txid(1), 0, 150_000), Utxo::new(txid(2), 0, 140_000)])
            } else {
                Ok(vec![Utxo::new(txid(2), 0, 140_000)])
            }
        });
        chain.expect_get_address_mempool().times(3).returning(|_| Ok(vec![]));
        let counter = broadcast_calls.clone();
        chain.expect_broadcast_tx().returning(move |tx_hex| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(EsploraError::BroadcastFailed(
                    "bad-txns-inputs-missingorspent".to_string(),
                ))
            } else {
                Ok(decode(tx_hex).compute_txid().to_string())
            }
        });
        let engine = engine_with(chain);

        let stale = venue_psbt(
            &[Utxo::new(txid(9), 0, 120_000)],
            &own_signer().script_pubkey(),
            &[payee(100_000)],
        );

        let result = engine.rebuild_with_retry(&stale, FeeTier::Normal).await.unwrap();
        assert_eq!(result.inputs, vec![Utxo::new(txid(2), 0, 140_000)]);
        assert_eq!(broadcast_calls.load(Ordering::SeqCst), 2);

        // The rejected attempt's input is free again
        assert!(engine
            .ledger
            .lock()
            .await
            .is_available(&Utxo::new(txid(1), 0, 150_000)));
    }

    #[test]
    fn test_external_totals() {
        let own = own_signer().script_pubkey();
        let memo = TxBuilder::memo_output(&[0x11; 20]).unwrap();
        let psbt = venue_psbt(
            &[Utxo::new(txid(1), 0, 50_000)],
            &own,
            &[payee(30_000), TxOut { value: Amount::from_sat(18_000), script_pubkey: own.clone() }, memo],
        );

        let totals = external_totals(&psbt, &own).unwrap();
        assert_eq!(totals.sent, 30_000);
        assert_eq!(totals.change, vec![(1, 18_000)]);
        assert_eq!(totals.fee, 2_000);
    }

    #[tokio::test]
    async fn test_oversized_outputs_rejected_before_reservation() {
        // No expectations: neither the mempool nor broadcast is reached
        let engine = engine_with(MockChainBackend::new());
        let own = own_signer().script_pubkey();
        let input = Utxo::new(txid(1), 0, 50_000);
        let huge = u64::MAX / 2 + 1;
        let psbt = venue_psbt(&[input.clone()], &own, &[payee(huge), payee(huge)]);

        assert!(matches!(
            engine.sign_and_broadcast(psbt.clone()).await,
            Err(WalletError::InvalidPsbt(_))
        ));
        assert!(engine.ledger.lock().await.is_available(&input));

        assert!(matches!(
            engine.build_from_external_outputs(&psbt, FeeTier::Normal).await,
            Err(WalletError::InvalidPsbt(_))
        ));
        assert_eq!(engine.ledger_snapshot().await.reservations, 0);
    }

    #[tokio::test]
    async fn test_rebuild_rejects_psbt_without_payees() {
        let engine = engine_with(MockChainBackend::new());
        let own = own_signer().script_pubkey();
        let psbt = venue_psbt(
            &[Utxo::new(txid(1), 0, 50_000)],
            &own,
            &[TxOut { value: Amount::from_sat(40_000), script_pubkey: own.clone() }],
        );

        assert!(matches!(
            engine.build_from_external_outputs(&psbt, FeeTier::Normal).await,
            Err(WalletError::InvalidPsbt(_))
        ));
    }
}
