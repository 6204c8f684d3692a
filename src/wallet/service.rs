//! Spending Engine
//!
//! Owns the ledger and wires it to the signer, coin selector, builder, fee
//! oracle and chain watcher. Every spend follows the same path:
//!
//! ```text
//! fetch UTXOs + mempool + fee rate
//!   -> lock ledger: sweep, select, reserve   (no await inside)
//!   -> build, sign, broadcast
//!   -> commit spends + change, or release
//! ```

use bitcoin::{consensus::encode::serialize_hex, script::Instruction, Amount, Script, Transaction, TxOut};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::config::{ConfigError, WalletConfig};
use crate::error::WalletError;
use crate::esplora::{ChainBackend, EsploraClient, EsploraError};
use crate::fees::{FeeOracle, FeeRates};
use crate::logging::{self, EventCategory, SpendOutcome};
use crate::retry::RetryPolicy;
use crate::wallet::builder::TxBuilder;
use crate::wallet::ledger::{LedgerSnapshot, RecoveryStats, UtxoLedger};
use crate::wallet::selector::{CoinSelector, OutputPlan, Selection};
use crate::wallet::signer::{extract_signed, SingleKeySigner, TxSigner};
use crate::wallet::types::*;
use crate::wallet::watcher::{ChainWatcher, WatcherConfig};

/// Self-custodied spending engine for one P2WPKH address
pub struct Engine {
    /// Transaction signer; `None` leaves the engine receive-only
    pub(crate) signer: Option<Arc<dyn TxSigner>>,

    /// Indexer / broadcast endpoint
    pub(crate) chain: Arc<dyn ChainBackend>,

    /// Fee rate oracle
    pub(crate) fees: FeeOracle,

    /// Reservations, local spends, pending change
    pub(crate) ledger: Mutex<UtxoLedger>,

    pub(crate) selector: CoinSelector,

    pub(crate) builder: TxBuilder,

    /// Startup recovery and post-broadcast polling
    pub(crate) watcher: ChainWatcher,

    /// Budget for `rebuild_with_retry`
    pub(crate) retry: RetryPolicy,

    bridge_min_sats: u64,
}

impl Engine {
    /// Create a receive-only engine; attach a key with `with_signer`
    pub fn new(network: bitcoin::Network, chain: Arc<dyn ChainBackend>, fees: FeeOracle) -> Self {
        Self {
            signer: None,
            watcher: ChainWatcher::new(chain.clone(), WatcherConfig::default()),
            chain,
            fees,
            ledger: Mutex::new(UtxoLedger::new()),
            selector: CoinSelector::new(),
            builder: TxBuilder::new(network),
            retry: RetryPolicy::default(),
            bridge_min_sats: BRIDGE_MIN_SATS,
        }
    }

    /// Create from environment configuration
    pub fn from_config(config: &WalletConfig) -> Result<Self, WalletError> {
        let network = config.network.bitcoin_network();
        let chain: Arc<dyn ChainBackend> = Arc::new(EsploraClient::new(&config.esplora_url));
        let fees = match config.fee_api.as_deref() {
            Some(url) => FeeOracle::new(url),
            None => FeeOracle::fixed(),
        };

        let mut engine = Self::new(network, chain, fees)
            .with_bridge_minimum(config.bridge_min_sats)
            .with_watcher_config(WatcherConfig {
                timeout: config.visibility_timeout,
                ..WatcherConfig::default()
            });

        if let Some(key) = config.signer_key.as_deref() {
            let signer = SingleKeySigner::from_key_str(key, network).map_err(|e| {
                ConfigError::InvalidValue("WALLET_SIGNER_KEY".to_string(), e.to_string())
            })?;
            engine = engine.with_signer(Arc::new(signer));
        }

        Ok(engine)
    }

    pub fn with_signer(mut self, signer: Arc<dyn TxSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_watcher_config(mut self, config: WatcherConfig) -> Self {
        self.watcher = ChainWatcher::new(self.chain.clone(), config);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_bridge_minimum(mut self, minimum: u64) -> Self {
        self.bridge_min_sats = minimum;
        self
    }

    pub fn network(&self) -> bitcoin::Network {
        self.builder.network()
    }

    /// Signing address, if a key is configured
    pub fn address(&self) -> Option<String> {
        self.signer.as_ref().map(|s| s.address().to_string())
    }

    pub(crate) fn signer(&self) -> Result<Arc<dyn TxSigner>, WalletError> {
        self.signer.clone().ok_or(WalletError::NoCredential)
    }

    /// Pay a single recipient, optionally as a bridge deposit carrying a memo.
    ///
    /// Validation happens before any network or ledger access.
    pub async fn pay(&self, request: PaymentRequest) -> Result<BroadcastResult, WalletError> {
        let signer = self.signer()?;

        let mut memos = Vec::new();
        if let Some(memo) = request.memo.as_deref() {
            memos.push(TxBuilder::memo_output(memo)?);

            if request.amount_sats <= self.bridge_min_sats {
                return Err(WalletError::BelowBridgeMinimum {
                    amount: request.amount_sats,
                    minimum: self.bridge_min_sats,
                });
            }
        }

        if request.amount_sats <= DUST_THRESHOLD_SATS {
            return Err(WalletError::BelowDustThreshold {
                amount: request.amount_sats,
                threshold: DUST_THRESHOLD_SATS,
            });
        }
        if request.amount_sats > MAX_MONEY_SATS {
            return Err(WalletError::AmountOutOfRange {
                maximum: MAX_MONEY_SATS,
            });
        }

        let recipient = self.builder.validate_address(&request.recipient)?;
        let payee = TxOut {
            value: Amount::from_sat(request.amount_sats),
            script_pubkey: recipient.script_pubkey(),
        };

        self.spend(signer, vec![payee], memos, request.tier, EventCategory::Spend)
            .await
    }

    /// Select fresh inputs for `payees` (+ `memos`) and broadcast.
    pub(crate) async fn spend(
        &self,
        signer: Arc<dyn TxSigner>,
        payees: Vec<TxOut>,
        memos: Vec<TxOut>,
        tier: FeeTier,
        category: EventCategory,
    ) -> Result<BroadcastResult, WalletError> {
        let amount = checked_total(payees.iter().map(|o| o.value.to_sat())).ok_or(
            WalletError::AmountOutOfRange {
                maximum: MAX_MONEY_SATS,
            },
        )?;
        let correlation_id = logging::generate_correlation_id();

        let result = self
            .select_sign_broadcast(signer.as_ref(), &payees, &memos, amount, tier, &correlation_id)
            .await;

        let message = result.as_ref().err().map(ToString::to_string);
        let outcome = match &result {
            Ok(r) => SpendOutcome {
                amount_sats: r.sent,
                fee_sats: r.fee,
                inputs: r.inputs.len(),
                txid: Some(r.txid.as_str()),
                error: None,
            },
            Err(e) => SpendOutcome {
                amount_sats: amount,
                fee_sats: 0,
                inputs: 0,
                txid: None,
                error: Some((e.error_code(), message.as_deref().unwrap_or_default())),
            },
        };
        let event = if result.is_ok() { "spend_broadcast" } else { "spend_failed" };
        logging::log_spend_event(category, event, &correlation_id, outcome);

        result
    }

    async fn select_sign_broadcast(
        &self,
        signer: &dyn TxSigner,
        payees: &[TxOut],
        memos: &[TxOut],
        amount: u64,
        tier: FeeTier,
        correlation_id: &str,
    ) -> Result<BroadcastResult, WalletError> {
        let address = signer.address().to_string();
        let plan = OutputPlan {
            payees: payees.len(),
            memo_sizes: memos.iter().map(|m| op_return_payload_len(&m.script_pubkey)).collect(),
        };

        let utxos = self.chain.get_address_utxos(&address).await?;
        let mempool = self.chain.get_address_mempool(&address).await?;
        let fee_rate = self.fees.rate_for(tier).await;
        let external_pending = pending_spends(&mempool);

        let selection = {
            let mut ledger = self.ledger.lock().await;
            let mut candidates = utxos;
            candidates.extend(ledger.pending_change());

            let selection = self.selector.select(
                &candidates,
                &external_pending,
                &mut ledger,
                amount,
                fee_rate,
                &plan,
            )?;
            ledger.reserve(&selection.inputs);
            selection
        };

        tracing::debug!(
            target: "xbridge_wallet::engine",
            correlation_id,
            inputs = selection.inputs.len(),
            total_in = selection.total_in,
            fee = selection.fee,
            fee_rate,
            change = ?selection.change,
            "inputs reserved"
        );

        match self.build_and_commit(signer, &selection, payees, memos).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.rollback(&selection.inputs, &e).await;
                Err(e)
            }
        }
    }

    async fn build_and_commit(
        &self,
        signer: &dyn TxSigner,
        selection: &Selection,
        payees: &[TxOut],
        memos: &[TxOut],
    ) -> Result<BroadcastResult, WalletError> {
        let unsigned = self.builder.build_psbt(
            &selection.inputs,
            &signer.script_pubkey(),
            payees,
            selection.change,
            memos,
        )?;
        let change: Vec<(u32, u64)> = unsigned.change().into_iter().collect();

        let mut psbt = unsigned.psbt;
        signer.sign_psbt(&mut psbt)?;
        let tx = extract_signed(psbt)?;

        self.broadcast_and_commit(&tx, &selection.inputs, change, selection.amount, selection.effective_fee())
            .await
    }

    /// Broadcast a signed transaction and record its effects in the ledger
    pub(crate) async fn broadcast_and_commit(
        &self,
        tx: &Transaction,
        inputs: &[Utxo],
        change: Vec<(u32, u64)>,
        sent: u64,
        fee: u64,
    ) -> Result<BroadcastResult, WalletError> {
        let tx_hex = serialize_hex(tx);
        let txid = tx.compute_txid().to_string();

        let reported = self.chain.broadcast_tx(&tx_hex).await?;
        if reported != txid {
            tracing::warn!(target: "xbridge_wallet::engine", %txid, %reported, "endpoint reported a different txid");
        }

        {
            let mut ledger = self.ledger.lock().await;
            ledger.record_spent(inputs, &txid);
            for &(vout, value) in &change {
                ledger.record_change(&txid, vout, value);
            }
        }

        tracing::info!(target: "xbridge_wallet::engine", %txid, sent, fee, inputs = inputs.len(), "transaction broadcast");

        Ok(BroadcastResult {
            txid,
            tx_hex,
            fee,
            sent,
            change,
            inputs: inputs.to_vec(),
        })
    }

    /// Undo a reservation after a failed build.
    ///
    /// A transport failure during broadcast leaves the outcome unknown: the
    /// inputs stay reserved and expire on their own.
    pub(crate) async fn rollback(&self, inputs: &[Utxo], error: &WalletError) {
        if let WalletError::Chain(EsploraError::HttpError(_)) = error {
            tracing::warn!(
                target: "xbridge_wallet::engine",
                inputs = inputs.len(),
                "broadcast outcome unknown, inputs stay reserved until expiry"
            );
            return;
        }
        self.ledger.lock().await.release(inputs);
    }

    /// Rehydrate the ledger from the address mempool
    pub async fn recover_on_startup(&self) -> Result<RecoveryStats, WalletError> {
        let signer = self.signer()?;
        let address = signer.address().to_string();
        Ok(self.watcher.recover_on_startup(&address, &self.ledger).await?)
    }

    /// Poll until the indexer knows `txid`; `false` on timeout
    pub async fn wait_for_visibility(&self, txid: &str) -> bool {
        self.watcher.wait_for_visibility(txid).await
    }

    /// Current fee rates (never fails)
    pub async fn fee_rates(&self) -> FeeRates {
        self.fees.get_rates().await
    }

    pub async fn ledger_snapshot(&self) -> LedgerSnapshot {
        self.ledger.lock().await.snapshot()
    }

    /// Sweep expired ledger entries every `interval` until the task is aborted.
    ///
    /// Selection sweeps on its own; this bounds growth for long-lived hosts.
    pub fn spawn_ledger_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                engine.ledger.lock().await.sweep_expired();
            }
        })
    }

    /// What the next selection would see
    pub async fn spendable(&self) -> Result<SpendableSummary, WalletError> {
        let signer = self.signer()?;
        let address = signer.address().to_string();

        let utxos = self.chain.get_address_utxos(&address).await?;
        let mempool = self.chain.get_address_mempool(&address).await?;
        let external_pending = pending_spends(&mempool);

        let mut ledger = self.ledger.lock().await;
        ledger.sweep_expired();
        let reported = utxos.len();
        let mut candidates = utxos;
        candidates.extend(ledger.pending_change());

        let (available, exclusions) = self.selector.filter_candidates(
            &candidates,
            &external_pending,
            &mut ledger,
            Instant::now(),
        );

        Ok(SpendableSummary {
            address,
            reported,
            available_sats: available.iter().map(|u| u.value).sum(),
            available,
            exclusions,
            ledger: ledger.snapshot(),
        })
    }
}

/// Spendable balance breakdown
#[derive(Debug, Clone)]
pub struct SpendableSummary {
    pub address: String,
    /// UTXOs the indexer reported
    pub reported: usize,
    /// Candidates that survive filtering (indexer set plus pending change)
    pub available: Vec<Utxo>,
    pub available_sats: u64,
    pub exclusions: ExclusionCounts,
    pub ledger: LedgerSnapshot,
}

/// Outpoints consumed by the address's mempool transactions
pub(crate) fn pending_spends(mempool: &[MempoolTx]) -> HashSet<String> {
    mempool
        .iter()
        .flat_map(|tx| tx.vin.iter().map(|vin| outpoint_key(&vin.txid, vin.vout)))
        .collect()
}

/// Bytes pushed after `OP_RETURN`
pub(crate) fn op_return_payload_len(script: &Script) -> usize {
    script
        .instructions()
        .filter_map(|ins| match ins {
            Ok(Instruction::PushBytes(bytes)) => Some(bytes.len()),
            _ => None,
        })
        .sum()
}
