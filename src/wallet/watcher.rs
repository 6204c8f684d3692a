//! Recovery / Confirmation Watcher
//!
//! Startup rehydration of the ledger from the address mempool, and
//! post-broadcast polling until the indexer knows a transaction.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::esplora::{ChainBackend, EsploraError};
use crate::logging;
use crate::wallet::ledger::{RecoveryStats, UtxoLedger};

/// Polling cadence for `wait_for_visibility`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherConfig {
    /// Wait before the first lookup
    pub settle_delay: Duration,
    /// Delay between lookups
    pub poll_interval: Duration,
    /// Give up after this long (measured from the first lookup)
    pub timeout: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(3),
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Watches the engine's address on the chain backend
pub struct ChainWatcher {
    chain: Arc<dyn ChainBackend>,
    config: WatcherConfig,
}

impl ChainWatcher {
    pub fn new(chain: Arc<dyn ChainBackend>, config: WatcherConfig) -> Self {
        Self { chain, config }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Feed the address's unconfirmed transactions into the ledger
    pub async fn recover_on_startup(
        &self,
        address: &str,
        ledger: &Mutex<UtxoLedger>,
    ) -> Result<RecoveryStats, EsploraError> {
        let correlation_id = logging::generate_correlation_id();

        let pending = match self.chain.get_address_mempool(address).await {
            Ok(pending) => pending,
            Err(e) => {
                logging::log_recovery_event(&correlation_id, address, Err(&e.to_string()));
                return Err(e);
            }
        };
        let stats = ledger.lock().await.recover_from_network(address, &pending);

        logging::log_recovery_event(&correlation_id, address, Ok(&stats));
        Ok(stats)
    }

    /// Poll until the indexer returns the transaction.
    ///
    /// Returns `false` on timeout; lookup errors count as "not yet visible".
    pub async fn wait_for_visibility(&self, txid: &str) -> bool {
        tokio::time::sleep(self.config.settle_delay).await;

        let deadline = Instant::now() + self.config.timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.chain.tx_exists(txid).await {
                Ok(true) => {
                    tracing::info!(target: "xbridge_wallet::watcher", txid, attempts, "transaction visible");
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(target: "xbridge_wallet::watcher", txid, error = %e, "lookup failed");
                }
            }

            if Instant::now() + self.config.poll_interval > deadline {
                break;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        tracing::warn!(
            target: "xbridge_wallet::watcher",
            txid,
            attempts,
            timeout_secs = self.config.timeout.as_secs(),
            "transaction not visible before timeout"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::esplora::MockChainBackend;
    use crate::wallet::types::{MempoolTx, MempoolVin, MempoolVout};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick() -> WatcherConfig {
        WatcherConfig {
            settle_delay: Duration::ZERO,
            poll_interval: Duration::from_millis(5),
            timeout: Duration::from_millis(40),
        }
    }

    #[tokio::test]
    async fn test_recover_on_startup() {
        let mut chain = MockChainBackend::new();
        chain
            .expect_get_address_mempool()
            .withf(|addr: &str| addr == "tb1qwatched")
            .times(1)
            .returning(|_| {
                Ok(vec![MempoolTx {
                    txid: "txidB".to_string(),
                    vin: vec![MempoolVin {
                        txid: "txidA".to_string(),
                        vout: 0,
                    }],
                    vout: vec![
                        MempoolVout {
                            scriptpubkey_address: Some("tb1qdest".to_string()),
                            value: 9_000,
                        },
                        MempoolVout {
                            scriptpubkey_address: Some("tb1qwatched".to_string()),
                            value: 1_000,
                        },
                    ],
                }])
            });

        let watcher = ChainWatcher::new(Arc::new(chain), quick());
        let ledger = Mutex::new(UtxoLedger::new());

        let stats = watcher.recover_on_startup("tb1qwatched", &ledger).await.unwrap();
        assert_eq!(stats.spent_inputs, 1);

        let mut ledger = ledger.lock().await;
        assert!(ledger.is_spent_by_us("txidA:0").spent);
        let change = ledger.pending_change();
        assert_eq!(change.len(), 1);
        assert_eq!(change[0].key(), "txidB:1");
        assert_eq!(change[0].value, 1_000);
    }

    #[tokio::test]
    async fn test_wait_for_visibility_eventually_true() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut chain = MockChainBackend::new();
        chain.expect_tx_exists().returning(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(EsploraError::UnexpectedStatus(502))
            } else {
                Ok(n >= 2)
            }
        });

        let watcher = ChainWatcher::new(Arc::new(chain), quick());
        assert!(watcher.wait_for_visibility("abcd").await);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_for_visibility_times_out() {
        let mut chain = MockChainBackend::new();
        chain.expect_tx_exists().returning(|_| Ok(false));

        let watcher = ChainWatcher::new(Arc::new(chain), quick());
        assert!(!watcher.wait_for_visibility("abcd").await);
    }
}
