//! UTXO Ledger
//!
//! In-process bookkeeping of what this engine has claimed or consumed but the
//! indexer may not reflect yet. Three short-lived fact types live here:
//!
//! - **Reservations**: claimed by an in-flight build (60s)
//! - **Spends**: consumed by a transaction we broadcast (10 min)
//! - **Pending change**: our own change outputs, spendable before indexing (10 min)
//!
//! Pure state, no I/O. Expiry is tracked with a min-heap so sweeps only touch
//! entries that are actually due.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use crate::wallet::types::{outpoint_key, MempoolTx, Utxo};

/// How long a reservation blocks re-selection
pub const RESERVATION_TTL: Duration = Duration::from_secs(60);

/// How long spend and change records are trusted over the indexer
pub const SPEND_TTL: Duration = Duration::from_secs(600);

/// Proof that a UTXO was consumed by a transaction we broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendRecord {
    pub spent_in_txid: String,
    pub spent_at: Instant,
    pub expires_at: Instant,
}

/// Change output paid back to us by one of our own transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub expires_at: Instant,
}

impl PendingChange {
    pub fn to_utxo(&self) -> Utxo {
        Utxo::new(self.txid.clone(), self.vout, self.value)
    }
}

/// Ledger view of a single outpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    Reserved,
    Spent { spent_in_txid: String },
}

/// Answer to `is_spent_by_us`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpentStatus {
    pub spent: bool,
    pub spent_in_txid: Option<String>,
}

/// What a startup recovery pass fed into the ledger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub transactions: usize,
    pub spent_inputs: usize,
    pub change_outputs: usize,
}

/// Live entry counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub reservations: usize,
    pub spends: usize,
    pub pending_change: usize,
}

impl std::fmt::Display for LedgerSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Ledger: {} reserved | {} spent | {} pending change",
            self.reservations, self.spends, self.pending_change
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EntryKind {
    Reservation,
    Spend,
    Change,
}

/// Reservation / spend / pending-change tables
#[derive(Debug)]
pub struct UtxoLedger {
    reservations: HashMap<String, Instant>,
    spends: HashMap<String, SpendRecord>,
    change: HashMap<String, PendingChange>,
    /// Min-heap of (expiry, kind, key); stale entries are skipped on pop
    expiries: BinaryHeap<Reverse<(Instant, EntryKind, String)>>,
    reservation_ttl: Duration,
    spend_ttl: Duration,
}

impl UtxoLedger {
    pub fn new() -> Self {
        Self::with_ttls(RESERVATION_TTL, SPEND_TTL)
    }

    pub fn with_ttls(reservation_ttl: Duration, spend_ttl: Duration) -> Self {
        Self {
            reservations: HashMap::new(),
            spends: HashMap::new(),
            change: HashMap::new(),
            expiries: BinaryHeap::new(),
            reservation_ttl,
            spend_ttl,
        }
    }

    /// Claim UTXOs for an in-flight build.
    ///
    /// Must run in the same critical section as the selection that chose them.
    pub fn reserve(&mut self, utxos: &[Utxo]) {
        self.reserve_at(utxos, Instant::now());
    }

    pub fn reserve_at(&mut self, utxos: &[Utxo], now: Instant) {
        let expires_at = now + self.reservation_ttl;
        for utxo in utxos {
            let key = utxo.key();
            self.reservations.insert(key.clone(), expires_at);
            self.expiries
                .push(Reverse((expires_at, EntryKind::Reservation, key)));
        }
    }

    /// Drop reservations after a failed build or broadcast
    pub fn release(&mut self, utxos: &[Utxo]) {
        for utxo in utxos {
            self.reservations.remove(&utxo.key());
        }
    }

    pub fn is_available(&mut self, utxo: &Utxo) -> bool {
        self.is_available_at(utxo, Instant::now())
    }

    pub fn is_available_at(&mut self, utxo: &Utxo, now: Instant) -> bool {
        self.availability_at(&utxo.key(), now) == Availability::Available
    }

    pub fn availability(&mut self, key: &str) -> Availability {
        self.availability_at(key, Instant::now())
    }

    /// Spends win over reservations; expired entries are deleted on the way.
    pub fn availability_at(&mut self, key: &str, now: Instant) -> Availability {
        if let Some(record) = self.spends.get(key) {
            if now > record.expires_at {
                self.spends.remove(key);
            } else {
                return Availability::Spent {
                    spent_in_txid: record.spent_in_txid.clone(),
                };
            }
        }

        if let Some(&expires_at) = self.reservations.get(key) {
            if now > expires_at {
                self.reservations.remove(key);
            } else {
                return Availability::Reserved;
            }
        }

        Availability::Available
    }

    /// Replace reservations with spend records after a successful broadcast
    pub fn record_spent(&mut self, utxos: &[Utxo], txid: &str) {
        self.record_spent_at(utxos, txid, Instant::now());
    }

    pub fn record_spent_at(&mut self, utxos: &[Utxo], txid: &str, now: Instant) {
        for utxo in utxos {
            self.insert_spend(utxo.key(), txid, now);
        }
    }

    pub fn record_change(&mut self, txid: &str, vout: u32, value: u64) {
        self.record_change_at(txid, vout, value, Instant::now());
    }

    pub fn record_change_at(&mut self, txid: &str, vout: u32, value: u64, now: Instant) {
        let key = outpoint_key(txid, vout);
        let expires_at = now + self.spend_ttl;
        self.change.insert(
            key.clone(),
            PendingChange {
                txid: txid.to_string(),
                vout,
                value,
                expires_at,
            },
        );
        self.expiries.push(Reverse((expires_at, EntryKind::Change, key)));
    }

    pub fn is_spent_by_us(&mut self, key: &str) -> SpentStatus {
        self.is_spent_by_us_at(key, Instant::now())
    }

    pub fn is_spent_by_us_at(&mut self, key: &str, now: Instant) -> SpentStatus {
        match self.spends.get(key) {
            Some(record) if now > record.expires_at => {
                self.spends.remove(key);
                SpentStatus::default()
            }
            Some(record) => SpentStatus {
                spent: true,
                spent_in_txid: Some(record.spent_in_txid.clone()),
            },
            None => SpentStatus::default(),
        }
    }

    /// Live pending change, usable as selection candidates
    pub fn pending_change(&mut self) -> Vec<Utxo> {
        self.pending_change_at(Instant::now())
    }

    pub fn pending_change_at(&mut self, now: Instant) -> Vec<Utxo> {
        self.sweep_expired_at(now);
        let mut utxos: Vec<Utxo> = self.change.values().map(PendingChange::to_utxo).collect();
        utxos.sort_by(|a, b| a.key().cmp(&b.key()));
        utxos
    }

    pub fn sweep_expired(&mut self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    /// Remove every entry whose expiry has passed. Returns how many were dropped.
    pub fn sweep_expired_at(&mut self, now: Instant) -> usize {
        let mut removed = 0;

        while let Some(Reverse((expires_at, _, _))) = self.expiries.peek() {
            if *expires_at >= now {
                break;
            }

            let Some(Reverse((expires_at, kind, key))) = self.expiries.pop() else {
                break;
            };

            // A heap entry is only authoritative if the table still holds the
            // same expiry; re-inserted or released keys leave stale entries.
            let live = match kind {
                EntryKind::Reservation => self.reservations.get(&key) == Some(&expires_at),
                EntryKind::Spend => self
                    .spends
                    .get(&key)
                    .is_some_and(|s| s.expires_at == expires_at),
                EntryKind::Change => self
                    .change
                    .get(&key)
                    .is_some_and(|c| c.expires_at == expires_at),
            };

            if live {
                match kind {
                    EntryKind::Reservation => self.reservations.remove(&key),
                    EntryKind::Spend => self.spends.remove(&key).map(|r| r.expires_at),
                    EntryKind::Change => self.change.remove(&key).map(|c| c.expires_at),
                };
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::debug!(target: "xbridge_wallet::ledger", removed, "swept expired ledger entries");
        }

        removed
    }

    /// Rehydrate from the address's unconfirmed transactions after a restart.
    ///
    /// Every input they consume becomes a spend attributed to that transaction;
    /// every output paying `address` becomes pending change.
    pub fn recover_from_network(&mut self, address: &str, pending: &[MempoolTx]) -> RecoveryStats {
        self.recover_from_network_at(address, pending, Instant::now())
    }

    pub fn recover_from_network_at(
        &mut self,
        address: &str,
        pending: &[MempoolTx],
        now: Instant,
    ) -> RecoveryStats {
        let mut stats = RecoveryStats::default();

        for tx in pending {
            stats.transactions += 1;

            for vin in &tx.vin {
                self.insert_spend(outpoint_key(&vin.txid, vin.vout), &tx.txid, now);
                stats.spent_inputs += 1;
            }

            for (index, vout) in tx.vout.iter().enumerate() {
                if vout.scriptpubkey_address.as_deref() == Some(address) {
                    self.record_change_at(&tx.txid, index as u32, vout.value, now);
                    stats.change_outputs += 1;
                }
            }
        }

        stats
    }

    pub fn snapshot(&mut self) -> LedgerSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&mut self, now: Instant) -> LedgerSnapshot {
        self.sweep_expired_at(now);
        LedgerSnapshot {
            reservations: self.reservations.len(),
            spends: self.spends.len(),
            pending_change: self.change.len(),
        }
    }

    fn insert_spend(&mut self, key: String, txid: &str, now: Instant) {
        let expires_at = now + self.spend_ttl;
        self.reservations.remove(&key);
        self.spends.insert(
            key.clone(),
            SpendRecord {
                spent_in_txid: txid.to_string(),
                spent_at: now,
                expires_at,
            },
        );
        self.expiries.push(Reverse((expires_at, EntryKind::Spend, key)));
    }
}

impl Default for UtxoLedger {
    fn default() -> Self {
        Self::new()
    }
}
