//! BTC Transaction Builder
//!
//! Assembles unsigned PSBTs from selected inputs and an ordered output set.
//!
//! Output order is part of the bridge contract:
//!
//! ```text
//! plain transfer:   [recipient, change?]
//! bridge transfer:  [recipient, change-to-self?, OP_RETURN(memo)]
//! ```
//!
//! The destination protocol refunds to the address of the first input and
//! expects change back to that same address as the second output. Every
//! input here is locked to the single signing key, so that holds by
//! construction.

use bitcoin::{
    absolute::LockTime,
    psbt::Psbt,
    script::PushBytesBuf,
    transaction::Version,
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use std::str::FromStr;

use crate::error::WalletError;
use crate::wallet::types::{Utxo, MAX_MEMO_BYTES};

/// Builds unsigned PSBTs spending the engine's own P2WPKH outputs
#[derive(Debug, Clone)]
pub struct TxBuilder {
    /// Network (mainnet, testnet, signet, regtest)
    network: Network,
}

impl TxBuilder {
    /// Create a new transaction builder
    pub fn new(network: Network) -> Self {
        Self { network }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Validate a Bitcoin address for this network
    pub fn validate_address(&self, address: &str) -> Result<Address, WalletError> {
        Address::from_str(address)
            .map_err(|e| WalletError::InvalidAddress(e.to_string()))?
            .require_network(self.network)
            .map_err(|e| WalletError::InvalidAddress(e.to_string()))
    }

    /// Zero-value `OP_RETURN <memo>` output
    pub fn memo_output(memo: &[u8]) -> Result<TxOut, WalletError> {
        if memo.len() > MAX_MEMO_BYTES {
            return Err(WalletError::MemoTooLong {
                len: memo.len(),
                max: MAX_MEMO_BYTES,
            });
        }

        let push = PushBytesBuf::try_from(memo.to_vec())
            .map_err(|e| WalletError::Build(e.to_string()))?;

        Ok(TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::new_op_return(push),
        })
    }

    /// Build an unsigned PSBT: `payees`, then change to `own_script`, then `memos`.
    ///
    /// Every input gets a `witness_utxo` (own script + value) so it can be
    /// signed without the funding transaction.
    pub fn build_psbt(
        &self,
        inputs: &[Utxo],
        own_script: &ScriptBuf,
        payees: &[TxOut],
        change: Option<u64>,
        memos: &[TxOut],
    ) -> Result<UnsignedTx, WalletError> {
        if inputs.is_empty() {
            return Err(WalletError::NoUtxosFound);
        }

        let tx_inputs = inputs
            .iter()
            .map(|utxo| {
                let txid = Txid::from_str(&utxo.txid)
                    .map_err(|e| WalletError::Build(format!("invalid txid {}: {}", utxo.txid, e)))?;

                Ok(TxIn {
                    previous_output: OutPoint {
                        txid,
                        vout: utxo.vout,
                    },
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
            })
            .collect::<Result<Vec<TxIn>, WalletError>>()?;

        let mut outputs: Vec<TxOut> = payees.to_vec();

        let change_vout = change.map(|value| {
            outputs.push(TxOut {
                value: Amount::from_sat(value),
                script_pubkey: own_script.clone(),
            });
            (outputs.len() - 1) as u32
        });

        outputs.extend(memos.iter().cloned());

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: tx_inputs,
            output: outputs,
        };

        let mut psbt =
            Psbt::from_unsigned_tx(tx).map_err(|e| WalletError::Build(e.to_string()))?;

        for (psbt_input, utxo) in psbt.inputs.iter_mut().zip(inputs) {
            psbt_input.witness_utxo = Some(TxOut {
                value: Amount::from_sat(utxo.value),
                script_pubkey: own_script.clone(),
            });
        }

        Ok(UnsignedTx {
            psbt,
            inputs: inputs.to_vec(),
            change_vout,
        })
    }
}

/// Unsigned PSBT ready for signing
#[derive(Debug, Clone)]
pub struct UnsignedTx {
    pub psbt: Psbt,
    /// UTXOs being spent, in input order
    pub inputs: Vec<Utxo>,
    /// Index of the change output, if any
    pub change_vout: Option<u32>,
}

impl UnsignedTx {
    /// Change output `(vout, value)`
    pub fn change(&self) -> Option<(u32, u64)> {
        self.change_vout.map(|vout| {
            let value = self.psbt.unsigned_tx.output[vout as usize].value.to_sat();
            (vout, value)
        })
    }

    /// Transaction id (segwit txids do not change when witnesses are added)
    pub fn txid(&self) -> String {
        self.psbt.unsigned_tx.compute_txid().to_string()
    }
}
