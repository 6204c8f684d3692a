//! Transaction Signer
//!
//! Signs P2WPKH inputs of a PSBT with the engine's single key and finalizes
//! them. A failure on any input aborts the whole PSBT; nothing is partially
//! finalized.

use bitcoin::{
    ecdsa,
    hashes::Hash,
    key::{CompressedPublicKey, Secp256k1},
    psbt::Psbt,
    secp256k1::{self, Message, SecretKey},
    sighash::{EcdsaSighashType, SighashCache},
    Address, Network, PrivateKey, ScriptBuf, Transaction, Witness,
};

/// Trait for transaction signers
pub trait TxSigner: Send + Sync {
    /// Sign every input of `psbt` (each must carry a `witness_utxo`)
    fn sign_psbt(&self, psbt: &mut Psbt) -> Result<(), SignerError>;

    /// Address every input spends from and change returns to
    fn address(&self) -> &Address;

    /// Locking script of `address()`
    fn script_pubkey(&self) -> ScriptBuf {
        self.address().script_pubkey()
    }
}

/// Single-key P2WPKH signer
pub struct SingleKeySigner {
    private_key: PrivateKey,
    public_key: CompressedPublicKey,
    address: Address,
    secp: Secp256k1<secp256k1::All>,
}

impl SingleKeySigner {
    /// Create from a secret key
    pub fn new(secret_key: SecretKey, network: Network) -> Self {
        let secp = Secp256k1::new();
        let private_key = PrivateKey::new(secret_key, network);
        let public_key = CompressedPublicKey(secret_key.public_key(&secp));
        let address = Address::p2wpkh(&public_key, network);

        Self {
            private_key,
            public_key,
            address,
            secp,
        }
    }

    /// Create from secret key bytes
    pub fn from_bytes(bytes: &[u8; 32], network: Network) -> Result<Self, SignerError> {
        let secret_key =
            SecretKey::from_slice(bytes).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Ok(Self::new(secret_key, network))
    }

    /// Create from a 32-byte hex string or a WIF string
    pub fn from_key_str(key: &str, network: Network) -> Result<Self, SignerError> {
        let key = key.trim();

        if key.len() == 64 && key.chars().all(|c| c.is_ascii_hexdigit()) {
            let bytes = hex::decode(key).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
            let mut arr = [0u8; 32];
            arr.copy_from_slice(&bytes);
            return Self::from_bytes(&arr, network);
        }

        let wif = PrivateKey::from_wif(key).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        if !wif.compressed {
            return Err(SignerError::InvalidKey(
                "uncompressed keys cannot sign P2WPKH".to_string(),
            ));
        }
        Ok(Self::new(wif.inner, network))
    }

    /// Create from a seed (deterministic, testing only)
    pub fn from_seed(seed: &[u8], network: Network) -> Self {
        use sha2::{Digest, Sha256};
        let hash: [u8; 32] = Sha256::digest(seed).into();

        // A SHA-256 output is a valid key with overwhelming probability; rehash otherwise
        match SecretKey::from_slice(&hash) {
            Ok(secret_key) => Self::new(secret_key, network),
            Err(_) => Self::from_seed(&hash, network),
        }
    }

    /// Generate a new random signer
    pub fn generate(network: Network) -> Self {
        let secret_key = SecretKey::new(&mut rand::thread_rng());
        Self::new(secret_key, network)
    }

    /// WIF export (for backup)
    pub fn to_wif(&self) -> String {
        self.private_key.to_wif()
    }

    pub fn public_key(&self) -> CompressedPublicKey {
        self.public_key
    }

    fn sign_input(&self, psbt: &Psbt, index: usize, own_script: &ScriptBuf) -> Result<ecdsa::Signature, SignerError> {
        let prevout = psbt.inputs[index]
            .witness_utxo
            .as_ref()
            .ok_or(SignerError::MissingWitnessUtxo(index))?;

        if &prevout.script_pubkey != own_script {
            return Err(SignerError::ForeignInput(index));
        }

        let mut cache = SighashCache::new(&psbt.unsigned_tx);
        let sighash = cache
            .p2wpkh_signature_hash(index, own_script, prevout.value, EcdsaSighashType::All)
            .map_err(|e| SignerError::SigningFailed {
                index,
                reason: e.to_string(),
            })?;

        let msg = Message::from_digest(sighash.to_byte_array());
        let signature = self.secp.sign_ecdsa(&msg, &self.private_key.inner);

        Ok(ecdsa::Signature {
            signature,
            sighash_type: EcdsaSighashType::All,
        })
    }
}

impl TxSigner for SingleKeySigner {
    fn sign_psbt(&self, psbt: &mut Psbt) -> Result<(), SignerError> {
        let own_script = self.script_pubkey();

        // Sign everything first so a bad input leaves the PSBT untouched
        let signatures = (0..psbt.inputs.len())
            .map(|index| self.sign_input(psbt, index, &own_script))
            .collect::<Result<Vec<_>, _>>()?;

        for (input, signature) in psbt.inputs.iter_mut().zip(signatures) {
            let mut witness = Witness::new();
            witness.push(signature.to_vec());
            witness.push(self.public_key.to_bytes());

            input.final_script_witness = Some(witness);
            input.partial_sigs.clear();
            input.sighash_type = None;
            input.bip32_derivation.clear();
        }

        Ok(())
    }

    fn address(&self) -> &Address {
        &self.address
    }
}

/// Extract the finalized transaction from a fully signed PSBT
pub fn extract_signed(psbt: Psbt) -> Result<Transaction, SignerError> {
    psbt.extract_tx()
        .map_err(|e| SignerError::ExtractFailed(e.to_string()))
}

/// Signer errors
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("input {0} has no witness UTXO")]
    MissingWitnessUtxo(usize),

    #[error("input {0} is not locked to the signing key")]
    ForeignInput(usize),

    #[error("signing input {index} failed: {reason}")]
    SigningFailed { index: usize, reason: String },

    #[error("failed to extract transaction: {0}")]
    ExtractFailed(String),
}

impl SignerError {
    /// Input the failure refers to, if any
    pub fn input_index(&self) -> Option<usize> {
        match self {
            Self::MissingWitnessUtxo(index)
            | Self::ForeignInput(index)
            | Self::SigningFailed { index, .. } => Some(*index),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{
        absolute::LockTime, script::PushBytesBuf, transaction::Version, Amount, OutPoint,
        Sequence, TxIn, TxOut, Txid,
    };
    use std::str::FromStr;

    fn unsigned_psbt(prevouts: &[TxOut]) -> Psbt {
        let input = prevouts
            .iter()
            .enumerate()
            .map(|(i, _)| TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_str(&format!("{:064x}", i + 1)).unwrap(),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect();

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input,
            output: vec![TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: ScriptBuf::new_op_return(PushBytesBuf::try_from(vec![0u8; 4]).unwrap()),
            }],
        };

        let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
        for (input, prevout) in psbt.inputs.iter_mut().zip(prevouts) {
            input.witness_utxo = Some(prevout.clone());
        }
        psbt
    }

    #[test]
    fn test_signer_from_hex_and_wif() {
        let hex = "0000000000000000000000000000000000000000000000000000000000000001";
        let signer = SingleKeySigner::from_key_str(hex, Network::Testnet).unwrap();
        assert!(signer.address().to_string().starts_with("tb1q"));

        let wif = signer.to_wif();
        let again = SingleKeySigner::from_key_str(&wif, Network::Testnet).unwrap();
        assert_eq!(again.address(), signer.address());

        assert!(SingleKeySigner::from_key_str("not-a-key", Network::Testnet).is_err());
    }

    #[test]
    fn test_sign_and_finalize() {
        let signer = SingleKeySigner::from_seed(b"signer-test", Network::Regtest);
        let prevouts = vec![
            TxOut {
                value: Amount::from_sat(30_000),
                script_pubkey: signer.script_pubkey(),
            },
            TxOut {
                value: Amount::from_sat(20_000),
                script_pubkey: signer.script_pubkey(),
            },
        ];
        let mut psbt = unsigned_psbt(&prevouts);

        signer.sign_psbt(&mut psbt).unwrap();

        let tx = extract_signed(psbt).unwrap();
        for input in &tx.input {
            assert_eq!(input.witness.len(), 2);
            assert_eq!(input.witness.nth(1).unwrap(), &signer.public_key().to_bytes()[..]);
        }
    }

    #[test]
    fn test_foreign_input_aborts_without_partial_finalization() {
        let signer = SingleKeySigner::from_seed(b"signer-test", Network::Regtest);
        let other = SingleKeySigner::from_seed(b"someone-else", Network::Regtest);
        let prevouts = vec![
            TxOut {
                value: Amount::from_sat(30_000),
                script_pubkey: signer.script_pubkey(),
            },
            TxOut {
                value: Amount::from_sat(20_000),
                script_pubkey: other.script_pubkey(),
            },
        ];
        let mut psbt = unsigned_psbt(&prevouts);

        let err = signer.sign_psbt(&mut psbt).unwrap_err();
        assert!(matches!(err, SignerError::ForeignInput(1)));
        assert_eq!(err.input_index(), Some(1));
        assert!(psbt.inputs.iter().all(|i| i.final_script_witness.is_none()));
    }

    #[test]
    fn test_missing_witness_utxo() {
        let signer = SingleKeySigner::from_seed(b"signer-test", Network::Regtest);
        let mut psbt = unsigned_psbt(&[TxOut {
            value: Amount::from_sat(1),
            script_pubkey: signer.script_pubkey(),
        }]);
        psbt.inputs[0].witness_utxo = None;

        assert!(matches!(
            signer.sign_psbt(&mut psbt),
            Err(SignerError::MissingWitnessUtxo(0))
        ));
    }
}
