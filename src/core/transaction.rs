//! Bitcoin-side checks and construction used by the coordinator.
//!
//! Input ownership is proven with an ECDSA signature over
//! `SHA256(blinded_1 || ... || blinded_n)` by the key whose hash is the
//! P2WPKH program of the input. Witnesses posted in the signing phase are
//! checked against the BIP143 sighash of the unsigned joint transaction.

use super::types::*;
use anyhow::{anyhow, bail, Result};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{ecdsa, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    absolute, transaction, Amount, CompressedPublicKey, OutPoint, Script, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Witness,
};

/// P2WPKH scriptPubKey paying to `pubkey`.
pub fn p2wpkh_script(pubkey: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&CompressedPublicKey(*pubkey).wpubkey_hash())
}

/// Message an Alice signs with each of its inputs.
pub fn ownership_message(blinded_outputs: &[[u8; 32]]) -> [u8; 32] {
    let mut data = Vec::with_capacity(blinded_outputs.len() * 32);
    for blinded in blinded_outputs {
        data.extend_from_slice(blinded);
    }
    sha256(&data)
}

pub fn sign_ownership(secret_key: &SecretKey, message: &[u8; 32]) -> OwnershipProof {
    let secp = Secp256k1::signing_only();
    let pubkey = PublicKey::from_secret_key(&secp, secret_key);
    let sig = secp.sign_ecdsa(&Message::from_digest(*message), secret_key);
    OwnershipProof {
        pubkey: pubkey.serialize().to_vec(),
        signature: sig.serialize_compact().to_vec(),
    }
}

/// True when `proof` was made by the key that `script_pubkey` pays to.
pub fn verify_ownership(script_pubkey: &Script, proof: &OwnershipProof, message: &[u8; 32]) -> bool {
    let Ok(pubkey) = CompressedPublicKey::from_slice(&proof.pubkey) else {
        return false;
    };
    if ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash()).as_script() != script_pubkey {
        return false;
    }
    let Ok(sig) = ecdsa::Signature::from_compact(&proof.signature) else {
        return false;
    };
    let secp = Secp256k1::verification_only();
    secp.verify_ecdsa(&Message::from_digest(*message), &sig, &pubkey.0).is_ok()
}

// ── Joint transaction ───────────────────────────────────────────────────────

/// Assemble an unsigned joint transaction.
///
/// Inputs are ordered by increasing amount, then outpoint. Outputs are
/// ordered by value, then script. The ordering depends only on the set of
/// inputs and outputs, so every participant sees the same bytes.
pub fn build_coinjoin(mut inputs: Vec<(OutPoint, Amount)>, mut outputs: Vec<TxOut>) -> Transaction {
    inputs.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    outputs.sort_by(|a, b| {
        a.value
            .cmp(&b.value)
            .then_with(|| a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()))
    });

    Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: inputs
            .into_iter()
            .map(|(outpoint, _)| TxIn {
                previous_output: outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    }
}

/// Check a P2WPKH witness for input `index` of `tx` spending `prevout`.
pub fn verify_p2wpkh_witness(tx: &Transaction, index: usize, prevout: &TxOut, witness: &Witness) -> Result<()> {
    if witness.len() != 2 {
        bail!("witness must have 2 items, got {}", witness.len());
    }
    let sig = bitcoin::ecdsa::Signature::from_slice(&witness[0])
        .map_err(|e| anyhow!("malformed signature: {}", e))?;
    if sig.sighash_type != EcdsaSighashType::All {
        bail!("signature must commit with SIGHASH_ALL");
    }
    let pubkey = CompressedPublicKey::from_slice(&witness[1])
        .map_err(|e| anyhow!("malformed public key: {}", e))?;
    if ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash()) != prevout.script_pubkey {
        bail!("public key does not match the spent script");
    }

    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .p2wpkh_signature_hash(index, &prevout.script_pubkey, prevout.value, EcdsaSighashType::All)
        .map_err(|e| anyhow!("sighash: {}", e))?;
    let msg = Message::from_digest(sighash.to_byte_array());

    Secp256k1::verification_only()
        .verify_ecdsa(&msg, &sig.signature, &pubkey.0)
        .map_err(|_| anyhow!("signature does not verify"))
}

/// Produce the P2WPKH witness for input `index` of `tx`.
pub fn sign_p2wpkh_input(tx: &Transaction, index: usize, value: Amount, secret_key: &SecretKey) -> Result<Witness> {
    let secp = Secp256k1::new();
    let pubkey = PublicKey::from_secret_key(&secp, secret_key);
    let script = p2wpkh_script(&pubkey);

    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .p2wpkh_signature_hash(index, &script, value, EcdsaSighashType::All)
        .map_err(|e| anyhow!("sighash: {}", e))?;
    let signature = secp.sign_ecdsa(&Message::from_digest(sighash.to_byte_array()), secret_key);
    let sig = bitcoin::ecdsa::Signature { signature, sighash_type: EcdsaSighashType::All };

    let mut witness = Witness::new();
    witness.push(sig.serialize().to_vec());
    witness.push(pubkey.serialize());
    Ok(witness)
}

/// Coordinator fee charged for one active output of `denomination`.
pub fn coordinator_fee(denomination: Amount, fee_percent: f64) -> Amount {
    let sats = (denomination.to_sat() as f64 * fee_percent / 100.0).round();
    Amount::from_sat(sats.max(0.0) as u64)
}
