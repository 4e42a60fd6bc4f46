//! Blind Schnorr signatures over Ristretto255.
//!
//! The signer holds `x` with `P = xG` and hands out one-time nonces
//! `R = kG`. A requester blinds a message with random `a, b`:
//!
//! ```text
//! R' = R + aG + bP
//! e' = H(R' || P || m)
//! e  = e' + b            (sent to the signer)
//! s  = k + e*x           (returned by the signer)
//! s' = s + a             (unblinded)
//! ```
//!
//! `(R', s')` verifies as `s'G == R' + H(R' || P || m) P` and cannot be
//! linked to the `(e, s)` the signer saw.

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::rngs::OsRng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BlindError {
    #[error("unknown or already used nonce {0}")]
    UnknownNonce(u64),
    #[error("malformed curve point")]
    InvalidPoint,
    #[error("malformed scalar")]
    InvalidScalar,
    #[error("requester already blinded a message")]
    RequesterReused,
    #[error("requester has not blinded a message yet")]
    NotBlinded,
}

// ── Wire types ──────────────────────────────────────────────────────────────

macro_rules! hex_bytes {
    ($name:ident, $len:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> anyhow::Result<Self> {
                let bytes = hex::decode(s)?;
                let arr: [u8; $len] = bytes.try_into().map_err(|b: Vec<u8>| {
                    anyhow::anyhow!("expected {} bytes, got {}", $len, b.len())
                })?;
                Ok(Self(arr))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let s = String::deserialize(d)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

hex_bytes!(SignerPubKey, 32);
hex_bytes!(NoncePubKey, 32);
hex_bytes!(BlindedMessage, 32);
hex_bytes!(BlindSignature, 32);
hex_bytes!(UnblindedSignature, 64);

impl UnblindedSignature {
    fn parts(&self) -> ([u8; 32], [u8; 32]) {
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&self.0[..32]);
        s.copy_from_slice(&self.0[32..]);
        (r, s)
    }
}

fn decompress(bytes: &[u8; 32]) -> Result<RistrettoPoint, BlindError> {
    CompressedRistretto(*bytes).decompress().ok_or(BlindError::InvalidPoint)
}

fn scalar(bytes: &[u8; 32]) -> Result<Scalar, BlindError> {
    Option::from(Scalar::from_canonical_bytes(*bytes)).ok_or(BlindError::InvalidScalar)
}

fn challenge(r: &RistrettoPoint, p: &RistrettoPoint, message: &[u8]) -> Scalar {
    let digest = Sha512::new()
        .chain_update(r.compress().as_bytes())
        .chain_update(p.compress().as_bytes())
        .chain_update(message)
        .finalize();
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&digest);
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// Check an unblinded signature on `message` under `pubkey`.
pub fn verify(pubkey: &SignerPubKey, message: &[u8], signature: &UnblindedSignature) -> bool {
    let (r_bytes, s_bytes) = signature.parts();
    let (Ok(p), Ok(r), Ok(s)) = (decompress(&pubkey.0), decompress(&r_bytes), scalar(&s_bytes)) else {
        return false;
    };
    RISTRETTO_BASEPOINT_POINT * s == r + p * challenge(&r, &p, message)
}

// ── Signer ──────────────────────────────────────────────────────────────────

/// The coordinator side of the scheme. One signer exists per mixing level
/// of a round.
pub trait BlindSigner: Send + Sync {
    fn public_key(&self) -> SignerPubKey;

    /// Issue a fresh one-time nonce, identified by its index.
    fn new_nonce(&mut self) -> (u64, NoncePubKey);

    /// True if `index` was issued and has not been consumed.
    fn has_nonce(&self, index: u64) -> bool;

    /// Forget an unconsumed nonce. Returns false if it was not outstanding.
    fn revoke_nonce(&mut self, index: u64) -> bool;

    /// Sign a blinded challenge. Consumes the nonce.
    fn sign(&mut self, nonce_index: u64, blinded: &BlindedMessage) -> Result<BlindSignature, BlindError>;

    fn verify(&self, message: &[u8], signature: &UnblindedSignature) -> bool {
        verify(&self.public_key(), message, signature)
    }
}

pub struct SchnorrSigner {
    secret: Scalar,
    public: RistrettoPoint,
    nonces: HashMap<u64, Scalar>,
    next_index: u64,
}

impl SchnorrSigner {
    pub fn random() -> Self {
        let secret = Scalar::random(&mut OsRng);
        Self {
            secret,
            public: RISTRETTO_BASEPOINT_POINT * secret,
            nonces: HashMap::new(),
            next_index: 0,
        }
    }

    pub fn outstanding_nonces(&self) -> usize {
        self.nonces.len()
    }
}

impl BlindSigner for SchnorrSigner {
    fn public_key(&self) -> SignerPubKey {
        SignerPubKey(self.public.compress().to_bytes())
    }

    fn new_nonce(&mut self) -> (u64, NoncePubKey) {
        let k = Scalar::random(&mut OsRng);
        let index = self.next_index;
        self.next_index += 1;
        self.nonces.insert(index, k);
        (index, NoncePubKey((RISTRETTO_BASEPOINT_POINT * k).compress().to_bytes()))
    }

    fn has_nonce(&self, index: u64) -> bool {
        self.nonces.contains_key(&index)
    }

    fn revoke_nonce(&mut self, index: u64) -> bool {
        self.nonces.remove(&index).is_some()
    }

    fn sign(&mut self, nonce_index: u64, blinded: &BlindedMessage) -> Result<BlindSignature, BlindError> {
        let e = scalar(&blinded.0)?;
        let k = self.nonces.remove(&nonce_index).ok_or(BlindError::UnknownNonce(nonce_index))?;
        let s = k + e * self.secret;
        Ok(BlindSignature(s.to_bytes()))
    }
}

// ── Requester ───────────────────────────────────────────────────────────────

/// Participant-side blinding state for exactly one message.
pub struct Requester {
    a: Scalar,
    b: Scalar,
    r_prime: Option<RistrettoPoint>,
}

impl Default for Requester {
    fn default() -> Self {
        Self::new()
    }
}

impl Requester {
    pub fn new() -> Self {
        Self {
            a: Scalar::random(&mut OsRng),
            b: Scalar::random(&mut OsRng),
            r_prime: None,
        }
    }

    pub fn blind(
        &mut self,
        signer: &SignerPubKey,
        nonce: &NoncePubKey,
        message: &[u8],
    ) -> Result<BlindedMessage, BlindError> {
        if self.r_prime.is_some() {
            return Err(BlindError::RequesterReused);
        }
        let p = decompress(&signer.0)?;
        let r = decompress(&nonce.0)?;

        let r_prime = r + RISTRETTO_BASEPOINT_POINT * self.a + p * self.b;
        let e = challenge(&r_prime, &p, message) + self.b;
        self.r_prime = Some(r_prime);
        Ok(BlindedMessage(e.to_bytes()))
    }

    pub fn unblind(&self, signature: &BlindSignature) -> Result<UnblindedSignature, BlindError> {
        let r_prime = self.r_prime.ok_or(BlindError::NotBlinded)?;
        let s = scalar(&signature.0)? + self.a;

        let mut out = [0u8; 64];
        out[..32].copy_from_slice(r_prime.compress().as_bytes());
        out[32..].copy_from_slice(s.as_bytes());
        Ok(UnblindedSignature(out))
    }
}
