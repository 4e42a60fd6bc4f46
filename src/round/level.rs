use crate::crypto::{BlindSigner, NoncePubKey, SchnorrSigner, SignerPubKey};
use bitcoin::Amount;
use serde::{Deserialize, Serialize};

/// One denomination tier of a round, with its own signing key.
pub struct MixingLevel {
    pub denomination: Amount,
    signer: Box<dyn BlindSigner>,
}

impl MixingLevel {
    pub fn new(denomination: Amount) -> Self {
        Self::with_signer(denomination, Box::new(SchnorrSigner::random()))
    }

    pub fn with_signer(denomination: Amount, signer: Box<dyn BlindSigner>) -> Self {
        Self { denomination, signer }
    }

    pub fn signer_pubkey(&self) -> SignerPubKey {
        self.signer.public_key()
    }

    pub fn signer(&self) -> &dyn BlindSigner {
        self.signer.as_ref()
    }

    pub fn signer_mut(&mut self) -> &mut dyn BlindSigner {
        self.signer.as_mut()
    }

    pub fn info(&self) -> LevelInfo {
        LevelInfo {
            denomination: self.denomination.to_sat(),
            signer_pubkey: self.signer_pubkey(),
        }
    }
}

/// Public view of a level, as published in the round state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelInfo {
    pub denomination: u64,
    pub signer_pubkey: SignerPubKey,
}

/// A nonce handed to a participant for one level.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceInfo {
    pub level: usize,
    pub index: u64,
    pub nonce_pubkey: NoncePubKey,
}
