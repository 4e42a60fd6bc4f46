use crate::core::types::{AliceId, OwnershipProof, RoundId};
use crate::crypto::{BlindSignature, UnblindedSignature};
use crate::round::BlindedOutput;
use bitcoin::OutPoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Path prefix of every coordinator endpoint.
pub const API_PREFIX: &str = "/api/v1/btc/chaumiancoinjoin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofJson {
    pub pubkey: String,
    pub signature: String,
}

impl From<&OwnershipProof> for ProofJson {
    fn from(p: &OwnershipProof) -> Self {
        Self { pubkey: hex::encode(&p.pubkey), signature: hex::encode(&p.signature) }
    }
}

impl TryFrom<&ProofJson> for OwnershipProof {
    type Error = hex::FromHexError;

    fn try_from(p: &ProofJson) -> Result<Self, Self::Error> {
        Ok(Self { pubkey: hex::decode(&p.pubkey)?, signature: hex::decode(&p.signature)? })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputJson {
    pub outpoint: OutPoint,
    pub proof: ProofJson,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputsRequest {
    pub round_id: RoundId,
    pub inputs: Vec<InputJson>,
    pub blinded_output_scripts: Vec<BlindedOutput>,
    pub change_output_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputsResponse {
    pub unique_id: AliceId,
    pub round_id: RoundId,
}

/// Query string of the confirmation endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliceQuery {
    pub unique_id: String,
    pub round_id: RoundId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationResponse {
    pub current_phase: String,
    pub blind_signatures: Vec<BlindSignature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveOutput {
    pub address: String,
    pub signature: UnblindedSignature,
    pub level: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRequest {
    pub round_id: RoundId,
    pub active_output: ActiveOutput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinjoinResponse {
    /// Consensus-encoded unsigned transaction, hex.
    pub transaction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignaturesRequest {
    pub round_id: RoundId,
    /// Parsed by the handler, so a malformed id gets a JSON error body.
    pub unique_id: String,
    /// Witness stack items (hex) by input index.
    pub witnesses: BTreeMap<usize, Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
