use crate::core::types::{AliceId, RegisteredInput};
use crate::crypto::{BlindSignature, BlindedMessage};
use bitcoin::{Amount, OutPoint, ScriptBuf};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Blinded output request for level `i`, where `i` is its position in
/// the Alice's list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindedOutput {
    pub nonce_index: u64,
    pub blinded: BlindedMessage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AliceState {
    InputsRegistered,
    ConnectionConfirmed,
}

/// A participant's input-side identity inside one round.
#[derive(Clone, Debug)]
pub struct Alice {
    pub id: AliceId,
    pub inputs: Vec<RegisteredInput>,
    pub blinded_outputs: Vec<BlindedOutput>,
    pub change_script: ScriptBuf,
    pub state: AliceState,
    pub last_seen: Instant,
    /// Number of leading levels this Alice can pay for.
    pub eligible_levels: usize,
    /// Issued once, on connection confirmation.
    pub blind_signatures: Option<Vec<BlindSignature>>,
}

impl Alice {
    pub fn new(
        inputs: Vec<RegisteredInput>,
        blinded_outputs: Vec<BlindedOutput>,
        change_script: ScriptBuf,
        eligible_levels: usize,
    ) -> Self {
        Self {
            id: AliceId::random(),
            inputs,
            blinded_outputs,
            change_script,
            state: AliceState::InputsRegistered,
            last_seen: Instant::now(),
            eligible_levels,
            blind_signatures: None,
        }
    }

    pub fn input_sum(&self) -> Amount {
        self.inputs.iter().map(|i| i.value()).sum()
    }

    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.inputs.iter().map(|i| i.outpoint).collect()
    }

    pub fn owns(&self, outpoint: &OutPoint) -> bool {
        self.inputs.iter().any(|i| i.outpoint == *outpoint)
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == AliceState::ConnectionConfirmed
    }
}
