use bitcoin::hashes::{sha256, Hash};
use bitcoin::{Amount, OutPoint, ScriptBuf, TxOut};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Rounds are numbered from 1, strictly increasing per coordinator process.
pub type RoundId = u64;

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    sha256::Hash::hash(data).to_byte_array()
}

/// Identifier handed to an Alice after successful input registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AliceId(pub Uuid);

impl AliceId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for AliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for AliceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ── Phases ──────────────────────────────────────────────────────────────────

/// Why a round ended without a broadcast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundFailure {
    /// Registration timed out before the anonymity set filled.
    NotEnoughParticipants,
    /// Some Alices never confirmed their connection.
    ConnectionConfirmationTimeout,
    /// Not every expected output was registered in time.
    OutputRegistrationTimeout,
    /// Some Alices never posted their witnesses.
    SigningTimeout,
    /// The signed transaction was refused by the broadcaster.
    BroadcastFailed(String),
    /// Administrative abort while still in input registration.
    Aborted(String),
}

impl fmt::Display for RoundFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundFailure::NotEnoughParticipants => write!(f, "not enough participants"),
            RoundFailure::ConnectionConfirmationTimeout => write!(f, "connection confirmation timed out"),
            RoundFailure::OutputRegistrationTimeout => write!(f, "output registration timed out"),
            RoundFailure::SigningTimeout => write!(f, "signing timed out"),
            RoundFailure::BroadcastFailed(e) => write!(f, "broadcast failed: {}", e),
            RoundFailure::Aborted(reason) => write!(f, "aborted: {}", reason),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    InputRegistration,
    ConnectionConfirmation,
    OutputRegistration,
    Signing,
    Succeeded,
    Failed(RoundFailure),
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed(_))
    }

    /// Wire name used by the round-state endpoint.
    pub fn name(&self) -> &'static str {
        match self {
            Phase::InputRegistration => "InputRegistration",
            Phase::ConnectionConfirmation => "ConnectionConfirmation",
            Phase::OutputRegistration => "OutputRegistration",
            Phase::Signing => "Signing",
            Phase::Succeeded => "Succeeded",
            Phase::Failed(_) => "Failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Registration payloads ───────────────────────────────────────────────────

/// ECDSA signature by the key behind a P2WPKH input, committing to the
/// blinded outputs the Alice registers with it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipProof {
    /// Compressed public key (33 bytes).
    pub pubkey: Vec<u8>,
    /// Compact ECDSA signature (64 bytes).
    pub signature: Vec<u8>,
}

/// An input as submitted by a participant, before chain lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputProof {
    pub outpoint: OutPoint,
    pub proof: OwnershipProof,
}

/// An input after chain lookup, as held by a registered Alice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredInput {
    pub outpoint: OutPoint,
    pub txout: TxOut,
    pub proof: OwnershipProof,
}

impl RegisteredInput {
    pub fn value(&self) -> Amount {
        self.txout.value
    }

    pub fn script_pubkey(&self) -> &ScriptBuf {
        &self.txout.script_pubkey
    }
}

// ── Protocol constants ──────────────────────────────────────────────────────

/// Virtual size of a P2WPKH input.
pub const P2WPKH_INPUT_VSIZE: u64 = 68;

/// Virtual size of a P2WPKH output.
pub const P2WPKH_OUTPUT_VSIZE: u64 = 31;

/// Coinbase outputs are spendable after this many confirmations.
pub const COINBASE_MATURITY: u32 = 100;

/// Finished rounds stay queryable for this long.
pub const ROUND_RETENTION_SECS: u64 = 600;

/// Unix seconds.
pub fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alice_id_round_trips_through_string() {
        let id = AliceId::random();
        let parsed: AliceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn terminal_phases() {
        assert!(Phase::Succeeded.is_terminal());
        assert!(Phase::Failed(RoundFailure::SigningTimeout).is_terminal());
        assert!(!Phase::Signing.is_terminal());
        assert!(!Phase::InputRegistration.is_terminal());
    }

    #[test]
    fn failed_phase_has_stable_wire_name() {
        let phase = Phase::Failed(RoundFailure::Aborted("config changed".into()));
        assert_eq!(phase.name(), "Failed");
        assert_eq!(phase.to_string(), "Failed");
    }
}
