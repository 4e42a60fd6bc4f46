use super::CoordinatorClient;
use crate::core::transaction::{ownership_message, sign_ownership, sign_p2wpkh_input};
use crate::core::types::{AliceId, RoundId};
use crate::crypto::{Requester, UnblindedSignature};
use crate::round::BlindedOutput;
use crate::rpc::types::*;
use anyhow::{bail, Result};
use bitcoin::secp256k1::SecretKey;
use bitcoin::{Address, Amount, OutPoint, Transaction};
use std::collections::BTreeMap;

/// A P2WPKH coin the participant controls.
#[derive(Clone, Debug)]
pub struct Coin {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub secret_key: SecretKey,
}

/// What a connection confirmation returned.
#[derive(Clone, Debug)]
pub struct Confirmation {
    pub phase: String,
    /// Unblinded signatures, level by level. Empty until the round is in
    /// connection confirmation.
    pub signatures: Vec<UnblindedSignature>,
}

/// A registered Alice.
pub struct AliceClient {
    client: CoordinatorClient,
    pub round_id: RoundId,
    pub unique_id: AliceId,
    coins: Vec<Coin>,
    outputs: Vec<Address>,
    requesters: Vec<Requester>,
}

impl AliceClient {
    /// Blind one output per address (address `i` goes to level `i`) and
    /// register `coins` in `round_id`.
    pub async fn register(
        client: CoordinatorClient,
        round_id: RoundId,
        coins: Vec<Coin>,
        outputs: Vec<Address>,
        change: &Address,
    ) -> Result<Self> {
        let state = client.round_state(round_id).await?;
        if outputs.is_empty() || outputs.len() > state.mixing_levels.len() {
            bail!("round {} has {} levels, got {} outputs", round_id, state.mixing_levels.len(), outputs.len());
        }
        let nonces = client.nonces(round_id).await?;

        let mut requesters = Vec::with_capacity(outputs.len());
        let mut blinded = Vec::with_capacity(outputs.len());
        for (level, address) in outputs.iter().enumerate() {
            let Some(nonce) = nonces.iter().find(|n| n.level == level) else {
                bail!("no nonce for level {}", level);
            };
            let mut requester = Requester::new();
            let message = requester.blind(
                &state.mixing_levels[level].signer_pubkey,
                &nonce.nonce_pubkey,
                address.script_pubkey().as_bytes(),
            )?;
            requesters.push(requester);
            blinded.push(BlindedOutput { nonce_index: nonce.index, blinded: message });
        }

        let raw: Vec<[u8; 32]> = blinded.iter().map(|b| b.blinded.0).collect();
        let message = ownership_message(&raw);
        let inputs = coins
            .iter()
            .map(|c| InputJson {
                outpoint: c.outpoint,
                proof: ProofJson::from(&sign_ownership(&c.secret_key, &message)),
            })
            .collect();

        let request = InputsRequest {
            round_id,
            inputs,
            blinded_output_scripts: blinded,
            change_output_address: change.to_string(),
        };
        let response: InputsResponse = client.post_json("/inputs", &request).await?;
        tracing::debug!("Registered as Alice {} in round {}", response.unique_id, round_id);

        Ok(Self { client, round_id, unique_id: response.unique_id, coins, outputs, requesters })
    }

    fn query(&self) -> AliceQuery {
        AliceQuery { unique_id: self.unique_id.to_string(), round_id: self.round_id }
    }

    /// Output addresses, indexed by level.
    pub fn outputs(&self) -> &[Address] {
        &self.outputs
    }

    pub async fn confirm_connection(&self) -> Result<Confirmation> {
        let response: ConfirmationResponse = self.client.post_query("/confirmation", &self.query()).await?;
        if response.blind_signatures.len() > self.requesters.len() {
            bail!("coordinator sent {} signatures for {} outputs", response.blind_signatures.len(), self.requesters.len());
        }
        let signatures = response
            .blind_signatures
            .iter()
            .zip(&self.requesters)
            .map(|(sig, requester)| requester.unblind(sig))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Confirmation { phase: response.current_phase, signatures })
    }

    pub async fn unconfirm(&self) -> Result<()> {
        self.client.post_query_empty("/unconfirmation", &self.query()).await
    }

    pub async fn unsigned_coinjoin(&self) -> Result<Transaction> {
        self.client.unsigned_coinjoin(self.round_id).await
    }

    /// Witnesses for this Alice's inputs of `tx`, by input index.
    pub fn sign(&self, tx: &Transaction) -> Result<BTreeMap<usize, Vec<String>>> {
        let mut witnesses = BTreeMap::new();
        for (index, txin) in tx.input.iter().enumerate() {
            let Some(coin) = self.coins.iter().find(|c| c.outpoint == txin.previous_output) else {
                continue;
            };
            let witness = sign_p2wpkh_input(tx, index, coin.value, &coin.secret_key)?;
            witnesses.insert(index, witness.iter().map(hex::encode).collect());
        }
        if witnesses.len() != self.coins.len() {
            bail!("coinjoin spends {} of our {} coins", witnesses.len(), self.coins.len());
        }
        Ok(witnesses)
    }

    /// Check that `tx` pays each output we got a signature for, then sign
    /// and post it. `denominations` are the sats of those levels.
    pub async fn post_signatures(&self, tx: &Transaction, denominations: &[u64]) -> Result<()> {
        for (address, denomination) in self.outputs.iter().zip(denominations) {
            let script = address.script_pubkey();
            let paid = tx
                .output
                .iter()
                .any(|o| o.script_pubkey == script && o.value.to_sat() == *denomination);
            if !paid {
                bail!("coinjoin does not pay {} to {}", denomination, address);
            }
        }
        let request = SignaturesRequest {
            round_id: self.round_id,
            unique_id: self.unique_id.to_string(),
            witnesses: self.sign(tx)?,
        };
        self.client.post("/signatures", &request).await
    }
}
