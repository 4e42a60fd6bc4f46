#![allow(dead_code)]

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{Address, Amount, CompressedPublicKey, Network, OutPoint, ScriptBuf, Transaction, TxOut, Txid, Witness};
use coinjoin_coordinator::chain::MemoryChain;
use coinjoin_coordinator::client::Coin;
use coinjoin_coordinator::config::{Config, RoundConfig};
use coinjoin_coordinator::core::transaction::{ownership_message, p2wpkh_script, sign_ownership, sign_p2wpkh_input};
use coinjoin_coordinator::crypto::{BlindSignature, Requester, UnblindedSignature};
use coinjoin_coordinator::referee::UtxoReferee;
use coinjoin_coordinator::round::BlindedOutput;
use coinjoin_coordinator::storage::Storage;
use coinjoin_coordinator::{AliceId, Coordinator, CoordinatorResult, InputProof, RoundId};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const DENOMINATION: u64 = 10_000_000;

pub fn keypair() -> (SecretKey, PublicKey) {
    let sk = SecretKey::new(&mut rand::thread_rng());
    (sk, PublicKey::from_secret_key(&Secp256k1::new(), &sk))
}

pub fn address(pk: &PublicKey) -> Address {
    Address::p2wpkh(&CompressedPublicKey(*pk), Network::Regtest)
}

pub fn new_address() -> Address {
    address(&keypair().1)
}

/// One 0.1 BTC level, 0.3% coordinator fee, fees paid to a coordinator
/// address.
pub fn config(anonymity_set: usize) -> Config {
    Config {
        coordinator_address: Some(new_address().to_string()),
        round: RoundConfig {
            mixing_levels: 1,
            anonymity_set,
            coordinator_fee_percent: 0.3,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub async fn start(config: Config) -> (Arc<Coordinator>, Arc<MemoryChain>) {
    let chain = Arc::new(MemoryChain::new(10));
    let referee = UtxoReferee::open(Storage::temporary().unwrap(), config.dos.clone()).unwrap();
    let coordinator = Coordinator::new(config, referee, chain.clone(), chain.clone()).await.unwrap();
    (coordinator, chain)
}

pub async fn open_round(coordinator: &Coordinator) -> RoundId {
    coordinator
        .get_current_input_registerable_round_or_default()
        .await
        .expect("a round in input registration")
        .round_id
}

pub async fn fund(chain: &MemoryChain, sats: u64) -> Coin {
    fund_with(chain, sats, 6, false).await
}

pub async fn fund_with(chain: &MemoryChain, sats: u64, confirmations: u32, coinbase: bool) -> Coin {
    let (secret_key, pk) = keypair();
    let outpoint = OutPoint::new(Txid::from_byte_array(rand::random()), 0);
    let value = Amount::from_sat(sats);
    chain
        .add_utxo(outpoint, TxOut { value, script_pubkey: p2wpkh_script(&pk) }, confirmations, coinbase)
        .await;
    Coin { outpoint, value, secret_key }
}

/// A wallet driving the coordinator directly, without HTTP.
pub struct Participant {
    pub coins: Vec<Coin>,
    pub output_keys: Vec<SecretKey>,
    pub outputs: Vec<ScriptBuf>,
    pub change: ScriptBuf,
    pub blinded: Vec<BlindedOutput>,
    requesters: Vec<Requester>,
    pub alice_id: Option<AliceId>,
}

impl Participant {
    /// Fetch nonces from `round_id` and blind one fresh output per level.
    pub async fn new(coordinator: &Coordinator, round_id: RoundId, coins: Vec<Coin>, levels: usize) -> Self {
        let state = coordinator.round_state(round_id).await.unwrap();
        let nonces = coordinator.nonces(round_id).await.unwrap();

        let mut p = Participant {
            coins,
            output_keys: Vec::new(),
            outputs: Vec::new(),
            change: p2wpkh_script(&keypair().1),
            blinded: Vec::new(),
            requesters: Vec::new(),
            alice_id: None,
        };
        for level in 0..levels {
            let (sk, pk) = keypair();
            let script = p2wpkh_script(&pk);
            let mut requester = Requester::new();
            let blinded = requester
                .blind(&state.mixing_levels[level].signer_pubkey, &nonces[level].nonce_pubkey, script.as_bytes())
                .unwrap();
            p.output_keys.push(sk);
            p.outputs.push(script);
            p.blinded.push(BlindedOutput { nonce_index: nonces[level].index, blinded });
            p.requesters.push(requester);
        }
        p
    }

    pub fn inputs(&self) -> Vec<InputProof> {
        let raw: Vec<[u8; 32]> = self.blinded.iter().map(|b| b.blinded.0).collect();
        let message = ownership_message(&raw);
        self.coins
            .iter()
            .map(|c| InputProof { outpoint: c.outpoint, proof: sign_ownership(&c.secret_key, &message) })
            .collect()
    }

    pub async fn register(&mut self, coordinator: &Coordinator, round_id: RoundId) -> CoordinatorResult<AliceId> {
        let id = coordinator
            .register_alice(round_id, self.inputs(), self.blinded.clone(), self.change.clone())
            .await?;
        self.alice_id = Some(id);
        Ok(id)
    }

    pub fn id(&self) -> AliceId {
        self.alice_id.expect("registered")
    }

    pub fn unblind(&self, signatures: &[BlindSignature]) -> Vec<UnblindedSignature> {
        signatures
            .iter()
            .zip(&self.requesters)
            .map(|(sig, r)| r.unblind(sig).unwrap())
            .collect()
    }

    pub fn witnesses(&self, tx: &Transaction) -> BTreeMap<usize, Witness> {
        let mut witnesses = BTreeMap::new();
        for (index, txin) in tx.input.iter().enumerate() {
            if let Some(coin) = self.coins.iter().find(|c| c.outpoint == txin.previous_output) {
                witnesses.insert(index, sign_p2wpkh_input(tx, index, coin.value, &coin.secret_key).unwrap());
            }
        }
        witnesses
    }
}

/// Register one funded single-input participant per value.
pub async fn register_all(
    coordinator: &Coordinator,
    chain: &MemoryChain,
    round_id: RoundId,
    values: &[u64],
) -> Vec<Participant> {
    let mut participants = Vec::new();
    for value in values {
        let coin = fund(chain, *value).await;
        let mut p = Participant::new(coordinator, round_id, vec![coin], 1).await;
        p.register(coordinator, round_id).await.unwrap();
        participants.push(p);
    }
    participants
}

/// Confirm every participant, post all outputs, and return the unsigned
/// coinjoin.
pub async fn advance_to_signing(coordinator: &Coordinator, round_id: RoundId, participants: &[Participant]) -> Transaction {
    let mut signatures = Vec::new();
    for p in participants {
        let (_, sigs) = coordinator.confirm_connection(round_id, &p.id()).await.unwrap();
        signatures.push(sigs.unwrap());
    }
    for (p, sigs) in participants.iter().zip(signatures) {
        for (level, sig) in p.unblind(&sigs).into_iter().enumerate() {
            coordinator
                .register_output(round_id, p.outputs[level].clone(), sig, level)
                .await
                .unwrap();
        }
    }
    coordinator.get_unsigned_coinjoin(round_id).await.unwrap()
}
