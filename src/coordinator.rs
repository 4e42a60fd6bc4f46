//! The coordinator: owns all rounds, validates participants against the
//! chain and the referee, and drives round timers.
//!
//! Lock order is round map, then a single round, then the outpoint index.
//! Chain oracle and broadcaster calls never happen while a round is locked.

use crate::chain::{Broadcaster, ChainOracle};
use crate::config::{Config, RoundConfig};
use crate::core::transaction::{ownership_message, verify_ownership};
use crate::core::types::*;
use crate::crypto::{BlindSignature, UnblindedSignature};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::metrics::Metrics;
use crate::referee::UtxoReferee;
use crate::round::{Alice, BlindedOutput, NonceInfo, Round, RoundState, TickOutcome};
use anyhow::Result;
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, Txid, Witness};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time;

/// How often round timers are checked.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

const METRICS_INTERVAL: Duration = Duration::from_secs(30);

/// Blocks fed to the referee per tick while catching up.
const MAX_BLOCKS_PER_TICK: u64 = 10;

pub struct Coordinator {
    config: RwLock<Config>,
    rounds: RwLock<BTreeMap<RoundId, Arc<Mutex<Round>>>>,
    /// Outpoints held by a live round.
    index: Mutex<HashMap<OutPoint, RoundId>>,
    next_round_id: AtomicU64,
    unconfirmed_coinjoins: RwLock<HashSet<Txid>>,
    /// Last block whose transactions went through the referee.
    scanned_height: Mutex<Option<u64>>,
    referee: UtxoReferee,
    oracle: Arc<dyn ChainOracle>,
    broadcaster: Arc<dyn Broadcaster>,
    metrics: Metrics,
}

impl Coordinator {
    /// Build a coordinator and try to open its first round.
    pub async fn new(
        config: Config,
        referee: UtxoReferee,
        oracle: Arc<dyn ChainOracle>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let scanned_height = match oracle.best_block_height().await {
            Ok(height) => Some(height),
            Err(e) => {
                tracing::warn!("Could not read the chain tip, block scanning starts later: {}", e);
                None
            }
        };
        let coordinator = Arc::new(Self {
            config: RwLock::new(config),
            rounds: RwLock::new(BTreeMap::new()),
            index: Mutex::new(HashMap::new()),
            next_round_id: AtomicU64::new(1),
            unconfirmed_coinjoins: RwLock::new(HashSet::new()),
            scanned_height: Mutex::new(scanned_height),
            referee,
            oracle,
            broadcaster,
            metrics: Metrics::new(),
        });
        if let Err(e) = coordinator.ensure_open_round().await {
            tracing::error!("Could not open the first round: {}", e);
        }
        Ok(coordinator)
    }

    pub fn referee(&self) -> &UtxoReferee {
        &self.referee
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub async fn config(&self) -> Config {
        self.config.read().await.clone()
    }

    async fn round(&self, round_id: RoundId) -> CoordinatorResult<Arc<Mutex<Round>>> {
        self.rounds
            .read()
            .await
            .get(&round_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::round_not_found(round_id))
    }

    async fn all_rounds(&self) -> Vec<Arc<Mutex<Round>>> {
        self.rounds.read().await.values().cloned().collect()
    }

    // ── Round issuance ──────────────────────────────────────────────────

    async fn open_round_id(&self) -> Option<RoundId> {
        for round in self.all_rounds().await {
            let round = round.lock().await;
            if *round.phase() == Phase::InputRegistration {
                return Some(round.id);
            }
        }
        None
    }

    /// Open a round in input registration unless one already exists.
    pub async fn ensure_open_round(&self) -> Result<RoundId> {
        if let Some(id) = self.open_round_id().await {
            return Ok(id);
        }

        let config = self.config.read().await.clone();
        let coordinator_script = config.coordinator_script()?;
        let unconfirmed = self.unconfirmed_coinjoins.read().await.len();
        let target = config.round.adjusted_confirmation_target(unconfirmed);
        let fee_rate = self.oracle.estimate_fee_rate(target).await.map_err(|e| {
            tracing::error!("Fee estimation failed, not opening a round: {}", e);
            e
        })?;

        let mut rounds = self.rounds.write().await;
        for round in rounds.values() {
            let round = round.lock().await;
            if *round.phase() == Phase::InputRegistration {
                return Ok(round.id);
            }
        }
        let id = self.next_round_id.fetch_add(1, Ordering::SeqCst);
        let round = Round::new(id, config.round, fee_rate, target, coordinator_script);
        rounds.insert(id, Arc::new(Mutex::new(round)));
        self.metrics.inc_rounds_started();
        Ok(id)
    }

    /// State of the round currently admitting Alices, if any.
    pub async fn get_current_input_registerable_round_or_default(&self) -> Option<RoundState> {
        let id = self.open_round_id().await?;
        self.round_state(id).await.ok()
    }

    /// States of all rounds that have not finished yet.
    pub async fn round_states(&self) -> Vec<RoundState> {
        let mut states = Vec::new();
        for round in self.all_rounds().await {
            let round = round.lock().await;
            if !round.phase().is_terminal() {
                states.push(round.state());
            }
        }
        states
    }

    pub async fn round_state(&self, round_id: RoundId) -> CoordinatorResult<RoundState> {
        let round = self.round(round_id).await?;
        let state = round.lock().await.state();
        Ok(state)
    }

    pub async fn nonces(&self, round_id: RoundId) -> CoordinatorResult<Vec<NonceInfo>> {
        let round = self.round(round_id).await?;
        let mut round = round.lock().await;
        round.issue_nonces()
    }

    // ── Input registration ──────────────────────────────────────────────

    pub async fn register_alice(
        &self,
        round_id: RoundId,
        inputs: Vec<InputProof>,
        blinded_outputs: Vec<BlindedOutput>,
        change_script: ScriptBuf,
    ) -> CoordinatorResult<AliceId> {
        let result = self.try_register_alice(round_id, inputs, blinded_outputs, change_script).await;
        match &result {
            Ok(_) => self.metrics.inc_alices_registered(),
            Err(e) => {
                self.metrics.inc_registrations_rejected();
                tracing::debug!("Round {}: registration rejected: {}", round_id, e);
            }
        }
        result
    }

    async fn try_register_alice(
        &self,
        round_id: RoundId,
        inputs: Vec<InputProof>,
        blinded_outputs: Vec<BlindedOutput>,
        change_script: ScriptBuf,
    ) -> CoordinatorResult<AliceId> {
        let outpoints: Vec<OutPoint> = inputs.iter().map(|i| i.outpoint).collect();

        let round_arc = self.round(round_id).await?;
        let (fees, max_inputs) = {
            let round = round_arc.lock().await;
            if *round.phase() != Phase::InputRegistration {
                return Err(CoordinatorError::WrongPhase("Round is not running.".into()));
            }
            let replaced = round.alices_holding(&outpoints);
            round.check_blinded_outputs(&blinded_outputs, &replaced)?;
            (round.fees().clone(), round.config().maximum_input_count_per_peer)
        };

        if inputs.is_empty() {
            return Err(CoordinatorError::violation("No inputs are provided."));
        }
        let unique: HashSet<&OutPoint> = outpoints.iter().collect();
        if unique.len() != outpoints.len() {
            return Err(CoordinatorError::rejected("Cannot register an input twice."));
        }

        let mut registered = Vec::with_capacity(inputs.len());
        for input in inputs {
            let utxo = self
                .oracle
                .get_utxo(&input.outpoint)
                .await?
                .ok_or_else(|| CoordinatorError::rejected("Provided input is not unspent."))?;

            if utxo.confirmations == 0
                && !self.unconfirmed_coinjoins.read().await.contains(&input.outpoint.txid)
            {
                return Err(CoordinatorError::rejected(
                    "Provided input is neither confirmed, nor is from an unconfirmed coinjoin.",
                ));
            }
            if utxo.is_coinbase && utxo.confirmations < COINBASE_MATURITY {
                return Err(CoordinatorError::rejected("Provided input is immature."));
            }
            if !utxo.txout.script_pubkey.is_p2wpkh() {
                return Err(CoordinatorError::rejected("Provided input is not witness_v0_keyhash."));
            }
            if self.held_by_other_round(&input.outpoint, round_id).await {
                return Err(CoordinatorError::rejected("Input is already registered in another round."));
            }
            if let Some(ban) = self.referee.try_get_banned(&input.outpoint, false).await {
                let secs = ban.remaining_secs(self.referee.config().duration_hours, now());
                return Err(CoordinatorError::rejected(format!(
                    "Input is banned from participation for {} minutes: {}.",
                    secs.div_ceil(60),
                    input.outpoint
                )));
            }

            registered.push(RegisteredInput { outpoint: input.outpoint, txout: utxo.txout, proof: input.proof });
        }

        let blinded: Vec<[u8; 32]> = blinded_outputs.iter().map(|b| b.blinded.0).collect();
        let message = ownership_message(&blinded);
        if !registered.iter().all(|i| verify_ownership(i.script_pubkey(), &i.proof, &message)) {
            return Err(CoordinatorError::violation("Provided proof is invalid."));
        }

        let input_sum: Amount = registered.iter().map(|i| i.value()).sum();
        let eligible = fees.eligible_levels(input_sum, registered.len(), blinded_outputs.len());
        if eligible == 0 {
            return Err(CoordinatorError::rejected(format!(
                "Not enough inputs are provided. Fee to pay: {} BTC. Round denomination: {} BTC. Only provided: {} BTC.",
                fees.base_fee(registered.len()).to_btc(),
                fees.denominations[0].to_btc(),
                input_sum.to_btc()
            )));
        }

        if registered.len() > max_inputs {
            return Err(CoordinatorError::violation(format!(
                "Maximum {} inputs can be registered.",
                max_inputs
            )));
        }

        let alice = Alice::new(registered, blinded_outputs, change_script, eligible);
        let (alice_id, closed) = {
            let mut round = round_arc.lock().await;
            let mut index = self.index.lock().await;
            if outpoints.iter().any(|op| index.get(op).map_or(false, |r| *r != round_id)) {
                return Err(CoordinatorError::rejected("Input is already registered in another round."));
            }
            let admission = round.admit(alice)?;
            for op in &admission.replaced {
                index.remove(op);
            }
            for op in &outpoints {
                index.insert(*op, round_id);
            }
            (admission.alice_id, *round.phase() != Phase::InputRegistration)
        };

        if closed {
            if let Err(e) = self.ensure_open_round().await {
                tracing::error!("Could not open the next round: {}", e);
            }
        }
        Ok(alice_id)
    }

    async fn held_by_other_round(&self, outpoint: &OutPoint, round_id: RoundId) -> bool {
        self.index.lock().await.get(outpoint).map_or(false, |r| *r != round_id)
    }

    async fn release(&self, outpoints: &[OutPoint]) {
        if outpoints.is_empty() {
            return;
        }
        let mut index = self.index.lock().await;
        for op in outpoints {
            index.remove(op);
        }
    }

    async fn release_round(&self, round_id: RoundId) {
        self.index.lock().await.retain(|_, r| *r != round_id);
    }

    // ── Connection confirmation ─────────────────────────────────────────

    pub async fn confirm_connection(
        &self,
        round_id: RoundId,
        alice_id: &AliceId,
    ) -> CoordinatorResult<(Phase, Option<Vec<BlindSignature>>)> {
        let round = self.round(round_id).await?;
        let mut round = round.lock().await;
        round.confirm(alice_id)
    }

    /// Withdraw an Alice. Succeeds whether or not anything was removed.
    pub async fn unconfirm(&self, round_id: RoundId, alice_id: &AliceId) {
        let Ok(round) = self.round(round_id).await else {
            return;
        };
        let released = round.lock().await.unconfirm(alice_id);
        if let Some(outpoints) = released {
            self.release(&outpoints).await;
        }
    }

    // ── Output registration ─────────────────────────────────────────────

    pub async fn register_output(
        &self,
        round_id: RoundId,
        script: ScriptBuf,
        signature: UnblindedSignature,
        level: usize,
    ) -> CoordinatorResult<()> {
        let round = self.round(round_id).await?;
        let mut round = round.lock().await;
        if round.register_output(script, signature, level)? {
            self.metrics.inc_outputs_registered();
        }
        Ok(())
    }

    // ── Signing ─────────────────────────────────────────────────────────

    pub async fn get_unsigned_coinjoin(&self, round_id: RoundId) -> CoordinatorResult<Transaction> {
        let round = self.round(round_id).await?;
        let round = round.lock().await;
        round.unsigned_coinjoin().cloned().ok_or_else(|| {
            CoordinatorError::WrongPhase("Coinjoin can only be requested from Signing phase.".into())
        })
    }

    pub async fn post_signatures(
        &self,
        round_id: RoundId,
        alice_id: &AliceId,
        witnesses: BTreeMap<usize, Witness>,
    ) -> CoordinatorResult<()> {
        let round_arc = self.round(round_id).await?;
        let signed = round_arc.lock().await.post_signatures(alice_id, witnesses)?;
        let Some(tx) = signed else {
            return Ok(());
        };

        let txid = tx.compute_txid();
        let result = match self.broadcaster.broadcast(&tx).await {
            Ok(_) => {
                tracing::info!("Round {}: broadcast coinjoin {}", round_id, txid);
                self.unconfirmed_coinjoins.write().await.insert(txid);
                self.metrics.inc_rounds_succeeded();
                Ok(())
            }
            Err(e) => {
                tracing::error!("Round {}: broadcasting {} failed: {}", round_id, txid, e);
                self.metrics.inc_rounds_failed();
                Err(e.to_string())
            }
        };
        round_arc.lock().await.complete(result)?;
        self.release_round(round_id).await;
        Ok(())
    }

    /// Let the referee follow coins spent by `tx`.
    pub async fn process_transaction(&self, tx: &Transaction) -> Result<()> {
        self.referee.process_transaction(tx).await?;
        Ok(())
    }

    // ── Administration ──────────────────────────────────────────────────

    /// Use `round` for rounds opened from now on.
    pub async fn update_round_config(&self, round: RoundConfig) -> Result<()> {
        round.validate()?;
        let mut config = self.config.write().await;
        if config.round != round {
            tracing::info!("Round config updated; applies to the next round");
            config.round = round;
        }
        Ok(())
    }

    /// Fail every round still in input registration. Rounds past it are
    /// left to finish.
    pub async fn abort_all_rounds_in_input_registration(&self, reason: &str) -> usize {
        let mut aborted = 0;
        for round in self.all_rounds().await {
            let (id, result) = {
                let mut round = round.lock().await;
                (round.id, round.abort(reason))
            };
            match result {
                Ok(true) => {
                    aborted += 1;
                    self.metrics.inc_rounds_failed();
                    self.release_round(id).await;
                }
                Ok(false) => {}
                Err(e) => tracing::error!("Aborting round {}: {}", id, e),
            }
        }
        if aborted > 0 {
            tracing::info!("Aborted {} rounds in input registration: {}", aborted, reason);
        }
        aborted
    }

    // ── Timers ──────────────────────────────────────────────────────────

    /// One pass of timeouts, coinjoin confirmation tracking, ban expiry and
    /// pruning. Opens a new round when none is admitting Alices.
    pub async fn tick(&self) {
        for round in self.all_rounds().await {
            let (id, outcome, finished) = {
                let mut round = round.lock().await;
                let was_terminal = round.phase().is_terminal();
                let outcome = match round.tick() {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!("Round {} timer: {}", round.id, e);
                        continue;
                    }
                };
                (round.id, outcome, !was_terminal && round.phase().is_terminal())
            };
            self.apply(id, outcome).await;
            if finished {
                self.metrics.inc_rounds_failed();
                self.release_round(id).await;
            }
        }

        self.scan_blocks().await;
        self.refresh_unconfirmed_coinjoins().await;
        if let Err(e) = self.referee.refresh().await {
            tracing::error!("Referee refresh failed: {}", e);
        }
        self.prune().await;

        if let Err(e) = self.ensure_open_round().await {
            tracing::error!("Round issuance stopped: {}", e);
        }
    }

    async fn apply(&self, round_id: RoundId, outcome: TickOutcome) {
        self.release(&outcome.released).await;
        if !outcome.noted.is_empty() {
            self.metrics.add_outpoints_noted(outcome.noted.len());
            if let Err(e) = self.referee.note(&outcome.noted, round_id).await {
                tracing::error!("Noting outpoints of round {}: {}", round_id, e);
            }
        }
        if !outcome.banned.is_empty() {
            self.metrics.add_outpoints_banned(outcome.banned.len());
            let severity = self.referee.config().severity;
            if let Err(e) = self.referee.ban(&outcome.banned, severity, round_id).await {
                tracing::error!("Banning outpoints of round {}: {}", round_id, e);
            }
        }
    }

    /// Pass the transactions of newly mined blocks to the referee, so bans
    /// follow coins that get spent.
    async fn scan_blocks(&self) {
        let tip = match self.oracle.best_block_height().await {
            Ok(tip) => tip,
            Err(e) => {
                tracing::warn!("Reading the chain tip: {}", e);
                return;
            }
        };
        let mut scanned = self.scanned_height.lock().await;
        let Some(last) = *scanned else {
            *scanned = Some(tip);
            return;
        };

        for height in (last + 1)..=tip.min(last + MAX_BLOCKS_PER_TICK) {
            let txs = match self.oracle.block_transactions(height).await {
                Ok(Some(txs)) => txs,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Fetching block {}: {}", height, e);
                    break;
                }
            };
            for tx in &txs {
                if let Err(e) = self.process_transaction(tx).await {
                    tracing::error!("Processing {} from block {}: {}", tx.compute_txid(), height, e);
                }
            }
            tracing::debug!("Scanned block {} ({} transactions)", height, txs.len());
            *scanned = Some(height);
        }
    }

    async fn refresh_unconfirmed_coinjoins(&self) {
        let txids: Vec<Txid> = self.unconfirmed_coinjoins.read().await.iter().copied().collect();
        for txid in txids {
            match self.oracle.tx_confirmations(&txid).await {
                Ok(Some(0)) => {}
                Ok(Some(_)) => {
                    tracing::info!("Coinjoin {} confirmed", txid);
                    self.unconfirmed_coinjoins.write().await.remove(&txid);
                }
                Ok(None) => {
                    tracing::warn!("Coinjoin {} dropped from the mempool", txid);
                    self.unconfirmed_coinjoins.write().await.remove(&txid);
                }
                Err(e) => tracing::warn!("Checking coinjoin {}: {}", txid, e),
            }
        }
    }

    async fn prune(&self) {
        let mut prunable = Vec::new();
        for round in self.all_rounds().await {
            let round = round.lock().await;
            if round.is_prunable() {
                prunable.push(round.id);
            }
        }
        if prunable.is_empty() {
            return;
        }
        let mut rounds = self.rounds.write().await;
        for id in &prunable {
            rounds.remove(id);
        }
        tracing::debug!("Pruned {} finished rounds", prunable.len());
    }

    pub async fn unconfirmed_coinjoin_count(&self) -> usize {
        self.unconfirmed_coinjoins.read().await.len()
    }

    /// Drive timers until `shutdown` flips to true, then flush the referee.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut tick_interval = time::interval(TICK_INTERVAL);
        let mut metrics_interval = time::interval(METRICS_INTERVAL);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    self.tick().await;
                }
                _ = metrics_interval.tick() => {
                    self.metrics.report();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.shutdown()
    }

    pub fn shutdown(&self) -> Result<()> {
        tracing::info!("Coordinator shutting down, flushing bans");
        self.referee.flush()
    }
}
