//! A single coinjoin round and its phase state machine.
//!
//! A [`Round`] is always mutated under its coordinator's lock, so every
//! method here is synchronous and sees a consistent state. Chain lookups
//! and broadcasting happen in the coordinator, outside that lock.

pub mod alice;
pub mod level;

pub use alice::{Alice, AliceState, BlindedOutput};
pub use level::{LevelInfo, MixingLevel, NonceInfo};

use crate::config::RoundConfig;
use crate::core::transaction::{build_coinjoin, coordinator_fee, verify_p2wpkh_witness};
use crate::core::types::*;
use crate::crypto::{BlindSignature, UnblindedSignature};
use crate::error::{CoordinatorError, CoordinatorResult};
use anyhow::{anyhow, bail};
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxOut, Witness};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Unclaimed nonces a level keeps per expected peer. Past that, the
/// oldest unclaimed nonce is revoked to make room.
const NONCES_PER_PEER: usize = 16;

// ── Fees ────────────────────────────────────────────────────────────────────

/// Fee parameters fixed when the round opens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeeSchedule {
    pub fee_per_input: Amount,
    pub fee_per_output: Amount,
    pub denominations: Vec<Amount>,
    pub coordinator_fees: Vec<Amount>,
}

impl FeeSchedule {
    pub fn new(config: &RoundConfig, fee_rate_sat_vb: u64) -> Self {
        let denominations: Vec<Amount> =
            (0..config.mixing_levels).map(|i| config.level_denomination(i)).collect();
        let coordinator_fees = denominations
            .iter()
            .map(|d| coordinator_fee(*d, config.coordinator_fee_percent))
            .collect();
        Self {
            fee_per_input: Amount::from_sat(fee_rate_sat_vb * P2WPKH_INPUT_VSIZE),
            fee_per_output: Amount::from_sat(fee_rate_sat_vb * P2WPKH_OUTPUT_VSIZE),
            denominations,
            coordinator_fees,
        }
    }

    /// Everything an Alice with `input_count` inputs pays for the first
    /// `levels` levels: denominations, coordinator fees, and the network
    /// fee for its inputs, active outputs and change output.
    pub fn cost(&self, input_count: usize, levels: usize) -> Amount {
        let mut sats = self.fee_per_input.to_sat() * input_count as u64
            + self.fee_per_output.to_sat() * (levels as u64 + 1);
        for i in 0..levels {
            sats += self.denominations[i].to_sat() + self.coordinator_fees[i].to_sat();
        }
        Amount::from_sat(sats)
    }

    /// Fees (without the denomination) owed for the first level.
    pub fn base_fee(&self, input_count: usize) -> Amount {
        self.cost(input_count, 1) - self.denominations[0]
    }

    /// Number of leading levels affordable with `input_sum`, capped at
    /// `requested`.
    pub fn eligible_levels(&self, input_sum: Amount, input_count: usize, requested: usize) -> usize {
        let max = requested.min(self.denominations.len());
        (1..=max)
            .take_while(|k| self.cost(input_count, *k) <= input_sum)
            .last()
            .unwrap_or(0)
    }

    fn coordinator_fee_for(&self, levels: usize) -> Amount {
        self.coordinator_fees[..levels].iter().copied().sum()
    }
}

// ── Snapshots and outcomes ──────────────────────────────────────────────────

/// Public state of a round, served to participants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundState {
    pub round_id: RoundId,
    pub phase: String,
    pub registered_peer_count: usize,
    pub required_peer_count: usize,
    pub denomination: u64,
    pub coordinator_fee_percent: f64,
    pub registration_timeout: u64,
    pub remaining_registration_secs: u64,
    pub fee_per_inputs: u64,
    pub fee_per_outputs: u64,
    pub maximum_input_count_per_peer: usize,
    pub mixing_levels: Vec<LevelInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Result of a successful admission.
#[derive(Debug)]
pub struct Admission {
    pub alice_id: AliceId,
    /// Outpoints of Alices replaced by this registration.
    pub replaced: Vec<OutPoint>,
}

/// Side effects of a timer check the coordinator has to carry out.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub noted: Vec<OutPoint>,
    pub banned: Vec<OutPoint>,
    /// Outpoints no longer held by this round.
    pub released: Vec<OutPoint>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Bob {
    script: ScriptBuf,
    level: usize,
    signature: UnblindedSignature,
}

// ── Round ───────────────────────────────────────────────────────────────────

pub struct Round {
    pub id: RoundId,
    config: RoundConfig,
    phase: Phase,
    levels: Vec<MixingLevel>,
    fees: FeeSchedule,
    adjusted_confirmation_target: u32,
    coordinator_script: Option<ScriptBuf>,
    alices: Vec<Alice>,
    bobs: Vec<Bob>,
    unsigned_coinjoin: Option<Transaction>,
    witnesses: HashMap<usize, Witness>,
    signed_coinjoin: Option<Transaction>,
    /// Issued `(level, index)` nonces not held by any Alice, oldest first.
    unclaimed_nonces: VecDeque<(usize, u64)>,
    phase_started: Instant,
    finished_at: Option<Instant>,
}

impl Round {
    pub fn new(
        id: RoundId,
        config: RoundConfig,
        fee_rate_sat_vb: u64,
        adjusted_confirmation_target: u32,
        coordinator_script: Option<ScriptBuf>,
    ) -> Self {
        let fees = FeeSchedule::new(&config, fee_rate_sat_vb);
        let levels = fees.denominations.iter().map(|d| MixingLevel::new(*d)).collect();
        tracing::info!(
            "Round {} opened: denomination {}, {} levels, anonymity set {}, fee rate {} sat/vB",
            id, config.denomination, config.mixing_levels, config.anonymity_set, fee_rate_sat_vb
        );
        Self {
            id,
            config,
            phase: Phase::InputRegistration,
            levels,
            fees,
            adjusted_confirmation_target,
            coordinator_script,
            alices: Vec::new(),
            bobs: Vec::new(),
            unsigned_coinjoin: None,
            witnesses: HashMap::new(),
            signed_coinjoin: None,
            unclaimed_nonces: VecDeque::new(),
            phase_started: Instant::now(),
            finished_at: None,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn config(&self) -> &RoundConfig {
        &self.config
    }

    pub fn fees(&self) -> &FeeSchedule {
        &self.fees
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn adjusted_confirmation_target(&self) -> u32 {
        self.adjusted_confirmation_target
    }

    pub fn alice_count(&self) -> usize {
        self.alices.len()
    }

    pub fn alice(&self, id: &AliceId) -> Option<&Alice> {
        self.alices.iter().find(|a| a.id == *id)
    }

    /// Every outpoint currently held by an Alice of this round.
    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.alices.iter().flat_map(|a| a.outpoints()).collect()
    }

    pub fn unsigned_coinjoin(&self) -> Option<&Transaction> {
        self.unsigned_coinjoin.as_ref()
    }

    pub fn state(&self) -> RoundState {
        let remaining = match self.phase {
            Phase::InputRegistration => self
                .deadline(self.config.registration_timeout)
                .saturating_duration_since(Instant::now())
                .as_secs(),
            _ => 0,
        };
        RoundState {
            round_id: self.id,
            phase: self.phase.name().to_string(),
            registered_peer_count: self.alices.len(),
            required_peer_count: self.config.anonymity_set,
            denomination: self.config.denomination.to_sat(),
            coordinator_fee_percent: self.config.coordinator_fee_percent,
            registration_timeout: self.config.registration_timeout,
            remaining_registration_secs: remaining,
            fee_per_inputs: self.fees.fee_per_input.to_sat(),
            fee_per_outputs: self.fees.fee_per_output.to_sat(),
            maximum_input_count_per_peer: self.config.maximum_input_count_per_peer,
            mixing_levels: self.levels.iter().map(|l| l.info()).collect(),
            failure: match &self.phase {
                Phase::Failed(reason) => Some(reason.to_string()),
                _ => None,
            },
        }
    }

    // ── Phase transitions ───────────────────────────────────────────────

    fn transition(&mut self, next: Phase) -> anyhow::Result<()> {
        use Phase::*;
        let legal = match (&self.phase, &next) {
            (InputRegistration, ConnectionConfirmation) => true,
            (ConnectionConfirmation, OutputRegistration) => true,
            (OutputRegistration, Signing) => true,
            (Signing, Succeeded) => true,
            (InputRegistration | ConnectionConfirmation | OutputRegistration | Signing, Failed(_)) => true,
            _ => false,
        };
        if !legal {
            bail!("round {}: illegal transition {} -> {}", self.id, self.phase, next);
        }

        match &next {
            Failed(reason) => tracing::warn!("Round {} failed in {}: {}", self.id, self.phase, reason),
            _ => tracing::info!("Round {}: {} -> {}", self.id, self.phase, next),
        }
        self.phase = next;
        self.phase_started = Instant::now();
        if self.phase.is_terminal() {
            self.finished_at = Some(self.phase_started);
        }
        Ok(())
    }

    fn deadline(&self, timeout_secs: u64) -> Instant {
        self.phase_started + Duration::from_secs(timeout_secs)
    }

    pub fn fail(&mut self, reason: RoundFailure) -> anyhow::Result<()> {
        self.transition(Phase::Failed(reason))
    }

    /// Fail the round if it is still in input registration.
    pub fn abort(&mut self, reason: &str) -> anyhow::Result<bool> {
        if self.phase != Phase::InputRegistration {
            return Ok(false);
        }
        self.fail(RoundFailure::Aborted(reason.to_string()))?;
        Ok(true)
    }

    /// Finished rounds are kept around for a while so clients can read
    /// their final state.
    pub fn is_prunable(&self) -> bool {
        self.finished_at
            .map_or(false, |t| t.elapsed() >= Duration::from_secs(ROUND_RETENTION_SECS))
    }

    // ── Input registration ──────────────────────────────────────────────

    /// One fresh nonce per level. Nonces claimed by a registered Alice are
    /// never revoked; unclaimed ones are, oldest first, once the budget is
    /// full.
    pub fn issue_nonces(&mut self) -> CoordinatorResult<Vec<NonceInfo>> {
        if self.phase != Phase::InputRegistration {
            return Err(CoordinatorError::WrongPhase("Round is not running.".into()));
        }
        let budget = self.config.anonymity_set * NONCES_PER_PEER * self.levels.len();
        let mut revoked = 0;
        while self.unclaimed_nonces.len() + self.levels.len() > budget {
            let Some((level, index)) = self.unclaimed_nonces.pop_front() else {
                break;
            };
            if self.levels[level].signer_mut().revoke_nonce(index) {
                revoked += 1;
            }
        }
        if revoked > 0 {
            tracing::debug!("Round {}: revoked {} unclaimed nonces", self.id, revoked);
        }

        let nonces: Vec<NonceInfo> = self
            .levels
            .iter_mut()
            .enumerate()
            .map(|(level, l)| {
                let (index, nonce_pubkey) = l.signer_mut().new_nonce();
                NonceInfo { level, index, nonce_pubkey }
            })
            .collect();
        self.unclaimed_nonces.extend(nonces.iter().map(|n| (n.level, n.index)));
        Ok(nonces)
    }

    fn claim_nonces(&mut self, outputs: &[BlindedOutput]) {
        self.unclaimed_nonces
            .retain(|(level, index)| outputs.get(*level).map_or(true, |o| o.nonce_index != *index));
    }

    /// Put the nonces of a departing Alice back into the revocable pool.
    fn release_nonces(&mut self, outputs: &[BlindedOutput]) {
        self.unclaimed_nonces
            .extend(outputs.iter().enumerate().map(|(level, o)| (level, o.nonce_index)));
    }

    pub fn unclaimed_nonce_count(&self) -> usize {
        self.unclaimed_nonces.len()
    }

    /// Round-local checks on a registration request. `ignore` lists Alices
    /// about to be replaced by the same request.
    pub fn check_blinded_outputs(&self, outputs: &[BlindedOutput], ignore: &[AliceId]) -> CoordinatorResult<()> {
        if outputs.is_empty() {
            return Err(CoordinatorError::violation("No blinded output was provided."));
        }
        if outputs.len() > self.levels.len() {
            return Err(CoordinatorError::violation(format!(
                "Too many blinded output was provided: {}, maximum: {}.",
                outputs.len(),
                self.levels.len()
            )));
        }
        let unique: HashSet<_> = outputs.iter().map(|o| o.blinded).collect();
        if unique.len() != outputs.len() {
            return Err(CoordinatorError::violation("Duplicate blinded output found."));
        }

        let others = self.alices.iter().filter(|a| !ignore.contains(&a.id));
        let mut used_blinded = HashSet::new();
        let mut used_nonces = HashSet::new();
        for alice in others {
            for (level, out) in alice.blinded_outputs.iter().enumerate() {
                used_blinded.insert(out.blinded);
                used_nonces.insert((level, out.nonce_index));
            }
        }
        if outputs.iter().any(|o| used_blinded.contains(&o.blinded)) {
            return Err(CoordinatorError::AlreadyRegistered(
                "Blinded output has already been registered.".into(),
            ));
        }
        for (level, out) in outputs.iter().enumerate() {
            if !self.levels[level].signer().has_nonce(out.nonce_index)
                || used_nonces.contains(&(level, out.nonce_index))
            {
                return Err(CoordinatorError::violation("Invalid nonce provided."));
            }
        }
        Ok(())
    }

    /// Alices sharing an input with `outpoints`.
    pub fn alices_holding(&self, outpoints: &[OutPoint]) -> Vec<AliceId> {
        self.alices
            .iter()
            .filter(|a| outpoints.iter().any(|op| a.owns(op)))
            .map(|a| a.id)
            .collect()
    }

    /// Add a validated Alice. Re-checks everything that may have changed
    /// since validation started.
    pub fn admit(&mut self, alice: Alice) -> CoordinatorResult<Admission> {
        if self.phase != Phase::InputRegistration {
            return Err(CoordinatorError::WrongPhase("Round is not running.".into()));
        }
        let replaced_ids = self.alices_holding(&alice.outpoints());
        if self.alices.len() - replaced_ids.len() >= self.config.anonymity_set {
            return Err(CoordinatorError::WrongPhase("Round is full.".into()));
        }
        self.check_blinded_outputs(&alice.blinded_outputs, &replaced_ids)?;

        let mut replaced = Vec::new();
        let mut freed = Vec::new();
        self.alices.retain(|a| {
            if replaced_ids.contains(&a.id) {
                tracing::info!("Round {}: Alice {} replaced by re-registration", self.id, a.id);
                replaced.extend(a.outpoints());
                freed.push(a.blinded_outputs.clone());
                false
            } else {
                true
            }
        });
        for outputs in &freed {
            self.release_nonces(outputs);
        }
        self.claim_nonces(&alice.blinded_outputs);

        let alice_id = alice.id;
        tracing::info!(
            "Round {}: Alice {} registered {} inputs ({}), {} of {} peers",
            self.id,
            alice_id,
            alice.inputs.len(),
            alice.input_sum(),
            self.alices.len() + 1,
            self.config.anonymity_set
        );
        self.alices.push(alice);

        if self.alices.len() == self.config.anonymity_set {
            self.transition(Phase::ConnectionConfirmation)?;
        }
        Ok(Admission { alice_id, replaced })
    }

    // ── Connection confirmation ─────────────────────────────────────────

    /// Keep-alive during input registration; blind signing during
    /// connection confirmation. Returns the phase after the call and the
    /// Alice's blind signatures, once issued.
    pub fn confirm(&mut self, alice_id: &AliceId) -> CoordinatorResult<(Phase, Option<Vec<BlindSignature>>)> {
        match self.phase {
            Phase::InputRegistration => {
                let alice = self.alice_mut(alice_id)?;
                alice.last_seen = Instant::now();
                Ok((Phase::InputRegistration, None))
            }
            Phase::ConnectionConfirmation => {
                let idx = self
                    .alices
                    .iter()
                    .position(|a| a.id == *alice_id)
                    .ok_or_else(|| CoordinatorError::alice_not_found(alice_id))?;

                if let Some(sigs) = &self.alices[idx].blind_signatures {
                    return Ok((self.phase.clone(), Some(sigs.clone())));
                }

                let alice = &self.alices[idx];
                let mut sigs = Vec::with_capacity(alice.eligible_levels);
                for (level, out) in alice.blinded_outputs.iter().take(alice.eligible_levels).enumerate() {
                    let sig = self.levels[level]
                        .signer_mut()
                        .sign(out.nonce_index, &out.blinded)
                        .map_err(|e| anyhow!("blind signing for level {}: {}", level, e))?;
                    sigs.push(sig);
                }

                let alice = &mut self.alices[idx];
                alice.state = AliceState::ConnectionConfirmed;
                alice.last_seen = Instant::now();
                alice.blind_signatures = Some(sigs.clone());
                tracing::debug!("Round {}: Alice {} confirmed", self.id, alice_id);

                if self.alices.iter().all(|a| a.is_confirmed()) {
                    self.transition(Phase::OutputRegistration)?;
                }
                Ok((self.phase.clone(), Some(sigs)))
            }
            _ => Err(CoordinatorError::WrongPhase(
                "Connection confirmation can only be done from InputRegistration or ConnectionConfirmation phase."
                    .into(),
            )),
        }
    }

    /// Withdraw an Alice during input registration. Returns the released
    /// outpoints, or `None` when nothing was removed.
    pub fn unconfirm(&mut self, alice_id: &AliceId) -> Option<Vec<OutPoint>> {
        if self.phase != Phase::InputRegistration {
            return None;
        }
        let idx = self.alices.iter().position(|a| a.id == *alice_id)?;
        let alice = self.alices.remove(idx);
        self.release_nonces(&alice.blinded_outputs);
        tracing::info!("Round {}: Alice {} unconfirmed", self.id, alice_id);
        Some(alice.outpoints())
    }

    fn alice_mut(&mut self, id: &AliceId) -> CoordinatorResult<&mut Alice> {
        self.alices
            .iter_mut()
            .find(|a| a.id == *id)
            .ok_or_else(|| CoordinatorError::alice_not_found(id))
    }

    // ── Output registration ─────────────────────────────────────────────

    pub fn expected_output_count(&self) -> usize {
        self.alices.iter().map(|a| a.eligible_levels).sum()
    }

    /// Returns false for an identical retry of an output already held.
    pub fn register_output(
        &mut self,
        script: ScriptBuf,
        signature: UnblindedSignature,
        level: usize,
    ) -> CoordinatorResult<bool> {
        if self.phase != Phase::OutputRegistration {
            return Err(CoordinatorError::WrongPhase(
                "Output registration can only be done from OutputRegistration phase.".into(),
            ));
        }
        if level >= self.levels.len() {
            return Err(CoordinatorError::violation(format!("Mixing level {} does not exist.", level)));
        }
        if !script.is_p2wpkh() {
            return Err(CoordinatorError::violation("Output is not witness_v0_keyhash."));
        }

        let bob = Bob { script, level, signature };
        if self.bobs.contains(&bob) {
            return Ok(false);
        }
        if !self.levels[level].signer().verify(bob.script.as_bytes(), &bob.signature) {
            return Err(CoordinatorError::violation("Invalid signature provided."));
        }
        if self.bobs.iter().any(|b| b.script == bob.script || b.signature == bob.signature) {
            return Err(CoordinatorError::AlreadyRegistered("Output address is already registered.".into()));
        }

        self.bobs.push(bob);
        tracing::debug!(
            "Round {}: output {} of {} registered",
            self.id,
            self.bobs.len(),
            self.expected_output_count()
        );

        if self.bobs.len() == self.expected_output_count() {
            let tx = self.build_unsigned_coinjoin();
            tracing::info!(
                "Round {}: unsigned coinjoin {} with {} inputs and {} outputs",
                self.id,
                tx.compute_txid(),
                tx.input.len(),
                tx.output.len()
            );
            self.unsigned_coinjoin = Some(tx);
            self.transition(Phase::Signing)?;
        }
        Ok(true)
    }

    fn build_unsigned_coinjoin(&self) -> Transaction {
        let dust = self.config.dust_threshold;
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        let mut coordinator_total = Amount::ZERO;

        for alice in &self.alices {
            inputs.extend(alice.inputs.iter().map(|i| (i.outpoint, i.value())));

            let cost = self.fees.cost(alice.inputs.len(), alice.eligible_levels);
            coordinator_total += self.fees.coordinator_fee_for(alice.eligible_levels);
            let change = alice.input_sum() - cost;
            if change >= dust {
                outputs.push(TxOut { value: change, script_pubkey: alice.change_script.clone() });
            } else {
                coordinator_total += change;
            }
        }

        for bob in &self.bobs {
            outputs.push(TxOut {
                value: self.levels[bob.level].denomination,
                script_pubkey: bob.script.clone(),
            });
        }

        if let Some(script) = &self.coordinator_script {
            if coordinator_total >= dust {
                outputs.push(TxOut { value: coordinator_total, script_pubkey: script.clone() });
            }
        }

        build_coinjoin(inputs, outputs)
    }

    // ── Signing ─────────────────────────────────────────────────────────

    /// Positions of `alice`'s inputs in the unsigned transaction.
    fn input_indexes(tx: &Transaction, alice: &Alice) -> Vec<usize> {
        tx.input
            .iter()
            .enumerate()
            .filter(|(_, txin)| alice.owns(&txin.previous_output))
            .map(|(i, _)| i)
            .collect()
    }

    /// Record an Alice's witnesses. Returns the fully signed transaction
    /// when this completes the set.
    pub fn post_signatures(
        &mut self,
        alice_id: &AliceId,
        witnesses: BTreeMap<usize, Witness>,
    ) -> CoordinatorResult<Option<Transaction>> {
        if self.phase != Phase::Signing {
            return Err(CoordinatorError::WrongPhase(
                "Signatures can only be posted from Signing phase.".into(),
            ));
        }
        let alice = self.alice(alice_id).ok_or_else(|| CoordinatorError::alice_not_found(alice_id))?;
        let tx = self
            .unsigned_coinjoin
            .as_ref()
            .ok_or_else(|| anyhow!("round {} is signing without a transaction", self.id))?;

        let expected = Self::input_indexes(tx, alice);
        if witnesses.keys().copied().collect::<Vec<_>>() != expected {
            return Err(CoordinatorError::violation("Witnesses do not match the registered inputs."));
        }
        for (index, witness) in &witnesses {
            if self.witnesses.get(index) == Some(witness) {
                continue;
            }
            let prevout = alice
                .inputs
                .iter()
                .find(|i| i.outpoint == tx.input[*index].previous_output)
                .map(|i| &i.txout)
                .ok_or_else(|| anyhow!("input {} has no prevout", index))?;
            verify_p2wpkh_witness(tx, *index, prevout, witness)
                .map_err(|e| CoordinatorError::violation(format!("Invalid witness for input {}: {}.", index, e)))?;
        }

        self.witnesses.extend(witnesses);
        tracing::debug!("Round {}: {} of {} inputs signed", self.id, self.witnesses.len(), tx.input.len());

        if self.signed_coinjoin.is_some() || self.witnesses.len() < tx.input.len() {
            return Ok(None);
        }

        let mut signed = tx.clone();
        for (index, txin) in signed.input.iter_mut().enumerate() {
            txin.witness = self
                .witnesses
                .get(&index)
                .cloned()
                .ok_or_else(|| anyhow!("missing witness for input {}", index))?;
        }
        self.signed_coinjoin = Some(signed.clone());
        Ok(Some(signed))
    }

    /// Settle the round after the broadcast attempt.
    pub fn complete(&mut self, broadcast: Result<(), String>) -> anyhow::Result<()> {
        match broadcast {
            Ok(()) => self.transition(Phase::Succeeded),
            Err(e) => self.fail(RoundFailure::BroadcastFailed(e)),
        }
    }

    // ── Timers ──────────────────────────────────────────────────────────

    /// Apply phase timeouts and drop stale Alices.
    pub fn tick(&mut self) -> anyhow::Result<TickOutcome> {
        let now = Instant::now();
        let mut outcome = TickOutcome::default();

        match self.phase {
            Phase::InputRegistration => {
                let stale_after = Duration::from_secs(self.config.connection_confirmation_timeout);
                let id = self.id;
                let mut freed = Vec::new();
                self.alices.retain(|a| {
                    if now.saturating_duration_since(a.last_seen) >= stale_after {
                        tracing::info!("Round {}: dropping Alice {} (no keep-alive)", id, a.id);
                        outcome.released.extend(a.outpoints());
                        freed.push(a.blinded_outputs.clone());
                        false
                    } else {
                        true
                    }
                });
                for outputs in &freed {
                    self.release_nonces(outputs);
                }
                if now >= self.deadline(self.config.registration_timeout) {
                    outcome.released.extend(self.outpoints());
                    self.fail(RoundFailure::NotEnoughParticipants)?;
                }
            }
            Phase::ConnectionConfirmation => {
                if now >= self.deadline(self.config.connection_confirmation_timeout) {
                    let id = self.id;
                    let mut offenders = Vec::new();
                    self.alices.retain(|a| {
                        if a.is_confirmed() {
                            true
                        } else {
                            tracing::info!("Round {}: Alice {} did not confirm", id, a.id);
                            offenders.extend(a.outpoints());
                            false
                        }
                    });
                    if self.config.does_note_before_ban {
                        outcome.noted = offenders.clone();
                    } else {
                        outcome.banned = offenders.clone();
                    }
                    outcome.released.extend(offenders);
                    outcome.released.extend(self.outpoints());
                    self.fail(RoundFailure::ConnectionConfirmationTimeout)?;
                }
            }
            Phase::OutputRegistration => {
                if now >= self.deadline(self.config.output_registration_timeout) {
                    outcome.released.extend(self.outpoints());
                    self.fail(RoundFailure::OutputRegistrationTimeout)?;
                }
            }
            Phase::Signing => {
                if self.signed_coinjoin.is_none() && now >= self.deadline(self.config.signing_timeout) {
                    if let Some(tx) = &self.unsigned_coinjoin {
                        for alice in &self.alices {
                            let signed = Self::input_indexes(tx, alice)
                                .iter()
                                .all(|i| self.witnesses.contains_key(i));
                            if !signed {
                                tracing::info!("Round {}: Alice {} did not sign", self.id, alice.id);
                                outcome.banned.extend(alice.outpoints());
                            }
                        }
                    }
                    outcome.released.extend(self.outpoints());
                    self.fail(RoundFailure::SigningTimeout)?;
                }
            }
            Phase::Succeeded | Phase::Failed(_) => {}
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::{ownership_message, p2wpkh_script, sign_ownership, sign_p2wpkh_input};
    use crate::crypto::{BlindedMessage, Requester};
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
    use bitcoin::Txid;

    struct Participant {
        key: SecretKey,
        outpoint: OutPoint,
        value: Amount,
        output_script: ScriptBuf,
        requester: Requester,
    }

    fn key() -> (SecretKey, PublicKey) {
        let sk = SecretKey::new(&mut rand::thread_rng());
        (sk, PublicKey::from_secret_key(&Secp256k1::new(), &sk))
    }

    fn config(anonymity_set: usize) -> RoundConfig {
        RoundConfig {
            denomination: Amount::from_sat(10_000_000),
            mixing_levels: 1,
            anonymity_set,
            coordinator_fee_percent: 0.3,
            ..Default::default()
        }
    }

    fn round(anonymity_set: usize) -> Round {
        Round::new(1, config(anonymity_set), 10, 144, Some(p2wpkh_script(&key().1)))
    }

    /// Registers one single-input participant at level 0.
    fn register(round: &mut Round, value: Amount) -> (AliceId, Participant) {
        let (sk, pk) = key();
        let (_, out_pk) = key();
        let output_script = p2wpkh_script(&out_pk);

        let nonce = round.issue_nonces().unwrap().remove(0);
        let mut requester = Requester::new();
        let blinded = requester
            .blind(&round.levels[0].signer_pubkey(), &nonce.nonce_pubkey, output_script.as_bytes())
            .unwrap();

        let outpoint = OutPoint::new(Txid::from_byte_array(rand::random()), 0);
        let txout = TxOut { value, script_pubkey: p2wpkh_script(&pk) };
        let proof = sign_ownership(&sk, &ownership_message(&[blinded.0]));
        let input = RegisteredInput { outpoint, txout, proof };
        let eligible = round.fees().eligible_levels(value, 1, 1);
        let alice = Alice::new(
            vec![input],
            vec![BlindedOutput { nonce_index: nonce.index, blinded }],
            p2wpkh_script(&pk),
            eligible,
        );
        let id = round.admit(alice).unwrap().alice_id;
        (id, Participant { key: sk, outpoint, value, output_script, requester })
    }

    #[test]
    fn fee_schedule_from_rate() {
        let fees = FeeSchedule::new(&config(2), 10);
        assert_eq!(fees.fee_per_input, Amount::from_sat(680));
        assert_eq!(fees.fee_per_output, Amount::from_sat(310));
        assert_eq!(fees.coordinator_fees[0], Amount::from_sat(30_000));
        // 0.1 BTC + 30k coordinator fee + 680 input + 2 * 310 outputs
        assert_eq!(fees.cost(1, 1), Amount::from_sat(10_031_300));
        assert_eq!(fees.base_fee(1), Amount::from_sat(31_300));
    }

    #[test]
    fn eligibility_takes_affordable_prefix() {
        let mut cfg = config(2);
        cfg.mixing_levels = 3;
        let fees = FeeSchedule::new(&cfg, 1);

        assert_eq!(fees.eligible_levels(Amount::from_sat(9_000_000), 1, 3), 0);
        assert_eq!(fees.eligible_levels(Amount::from_sat(11_000_000), 1, 3), 1);
        assert_eq!(fees.eligible_levels(Amount::from_sat(31_000_000), 1, 3), 2);
        assert_eq!(fees.eligible_levels(Amount::from_sat(80_000_000), 1, 3), 3);
        // Capped by the number of blinded outputs sent.
        assert_eq!(fees.eligible_levels(Amount::from_sat(80_000_000), 1, 1), 1);
    }

    #[test]
    fn filling_anonymity_set_closes_registration() {
        let mut round = round(2);
        register(&mut round, Amount::from_sat(11_000_000));
        assert_eq!(*round.phase(), Phase::InputRegistration);
        register(&mut round, Amount::from_sat(11_000_000));
        assert_eq!(*round.phase(), Phase::ConnectionConfirmation);
        assert!(matches!(round.issue_nonces(), Err(CoordinatorError::WrongPhase(_))));
    }

    #[test]
    fn reused_nonce_is_rejected() {
        let mut round = round(3);
        register(&mut round, Amount::from_sat(11_000_000));
        let taken = round.alices[0].blinded_outputs[0];
        let other = BlindedOutput { nonce_index: taken.nonce_index, blinded: BlindedMessage([7u8; 32]) };
        let err = round.check_blinded_outputs(&[other], &[]).unwrap_err();
        assert_eq!(err.to_string(), "Invalid nonce provided.");

        let dup = round.check_blinded_outputs(&[taken], &[]).unwrap_err();
        assert_eq!(dup.to_string(), "Blinded output has already been registered.");
    }

    #[test]
    fn nonce_flood_only_revokes_unclaimed_nonces() {
        let mut round = round(2);
        let (a, _) = register(&mut round, Amount::from_sat(11_000_000));
        let early = round.issue_nonces().unwrap().remove(0);

        for _ in 0..100 {
            round.issue_nonces().unwrap();
        }
        assert_eq!(round.unclaimed_nonce_count(), 2 * NONCES_PER_PEER);
        assert!(!round.levels[0].signer().has_nonce(early.index));
        let claimed = round.alice(&a).unwrap().blinded_outputs[0].nonce_index;
        assert!(round.levels[0].signer().has_nonce(claimed));

        // A fresh nonce still registers, and the first Alice can still be
        // signed for.
        let (b, _) = register(&mut round, Amount::from_sat(11_000_000));
        assert_eq!(*round.phase(), Phase::ConnectionConfirmation);
        assert_eq!(round.confirm(&a).unwrap().1.unwrap().len(), 1);
        assert_eq!(round.confirm(&b).unwrap().1.unwrap().len(), 1);
    }

    #[test]
    fn unconfirmed_alice_returns_nonces() {
        let mut round = round(3);
        let (a, _) = register(&mut round, Amount::from_sat(11_000_000));
        assert_eq!(round.unclaimed_nonce_count(), 0);
        round.unconfirm(&a).unwrap();
        assert_eq!(round.unclaimed_nonce_count(), 1);
    }

    #[test]
    fn same_outpoint_replaces_alice() {
        let mut round = round(3);
        let (first, participant) = register(&mut round, Amount::from_sat(11_000_000));

        let nonce = round.issue_nonces().unwrap().remove(0);
        let retry = Alice::new(
            round.alice(&first).unwrap().inputs.clone(),
            vec![BlindedOutput { nonce_index: nonce.index, blinded: BlindedMessage([9u8; 32]) }],
            p2wpkh_script(&key().1),
            1,
        );
        let admission = round.admit(retry).unwrap();
        assert_eq!(admission.replaced, vec![participant.outpoint]);
        assert_eq!(round.alice_count(), 1);
        assert!(round.alice(&first).is_none());
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut round = round(2);
        assert!(round.transition(Phase::Signing).is_err());
        round.fail(RoundFailure::NotEnoughParticipants).unwrap();
        assert!(round.transition(Phase::ConnectionConfirmation).is_err());
        assert!(round.fail(RoundFailure::SigningTimeout).is_err());
    }

    #[test]
    fn confirmation_signs_once() {
        let mut round = round(2);
        let (a, _) = register(&mut round, Amount::from_sat(11_000_000));
        register(&mut round, Amount::from_sat(11_000_000));

        let (phase, first) = round.confirm(&a).unwrap();
        assert_eq!(phase, Phase::ConnectionConfirmation);
        let (_, again) = round.confirm(&a).unwrap();
        assert_eq!(first, again);
        assert_eq!(first.unwrap().len(), 1);
    }

    #[test]
    fn full_round_reaches_signing() {
        let mut round = round(2);
        let (a, pa) = register(&mut round, Amount::from_sat(11_000_000));
        let (b, pb) = register(&mut round, Amount::from_sat(12_000_000));

        let (_, sig_a) = round.confirm(&a).unwrap();
        let (phase, sig_b) = round.confirm(&b).unwrap();
        assert_eq!(phase, Phase::OutputRegistration);

        for (p, sigs) in [(&pa, sig_a), (&pb, sig_b)] {
            let sig = p.requester.unblind(&sigs.unwrap()[0]).unwrap();
            round.register_output(p.output_script.clone(), sig, 0).unwrap();
        }
        assert_eq!(*round.phase(), Phase::Signing);

        let tx = round.unsigned_coinjoin().unwrap().clone();
        assert_eq!(tx.input.len(), 2);
        // Two active outputs, two change outputs, one coordinator output.
        assert_eq!(tx.output.len(), 5);
        let active = tx.output.iter().filter(|o| o.value == Amount::from_sat(10_000_000)).count();
        assert_eq!(active, 2);
        let coordinator = tx.output.iter().find(|o| o.value == Amount::from_sat(60_000));
        assert!(coordinator.is_some());

        let mut signed = None;
        for (id, p) in [(a, &pa), (b, &pb)] {
            let index = tx.input.iter().position(|i| i.previous_output == p.outpoint).unwrap();
            let witness = sign_p2wpkh_input(&tx, index, p.value, &p.key).unwrap();
            signed = round.post_signatures(&id, BTreeMap::from([(index, witness)])).unwrap();
        }
        let signed = signed.unwrap();
        assert!(signed.input.iter().all(|i| i.witness.len() == 2));

        round.complete(Ok(())).unwrap();
        assert_eq!(*round.phase(), Phase::Succeeded);
    }

    #[test]
    fn output_with_bad_signature_is_rejected() {
        let mut round = round(2);
        let (a, _) = register(&mut round, Amount::from_sat(11_000_000));
        let (b, _) = register(&mut round, Amount::from_sat(11_000_000));
        round.confirm(&a).unwrap();
        round.confirm(&b).unwrap();

        let script = p2wpkh_script(&key().1);
        let err = round.register_output(script, UnblindedSignature([1u8; 64]), 0).unwrap_err();
        assert_eq!(err.to_string(), "Invalid signature provided.");
    }

    #[tokio::test(start_paused = true)]
    async fn stale_alice_dropped_during_registration() {
        let mut round = round(3);
        let (a, pa) = register(&mut round, Amount::from_sat(11_000_000));
        let (b, _) = register(&mut round, Amount::from_sat(11_000_000));

        tokio::time::advance(Duration::from_secs(30)).await;
        round.confirm(&b).unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        let outcome = round.tick().unwrap();
        assert_eq!(outcome.released, vec![pa.outpoint]);
        assert!(outcome.noted.is_empty() && outcome.banned.is_empty());
        assert!(round.alice(&a).is_none());
        assert!(round.alice(&b).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn connection_confirmation_timeout_notes_unconfirmed() {
        let mut round = round(2);
        let (a, _) = register(&mut round, Amount::from_sat(11_000_000));
        let (_, pb) = register(&mut round, Amount::from_sat(11_000_000));
        round.confirm(&a).unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let outcome = round.tick().unwrap();
        assert_eq!(outcome.noted, vec![pb.outpoint]);
        assert!(outcome.banned.is_empty());
        assert_eq!(*round.phase(), Phase::Failed(RoundFailure::ConnectionConfirmationTimeout));
    }
}
