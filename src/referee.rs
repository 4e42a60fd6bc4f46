//! UTXO referee: remembers outpoints whose owners disrupted a round.
//!
//! A *noted* outpoint is still allowed to register; a *banned* one is
//! rejected until its ban expires. Offences are counted per round, so a
//! second offence reported for the same round changes nothing. Entries
//! follow the coins: when a banned outpoint is spent, every output of the
//! spending transaction inherits the entry.

use crate::config::DosConfig;
use crate::core::types::{now, RoundId};
use crate::storage::Storage;
use anyhow::Result;
use bitcoin::{OutPoint, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BannedUtxo {
    pub outpoint: OutPoint,
    pub severity: u32,
    /// Unix seconds of the latest offence.
    pub time_of_ban: u64,
    pub is_noted: bool,
    pub offenses: u32,
    pub banned_for_round: RoundId,
}

impl BannedUtxo {
    pub fn banned_until(&self, duration_hours: u64) -> u64 {
        self.time_of_ban + self.severity as u64 * duration_hours * 3600
    }

    pub fn remaining_secs(&self, duration_hours: u64, now: u64) -> u64 {
        self.banned_until(duration_hours).saturating_sub(now)
    }

    fn is_expired(&self, duration_hours: u64, now: u64) -> bool {
        self.banned_until(duration_hours) <= now
    }
}

pub struct UtxoReferee {
    bans: RwLock<HashMap<OutPoint, BannedUtxo>>,
    storage: Storage,
    config: DosConfig,
}

impl UtxoReferee {
    /// Open the referee over `storage`, dropping entries that expired
    /// while the coordinator was down.
    pub fn open(storage: Storage, config: DosConfig) -> Result<Self> {
        let now = now();
        let mut bans = HashMap::new();
        for ban in storage.load_bans()? {
            if ban.is_expired(config.duration_hours, now) {
                storage.remove_ban(&ban.outpoint)?;
            } else {
                bans.insert(ban.outpoint, ban);
            }
        }
        tracing::info!("Referee loaded {} ban entries", bans.len());
        Ok(Self { bans: RwLock::new(bans), storage, config })
    }

    pub fn config(&self) -> &DosConfig {
        &self.config
    }

    /// Live entry for `outpoint`. Noted entries are only returned with
    /// `noted_too`.
    pub async fn try_get_banned(&self, outpoint: &OutPoint, noted_too: bool) -> Option<BannedUtxo> {
        let now = now();
        let bans = self.bans.read().await;
        let ban = bans.get(outpoint)?;
        if ban.is_expired(self.config.duration_hours, now) || (ban.is_noted && !noted_too) {
            return None;
        }
        Some(ban.clone())
    }

    /// Hard-ban `outpoints` for misbehaviour in `round`.
    pub async fn ban(&self, outpoints: &[OutPoint], severity: u32, round: RoundId) -> Result<()> {
        self.punish(outpoints, severity, round, false).await
    }

    /// Note `outpoints`. Repeat offenders are converted to a full ban.
    pub async fn note(&self, outpoints: &[OutPoint], round: RoundId) -> Result<()> {
        self.punish(outpoints, self.config.severity, round, true).await
    }

    async fn punish(&self, outpoints: &[OutPoint], severity: u32, round: RoundId, noted: bool) -> Result<()> {
        let now = now();
        let mut bans = self.bans.write().await;
        for outpoint in outpoints {
            let entry = match bans.entry(*outpoint) {
                Entry::Occupied(slot) => {
                    let existing = slot.into_mut();
                    if existing.banned_for_round == round {
                        continue;
                    }
                    if existing.is_expired(self.config.duration_hours, now) {
                        *existing = fresh(*outpoint, severity, now, noted, round);
                    } else {
                        existing.severity += severity;
                        existing.offenses += 1;
                        existing.time_of_ban = now;
                        existing.banned_for_round = round;
                        if !noted || existing.offenses > self.config.note_repeat_limit {
                            existing.is_noted = false;
                        }
                    }
                    existing
                }
                Entry::Vacant(slot) => slot.insert(fresh(*outpoint, severity, now, noted, round)),
            };

            if entry.is_noted {
                tracing::info!("Noted {} for round {}", outpoint, round);
            } else {
                tracing::warn!(
                    "Banned {} for round {} (severity {}, offenses {})",
                    outpoint, round, entry.severity, entry.offenses
                );
            }
            self.storage.save_ban(entry)?;
        }
        Ok(())
    }

    /// Number of live entries: noted ones with `noted_only`, banned ones
    /// otherwise.
    pub async fn count_banned(&self, noted_only: bool) -> usize {
        let now = now();
        let bans = self.bans.read().await;
        bans.values()
            .filter(|b| !b.is_expired(self.config.duration_hours, now))
            .filter(|b| b.is_noted == noted_only)
            .count()
    }

    /// Drop expired entries.
    pub async fn refresh(&self) -> Result<usize> {
        self.refresh_at(now()).await
    }

    pub async fn refresh_at(&self, now: u64) -> Result<usize> {
        let mut bans = self.bans.write().await;
        let expired: Vec<OutPoint> = bans
            .values()
            .filter(|b| b.is_expired(self.config.duration_hours, now))
            .map(|b| b.outpoint)
            .collect();
        for outpoint in &expired {
            bans.remove(outpoint);
            self.storage.remove_ban(outpoint)?;
        }
        if !expired.is_empty() {
            tracing::debug!("Referee released {} expired entries", expired.len());
        }
        Ok(expired.len())
    }

    /// Carry entries of spent outpoints over to the outputs of `tx`.
    pub async fn process_transaction(&self, tx: &Transaction) -> Result<usize> {
        let txid = tx.compute_txid();
        let mut bans = self.bans.write().await;

        let inherited: Vec<BannedUtxo> = tx
            .input
            .iter()
            .filter_map(|input| bans.remove(&input.previous_output))
            .collect();
        for spent in &inherited {
            self.storage.remove_ban(&spent.outpoint)?;
        }

        let Some(worst) = inherited.into_iter().max_by_key(|b| (!b.is_noted, b.severity, b.time_of_ban)) else {
            return Ok(0);
        };

        for vout in 0..tx.output.len() as u32 {
            let outpoint = OutPoint::new(txid, vout);
            let ban = BannedUtxo { outpoint, ..worst.clone() };
            self.storage.save_ban(&ban)?;
            bans.insert(outpoint, ban);
        }
        tracing::info!("Ban carried from spent outpoints to {} outputs of {}", tx.output.len(), txid);
        Ok(tx.output.len())
    }

    pub async fn list(&self) -> Vec<BannedUtxo> {
        let mut list: Vec<BannedUtxo> = self.bans.read().await.values().cloned().collect();
        list.sort_by_key(|b| (b.time_of_ban, b.outpoint));
        list
    }

    pub fn flush(&self) -> Result<()> {
        self.storage.flush()
    }
}

fn fresh(outpoint: OutPoint, severity: u32, now: u64, noted: bool, round: RoundId) -> BannedUtxo {
    BannedUtxo {
        outpoint,
        severity,
        time_of_ban: now,
        is_noted: noted,
        offenses: 1,
        banned_for_round: round,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{absolute, transaction, Amount, ScriptBuf, Sequence, TxIn, TxOut, Txid, Witness};

    fn referee() -> UtxoReferee {
        UtxoReferee::open(Storage::temporary().unwrap(), DosConfig::default()).unwrap()
    }

    fn outpoint() -> OutPoint {
        OutPoint::new(Txid::from_byte_array(rand::random()), 0)
    }

    fn spend(inputs: &[OutPoint], outputs: usize) -> Transaction {
        Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: inputs
                .iter()
                .map(|op| TxIn {
                    previous_output: *op,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: (0..outputs)
                .map(|_| TxOut { value: Amount::from_sat(1_000), script_pubkey: ScriptBuf::new() })
                .collect(),
        }
    }

    #[tokio::test]
    async fn note_hides_from_strict_lookup() {
        let referee = referee();
        let op = outpoint();
        referee.note(&[op], 1).await.unwrap();

        assert!(referee.try_get_banned(&op, false).await.is_none());
        let noted = referee.try_get_banned(&op, true).await.unwrap();
        assert!(noted.is_noted);
        assert_eq!(referee.count_banned(true).await, 1);
        assert_eq!(referee.count_banned(false).await, 0);
    }

    #[tokio::test]
    async fn same_round_offence_is_idempotent() {
        let referee = referee();
        let op = outpoint();
        referee.note(&[op], 7).await.unwrap();
        referee.note(&[op], 7).await.unwrap();
        referee.ban(&[op], 1, 7).await.unwrap();

        let entry = referee.try_get_banned(&op, true).await.unwrap();
        assert_eq!(entry.offenses, 1);
        assert!(entry.is_noted);
    }

    #[tokio::test]
    async fn repeat_note_escalates_to_ban() {
        let referee = referee();
        let op = outpoint();
        referee.note(&[op], 1).await.unwrap();
        referee.note(&[op], 2).await.unwrap();

        let entry = referee.try_get_banned(&op, false).await.unwrap();
        assert!(!entry.is_noted);
        assert_eq!(entry.offenses, 2);
        assert_eq!(entry.severity, 2);
        assert_eq!(entry.banned_for_round, 2);
    }

    #[tokio::test]
    async fn ban_length_scales_with_severity() {
        let referee = referee();
        let op = outpoint();
        referee.ban(&[op], 3, 1).await.unwrap();
        let entry = referee.try_get_banned(&op, false).await.unwrap();
        assert_eq!(entry.banned_until(24), entry.time_of_ban + 3 * 24 * 3600);
    }

    #[tokio::test]
    async fn refresh_drops_expired() {
        let referee = referee();
        let op = outpoint();
        referee.ban(&[op], 1, 1).await.unwrap();

        assert_eq!(referee.refresh().await.unwrap(), 0);
        let later = now() + 24 * 3600 + 1;
        assert_eq!(referee.refresh_at(later).await.unwrap(), 1);
        assert!(referee.list().await.is_empty());
    }

    #[tokio::test]
    async fn ban_follows_spending_transaction() {
        let referee = referee();
        let banned = outpoint();
        let clean = outpoint();
        referee.ban(&[banned], 1, 4).await.unwrap();

        let tx = spend(&[banned, clean], 3);
        assert_eq!(referee.process_transaction(&tx).await.unwrap(), 3);

        assert!(referee.try_get_banned(&banned, true).await.is_none());
        for vout in 0..3 {
            let child = OutPoint::new(tx.compute_txid(), vout);
            let entry = referee.try_get_banned(&child, false).await.unwrap();
            assert_eq!(entry.banned_for_round, 4);
        }
    }

    #[tokio::test]
    async fn clean_transaction_inherits_nothing() {
        let referee = referee();
        let tx = spend(&[outpoint()], 2);
        assert_eq!(referee.process_transaction(&tx).await.unwrap(), 0);
        assert!(referee.list().await.is_empty());
    }
}
