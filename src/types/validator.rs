use crate::crypto::hash::sha256;
use crate::types::Hash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Validator address: the raw ed25519 public key bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValidatorId(pub [u8; 32]);

impl fmt::Debug for ValidatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValidatorId(")?;
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Validator {
    pub id: ValidatorId,
    pub voting_power: u64,
    /// Round-robin accumulator; not part of the set hash.
    #[serde(default)]
    pub proposer_priority: i64,
}

/// A voting-power change emitted by the application's `end_block`.
/// Power zero removes the validator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorUpdate {
    pub id: ValidatorId,
    pub voting_power: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum ValidatorSetError {
    #[error("validator set may not be empty")]
    Empty,
    #[error("total voting power may not be zero")]
    ZeroPower,
    #[error("removal of unknown validator")]
    UnknownRemoval,
}

/// Immutable per-height validator table. Validators are kept sorted by id so
/// a `u32` index is a stable reference for the life of the height.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    total_power: u64,
}

impl ValidatorSet {
    pub fn new(mut validators: Vec<Validator>) -> Result<Self, ValidatorSetError> {
        if validators.is_empty() {
            return Err(ValidatorSetError::Empty);
        }
        validators.sort_by(|a, b| a.id.cmp(&b.id));
        validators.dedup_by(|a, b| a.id == b.id);
        let mut total = 0u64;
        for v in &validators {
            total = total.saturating_add(v.voting_power);
        }
        if total == 0 {
            return Err(ValidatorSetError::ZeroPower);
        }
        Ok(Self {
            validators,
            total_power: total,
        })
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn total_power(&self) -> u64 {
        self.total_power
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn by_index(&self, index: u32) -> Option<&Validator> {
        self.validators.get(index as usize)
    }

    pub fn index_of(&self, id: &ValidatorId) -> Option<u32> {
        self.validators
            .binary_search_by(|v| v.id.cmp(id))
            .ok()
            .map(|i| i as u32)
    }

    pub fn contains(&self, id: &ValidatorId) -> bool {
        self.index_of(id).is_some()
    }

    pub fn voting_power(&self, id: &ValidatorId) -> u64 {
        self.index_of(id)
            .and_then(|i| self.by_index(i))
            .map(|v| v.voting_power)
            .unwrap_or(0)
    }

    /// Strict `> 2/3` of total power expressed as a `>=` threshold.
    pub fn two_thirds_threshold(&self) -> u64 {
        (self.total_power.saturating_mul(2) / 3).saturating_add(1)
    }

    /// Strict `> 1/3` of total power expressed as a `>=` threshold.
    pub fn one_third_threshold(&self) -> u64 {
        (self.total_power / 3).saturating_add(1)
    }

    /// Hash over (id, power) pairs in table order; pinned into block headers.
    pub fn set_hash(&self) -> Hash {
        let mut buf = Vec::with_capacity(self.validators.len() * 40);
        for v in &self.validators {
            buf.extend_from_slice(&v.id.0);
            buf.extend_from_slice(&v.voting_power.to_be_bytes());
        }
        sha256(&buf)
    }

    /// One selection step of the weighted round-robin: every accumulator
    /// grows by its validator's power, the maximum wins (ties break toward
    /// the lower address), and the winner pays the total power back.
    pub fn increment_proposer_priority(&mut self) -> ValidatorId {
        for v in &mut self.validators {
            v.proposer_priority = v.proposer_priority.saturating_add(v.voting_power as i64);
        }
        let mut best = 0usize;
        for i in 1..self.validators.len() {
            let a = &self.validators[i];
            let b = &self.validators[best];
            if a.proposer_priority > b.proposer_priority
                || (a.proposer_priority == b.proposer_priority && a.id < b.id)
            {
                best = i;
            }
        }
        let total = self.total_power as i64;
        let winner = &mut self.validators[best];
        winner.proposer_priority = winner.proposer_priority.saturating_sub(total);
        winner.id
    }

    /// Apply `end_block` updates, producing the set for the next height.
    /// Accumulators restart from zero in the new table.
    pub fn apply_updates(
        &self,
        updates: &[ValidatorUpdate],
    ) -> Result<ValidatorSet, ValidatorSetError> {
        let mut next: Vec<Validator> = self
            .validators
            .iter()
            .map(|v| Validator {
                id: v.id,
                voting_power: v.voting_power,
                proposer_priority: 0,
            })
            .collect();

        for u in updates {
            match next.iter().position(|v| v.id == u.id) {
                Some(i) if u.voting_power == 0 => {
                    next.remove(i);
                }
                Some(i) => next[i].voting_power = u.voting_power,
                None if u.voting_power == 0 => return Err(ValidatorSetError::UnknownRemoval),
                None => next.push(Validator {
                    id: u.id,
                    voting_power: u.voting_power,
                    proposer_priority: 0,
                }),
            }
        }

        ValidatorSet::new(next)
    }
}
