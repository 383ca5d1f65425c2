use crate::types::{
    BlockId, Commit, DuplicateVoteEvidence, SignedVote, ValidatorSet, VoteType,
};
use std::collections::BTreeMap;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum VoteSetError {
    #[error("vote height {got} does not match vote set height {want}")]
    HeightMismatch { got: u64, want: u64 },
    #[error("vote round {got} does not match vote set round {want}")]
    RoundMismatch { got: u32, want: u32 },
    #[error("vote type does not match vote set type")]
    TypeMismatch,
    #[error("validator index {0} out of range")]
    IndexOutOfRange(u32),
    #[error("validator address does not match index {0}")]
    AddressMismatch(u32),
}

/// Outcome of [`VoteSet::add_vote`]. `Conflicting` carries the evidence pair;
/// the second vote still contributes to its own BlockID tally, so a +2/3
/// majority on two different blocks stays observable, which is the signature
/// of a safety violation worth slashing.
#[derive(Clone, Debug)]
pub enum AddVoteResult {
    Added,
    Duplicate,
    Conflicting(Box<DuplicateVoteEvidence>),
}

/// Tally of one (height, round, type). Votes are slotted by validator index;
/// power sums per BlockID are maintained incrementally.
#[derive(Clone, Debug)]
pub struct VoteSet {
    height: u64,
    round: u32,
    vote_type: VoteType,
    total_power: u64,
    two_thirds: u64,
    votes: Vec<Option<SignedVote>>,
    /// Extra votes from equivocating validators, kept for their tallies.
    conflicts: Vec<SignedVote>,
    by_block: BTreeMap<Option<BlockId>, u64>,
    /// Power of distinct validators that voted anything.
    power_voted: u64,
    /// First BlockID (possibly nil) to cross +2/3, if any.
    maj23: Option<Option<BlockId>>,
}

impl VoteSet {
    pub fn new(height: u64, round: u32, vote_type: VoteType, validators: &ValidatorSet) -> Self {
        Self {
            height,
            round,
            vote_type,
            total_power: validators.total_power(),
            two_thirds: validators.two_thirds_threshold(),
            votes: vec![None; validators.len()],
            conflicts: Vec::new(),
            by_block: BTreeMap::new(),
            power_voted: 0,
            maj23: None,
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    /// Insert a signature-checked vote. (H, R, type) and the validator's
    /// index/address are validated here; signatures are the caller's job.
    pub fn add_vote(
        &mut self,
        validators: &ValidatorSet,
        signed: SignedVote,
    ) -> Result<AddVoteResult, VoteSetError> {
        let vote = &signed.vote;

        if vote.height != self.height {
            return Err(VoteSetError::HeightMismatch {
                got: vote.height,
                want: self.height,
            });
        }
        if vote.round != self.round {
            return Err(VoteSetError::RoundMismatch {
                got: vote.round,
                want: self.round,
            });
        }
        if vote.vote_type != self.vote_type {
            return Err(VoteSetError::TypeMismatch);
        }

        let index = vote.validator_index;
        let validator = validators
            .by_index(index)
            .ok_or(VoteSetError::IndexOutOfRange(index))?;
        if validator.id != vote.validator {
            return Err(VoteSetError::AddressMismatch(index));
        }
        let power = validator.voting_power;

        if let Some(existing) = &self.votes[index as usize] {
            if existing.vote.block_id == vote.block_id {
                return Ok(AddVoteResult::Duplicate);
            }
            // Equivocation. The first vote keeps its slot; the second is
            // retained and its tally stands alongside the first.
            let evidence = DuplicateVoteEvidence {
                vote_a: existing.clone(),
                vote_b: signed.clone(),
            };
            self.tally(vote.block_id, power);
            self.conflicts.push(signed);
            return Ok(AddVoteResult::Conflicting(Box::new(evidence)));
        }

        self.power_voted = self.power_voted.saturating_add(power);
        self.tally(vote.block_id, power);
        self.votes[index as usize] = Some(signed);
        Ok(AddVoteResult::Added)
    }

    fn tally(&mut self, block_id: Option<BlockId>, power: u64) {
        let sum = self.by_block.entry(block_id).or_insert(0);
        *sum = sum.saturating_add(power);
        if *sum >= self.two_thirds && self.maj23.is_none() {
            self.maj23 = Some(block_id);
        }
    }

    /// `Some(Some(id))`: polka/commit for a block. `Some(None)`: for nil.
    /// `None`: no single majority yet. First majority observed wins.
    pub fn two_thirds_majority(&self) -> Option<Option<BlockId>> {
        self.maj23
    }

    /// +2/3 of power has voted, majority or not.
    pub fn has_two_thirds_any(&self) -> bool {
        self.power_voted >= self.two_thirds
    }

    pub fn power_for(&self, block_id: &Option<BlockId>) -> u64 {
        self.by_block.get(block_id).copied().unwrap_or(0)
    }

    /// Power of distinct voters, regardless of what they voted for.
    pub fn power_voted(&self) -> u64 {
        self.power_voted
    }

    pub fn total_power(&self) -> u64 {
        self.total_power
    }

    pub fn get_by_index(&self, index: u32) -> Option<&SignedVote> {
        self.votes.get(index as usize).and_then(|v| v.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &SignedVote> {
        self.votes.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.votes.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build the commit certificate once +2/3 precommits exist for a block.
    pub fn make_commit(&self) -> Option<Commit> {
        if self.vote_type != VoteType::Precommit {
            return None;
        }
        let block_id = self.maj23??;
        let votes: Vec<SignedVote> = self
            .iter()
            .filter(|sv| sv.vote.block_id == Some(block_id))
            .cloned()
            .collect();
        Some(Commit {
            height: self.height,
            round: self.round,
            block_id,
            votes,
        })
    }
}

/// Arena of vote sets for one height, keyed by (round, type). Sets are
/// created lazily as the first vote for a round arrives.
pub struct HeightVoteSet {
    height: u64,
    validators: ValidatorSet,
    sets: BTreeMap<(u32, VoteType), VoteSet>,
}

impl HeightVoteSet {
    pub fn new(height: u64, validators: ValidatorSet) -> Self {
        Self {
            height,
            validators,
            sets: BTreeMap::new(),
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn add_vote(&mut self, signed: SignedVote) -> Result<AddVoteResult, VoteSetError> {
        let key = (signed.vote.round, signed.vote.vote_type);
        let height = self.height;
        let validators = &self.validators;
        let set = self
            .sets
            .entry(key)
            .or_insert_with(|| VoteSet::new(height, key.0, key.1, validators));
        set.add_vote(validators, signed)
    }

    pub fn prevotes(&self, round: u32) -> Option<&VoteSet> {
        self.sets.get(&(round, VoteType::Prevote))
    }

    pub fn precommits(&self, round: u32) -> Option<&VoteSet> {
        self.sets.get(&(round, VoteType::Precommit))
    }

    /// Rounds that have any precommits, ascending; used by the commit scan.
    pub fn precommit_rounds(&self) -> Vec<u32> {
        self.sets
            .keys()
            .filter(|(_, t)| *t == VoteType::Precommit)
            .map(|(r, _)| *r)
            .collect()
    }

    /// Power of distinct validators voting anything (either type) at `round`.
    /// Crossing +1/3 here is the round-skip trigger.
    pub fn power_at_round(&self, round: u32) -> u64 {
        let mut power = 0u64;
        for (i, v) in self.validators.validators().iter().enumerate() {
            let voted = [VoteType::Prevote, VoteType::Precommit].iter().any(|t| {
                self.sets
                    .get(&(round, *t))
                    .and_then(|s| s.get_by_index(i as u32))
                    .is_some()
            });
            if voted {
                power = power.saturating_add(v.voting_power);
            }
        }
        power
    }

    pub fn one_third_threshold(&self) -> u64 {
        self.validators.one_third_threshold()
    }

    /// Human-readable per-round tallies for the replay console.
    pub fn describe(&self) -> Vec<String> {
        let n = self.validators.len();
        let mut rounds: Vec<u32> = self.sets.keys().map(|(r, _)| *r).collect();
        rounds.dedup();
        rounds
            .into_iter()
            .map(|r| {
                let pv = self.prevotes(r).map(|s| s.len()).unwrap_or(0);
                let pc = self.precommits(r).map(|s| s.len()).unwrap_or(0);
                format!("round {}: prevotes {}/{} precommits {}/{}", r, pv, n, pc, n)
            })
            .collect()
    }
}
