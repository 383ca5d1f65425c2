use crate::types::{BlockId, ValidatorId};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VoteType {
    Prevote,
    Precommit,
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteType::Prevote => write!(f, "prevote"),
            VoteType::Precommit => write!(f, "precommit"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub vote_type: VoteType,
    pub height: u64,
    pub round: u32,
    /// `None` votes for nothing ("nil").
    pub block_id: Option<BlockId>,
    pub timestamp_ms: u64,
    pub validator: ValidatorId,
    pub validator_index: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedVote {
    pub vote: Vote,
    #[serde(with = "serde_bytes")]
    pub signature: [u8; 64],
}

/// Two conflicting votes by one validator in the same (height, round, type).
/// Both are kept verbatim; the pair is the slashable proof.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateVoteEvidence {
    pub vote_a: SignedVote,
    pub vote_b: SignedVote,
}

impl DuplicateVoteEvidence {
    pub fn validator(&self) -> ValidatorId {
        self.vote_a.vote.validator
    }

    pub fn height(&self) -> u64 {
        self.vote_a.vote.height
    }
}
