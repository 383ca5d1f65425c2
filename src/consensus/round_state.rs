use crate::consensus::proposer::proposer_for;
use crate::consensus::vote_set::{HeightVoteSet, VoteSet};
use crate::types::{
    Block, BlockId, Commit, ConsensusParams, Hash, PartSet, Proposal, SignedProposal, ValidatorId,
    ValidatorSet,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the machine is within the current round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Step {
    NewHeight,
    NewRound,
    Propose,
    Prevote,
    PrevoteWait,
    Precommit,
    PrecommitWait,
    Commit,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::NewHeight => "new-height",
            Step::NewRound => "new-round",
            Step::Propose => "propose",
            Step::Prevote => "prevote",
            Step::PrevoteWait => "prevote-wait",
            Step::Precommit => "precommit",
            Step::PrecommitWait => "precommit-wait",
            Step::Commit => "commit",
        };
        write!(f, "{}", s)
    }
}

/// Round that carries no lock / no valid block.
pub const NO_ROUND: i32 = -1;

/// Everything the machine knows about the height in flight. Created when a
/// height is entered, torn down when its block commits.
///
/// Vote sets live in an arena keyed by (round, type) inside
/// [`HeightVoteSet`]; validators are referenced by index into the immutable
/// per-height table. No back-pointers anywhere.
pub struct RoundState {
    pub height: u64,
    pub round: u32,
    pub step: Step,
    pub start_time_ms: u64,

    pub validators: ValidatorSet,

    pub proposal: Option<SignedProposal>,
    pub proposal_block: Option<Block>,
    pub proposal_block_parts: Option<PartSet>,

    pub locked_round: i32,
    pub locked_block: Option<Block>,
    pub locked_block_parts: Option<PartSet>,

    pub valid_round: i32,
    pub valid_block: Option<Block>,
    pub valid_block_parts: Option<PartSet>,

    pub commit_round: i32,

    pub votes: HeightVoteSet,

    /// Precommits that committed the previous height; kept one extra height
    /// so late precommits can still improve the stored certificate.
    pub last_commit: Option<VoteSet>,
}

impl RoundState {
    pub fn new(height: u64, validators: ValidatorSet, start_time_ms: u64) -> Self {
        let votes = HeightVoteSet::new(height, validators.clone());
        Self {
            height,
            round: 0,
            step: Step::NewHeight,
            start_time_ms,
            validators,
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: NO_ROUND,
            locked_block: None,
            locked_block_parts: None,
            valid_round: NO_ROUND,
            valid_block: None,
            valid_block_parts: None,
            commit_round: NO_ROUND,
            votes,
            last_commit: None,
        }
    }

    pub fn proposer(&self) -> ValidatorId {
        proposer_for(&self.validators, self.height, self.round)
    }

    pub fn proposal_block_id(&self) -> Option<BlockId> {
        self.proposal.as_ref().map(|sp| sp.proposal.block_id)
    }

    /// True once the full proposal block for this round has been assembled.
    pub fn proposal_complete(&self) -> bool {
        self.proposal.is_some() && self.proposal_block.is_some()
    }

    pub fn summary(&self) -> RoundStateSummary {
        RoundStateSummary {
            height: self.height,
            round: self.round,
            step: self.step,
            proposer: self.proposer(),
            validators: self
                .validators
                .validators()
                .iter()
                .map(|v| (v.id, v.voting_power))
                .collect(),
            proposal: self.proposal.as_ref().map(|sp| sp.proposal.clone()),
            proposal_block_hash: self.proposal_block.as_ref().map(crate::types::serialization::block_hash),
            proposal_parts: self
                .proposal_block_parts
                .as_ref()
                .map(|ps| (ps.count(), ps.total())),
            locked_round: self.locked_round,
            locked_block_hash: self
                .locked_block
                .as_ref()
                .map(crate::types::serialization::block_hash),
            valid_round: self.valid_round,
            valid_block_hash: self
                .valid_block
                .as_ref()
                .map(crate::types::serialization::block_hash),
            commit_round: self.commit_round,
            vote_lines: self.votes.describe(),
        }
    }
}

/// Immutable copy of the interesting parts of [`RoundState`], handed to
/// observers (tests, RPC, the replay console) over a reply channel.
#[derive(Clone, Debug)]
pub struct RoundStateSummary {
    pub height: u64,
    pub round: u32,
    pub step: Step,
    pub proposer: ValidatorId,
    pub validators: Vec<(ValidatorId, u64)>,
    pub proposal: Option<Proposal>,
    pub proposal_block_hash: Option<Hash>,
    pub proposal_parts: Option<(u32, u32)>,
    pub locked_round: i32,
    pub locked_block_hash: Option<Hash>,
    pub valid_round: i32,
    pub valid_block_hash: Option<Hash>,
    pub commit_round: i32,
    pub vote_lines: Vec<String>,
}

impl fmt::Display for RoundStateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}/{}/{}", self.height, self.round, self.step)?;
        writeln!(f, "  proposer: {:?}", self.proposer)?;
        match &self.proposal {
            Some(p) => writeln!(
                f,
                "  proposal: {} pol_round={}",
                p.block_id, p.pol_round
            )?,
            None => writeln!(f, "  proposal: <none>")?,
        }
        writeln!(
            f,
            "  locked: round={} block={}",
            self.locked_round,
            self.locked_block_hash
                .map(|h| h.to_string())
                .unwrap_or_else(|| "<nil>".into())
        )?;
        writeln!(
            f,
            "  valid: round={} block={}",
            self.valid_round,
            self.valid_block_hash
                .map(|h| h.to_string())
                .unwrap_or_else(|| "<nil>".into())
        )?;
        for line in &self.vote_lines {
            writeln!(f, "  {}", line)?;
        }
        Ok(())
    }
}

/// The slice of chain state consensus needs between heights: who votes next,
/// what was last committed, and the active parameters. Persisted by the
/// state store and reconciled by the handshake at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainState {
    pub chain_id: String,
    /// Next height to be decided.
    pub height: u64,
    pub params: ConsensusParams,
    pub validators: ValidatorSet,
    pub last_block_id: Option<BlockId>,
    pub last_app_hash: Hash,
    pub last_commit: Option<Commit>,
}

impl ChainState {
    pub fn genesis(chain_id: impl Into<String>, validators: ValidatorSet) -> Self {
        Self {
            chain_id: chain_id.into(),
            height: 1,
            params: ConsensusParams::default(),
            validators,
            last_block_id: None,
            last_app_hash: Hash::ZERO,
            last_commit: None,
        }
    }

    /// State after committing `commit.height`. Every replica computes this
    /// from the same inputs, so the consensus core, the block executor, and
    /// handshake recovery all share this one function.
    pub fn advance(
        &self,
        commit: Commit,
        app_hash: Hash,
        validator_updates: &[crate::types::ValidatorUpdate],
        param_updates: &crate::types::ConsensusParamUpdates,
    ) -> ChainState {
        let validators = match self.validators.apply_updates(validator_updates) {
            Ok(vs) => vs,
            Err(e) => {
                tracing::error!(error = %e, "rejecting validator set update; keeping current set");
                self.validators.clone()
            }
        };
        ChainState {
            chain_id: self.chain_id.clone(),
            height: commit.height + 1,
            params: self.params.apply(param_updates),
            validators,
            last_block_id: Some(commit.block_id),
            last_app_hash: app_hash,
            last_commit: Some(commit),
        }
    }
}
