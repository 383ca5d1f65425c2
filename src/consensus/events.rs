use crate::consensus::round_state::{RoundStateSummary, Step};
use crate::types::{
    Block, BlockId, BlockPart, Commit, ConsensusParamUpdates, DuplicateVoteEvidence, Hash,
    SignedProposal, SignedVote, ValidatorUpdate,
};
use crossbeam_channel::Sender;

/// Opaque identifier the transport attaches to inbound messages, echoed
/// back on `PeerError` so the transport can penalize the sender.
pub type PeerId = String;

/// A scheduled (or fired) timeout, scoped to the (height, round, step) that
/// requested it. Fires for a state the machine has already left are ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutInfo {
    pub height: u64,
    pub round: u32,
    pub step: Step,
    pub duration_ms: u64,
}

/// Everything the consensus task consumes, in one merged queue.
#[derive(Clone, Debug)]
pub enum ConsensusEvent {
    /// Signed proposal from the designated proposer (or loopback).
    Proposal {
        proposal: SignedProposal,
        peer: Option<PeerId>,
    },
    /// One part of the proposal block for (height, round).
    BlockPart {
        height: u64,
        round: u32,
        part: BlockPart,
        peer: Option<PeerId>,
    },
    /// Prevote or precommit from a validator.
    Vote {
        vote: SignedVote,
        peer: Option<PeerId>,
    },
    /// A timer fired.
    Timeout(TimeoutInfo),
    /// Mempool/application answer to `RequestProposalTxs`.
    ProposalTxsReady {
        height: u64,
        round: u32,
        txs: Vec<Vec<u8>>,
    },
    /// The router finished driving the application and stores for a
    /// committed block.
    BlockFinalized {
        height: u64,
        app_hash: Hash,
        validator_updates: Vec<ValidatorUpdate>,
        param_updates: ConsensusParamUpdates,
    },
    /// Snapshot request from an observer; replied on the same queue turn so
    /// the copy is consistent.
    GetRoundState {
        reply: Sender<RoundStateSummary>,
    },
}

/// Side effects the machine asks the outside world to perform. The event
/// loop emits these; the router interprets them.
#[derive(Clone, Debug)]
pub enum ConsensusCommand {
    BroadcastProposal(SignedProposal),
    BroadcastBlockPart {
        height: u64,
        round: u32,
        part: BlockPart,
    },
    BroadcastVote(SignedVote),
    /// Ask for a mempool snapshot shaped by the application's
    /// `prepare_proposal`; answered with `ProposalTxsReady`.
    RequestProposalTxs {
        height: u64,
        round: u32,
        max_bytes: u64,
        max_txs: u32,
    },
    /// Ask peers for the parts of a block we must commit but do not hold.
    RequestBlockParts {
        height: u64,
        block_id: BlockId,
    },
    /// Drive the application lifecycle for the decided block and persist
    /// block + state; answered with `BlockFinalized`.
    FinalizeBlock {
        block: Box<Block>,
        commit: Commit,
    },
    ScheduleTimeout(TimeoutInfo),
    /// Conflicting vote pair for the evidence pool.
    Evidence(Box<DuplicateVoteEvidence>),
    /// Tell the transport a peer sent something invalid.
    PeerError {
        peer: PeerId,
        reason: String,
    },
}
