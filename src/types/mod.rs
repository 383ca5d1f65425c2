pub mod block;
pub mod hash;
pub mod part_set;
pub mod proposal;
pub mod serialization;
pub mod validator;
pub mod vote;

pub use block::{Block, BlockHeader, BlockId, Commit, ConsensusParamUpdates, ConsensusParams};
pub use hash::Hash;
pub use part_set::{BlockPart, PartSet, PartSetError, PartSetHeader, BLOCK_PART_SIZE};
pub use proposal::{Proposal, SignedProposal, NO_POL_ROUND};
pub use validator::{Validator, ValidatorId, ValidatorSet, ValidatorSetError, ValidatorUpdate};
pub use vote::{DuplicateVoteEvidence, SignedVote, Vote, VoteType};
