pub mod events;
pub mod executor;
pub mod handshake;
pub mod messages;
pub mod proposer;
pub mod replay;
pub mod round_state;
pub mod router;
pub mod state;
pub mod timer;
pub mod vote_set;

pub use events::{ConsensusCommand, ConsensusEvent, PeerId, TimeoutInfo};
pub use executor::{BlockExecutor, ExecutorError, FinalizeResult};
pub use handshake::{HandshakeError, Handshaker};
pub use messages::{PeerMessage, PeerMsgType};
pub use replay::{run_replay_file, replay_wal_tail, ReplayDriver, ReplaySetup};
pub use round_state::{ChainState, RoundState, RoundStateSummary, Step, NO_ROUND};
pub use router::{CommandRouter, EmptyTxSource, TxSource};
pub use state::{ConsensusConfig, ConsensusCore, ConsensusDeps};
pub use timer::{TimeoutScheduler, TimeoutSchedulerHandle};
pub use vote_set::{AddVoteResult, HeightVoteSet, VoteSet, VoteSetError};
