//! The application side of consensus: a deterministic state machine driven
//! over four logical connections (consensus, mempool, query, snapshot).
//!
//! The contract is strict determinism: identical call sequences on identical
//! initial state must produce identical results and identical app hashes,
//! or replicas will diverge at the first commit.

pub mod proxy;
pub mod socket;

pub use proxy::{AppConn, AppConns};

use crate::crypto::hash::sha256;
use crate::types::{
    Block, BlockHeader, ConsensusParamUpdates, DuplicateVoteEvidence, Hash, SignedVote,
    ValidatorUpdate, Vote,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InfoResponse {
    pub app_version: u64,
    pub last_height: u64,
    pub last_app_hash: Hash,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TxResult {
    /// 0 is success; anything else is an application-defined failure.
    pub code: u32,
    pub log: String,
}

impl TxResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(code: u32, log: impl Into<String>) -> Self {
        Self {
            code,
            log: log.into(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EndBlockResponse {
    pub validator_updates: Vec<ValidatorUpdate>,
    pub param_updates: ConsensusParamUpdates,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub height: u64,
    pub format: u32,
    pub chunks: u32,
    pub hash: Hash,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotChunkResult {
    Accept,
    Abort,
    Retry,
}

/// The deterministic application. Lifecycle per committed height, in order:
/// `begin_block`, `deliver_tx`*, `end_block`, `commit`. Proposal shaping
/// and validation go through `prepare_proposal` / `process_proposal`;
/// snapshot and vote-extension hooks have inert defaults.
pub trait Application: Send {
    fn info(&mut self) -> InfoResponse;

    /// May reorder or drop transactions within the size budget.
    fn prepare_proposal(&mut self, txs: Vec<Vec<u8>>, max_bytes: u64) -> Vec<Vec<u8>>;

    /// Accept or reject a block someone else proposed.
    fn process_proposal(&mut self, block: &Block) -> bool;

    fn begin_block(
        &mut self,
        header: &BlockHeader,
        last_commit_votes: &[SignedVote],
        evidence: &[DuplicateVoteEvidence],
    );

    fn deliver_tx(&mut self, tx: &[u8]) -> TxResult;

    fn end_block(&mut self, height: u64) -> EndBlockResponse;

    fn commit(&mut self) -> Hash;

    fn list_snapshots(&mut self) -> Vec<Snapshot> {
        Vec::new()
    }

    fn offer_snapshot(&mut self, _snapshot: &Snapshot) -> bool {
        false
    }

    fn load_snapshot_chunk(&mut self, _height: u64, _format: u32, _chunk: u32) -> Vec<u8> {
        Vec::new()
    }

    fn apply_snapshot_chunk(&mut self, _chunk: &[u8]) -> SnapshotChunkResult {
        SnapshotChunkResult::Abort
    }

    fn extend_vote(&mut self, _height: u64, _round: u32) -> Vec<u8> {
        Vec::new()
    }

    fn verify_vote_extension(&mut self, _vote: &Vote, _extension: &[u8]) -> bool {
        true
    }
}

/// Wire requests, one per trait method. Length-delimited JSON over the
/// stream socket; request/response matched by arrival order per connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AppRequest {
    Info,
    PrepareProposal {
        txs: Vec<Vec<u8>>,
        max_bytes: u64,
    },
    ProcessProposal {
        block: Block,
    },
    BeginBlock {
        header: BlockHeader,
        last_commit_votes: Vec<SignedVote>,
        evidence: Vec<DuplicateVoteEvidence>,
    },
    DeliverTx {
        tx: Vec<u8>,
    },
    EndBlock {
        height: u64,
    },
    Commit,
    ListSnapshots,
    OfferSnapshot {
        snapshot: Snapshot,
    },
    LoadSnapshotChunk {
        height: u64,
        format: u32,
        chunk: u32,
    },
    ApplySnapshotChunk {
        chunk: Vec<u8>,
    },
    ExtendVote {
        height: u64,
        round: u32,
    },
    VerifyVoteExtension {
        vote: Vote,
        extension: Vec<u8>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AppResponse {
    Info(InfoResponse),
    PrepareProposal { txs: Vec<Vec<u8>> },
    ProcessProposal { accept: bool },
    BeginBlock,
    DeliverTx(TxResult),
    EndBlock(EndBlockResponse),
    Commit { app_hash: Hash },
    Snapshots(Vec<Snapshot>),
    OfferSnapshot { accept: bool },
    SnapshotChunk { chunk: Vec<u8> },
    ApplySnapshotChunk(SnapshotChunkResult),
    VoteExtension { extension: Vec<u8> },
    VerifyVoteExtension { accept: bool },
    /// A handler panicked or the request was malformed. The connection
    /// stays usable.
    Exception { error: String },
}

/// Route one request into the application. A panic in the handler is
/// recovered, logged, and surfaced as an `Exception` response so one bad
/// request cannot take the connection down.
pub fn dispatch(app: &mut dyn Application, req: AppRequest) -> AppResponse {
    let result = catch_unwind(AssertUnwindSafe(|| match req {
        AppRequest::Info => AppResponse::Info(app.info()),
        AppRequest::PrepareProposal { txs, max_bytes } => AppResponse::PrepareProposal {
            txs: app.prepare_proposal(txs, max_bytes),
        },
        AppRequest::ProcessProposal { block } => AppResponse::ProcessProposal {
            accept: app.process_proposal(&block),
        },
        AppRequest::BeginBlock {
            header,
            last_commit_votes,
            evidence,
        } => {
            app.begin_block(&header, &last_commit_votes, &evidence);
            AppResponse::BeginBlock
        }
        AppRequest::DeliverTx { tx } => AppResponse::DeliverTx(app.deliver_tx(&tx)),
        AppRequest::EndBlock { height } => AppResponse::EndBlock(app.end_block(height)),
        AppRequest::Commit => AppResponse::Commit {
            app_hash: app.commit(),
        },
        AppRequest::ListSnapshots => AppResponse::Snapshots(app.list_snapshots()),
        AppRequest::OfferSnapshot { snapshot } => AppResponse::OfferSnapshot {
            accept: app.offer_snapshot(&snapshot),
        },
        AppRequest::LoadSnapshotChunk {
            height,
            format,
            chunk,
        } => AppResponse::SnapshotChunk {
            chunk: app.load_snapshot_chunk(height, format, chunk),
        },
        AppRequest::ApplySnapshotChunk { chunk } => {
            AppResponse::ApplySnapshotChunk(app.apply_snapshot_chunk(&chunk))
        }
        AppRequest::ExtendVote { height, round } => AppResponse::VoteExtension {
            extension: app.extend_vote(height, round),
        },
        AppRequest::VerifyVoteExtension { vote, extension } => {
            AppResponse::VerifyVoteExtension {
                accept: app.verify_vote_extension(&vote, &extension),
            }
        }
    }));

    match result {
        Ok(resp) => resp,
        Err(panic) => {
            let error = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            tracing::error!(error = %error, "application handler panicked");
            AppResponse::Exception { error }
        }
    }
}

/// Built-in key/value application: transactions are `key=value` pairs, the
/// app hash is a digest over the sorted store plus the height. Small, fully
/// deterministic, and enough to exercise the whole consensus path.
#[derive(Default)]
pub struct KvApp {
    store: BTreeMap<Vec<u8>, Vec<u8>>,
    pending: BTreeMap<Vec<u8>, Vec<u8>>,
    last_height: u64,
    last_app_hash: Hash,
    block_height: u64,
}

impl KvApp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.store.get(key)
    }

    fn compute_hash(&self) -> Hash {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.last_height.to_be_bytes());
        for (k, v) in &self.store {
            buf.extend_from_slice(&(k.len() as u32).to_be_bytes());
            buf.extend_from_slice(k);
            buf.extend_from_slice(&(v.len() as u32).to_be_bytes());
            buf.extend_from_slice(v);
        }
        sha256(&buf)
    }
}

impl Application for KvApp {
    fn info(&mut self) -> InfoResponse {
        InfoResponse {
            app_version: 1,
            last_height: self.last_height,
            last_app_hash: self.last_app_hash,
        }
    }

    fn prepare_proposal(&mut self, txs: Vec<Vec<u8>>, max_bytes: u64) -> Vec<Vec<u8>> {
        let mut total = 0u64;
        txs.into_iter()
            .filter(|tx| {
                total += tx.len() as u64;
                total <= max_bytes
            })
            .collect()
    }

    fn process_proposal(&mut self, block: &Block) -> bool {
        block.txs.iter().all(|tx| tx.contains(&b'='))
    }

    fn begin_block(
        &mut self,
        header: &BlockHeader,
        _last_commit_votes: &[SignedVote],
        _evidence: &[DuplicateVoteEvidence],
    ) {
        self.block_height = header.height;
        self.pending.clear();
    }

    fn deliver_tx(&mut self, tx: &[u8]) -> TxResult {
        let Some(eq) = tx.iter().position(|b| *b == b'=') else {
            return TxResult::error(1, "transaction is not key=value");
        };
        self.pending
            .insert(tx[..eq].to_vec(), tx[eq + 1..].to_vec());
        TxResult::ok()
    }

    fn end_block(&mut self, _height: u64) -> EndBlockResponse {
        EndBlockResponse::default()
    }

    fn commit(&mut self) -> Hash {
        self.store.append(&mut self.pending);
        self.last_height = self.block_height;
        self.last_app_hash = self.compute_hash();
        self.last_app_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PanickyApp;

    impl Application for PanickyApp {
        fn info(&mut self) -> InfoResponse {
            panic!("boom");
        }
        fn prepare_proposal(&mut self, txs: Vec<Vec<u8>>, _max_bytes: u64) -> Vec<Vec<u8>> {
            txs
        }
        fn process_proposal(&mut self, _block: &Block) -> bool {
            true
        }
        fn begin_block(
            &mut self,
            _header: &BlockHeader,
            _votes: &[SignedVote],
            _evidence: &[DuplicateVoteEvidence],
        ) {
        }
        fn deliver_tx(&mut self, _tx: &[u8]) -> TxResult {
            TxResult::ok()
        }
        fn end_block(&mut self, _height: u64) -> EndBlockResponse {
            EndBlockResponse::default()
        }
        fn commit(&mut self) -> Hash {
            Hash::ZERO
        }
    }

    #[test]
    fn panic_becomes_exception_response() {
        let mut app = PanickyApp;
        let resp = dispatch(&mut app, AppRequest::Info);
        assert!(matches!(resp, AppResponse::Exception { .. }));
        // Connection (and app) remain usable for the next request.
        let resp = dispatch(
            &mut app,
            AppRequest::DeliverTx {
                tx: b"k=v".to_vec(),
            },
        );
        assert!(matches!(resp, AppResponse::DeliverTx(_)));
    }

    #[test]
    fn kv_app_is_deterministic() {
        let run = || {
            let mut app = KvApp::new();
            let header = BlockHeader {
                chain_id: "test".into(),
                height: 1,
                timestamp_ms: 0,
                last_block_id: None,
                proposer: crate::types::ValidatorId([0u8; 32]),
                validator_set_hash: Hash::ZERO,
                app_hash: Hash::ZERO,
                tx_merkle_root: Hash::ZERO,
            };
            app.begin_block(&header, &[], &[]);
            app.deliver_tx(b"a=1");
            app.deliver_tx(b"b=2");
            app.end_block(1);
            app.commit()
        };
        assert_eq!(run(), run());
        assert_ne!(run(), Hash::ZERO);
    }

    #[test]
    fn kv_app_rejects_malformed_tx() {
        let mut app = KvApp::new();
        assert_ne!(app.deliver_tx(b"no-separator").code, 0);
    }
}
