//! Drives the application's per-height lifecycle for a decided block and
//! persists the results.
//!
//! The write order is fixed: application first, then the block store, then
//! the state store. A crash between the two stores leaves the block store
//! one height ahead, which is exactly the torn state the startup handshake
//! knows how to repair.

use crate::app::proxy::{AppConn, ProxyError};
use crate::consensus::round_state::ChainState;
use crate::storage::block_store::{BlockStore, StoreError};
use crate::storage::state_store::StateStore;
use crate::types::{Block, Commit, ConsensusParamUpdates, DuplicateVoteEvidence, Hash, ValidatorUpdate};
use std::sync::Arc;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum ExecutorError {
    #[error("application proxy: {0}")]
    Proxy(#[from] ProxyError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug)]
pub struct FinalizeResult {
    pub app_hash: Hash,
    pub validator_updates: Vec<ValidatorUpdate>,
    pub param_updates: ConsensusParamUpdates,
}

pub struct BlockExecutor {
    chain: ChainState,
    conn: AppConn,
    block_store: Arc<BlockStore>,
    state_store: Arc<StateStore>,
}

impl BlockExecutor {
    pub fn new(
        chain: ChainState,
        conn: AppConn,
        block_store: Arc<BlockStore>,
        state_store: Arc<StateStore>,
    ) -> Self {
        Self {
            chain,
            conn,
            block_store,
            state_store,
        }
    }

    pub fn chain(&self) -> &ChainState {
        &self.chain
    }

    /// Rewind to an earlier chain state (the replay console's `back`),
    /// keeping the connections and stores.
    pub fn reset_chain(mut self, chain: ChainState) -> Self {
        self.chain = chain;
        self
    }

    pub async fn info(&mut self) -> Result<crate::app::InfoResponse, ExecutorError> {
        Ok(self.conn.info().await?)
    }

    /// Shape a mempool snapshot through the application before proposing.
    pub async fn prepare_proposal(
        &mut self,
        txs: Vec<Vec<u8>>,
        max_bytes: u64,
    ) -> Result<Vec<Vec<u8>>, ExecutorError> {
        Ok(self.conn.prepare_proposal(txs, max_bytes).await?)
    }

    /// Run `begin_block` / `deliver_tx`* / `end_block` / `commit` against
    /// the application, then persist the block and the advanced state.
    pub async fn finalize(
        &mut self,
        block: &Block,
        commit: &Commit,
        evidence: Vec<DuplicateVoteEvidence>,
    ) -> Result<FinalizeResult, ExecutorError> {
        let result = self.apply_to_app(block, evidence).await?;

        self.block_store.save_block(block, commit)?;
        let next = self.chain.advance(
            commit.clone(),
            result.app_hash,
            &result.validator_updates,
            &result.param_updates,
        );
        self.state_store.save_state(&next)?;
        self.chain = next;

        Ok(result)
    }

    /// Handshake recovery: re-drive a stored block into the application.
    /// When `persist_state` is set (the block store was a height ahead of
    /// the state store) the advanced state is written as well.
    pub async fn replay_block(
        &mut self,
        block: &Block,
        commit: &Commit,
        persist_state: bool,
    ) -> Result<Hash, ExecutorError> {
        let result = self.apply_to_app(block, Vec::new()).await?;
        if persist_state {
            let next = self.chain.advance(
                commit.clone(),
                result.app_hash,
                &result.validator_updates,
                &result.param_updates,
            );
            self.state_store.save_state(&next)?;
            self.chain = next;
        }
        Ok(result.app_hash)
    }

    async fn apply_to_app(
        &mut self,
        block: &Block,
        evidence: Vec<DuplicateVoteEvidence>,
    ) -> Result<FinalizeResult, ExecutorError> {
        let height = block.header.height;
        let last_commit_votes = block
            .last_commit
            .as_ref()
            .map(|c| c.votes.clone())
            .unwrap_or_default();

        self.conn
            .begin_block(block.header.clone(), last_commit_votes, evidence)
            .await?;
        for tx in &block.txs {
            let result = self.conn.deliver_tx(tx.clone()).await?;
            if result.code != 0 {
                debug!(height, code = result.code, log = %result.log, "transaction failed");
            }
        }
        let end = self.conn.end_block(height).await?;
        let app_hash = self.conn.commit().await?;

        Ok(FinalizeResult {
            app_hash,
            validator_updates: end.validator_updates,
            param_updates: end.param_updates,
        })
    }
}
