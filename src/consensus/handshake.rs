//! Startup reconciliation between the application, the block store, and the
//! state store, before any live input is accepted.
//!
//! Let `Hst` be the last height applied to persisted state, `Hs` the last
//! height in the block store, and `Ha` the application's height. After a
//! clean shutdown all three agree; after a crash the block store may be one
//! ahead of the state store, and the application may trail both. Anything
//! else is corrupt persistence and the node refuses to start.

use crate::app::proxy::ProxyError;
use crate::consensus::executor::{BlockExecutor, ExecutorError};
use crate::consensus::round_state::ChainState;
use crate::storage::block_store::{BlockStore, StoreError};
use tracing::{info, warn};

#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
    #[error("block store height {hs} not in {{{hst}, {hst}+1}}: corrupt persistence")]
    StoreHeightMismatch { hs: u64, hst: u64 },
    #[error("application height {ha} is ahead of the block store ({hs}): corrupt persistence")]
    AppAhead { ha: u64, hs: u64 },
    #[error("application hash does not match persisted state at height {height}")]
    AppHashMismatch { height: u64 },
    #[error("block {0} missing from the block store")]
    MissingBlock(u64),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("application proxy: {0}")]
    Proxy(#[from] ProxyError),
    #[error("executor: {0}")]
    Executor(#[from] ExecutorError),
}

pub struct Handshaker<'a> {
    block_store: &'a BlockStore,
}

impl<'a> Handshaker<'a> {
    pub fn new(block_store: &'a BlockStore) -> Self {
        Self { block_store }
    }

    /// Reconcile heights and replay whatever the application (and possibly
    /// the state store) missed. Returns the chain state consensus resumes
    /// from; the executor's internal state is advanced to match.
    pub async fn handshake(
        &self,
        executor: &mut BlockExecutor,
    ) -> Result<ChainState, HandshakeError> {
        let hst = executor.chain().height - 1;
        let hs = self.block_store.last_height()?;
        let info = executor.info().await?;
        let ha = info.last_height;

        info!(
            app_height = ha,
            store_height = hs,
            state_height = hst,
            "handshaking with application"
        );

        if hs != hst && hs != hst + 1 {
            return Err(HandshakeError::StoreHeightMismatch { hs, hst });
        }
        if ha > hs {
            return Err(HandshakeError::AppAhead { ha, hs });
        }

        if ha == hs && hs == hst {
            // Everything agrees; just cross-check the app hash.
            let expected = executor.chain().last_app_hash;
            if ha > 0 && info.last_app_hash != expected {
                return Err(HandshakeError::AppHashMismatch { height: ha });
            }
            return Ok(executor.chain().clone());
        }

        // Re-drive missed blocks into the application. `finalize`/`commit`
        // on the app are idempotent by determinism: the same inputs land on
        // the same app hash.
        for h in ha + 1..=hs {
            let block = self
                .block_store
                .load_block(h)?
                .ok_or(HandshakeError::MissingBlock(h))?;
            let commit = self
                .block_store
                .load_commit(h)?
                .ok_or(HandshakeError::MissingBlock(h))?;
            let persist_state = h > hst;
            if persist_state {
                warn!(
                    height = h,
                    "block stored but state not applied; repairing torn commit"
                );
            }
            let app_hash = executor.replay_block(&block, &commit, persist_state).await?;
            info!(height = h, app_hash = %app_hash, "replayed block into application");
        }

        Ok(executor.chain().clone())
    }
}
