//! The node's view of the application: four logical connections with typed
//! helpers over the raw request/response pairs.
//!
//! Each connection enforces FIFO ordering (`&mut self` per call). An
//! unexpected or `Exception` reply is an error to the caller; the
//! connection itself stays open.

use crate::app::socket::{AppClient, SocketError};
use crate::app::{
    dispatch, AppRequest, AppResponse, Application, EndBlockResponse, InfoResponse, TxResult,
};
use crate::types::{Block, BlockHeader, DuplicateVoteEvidence, Hash, SignedVote};
use std::sync::{Arc, Mutex};

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("socket: {0}")]
    Socket(#[from] SocketError),
    #[error("application exception: {0}")]
    Exception(String),
    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),
}

/// One logical connection: in-process for embedded applications, socket for
/// external ones. Both go through the same dispatch path, so an in-process
/// app gets the same panic recovery an external one would.
pub enum AppConn {
    InProcess(Arc<Mutex<dyn Application>>),
    Socket(AppClient),
}

impl AppConn {
    pub async fn call(&mut self, req: AppRequest) -> Result<AppResponse, ProxyError> {
        let resp = match self {
            AppConn::InProcess(app) => {
                let mut guard = app.lock().unwrap_or_else(|p| p.into_inner());
                dispatch(&mut *guard, req)
            }
            AppConn::Socket(client) => client.call(&req).await?,
        };
        if let AppResponse::Exception { error } = resp {
            return Err(ProxyError::Exception(error));
        }
        Ok(resp)
    }

    pub async fn info(&mut self) -> Result<InfoResponse, ProxyError> {
        match self.call(AppRequest::Info).await? {
            AppResponse::Info(info) => Ok(info),
            _ => Err(ProxyError::UnexpectedResponse("Info")),
        }
    }

    pub async fn prepare_proposal(
        &mut self,
        txs: Vec<Vec<u8>>,
        max_bytes: u64,
    ) -> Result<Vec<Vec<u8>>, ProxyError> {
        match self
            .call(AppRequest::PrepareProposal { txs, max_bytes })
            .await?
        {
            AppResponse::PrepareProposal { txs } => Ok(txs),
            _ => Err(ProxyError::UnexpectedResponse("PrepareProposal")),
        }
    }

    pub async fn process_proposal(&mut self, block: Block) -> Result<bool, ProxyError> {
        match self.call(AppRequest::ProcessProposal { block }).await? {
            AppResponse::ProcessProposal { accept } => Ok(accept),
            _ => Err(ProxyError::UnexpectedResponse("ProcessProposal")),
        }
    }

    pub async fn begin_block(
        &mut self,
        header: BlockHeader,
        last_commit_votes: Vec<SignedVote>,
        evidence: Vec<DuplicateVoteEvidence>,
    ) -> Result<(), ProxyError> {
        match self
            .call(AppRequest::BeginBlock {
                header,
                last_commit_votes,
                evidence,
            })
            .await?
        {
            AppResponse::BeginBlock => Ok(()),
            _ => Err(ProxyError::UnexpectedResponse("BeginBlock")),
        }
    }

    pub async fn deliver_tx(&mut self, tx: Vec<u8>) -> Result<TxResult, ProxyError> {
        match self.call(AppRequest::DeliverTx { tx }).await? {
            AppResponse::DeliverTx(result) => Ok(result),
            _ => Err(ProxyError::UnexpectedResponse("DeliverTx")),
        }
    }

    pub async fn end_block(&mut self, height: u64) -> Result<EndBlockResponse, ProxyError> {
        match self.call(AppRequest::EndBlock { height }).await? {
            AppResponse::EndBlock(resp) => Ok(resp),
            _ => Err(ProxyError::UnexpectedResponse("EndBlock")),
        }
    }

    pub async fn commit(&mut self) -> Result<Hash, ProxyError> {
        match self.call(AppRequest::Commit).await? {
            AppResponse::Commit { app_hash } => Ok(app_hash),
            _ => Err(ProxyError::UnexpectedResponse("Commit")),
        }
    }
}

/// The four connections. Consensus drives the block lifecycle; mempool
/// checks transactions; query serves reads; snapshot serves state sync.
pub struct AppConns {
    pub consensus: AppConn,
    pub mempool: AppConn,
    pub query: AppConn,
    pub snapshot: AppConn,
}

impl AppConns {
    /// All four connections multiplexed onto one in-process application.
    pub fn in_process(app: Arc<Mutex<dyn Application>>) -> Self {
        Self {
            consensus: AppConn::InProcess(app.clone()),
            mempool: AppConn::InProcess(app.clone()),
            query: AppConn::InProcess(app.clone()),
            snapshot: AppConn::InProcess(app),
        }
    }

    /// Four sockets to an external application server.
    pub async fn connect(addr: &str) -> Result<Self, ProxyError> {
        Ok(Self {
            consensus: AppConn::Socket(AppClient::connect(addr).await?),
            mempool: AppConn::Socket(AppClient::connect(addr).await?),
            query: AppConn::Socket(AppClient::connect(addr).await?),
            snapshot: AppConn::Socket(AppClient::connect(addr).await?),
        })
    }
}
