pub mod autofile;
pub mod block_store;
pub mod state_store;
pub mod wal;

pub use autofile::AutoFile;
pub use block_store::{BlockStore, StoreError};
pub use state_store::StateStore;
pub use wal::{Wal, WalError, WalMessage, WalPayload, WalRecord};
