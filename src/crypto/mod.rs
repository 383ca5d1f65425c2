pub mod ed25519;
pub mod hash;
pub mod merkle;

pub use ed25519::{ConsensusSigner, LocalSigner};
pub use hash::sha256;
