use crate::types::ValidatorId;
use anyhow::Result;
use ed25519_dalek::Signer as _;
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use rand_core::OsRng;
use std::fs;
use std::path::Path;

/// The one seam between consensus and key custody. The core hands over
/// canonical bytes and gets a signature back; where the key lives is not
/// its concern.
pub trait ConsensusSigner: Send {
    fn sign(&self, canonical_bytes: &[u8]) -> [u8; 64];
    fn validator_id(&self) -> ValidatorId;
}

/// In-process signer backed by a locally held key.
pub struct LocalSigner {
    signing: SigningKey,
    id: ValidatorId,
}

impl LocalSigner {
    pub fn new(signing: SigningKey) -> Self {
        let id = ValidatorId(signing.verifying_key().to_bytes());
        Self { signing, id }
    }
}

impl ConsensusSigner for LocalSigner {
    fn sign(&self, canonical_bytes: &[u8]) -> [u8; 64] {
        let sig: Signature = self.signing.sign(canonical_bytes);
        sig.to_bytes()
    }

    fn validator_id(&self) -> ValidatorId {
        self.id
    }
}

pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let sk = SigningKey::generate(&mut OsRng);
    let vk = sk.verifying_key();
    (sk, vk)
}

pub fn verify(id: &ValidatorId, msg: &[u8], sig_bytes: &[u8; 64]) -> bool {
    let vk = match VerifyingKey::from_bytes(&id.0) {
        Ok(vk) => vk,
        Err(_) => return false,
    };
    let sig = Signature::from_bytes(sig_bytes);
    vk.verify_strict(msg, &sig).is_ok()
}

pub fn load_or_generate_keypair<P: AsRef<Path>>(path: P) -> Result<(SigningKey, VerifyingKey)> {
    let path = path.as_ref();

    if path.exists() {
        let bytes = fs::read(path)?;
        if bytes.len() != 32 {
            anyhow::bail!("invalid key file length");
        }
        let mut sk_bytes = [0u8; 32];
        sk_bytes.copy_from_slice(&bytes);
        let signing = SigningKey::from_bytes(&sk_bytes);
        let verify = signing.verifying_key();
        Ok((signing, verify))
    } else {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let (signing, verify) = generate_keypair();
        fs::write(path, signing.to_bytes())?;
        Ok((signing, verify))
    }
}
