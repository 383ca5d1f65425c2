use crate::crypto::hash::sha256;
use crate::types::Hash;
use serde::{Deserialize, Serialize};

// Domain-separated node hashing so a leaf can never be replayed as an
// inner node.
const LEAF_PREFIX: u8 = 0x00;
const INNER_PREFIX: u8 = 0x01;

pub fn leaf_hash(data: &[u8]) -> Hash {
    let mut buf = Vec::with_capacity(1 + data.len());
    buf.push(LEAF_PREFIX);
    buf.extend_from_slice(data);
    sha256(&buf)
}

fn inner_hash(left: &Hash, right: &Hash) -> Hash {
    let mut buf = [0u8; 65];
    buf[0] = INNER_PREFIX;
    buf[1..33].copy_from_slice(&left.0);
    buf[33..65].copy_from_slice(&right.0);
    sha256(&buf)
}

/// Root over a list of byte slices. An odd node at any level is promoted
/// unchanged. The empty list hashes to zero.
pub fn merkle_root<T: AsRef<[u8]>>(items: &[T]) -> Hash {
    if items.is_empty() {
        return Hash::ZERO;
    }
    let mut level: Vec<Hash> = items.iter().map(|i| leaf_hash(i.as_ref())).collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            match pair {
                [l, r] => next.push(inner_hash(l, r)),
                [odd] => next.push(*odd),
                _ => unreachable!(),
            }
        }
        level = next;
    }
    level[0]
}

/// Audit path from a leaf to the root. `siblings` are ordered bottom-up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub index: u32,
    pub total: u32,
    pub siblings: Vec<Hash>,
}

impl MerkleProof {
    /// Build proofs for every leaf at once.
    pub fn build_all<T: AsRef<[u8]>>(items: &[T]) -> Vec<MerkleProof> {
        let total = items.len() as u32;
        (0..items.len())
            .map(|i| MerkleProof {
                index: i as u32,
                total,
                siblings: audit_path(items, i),
            })
            .collect()
    }

    pub fn verify(&self, root: &Hash, leaf_data: &[u8]) -> bool {
        if self.total == 0 || self.index >= self.total {
            return false;
        }
        let mut hash = leaf_hash(leaf_data);
        let mut index = self.index as usize;
        let mut width = self.total as usize;
        let mut sib = self.siblings.iter();
        while width > 1 {
            let has_sibling = index ^ 1 < width;
            if has_sibling {
                let s = match sib.next() {
                    Some(s) => s,
                    None => return false,
                };
                hash = if index % 2 == 0 {
                    inner_hash(&hash, s)
                } else {
                    inner_hash(s, &hash)
                };
            }
            index /= 2;
            width = width.div_ceil(2);
        }
        sib.next().is_none() && hash == *root
    }
}

fn audit_path<T: AsRef<[u8]>>(items: &[T], mut index: usize) -> Vec<Hash> {
    let mut level: Vec<Hash> = items.iter().map(|i| leaf_hash(i.as_ref())).collect();
    let mut path = Vec::new();
    while level.len() > 1 {
        let sibling = index ^ 1;
        if sibling < level.len() {
            path.push(level[sibling]);
        }
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            match pair {
                [l, r] => next.push(inner_hash(l, r)),
                [odd] => next.push(*odd),
                _ => unreachable!(),
            }
        }
        level = next;
        index /= 2;
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_root_is_zero() {
        let items: Vec<Vec<u8>> = vec![];
        assert_eq!(merkle_root(&items), Hash::ZERO);
    }

    #[test]
    fn single_leaf_root_is_leaf_hash() {
        let items = vec![b"part".to_vec()];
        assert_eq!(merkle_root(&items), leaf_hash(b"part"));
    }

    #[test]
    fn proofs_verify_for_all_leaves() {
        for n in 1..=9usize {
            let items: Vec<Vec<u8>> = (0..n).map(|i| vec![i as u8; 10]).collect();
            let root = merkle_root(&items);
            let proofs = MerkleProof::build_all(&items);
            for (i, p) in proofs.iter().enumerate() {
                assert!(p.verify(&root, &items[i]), "leaf {} of {}", i, n);
            }
        }
    }

    #[test]
    fn tampered_leaf_fails_verification() {
        let items: Vec<Vec<u8>> = (0..4).map(|i| vec![i as u8; 10]).collect();
        let root = merkle_root(&items);
        let proofs = MerkleProof::build_all(&items);
        assert!(!proofs[2].verify(&root, b"not the leaf"));
    }

    #[test]
    fn proof_for_wrong_index_fails() {
        let items: Vec<Vec<u8>> = (0..4).map(|i| vec![i as u8; 10]).collect();
        let root = merkle_root(&items);
        let mut proof = MerkleProof::build_all(&items)[1].clone();
        proof.index = 2;
        assert!(!proof.verify(&root, &items[2]));
    }
}
