use crate::types::serialization::{decode_block, encode_block};
use crate::types::{Block, BlockPart, Commit, PartSet};
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use std::path::Path;

const CF_BLOCKS: &str = "blocks"; // height (u64 BE) -> canonical block bytes
const CF_PARTS: &str = "parts"; // height (u64 BE) | index (u32 BE) -> serialized part
const CF_COMMITS: &str = "commits"; // height (u64 BE) -> JSON commit
const CF_META: &str = "meta"; // "last_height" -> u64 BE

fn height_key(h: u64) -> [u8; 8] {
    h.to_be_bytes()
}

fn part_key(h: u64, index: u32) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..8].copy_from_slice(&h.to_be_bytes());
    key[8..].copy_from_slice(&index.to_be_bytes());
    key
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("rocksdb: {0}")]
    Db(#[from] rocksdb::Error),
    #[error("codec: {0}")]
    Codec(#[from] crate::types::serialization::CodecError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Committed blocks, their parts (served to lagging peers), and commit
/// certificates, keyed by height.
pub struct BlockStore {
    db: DB,
}

impl BlockStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_BLOCKS, Options::default()),
            ColumnFamilyDescriptor::new(CF_PARTS, Options::default()),
            ColumnFamilyDescriptor::new(CF_COMMITS, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        Ok(Self { db })
    }

    /// Persist block, parts, and commit in one batch.
    pub fn save_block(&self, block: &Block, commit: &Commit) -> Result<(), StoreError> {
        let height = block.header.height;
        let key = height_key(height);
        let block_bytes = encode_block(block);
        let parts = PartSet::from_bytes(&block_bytes);

        let cf_blocks = self.db.cf_handle(CF_BLOCKS).expect("cf exists");
        let cf_parts = self.db.cf_handle(CF_PARTS).expect("cf exists");
        let cf_commits = self.db.cf_handle(CF_COMMITS).expect("cf exists");
        let cf_meta = self.db.cf_handle(CF_META).expect("cf exists");

        let mut batch = rocksdb::WriteBatch::default();
        batch.put_cf(&cf_blocks, key, &block_bytes);
        for part in parts.parts() {
            let mut e = crate::types::serialization::Encoder::new();
            crate::types::serialization::put_block_part(&mut e, part);
            batch.put_cf(&cf_parts, part_key(height, part.index), e.into_bytes());
        }
        batch.put_cf(&cf_commits, key, serde_json::to_vec(commit)?);
        batch.put_cf(&cf_meta, b"last_height", key);

        self.db.write(batch)?;
        Ok(())
    }

    pub fn load_block(&self, height: u64) -> Result<Option<Block>, StoreError> {
        let cf = self.db.cf_handle(CF_BLOCKS).expect("cf exists");
        match self.db.get_cf(&cf, height_key(height))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(decode_block(&bytes)?)),
        }
    }

    pub fn load_part(&self, height: u64, index: u32) -> Result<Option<BlockPart>, StoreError> {
        let cf = self.db.cf_handle(CF_PARTS).expect("cf exists");
        match self.db.get_cf(&cf, part_key(height, index))? {
            None => Ok(None),
            Some(bytes) => {
                let mut d = crate::types::serialization::Decoder::new(&bytes);
                Ok(Some(crate::types::serialization::get_block_part(&mut d)?))
            }
        }
    }

    pub fn load_commit(&self, height: u64) -> Result<Option<Commit>, StoreError> {
        let cf = self.db.cf_handle(CF_COMMITS).expect("cf exists");
        match self.db.get_cf(&cf, height_key(height))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        }
    }

    /// Overwrite the stored commit with one carrying more signatures.
    pub fn update_commit(&self, commit: &Commit) -> Result<(), StoreError> {
        let cf = self.db.cf_handle(CF_COMMITS).expect("cf exists");
        self.db
            .put_cf(&cf, height_key(commit.height), serde_json::to_vec(commit)?)?;
        Ok(())
    }

    /// Last committed height; 0 when the store is empty.
    pub fn last_height(&self) -> Result<u64, StoreError> {
        let cf = self.db.cf_handle(CF_META).expect("cf exists");
        match self.db.get_cf(&cf, b"last_height")? {
            None => Ok(0),
            Some(bytes) if bytes.len() == 8 => Ok(u64::from_be_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ])),
            Some(_) => Ok(0),
        }
    }
}
