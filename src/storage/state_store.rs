use crate::consensus::round_state::ChainState;
use crate::storage::block_store::StoreError;
use crate::types::{ConsensusParams, ValidatorSet};
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use std::path::Path;

const CF_STATE: &str = "state"; // height (u64 BE) -> JSON ChainState (state *for* that height)
const CF_VALSETS: &str = "valsets"; // height (u64 BE) -> JSON validator set voting at that height
const CF_PARAMS: &str = "params"; // height (u64 BE) -> JSON consensus params at that height
const CF_META: &str = "state_meta"; // "latest" -> u64 BE height

fn height_key(h: u64) -> [u8; 8] {
    h.to_be_bytes()
}

/// Per-height validator sets and consensus params, plus the latest chain
/// state snapshot (whose `height` is the next height to decide).
pub struct StateStore {
    db: DB,
}

impl StateStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_STATE, Options::default()),
            ColumnFamilyDescriptor::new(CF_VALSETS, Options::default()),
            ColumnFamilyDescriptor::new(CF_PARAMS, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        Ok(Self { db })
    }

    /// Persist the post-commit state. `state.height` is the next height;
    /// its validator set and params are indexed under that height so they
    /// can be looked up when verifying old commits.
    pub fn save_state(&self, state: &ChainState) -> Result<(), StoreError> {
        let key = height_key(state.height);
        let cf_state = self.db.cf_handle(CF_STATE).expect("cf exists");
        let cf_valsets = self.db.cf_handle(CF_VALSETS).expect("cf exists");
        let cf_params = self.db.cf_handle(CF_PARAMS).expect("cf exists");
        let cf_meta = self.db.cf_handle(CF_META).expect("cf exists");

        let mut batch = rocksdb::WriteBatch::default();
        batch.put_cf(&cf_state, key, serde_json::to_vec(state)?);
        batch.put_cf(&cf_valsets, key, serde_json::to_vec(&state.validators)?);
        batch.put_cf(&cf_params, key, serde_json::to_vec(&state.params)?);
        batch.put_cf(&cf_meta, b"latest", key);
        self.db.write(batch)?;
        Ok(())
    }

    pub fn load_state(&self, height: u64) -> Result<Option<ChainState>, StoreError> {
        let cf = self.db.cf_handle(CF_STATE).expect("cf exists");
        match self.db.get_cf(&cf, height_key(height))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        }
    }

    pub fn load_latest_state(&self) -> Result<Option<ChainState>, StoreError> {
        let cf_meta = self.db.cf_handle(CF_META).expect("cf exists");
        let height = match self.db.get_cf(&cf_meta, b"latest")? {
            None => return Ok(None),
            Some(bytes) if bytes.len() == 8 => u64::from_be_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
            Some(_) => return Ok(None),
        };
        self.load_state(height)
    }

    pub fn load_validator_set(&self, height: u64) -> Result<Option<ValidatorSet>, StoreError> {
        let cf = self.db.cf_handle(CF_VALSETS).expect("cf exists");
        match self.db.get_cf(&cf, height_key(height))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        }
    }

    pub fn load_params(&self, height: u64) -> Result<Option<ConsensusParams>, StoreError> {
        let cf = self.db.cf_handle(CF_PARAMS).expect("cf exists");
        match self.db.get_cf(&cf, height_key(height))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        }
    }
}
