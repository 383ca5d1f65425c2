//! Write-ahead log for the consensus state machine.
//!
//! Every message the machine consumes is appended and flushed *before* it is
//! acted on, so a crashed node can re-drive itself deterministically from the
//! last height boundary. Frames are length-prefixed and CRC-protected; an
//! `EndHeight(H)` marker closes each height's segment.

use crate::consensus::events::TimeoutInfo;
use crate::consensus::round_state::Step;
use crate::metrics::Metrics;
use crate::storage::autofile::AutoFile;
use crate::types::serialization::{
    get_block_part, get_signed_proposal, get_signed_vote, put_block_part, put_signed_proposal,
    put_signed_vote, Decoder, Encoder,
};
use crate::types::{BlockPart, SignedProposal, SignedVote};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

const TAG_END_HEIGHT: u8 = 0x01;
const TAG_PROPOSAL: u8 = 0x02;
const TAG_BLOCK_PART: u8 = 0x03;
const TAG_VOTE: u8 = 0x04;
const TAG_TIMEOUT: u8 = 0x05;

/// Upper bound on a single frame; anything larger is treated as corruption.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt WAL frame")]
    CorruptFrame,
}

/// A consumed event worth persisting. Mirrors the inbound event queue minus
/// observer traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalMessage {
    Proposal(SignedProposal),
    BlockPart {
        height: u64,
        round: u32,
        part: BlockPart,
    },
    Vote(SignedVote),
    Timeout(TimeoutInfo),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalPayload {
    /// Height `H` fully committed; replay segments start after this marker.
    EndHeight(u64),
    Message(WalMessage),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalRecord {
    pub time_ms: u64,
    pub payload: WalPayload,
}

impl WalRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        e.put_u64(self.time_ms);
        match &self.payload {
            WalPayload::EndHeight(h) => {
                e.put_u8(TAG_END_HEIGHT);
                e.put_u64(*h);
            }
            WalPayload::Message(WalMessage::Proposal(sp)) => {
                e.put_u8(TAG_PROPOSAL);
                put_signed_proposal(&mut e, sp);
            }
            WalPayload::Message(WalMessage::BlockPart {
                height,
                round,
                part,
            }) => {
                e.put_u8(TAG_BLOCK_PART);
                e.put_u64(*height);
                e.put_u32(*round);
                put_block_part(&mut e, part);
            }
            WalPayload::Message(WalMessage::Vote(sv)) => {
                e.put_u8(TAG_VOTE);
                put_signed_vote(&mut e, sv);
            }
            WalPayload::Message(WalMessage::Timeout(t)) => {
                e.put_u8(TAG_TIMEOUT);
                e.put_u64(t.height);
                e.put_u32(t.round);
                e.put_u8(step_tag(t.step));
                e.put_u64(t.duration_ms);
            }
        }
        e.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<WalRecord, WalError> {
        decode_record(&mut Decoder::new(data)).map_err(|_| WalError::CorruptFrame)
    }
}

fn decode_record(
    d: &mut Decoder<'_>,
) -> Result<WalRecord, crate::types::serialization::CodecError> {
    use crate::types::serialization::CodecError;

    let time_ms = d.get_u64()?;
    let payload = match d.get_u8()? {
        TAG_END_HEIGHT => WalPayload::EndHeight(d.get_u64()?),
        TAG_PROPOSAL => WalPayload::Message(WalMessage::Proposal(get_signed_proposal(d)?)),
        TAG_BLOCK_PART => WalPayload::Message(WalMessage::BlockPart {
            height: d.get_u64()?,
            round: d.get_u32()?,
            part: get_block_part(d)?,
        }),
        TAG_VOTE => WalPayload::Message(WalMessage::Vote(get_signed_vote(d)?)),
        TAG_TIMEOUT => {
            let height = d.get_u64()?;
            let round = d.get_u32()?;
            let step = step_from_tag(d.get_u8()?).ok_or(CodecError::Invalid("step tag"))?;
            let duration_ms = d.get_u64()?;
            WalPayload::Message(WalMessage::Timeout(TimeoutInfo {
                height,
                round,
                step,
                duration_ms,
            }))
        }
        _ => return Err(CodecError::Invalid("wal tag")),
    };
    Ok(WalRecord { time_ms, payload })
}

fn step_tag(step: Step) -> u8 {
    match step {
        Step::NewHeight => 0,
        Step::NewRound => 1,
        Step::Propose => 2,
        Step::Prevote => 3,
        Step::PrevoteWait => 4,
        Step::Precommit => 5,
        Step::PrecommitWait => 6,
        Step::Commit => 7,
    }
}

fn step_from_tag(tag: u8) -> Option<Step> {
    Some(match tag {
        0 => Step::NewHeight,
        1 => Step::NewRound,
        2 => Step::Propose,
        3 => Step::Prevote,
        4 => Step::PrevoteWait,
        5 => Step::Precommit,
        6 => Step::PrecommitWait,
        7 => Step::Commit,
        _ => return None,
    })
}

// CRC-32 (IEEE 802.3), table-driven. Not cryptographic; catches bit rot and
// torn writes.
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0u32;
    while i < 256 {
        let mut crc = i;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i as usize] = crc;
        i += 1;
    }
    table
};

pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        let idx = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = CRC32_TABLE[idx] ^ (crc >> 8);
    }
    !crc
}

/// On-disk frame: `len(4) | crc32(4) | data`, big-endian.
fn frame(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + data.len());
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(&crc32(data).to_be_bytes());
    out.extend_from_slice(data);
    out
}

/// The writer side. Owns the rotating file; flushes every record before the
/// caller acts on the event.
pub struct Wal {
    file: AutoFile,
    metrics: Option<Arc<Metrics>>,
}

impl Wal {
    pub fn open(path: impl Into<PathBuf>, max_file_size: u64) -> Result<Self, WalError> {
        Ok(Self {
            file: AutoFile::open(path, max_file_size)?,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn write(&mut self, record: &WalRecord) -> Result<(), WalError> {
        let framed = frame(&record.encode());
        let started = Instant::now();
        self.file.write_all(&framed)?;
        self.file.flush()?;
        if let Some(m) = &self.metrics {
            m.wal_write_duration.observe(started.elapsed().as_secs_f64());
            m.wal_bytes_written.inc_by(framed.len() as u64);
        }
        Ok(())
    }

    pub fn write_message(&mut self, time_ms: u64, msg: WalMessage) -> Result<(), WalError> {
        self.write(&WalRecord {
            time_ms,
            payload: WalPayload::Message(msg),
        })
    }

    pub fn write_end_height(&mut self, time_ms: u64, height: u64) -> Result<(), WalError> {
        self.write(&WalRecord {
            time_ms,
            payload: WalPayload::EndHeight(height),
        })
    }

    /// Forward the SIGHUP-equivalent from the signal shim.
    pub fn reopen(&mut self) {
        self.file.reopen();
    }
}

/// Read every decodable record: the rotated-out generation first (if any),
/// then the live file. Reading stops cleanly at the first corrupt or
/// truncated frame: that is the torn tail of a crash, not an error.
pub fn read_all(path: &Path) -> Result<Vec<WalRecord>, WalError> {
    let mut old = path.as_os_str().to_owned();
    old.push(".old");
    let mut records = Vec::new();
    for p in [PathBuf::from(old), path.to_path_buf()] {
        match std::fs::File::open(&p) {
            Ok(mut f) => {
                let mut buf = Vec::new();
                f.read_to_end(&mut buf)?;
                read_frames(&buf, &mut records);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(WalError::Io(e)),
        }
    }
    Ok(records)
}

fn read_frames(mut buf: &[u8], out: &mut Vec<WalRecord>) {
    loop {
        if buf.len() < 8 {
            return;
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let crc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if len > MAX_FRAME_BYTES || buf.len() < 8 + len as usize {
            return;
        }
        let data = &buf[8..8 + len as usize];
        if crc32(data) != crc {
            return;
        }
        match WalRecord::decode(data) {
            Ok(rec) => out.push(rec),
            Err(_) => return,
        }
        buf = &buf[8 + len as usize..];
    }
}

/// Index of the first record after the latest `EndHeight(height)` marker,
/// or 0 when the marker is absent (fresh WAL).
pub fn seek_after_end_height(records: &[WalRecord], height: u64) -> usize {
    records
        .iter()
        .rposition(|r| r.payload == WalPayload::EndHeight(height))
        .map(|i| i + 1)
        .unwrap_or(0)
}
