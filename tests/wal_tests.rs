use lockstep::consensus::events::TimeoutInfo;
use lockstep::consensus::round_state::Step;
use lockstep::storage::wal::{
    crc32, read_all, seek_after_end_height, Wal, WalMessage, WalPayload, WalRecord,
};
use lockstep::types::{SignedVote, ValidatorId, Vote, VoteType};

fn vote_record(height: u64, time_ms: u64) -> WalRecord {
    WalRecord {
        time_ms,
        payload: WalPayload::Message(WalMessage::Vote(SignedVote {
            vote: Vote {
                vote_type: VoteType::Prevote,
                height,
                round: 0,
                block_id: None,
                timestamp_ms: time_ms,
                validator: ValidatorId([1u8; 32]),
                validator_index: 0,
            },
            signature: [0u8; 64],
        })),
    }
}

fn end_height(height: u64) -> WalRecord {
    WalRecord {
        time_ms: 0,
        payload: WalPayload::EndHeight(height),
    }
}

#[test]
fn record_encode_decode_roundtrip() {
    let records = [
        end_height(42),
        vote_record(1, 99),
        WalRecord {
            time_ms: 5,
            payload: WalPayload::Message(WalMessage::Timeout(TimeoutInfo {
                height: 3,
                round: 2,
                step: Step::PrevoteWait,
                duration_ms: 1500,
            })),
        },
    ];
    for record in &records {
        let decoded = WalRecord::decode(&record.encode()).unwrap();
        assert_eq!(&decoded, record);
    }
}

#[test]
fn write_then_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cs.wal");

    let mut wal = Wal::open(&path, u64::MAX).unwrap();
    wal.write(&vote_record(1, 10)).unwrap();
    wal.write(&end_height(1)).unwrap();
    wal.write(&vote_record(2, 20)).unwrap();
    drop(wal);

    let records = read_all(&path).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[1], end_height(1));
}

#[test]
fn reading_missing_file_is_empty_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let records = read_all(&dir.path().join("absent.wal")).unwrap();
    assert!(records.is_empty());
}

#[test]
fn torn_tail_stops_the_read_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cs.wal");

    let mut wal = Wal::open(&path, u64::MAX).unwrap();
    wal.write(&vote_record(1, 10)).unwrap();
    wal.write(&vote_record(1, 11)).unwrap();
    drop(wal);

    // Simulate a crash mid-append: chop the last few bytes.
    let mut bytes = std::fs::read(&path).unwrap();
    bytes.truncate(bytes.len() - 3);
    std::fs::write(&path, &bytes).unwrap();

    let records = read_all(&path).unwrap();
    assert_eq!(records.len(), 1, "only the intact frame survives");
}

#[test]
fn corrupt_crc_stops_the_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cs.wal");

    let mut wal = Wal::open(&path, u64::MAX).unwrap();
    wal.write(&vote_record(1, 10)).unwrap();
    wal.write(&vote_record(1, 11)).unwrap();
    drop(wal);

    // Flip a payload byte inside the second frame.
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let records = read_all(&path).unwrap();
    assert_eq!(records.len(), 1);
}

#[test]
fn seek_finds_the_latest_end_height_marker() {
    let records = vec![
        vote_record(1, 1),
        end_height(1),
        vote_record(2, 2),
        end_height(2),
        vote_record(3, 3),
    ];
    assert_eq!(seek_after_end_height(&records, 2), 4);
    assert_eq!(seek_after_end_height(&records, 1), 2);
    assert_eq!(seek_after_end_height(&records, 9), 0, "missing marker replays all");
}

#[test]
fn rotation_keeps_the_previous_generation_readable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cs.wal");

    // Tiny limit forces a rotation between writes.
    let mut wal = Wal::open(&path, 64).unwrap();
    wal.write(&vote_record(1, 10)).unwrap();
    wal.write(&vote_record(2, 20)).unwrap();
    drop(wal);

    let records = read_all(&path).unwrap();
    assert_eq!(records.len(), 2, "read spans the rotated-out generation");
}

#[test]
fn reopen_survives_external_rotation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cs.wal");

    let mut wal = Wal::open(&path, u64::MAX).unwrap();
    wal.write(&vote_record(1, 10)).unwrap();

    // External rotator moves the file away and signals us.
    std::fs::rename(&path, dir.path().join("cs.wal.1")).unwrap();
    wal.reopen();
    wal.write(&vote_record(2, 20)).unwrap();
    drop(wal);

    let records = read_all(&path).unwrap();
    assert_eq!(records.len(), 1);
    assert!(matches!(
        &records[0].payload,
        WalPayload::Message(WalMessage::Vote(sv)) if sv.vote.height == 2
    ));
}

#[test]
fn crc32_matches_known_vector() {
    // IEEE 802.3 check value for "123456789".
    assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
}
