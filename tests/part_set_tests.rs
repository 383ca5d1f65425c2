use lockstep::types::part_set::{PartSet, PartSetError, BLOCK_PART_SIZE};

const NO_LIMIT: u64 = u64::MAX;

#[test]
fn single_part_roundtrip() {
    let data = b"small block".to_vec();
    let built = PartSet::from_bytes(&data);
    assert_eq!(built.total(), 1);
    assert!(built.is_complete());
    assert_eq!(built.assemble().unwrap(), data);
}

#[test]
fn multi_part_transfer_and_reassembly() {
    let data = vec![0xAB; BLOCK_PART_SIZE * 2 + 100]; // 3 parts
    let built = PartSet::from_bytes(&data);
    assert_eq!(built.total(), 3);

    let mut receiver = PartSet::from_header(built.header());
    assert!(!receiver.is_complete());
    assert_eq!(receiver.missing(), vec![0, 1, 2]);

    // Out-of-order delivery is fine.
    for index in [2u32, 0, 1] {
        let part = built.part(index).unwrap().clone();
        assert!(receiver.add_part(part, NO_LIMIT).unwrap());
    }
    assert!(receiver.is_complete());
    assert_eq!(receiver.assemble().unwrap(), data);
}

#[test]
fn duplicate_part_is_ignored() {
    let data = vec![1u8; BLOCK_PART_SIZE + 1];
    let built = PartSet::from_bytes(&data);
    let mut receiver = PartSet::from_header(built.header());

    let part = built.part(0).unwrap().clone();
    assert!(receiver.add_part(part.clone(), NO_LIMIT).unwrap());
    assert!(!receiver.add_part(part, NO_LIMIT).unwrap());
    assert_eq!(receiver.count(), 1);
}

#[test]
fn tampered_part_fails_the_merkle_check() {
    let data = vec![7u8; BLOCK_PART_SIZE * 2];
    let built = PartSet::from_bytes(&data);
    let mut receiver = PartSet::from_header(built.header());

    let mut part = built.part(0).unwrap().clone();
    part.bytes[0] ^= 0xFF;
    assert_eq!(
        receiver.add_part(part, NO_LIMIT).unwrap_err(),
        PartSetError::BadProof
    );
    assert_eq!(receiver.count(), 0);
}

#[test]
fn proof_from_another_set_is_rejected() {
    let a = PartSet::from_bytes(&vec![1u8; BLOCK_PART_SIZE * 2]);
    let b = PartSet::from_bytes(&vec![2u8; BLOCK_PART_SIZE * 2]);

    let mut receiver = PartSet::from_header(a.header());
    let foreign = b.part(0).unwrap().clone();
    assert_eq!(
        receiver.add_part(foreign, NO_LIMIT).unwrap_err(),
        PartSetError::BadProof
    );
}

#[test]
fn out_of_range_index_is_rejected() {
    let built = PartSet::from_bytes(b"data");
    let mut receiver = PartSet::from_header(built.header());
    let mut part = built.part(0).unwrap().clone();
    part.index = 5;
    assert!(matches!(
        receiver.add_part(part, NO_LIMIT).unwrap_err(),
        PartSetError::IndexOutOfRange { index: 5, .. }
    ));
}

#[test]
fn parts_beyond_max_bytes_are_refused() {
    let data = vec![0u8; BLOCK_PART_SIZE + 10];
    let built = PartSet::from_bytes(&data);
    let mut receiver = PartSet::from_header(built.header());

    let first = built.part(0).unwrap().clone();
    assert!(receiver.add_part(first, data.len() as u64).unwrap());

    // The second part would push past the limit.
    let second = built.part(1).unwrap().clone();
    assert!(matches!(
        receiver.add_part(second, (BLOCK_PART_SIZE + 5) as u64).unwrap_err(),
        PartSetError::TooLarge { .. }
    ));
    assert!(!receiver.is_complete());
}

#[test]
fn assemble_refuses_incomplete_sets() {
    let built = PartSet::from_bytes(&vec![0u8; BLOCK_PART_SIZE * 2]);
    let receiver = PartSet::from_header(built.header());
    assert_eq!(receiver.assemble().unwrap_err(), PartSetError::Incomplete);
}

#[test]
fn empty_block_bytes_still_produce_one_part() {
    let built = PartSet::from_bytes(b"");
    assert_eq!(built.total(), 1);
    assert_eq!(built.assemble().unwrap(), Vec::<u8>::new());
}
