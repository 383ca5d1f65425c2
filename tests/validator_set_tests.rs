use lockstep::types::{Validator, ValidatorId, ValidatorSet, ValidatorSetError, ValidatorUpdate};

fn make_id(seed: u8) -> ValidatorId {
    ValidatorId([seed; 32])
}

fn vset(powers: &[u64]) -> ValidatorSet {
    let validators = powers
        .iter()
        .enumerate()
        .map(|(i, p)| Validator {
            id: make_id(i as u8 + 1),
            voting_power: *p,
            proposer_priority: 0,
        })
        .collect();
    ValidatorSet::new(validators).unwrap()
}

#[test]
fn empty_set_is_rejected() {
    assert!(matches!(
        ValidatorSet::new(vec![]),
        Err(ValidatorSetError::Empty)
    ));
}

#[test]
fn zero_total_power_is_rejected() {
    let validators = vec![Validator {
        id: make_id(1),
        voting_power: 0,
        proposer_priority: 0,
    }];
    assert!(matches!(
        ValidatorSet::new(validators),
        Err(ValidatorSetError::ZeroPower)
    ));
}

#[test]
fn indices_are_stable_and_sorted_by_address() {
    // Construct out of order; the table sorts by id.
    let validators = vec![
        Validator {
            id: make_id(9),
            voting_power: 1,
            proposer_priority: 0,
        },
        Validator {
            id: make_id(2),
            voting_power: 1,
            proposer_priority: 0,
        },
    ];
    let vs = ValidatorSet::new(validators).unwrap();
    assert_eq!(vs.index_of(&make_id(2)), Some(0));
    assert_eq!(vs.index_of(&make_id(9)), Some(1));
    assert_eq!(vs.by_index(0).unwrap().id, make_id(2));
    assert_eq!(vs.index_of(&make_id(5)), None);
}

#[test]
fn quorum_thresholds_are_strict_fractions() {
    // total 4: > 2/3 means >= 3; > 1/3 means >= 2
    let vs = vset(&[1, 1, 1, 1]);
    assert_eq!(vs.two_thirds_threshold(), 3);
    assert_eq!(vs.one_third_threshold(), 2);

    // total 3: > 2/3 means >= 3 (2 of 3 is exactly 2/3, not more)
    let vs = vset(&[1, 1, 1]);
    assert_eq!(vs.two_thirds_threshold(), 3);
    assert_eq!(vs.one_third_threshold(), 2);

    // weighted
    let vs = vset(&[6, 3, 1]); // total 10
    assert_eq!(vs.two_thirds_threshold(), 7);
    assert_eq!(vs.one_third_threshold(), 4);
}

#[test]
fn apply_updates_changes_power_adds_and_removes() {
    let vs = vset(&[1, 1, 1]);
    let next = vs
        .apply_updates(&[
            ValidatorUpdate {
                id: make_id(1),
                voting_power: 5,
            },
            ValidatorUpdate {
                id: make_id(2),
                voting_power: 0,
            },
            ValidatorUpdate {
                id: make_id(7),
                voting_power: 2,
            },
        ])
        .unwrap();

    assert_eq!(next.len(), 3);
    assert_eq!(next.voting_power(&make_id(1)), 5);
    assert!(!next.contains(&make_id(2)));
    assert_eq!(next.voting_power(&make_id(7)), 2);
    assert_eq!(next.total_power(), 8);
}

#[test]
fn removing_unknown_validator_is_an_error() {
    let vs = vset(&[1, 1]);
    assert!(matches!(
        vs.apply_updates(&[ValidatorUpdate {
            id: make_id(42),
            voting_power: 0,
        }]),
        Err(ValidatorSetError::UnknownRemoval)
    ));
}

#[test]
fn removing_everyone_is_an_error() {
    let vs = vset(&[1]);
    assert!(matches!(
        vs.apply_updates(&[ValidatorUpdate {
            id: make_id(1),
            voting_power: 0,
        }]),
        Err(ValidatorSetError::Empty)
    ));
}

#[test]
fn set_hash_tracks_membership_and_power() {
    let a = vset(&[1, 1]);
    let b = vset(&[1, 2]);
    let c = vset(&[1, 1, 1]);
    assert_ne!(a.set_hash(), b.set_hash());
    assert_ne!(a.set_hash(), c.set_hash());
    assert_eq!(a.set_hash(), vset(&[1, 1]).set_hash());
}

#[test]
fn updates_do_not_mutate_the_original_set() {
    let vs = vset(&[1, 1]);
    let _ = vs
        .apply_updates(&[ValidatorUpdate {
            id: make_id(1),
            voting_power: 9,
        }])
        .unwrap();
    assert_eq!(vs.voting_power(&make_id(1)), 1);
}
