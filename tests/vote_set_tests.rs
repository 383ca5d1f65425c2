use lockstep::consensus::vote_set::{AddVoteResult, HeightVoteSet, VoteSet, VoteSetError};
use lockstep::types::{
    BlockId, Hash, PartSetHeader, SignedVote, Validator, ValidatorId, ValidatorSet, Vote, VoteType,
};

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

fn bid(seed: u8) -> BlockId {
    BlockId {
        hash: Hash([seed; 32]),
        parts: PartSetHeader {
            total: 1,
            hash: Hash([seed; 32]),
        },
    }
}

fn vote(
    vote_type: VoteType,
    height: u64,
    round: u32,
    block_id: Option<BlockId>,
    index: u32,
) -> SignedVote {
    SignedVote {
        vote: Vote {
            vote_type,
            height,
            round,
            block_id,
            timestamp_ms: 0,
            validator: make_id(index as u8 + 1),
            validator_index: index,
        },
        signature: [0u8; 64],
    }
}

#[test]
fn polka_requires_more_than_two_thirds() {
    let vs = vset(&[1, 1, 1, 1]); // threshold is 3
    let mut set = VoteSet::new(1, 0, VoteType::Prevote, &vs);

    set.add_vote(&vs, vote(VoteType::Prevote, 1, 0, Some(bid(7)), 0))
        .unwrap();
    set.add_vote(&vs, vote(VoteType::Prevote, 1, 0, Some(bid(7)), 1))
        .unwrap();
    assert_eq!(set.two_thirds_majority(), None, "2/4 is not a polka");

    set.add_vote(&vs, vote(VoteType::Prevote, 1, 0, Some(bid(7)), 2))
        .unwrap();
    assert_eq!(set.two_thirds_majority(), Some(Some(bid(7))));
}

#[test]
fn nil_polka_is_a_majority_for_nothing() {
    let vs = vset(&[1, 1, 1]);
    let mut set = VoteSet::new(1, 0, VoteType::Prevote, &vs);
    for i in 0..3 {
        set.add_vote(&vs, vote(VoteType::Prevote, 1, 0, None, i))
            .unwrap();
    }
    assert_eq!(set.two_thirds_majority(), Some(None));
}

#[test]
fn two_thirds_any_without_single_majority() {
    let vs = vset(&[1, 1, 1, 1]);
    let mut set = VoteSet::new(1, 0, VoteType::Prevote, &vs);
    set.add_vote(&vs, vote(VoteType::Prevote, 1, 0, Some(bid(1)), 0))
        .unwrap();
    set.add_vote(&vs, vote(VoteType::Prevote, 1, 0, Some(bid(2)), 1))
        .unwrap();
    set.add_vote(&vs, vote(VoteType::Prevote, 1, 0, None, 2))
        .unwrap();

    assert!(set.has_two_thirds_any());
    assert_eq!(set.two_thirds_majority(), None);
}

#[test]
fn duplicate_vote_is_flagged_and_not_double_counted() {
    let vs = vset(&[1, 1, 1, 1]);
    let mut set = VoteSet::new(1, 0, VoteType::Prevote, &vs);
    let v = vote(VoteType::Prevote, 1, 0, Some(bid(7)), 0);
    assert!(matches!(
        set.add_vote(&vs, v.clone()).unwrap(),
        AddVoteResult::Added
    ));
    assert!(matches!(
        set.add_vote(&vs, v).unwrap(),
        AddVoteResult::Duplicate
    ));
    assert_eq!(set.power_for(&Some(bid(7))), 1);
    assert_eq!(set.power_voted(), 1);
}

#[test]
fn conflicting_votes_keep_both_tallies() {
    let vs = vset(&[1, 1, 1]);
    let mut set = VoteSet::new(1, 0, VoteType::Prevote, &vs);
    set.add_vote(&vs, vote(VoteType::Prevote, 1, 0, Some(bid(1)), 0))
        .unwrap();
    let result = set
        .add_vote(&vs, vote(VoteType::Prevote, 1, 0, Some(bid(2)), 0))
        .unwrap();

    let AddVoteResult::Conflicting(evidence) = result else {
        panic!("expected conflicting result");
    };
    assert_eq!(evidence.vote_a.vote.block_id, Some(bid(1)));
    assert_eq!(evidence.vote_b.vote.block_id, Some(bid(2)));

    // Both tallies stand: the equivocator contributes to both blocks.
    assert_eq!(set.power_for(&Some(bid(1))), 1);
    assert_eq!(set.power_for(&Some(bid(2))), 1);
    // Distinct voter power counts the validator once.
    assert_eq!(set.power_voted(), 1);
}

#[test]
fn equivocating_majorities_on_two_blocks_are_observable() {
    // The safety-violation signature: enough equivocating power that two
    // different blocks both reach +2/3.
    let vs = vset(&[1, 1, 1]);
    let mut set = VoteSet::new(1, 0, VoteType::Prevote, &vs);
    for i in 0..3 {
        set.add_vote(&vs, vote(VoteType::Prevote, 1, 0, Some(bid(1)), i))
            .unwrap();
    }
    for i in 0..3 {
        let _ = set.add_vote(&vs, vote(VoteType::Prevote, 1, 0, Some(bid(2)), i));
    }
    assert!(set.power_for(&Some(bid(1))) >= 3);
    assert!(set.power_for(&Some(bid(2))) >= 3);
    // First observed majority wins.
    assert_eq!(set.two_thirds_majority(), Some(Some(bid(1))));
}

#[test]
fn wrong_height_round_type_and_index_are_rejected() {
    let vs = vset(&[1, 1]);
    let mut set = VoteSet::new(5, 2, VoteType::Precommit, &vs);

    assert!(matches!(
        set.add_vote(&vs, vote(VoteType::Precommit, 4, 2, None, 0)),
        Err(VoteSetError::HeightMismatch { .. })
    ));
    assert!(matches!(
        set.add_vote(&vs, vote(VoteType::Precommit, 5, 1, None, 0)),
        Err(VoteSetError::RoundMismatch { .. })
    ));
    assert!(matches!(
        set.add_vote(&vs, vote(VoteType::Prevote, 5, 2, None, 0)),
        Err(VoteSetError::TypeMismatch)
    ));
    assert!(matches!(
        set.add_vote(&vs, vote(VoteType::Precommit, 5, 2, None, 9)),
        Err(VoteSetError::IndexOutOfRange(9))
    ));

    // Address not matching the claimed index.
    let mut bad = vote(VoteType::Precommit, 5, 2, None, 0);
    bad.vote.validator = make_id(99);
    assert!(matches!(
        set.add_vote(&vs, bad),
        Err(VoteSetError::AddressMismatch(0))
    ));
}

#[test]
fn weighted_powers_decide_the_majority() {
    let vs = vset(&[5, 1, 1]); // threshold is 5
    let mut set = VoteSet::new(1, 0, VoteType::Precommit, &vs);

    set.add_vote(&vs, vote(VoteType::Precommit, 1, 0, Some(bid(3)), 1))
        .unwrap();
    set.add_vote(&vs, vote(VoteType::Precommit, 1, 0, Some(bid(3)), 2))
        .unwrap();
    assert_eq!(set.two_thirds_majority(), None, "2/7 power is not enough");

    set.add_vote(&vs, vote(VoteType::Precommit, 1, 0, Some(bid(3)), 0))
        .unwrap();
    assert_eq!(set.two_thirds_majority(), Some(Some(bid(3))));
}

#[test]
fn make_commit_collects_the_majority_votes() {
    let vs = vset(&[1, 1, 1, 1]);
    let mut set = VoteSet::new(3, 1, VoteType::Precommit, &vs);
    for i in 0..3 {
        set.add_vote(&vs, vote(VoteType::Precommit, 3, 1, Some(bid(9)), i))
            .unwrap();
    }
    set.add_vote(&vs, vote(VoteType::Precommit, 3, 1, None, 3))
        .unwrap();

    let commit = set.make_commit().expect("majority exists");
    assert_eq!(commit.height, 3);
    assert_eq!(commit.round, 1);
    assert_eq!(commit.block_id, bid(9));
    assert_eq!(commit.votes.len(), 3, "nil vote is not part of the certificate");
}

#[test]
fn make_commit_is_none_without_majority_or_for_prevotes() {
    let vs = vset(&[1, 1, 1]);
    let mut precommits = VoteSet::new(1, 0, VoteType::Precommit, &vs);
    precommits
        .add_vote(&vs, vote(VoteType::Precommit, 1, 0, Some(bid(1)), 0))
        .unwrap();
    assert!(precommits.make_commit().is_none());

    let mut prevotes = VoteSet::new(1, 0, VoteType::Prevote, &vs);
    for i in 0..3 {
        prevotes
            .add_vote(&vs, vote(VoteType::Prevote, 1, 0, Some(bid(1)), i))
            .unwrap();
    }
    assert!(prevotes.make_commit().is_none());
}

#[test]
fn height_vote_set_routes_by_round_and_type() {
    let vs = vset(&[1, 1, 1, 1]);
    let mut hvs = HeightVoteSet::new(1, vs);

    hvs.add_vote(vote(VoteType::Prevote, 1, 0, Some(bid(1)), 0))
        .unwrap();
    hvs.add_vote(vote(VoteType::Precommit, 1, 0, Some(bid(1)), 0))
        .unwrap();
    hvs.add_vote(vote(VoteType::Prevote, 1, 2, None, 1)).unwrap();

    assert_eq!(hvs.prevotes(0).unwrap().len(), 1);
    assert_eq!(hvs.precommits(0).unwrap().len(), 1);
    assert_eq!(hvs.prevotes(2).unwrap().len(), 1);
    assert!(hvs.prevotes(1).is_none());
    assert_eq!(hvs.precommit_rounds(), vec![0]);
}

#[test]
fn power_at_round_counts_validators_once_across_types() {
    let vs = vset(&[1, 1, 1, 1]);
    let mut hvs = HeightVoteSet::new(1, vs);

    // Validator 0 votes both types at round 3; validator 1 prevotes only.
    hvs.add_vote(vote(VoteType::Prevote, 1, 3, None, 0)).unwrap();
    hvs.add_vote(vote(VoteType::Precommit, 1, 3, None, 0))
        .unwrap();
    hvs.add_vote(vote(VoteType::Prevote, 1, 3, None, 1)).unwrap();

    assert_eq!(hvs.power_at_round(3), 2);
    assert_eq!(hvs.one_third_threshold(), 2);
}
