#![allow(missing_docs)]

use std::collections::BTreeSet;

use dirstore::{
    storage::index::{EntryIdSet, UNDEFINED_SIZE},
    types::{EntryId, StoreError},
};
use proptest::prelude::*;

fn entry_id(raw: u64) -> EntryId {
    EntryId::new(raw).expect("valid entry id")
}

/// Mostly small ids so sets overlap, plus values across the whole 63-bit
/// range and at its top.
fn ids() -> impl Strategy<Value = Vec<u64>> {
    let max = EntryId::MAX.get();
    let id = prop_oneof![
        4 => 0u64..512,
        1 => 0u64..=max,
        1 => (max - 16)..=max,
    ];
    prop::collection::vec(id, 0..64)
}

fn defined(raw: &[u64]) -> EntryIdSet {
    EntryIdSet::new_defined_set(raw.iter().copied().map(entry_id))
}

fn model(raw: &[u64]) -> BTreeSet<u64> {
    raw.iter().copied().collect()
}

fn members(set: &EntryIdSet) -> Vec<u64> {
    set.iter().map(EntryId::get).collect()
}

proptest! {
    #[test]
    fn defined_sets_are_sorted_and_unique(raw in ids()) {
        let set = defined(&raw);
        let expected: Vec<u64> = model(&raw).into_iter().collect();
        prop_assert!(set.is_defined());
        prop_assert_eq!(set.size(), expected.len() as u64);
        prop_assert_eq!(members(&set), expected);
    }

    #[test]
    fn add_and_remove_track_a_btreeset(raw in ids(), ops in prop::collection::vec((any::<bool>(), 0u64..512), 0..64)) {
        let mut set = defined(&raw);
        let mut expected = model(&raw);
        for (insert, id) in ops {
            let changed = if insert {
                set.add(entry_id(id))
            } else {
                set.remove(entry_id(id))
            };
            let model_changed = if insert { expected.insert(id) } else { expected.remove(&id) };
            prop_assert_eq!(changed, model_changed);
            prop_assert_eq!(set.contains(entry_id(id)), expected.contains(&id));
        }
        prop_assert_eq!(members(&set), expected.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn bulk_operations_match_set_algebra(a in ids(), b in ids()) {
        let (ma, mb) = (model(&a), model(&b));

        let mut union = defined(&a);
        union.add_all(&defined(&b));
        prop_assert_eq!(members(&union), ma.union(&mb).copied().collect::<Vec<_>>());

        let mut difference = defined(&a);
        difference.remove_all(&defined(&b));
        prop_assert_eq!(members(&difference), ma.difference(&mb).copied().collect::<Vec<_>>());

        let mut intersection = defined(&a);
        intersection.retain_all(&defined(&b));
        prop_assert_eq!(members(&intersection), ma.intersection(&mb).copied().collect::<Vec<_>>());
    }

    #[test]
    fn union_of_many_matches_sequential_add_all(parts in prop::collection::vec(ids(), 0..6)) {
        let sets: Vec<EntryIdSet> = parts.iter().map(|p| defined(p)).collect();
        let merged = EntryIdSet::new_set_from_union(&sets);
        let mut sequential = EntryIdSet::empty();
        for set in &sets {
            sequential.add_all(set);
        }
        prop_assert_eq!(merged, sequential);
    }

    #[test]
    fn persisted_form_decodes_to_the_same_set(raw in ids(), limit in 0usize..80) {
        let mut set = defined(&raw);
        let degraded = set.apply_entry_limit(b"cn=x", limit);
        prop_assert_eq!(degraded, model(&raw).len() > limit);
        let bytes = set.to_byte_string();
        let back = EntryIdSet::new_set_from_bytes(b"cn=x", &bytes).unwrap();
        prop_assert_eq!(back.is_defined(), set.is_defined());
        prop_assert_eq!(back.size(), set.size());
        prop_assert_eq!(members(&back), members(&set));
    }

    #[test]
    fn iter_from_starts_at_first_member_not_below(raw in prop::collection::vec(0u64..512, 1..64), start in 0u64..600) {
        let set = defined(&raw);
        let expected = model(&raw);
        let got: Vec<u64> = set.iter_from(entry_id(start)).map(EntryId::get).collect();
        let tail: Vec<u64> = expected.range(start..).copied().collect();
        if tail.is_empty() {
            // Past the largest member the iterator starts over.
            prop_assert_eq!(got, expected.into_iter().collect::<Vec<_>>());
        } else {
            prop_assert_eq!(got, tail);
        }
    }

    #[test]
    fn undefined_sets_absorb_operations(raw in ids(), size in 0u64..1_000) {
        let other = defined(&raw);
        let mut set = EntryIdSet::new_undefined_set_with_size(Some(&b"sn=x"[..]), size);
        set.add_all(&other);
        prop_assert!(!set.is_defined());
        prop_assert_eq!(set.size(), size + other.size());
        prop_assert!(set.contains(entry_id(size)));
        prop_assert_eq!(set.iter().len(), 0);

        // Intersecting with something concrete becomes concrete.
        set.retain_all(&other);
        prop_assert!(set.is_defined());
        prop_assert_eq!(set, other);
    }
}

#[test]
fn unknown_size_saturates() {
    let mut set = EntryIdSet::new_undefined_set();
    assert_eq!(set.size(), UNDEFINED_SIZE);
    set.add(entry_id(1));
    set.remove(entry_id(2));
    assert_eq!(set.size(), UNDEFINED_SIZE);

    let mut defined = EntryIdSet::new_defined_set([entry_id(1), entry_id(2)]);
    defined.add_all(&set);
    assert!(!defined.is_defined());
    assert_eq!(defined.size(), UNDEFINED_SIZE);
}

#[test]
fn malformed_persisted_forms_are_corruption() {
    let descending: [u8; 16] = [0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 1];
    assert!(EntryIdSet::new_set_from_bytes(b"k", &descending).is_err());
    assert!(EntryIdSet::new_set_from_bytes(b"k", &[0, 0, 0]).is_err());
    assert!(EntryIdSet::new_set_from_bytes(b"k", &[0x80, 0, 0, 0, 0, 0, 0, 1, 0]).is_err());
    assert!(EntryIdSet::new_set_from_bytes(b"k", &[]).unwrap().is_empty());
}

#[test]
fn ids_beyond_63_bits_cannot_enter_a_set() {
    assert!(matches!(EntryId::new(1 << 63), Err(StoreError::Invalid(_))));
    let top = EntryIdSet::new_defined_set([EntryId::MAX, entry_id(1)]);
    let back = EntryIdSet::new_set_from_bytes(b"k", &top.to_byte_string()).unwrap();
    assert!(back.is_defined());
    assert_eq!(back, top);
    assert_eq!(back.to_vec(), vec![entry_id(1), EntryId::MAX]);
}

#[test]
fn display_forms() {
    let set = EntryIdSet::new_defined_set([entry_id(3), entry_id(1)]);
    assert_eq!(set.to_string(), "[1,3]");
    assert_eq!(EntryIdSet::new_undefined_set().to_string(), "[NOT-INDEXED]");
    let limited = EntryIdSet::new_undefined_set_with_size(Some(&b"ab"[..]), 5);
    assert_eq!(limited.to_string(), "[LIMIT-EXCEEDED:6162] COUNT: 5");
}
