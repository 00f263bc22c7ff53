#![allow(missing_docs)]

use std::sync::atomic::Ordering;
use std::sync::Arc;

use dirstore::{
    storage::{
        index::vlv::{SearchScope, SortOrder, VlvIndexConfig, VlvResult, VlvResultCode},
        BackendOptions, CounterMetrics, EntryContainer, EntryRecord, IndexConfig, MemStorage,
        Modification, SortedSearch,
    },
    types::{Dn, EntryId, Result},
};

fn entry_id(raw: u64) -> EntryId {
    EntryId::new(raw).expect("valid entry id")
}

// Added in this order, so entry ids do not follow sort order.
const SURNAMES: [&str; 9] = [
    "Delta", "alpha", "India", "charlie", "golf", "Bravo", "hotel", "echo", "foxtrot",
];

fn dn(s: &str) -> Dn {
    Dn::parse(s).expect("valid dn")
}

fn people_search(order: &str) -> SortedSearch {
    SortedSearch {
        base_dn: dn("ou=people,dc=example"),
        scope: SearchScope::SingleLevel,
        sort_order: SortOrder::parse(order).expect("sort order"),
    }
}

fn populated(vlv_orders: &[&str], metrics: Arc<CounterMetrics>) -> Result<EntryContainer<MemStorage>> {
    let mut indexes = IndexConfig::default();
    for (n, order) in vlv_orders.iter().enumerate() {
        let search = people_search(order);
        indexes = indexes.vlv(VlvIndexConfig {
            name: format!("people{n}"),
            base_dn: search.base_dn,
            scope: search.scope,
            sort_order: search.sort_order,
        });
    }
    let container = EntryContainer::open(
        MemStorage::new(),
        dn("dc=example"),
        BackendOptions::new().id2count_shards(8).metrics(metrics),
        indexes,
    )?;
    let mut ctx = container.lock_context();
    container.add_entry(&mut ctx, EntryRecord::new(dn("dc=example")))?;
    container.add_entry(&mut ctx, EntryRecord::new(dn("ou=people,dc=example")))?;
    for (n, sn) in SURNAMES.iter().enumerate() {
        let entry = EntryRecord::new(dn(&format!("uid=u{n},ou=people,dc=example")))
            .with("sn", sn)
            .with("cn", &format!("user {n}"));
        container.add_entry(&mut ctx, entry)?;
    }
    // A grandchild that a single-level search must not see.
    container.add_entry(
        &mut ctx,
        EntryRecord::new(dn("cn=device,uid=u0,ou=people,dc=example")).with("sn", "aaa"),
    )?;
    Ok(container)
}

/// Entry id of the person whose surname is `sn`.
fn id_of(sn: &str) -> EntryId {
    let pos = SURNAMES
        .iter()
        .position(|s| s.eq_ignore_ascii_case(sn))
        .expect("known surname");
    // ids 1 and 2 belong to the base and ou=people.
    entry_id(pos as u64 + 3)
}

fn ids(names: &[&str]) -> Vec<EntryId> {
    names.iter().map(|n| id_of(n)).collect()
}

#[test]
fn offset_window_in_the_middle() -> Result<()> {
    let c = populated(&["sn"], Arc::default())?;
    let result = c.vlv_by_offset(&people_search("sn"), 3, 3, 7)?;
    assert_eq!(result.result_code, VlvResultCode::Success);
    assert_eq!(result.content_count, 9);
    assert_eq!(result.target_position, 7);
    assert_eq!(
        result.entries,
        ids(&["delta", "echo", "foxtrot", "golf", "hotel", "india"])
    );
    Ok(())
}

#[test]
fn offsets_at_and_beyond_the_edges() -> Result<()> {
    let c = populated(&["sn"], Arc::default())?;
    let search = people_search("sn");

    let first = c.vlv_by_offset(&search, 3, 3, 0)?;
    assert_eq!(first.target_position, 1);
    assert_eq!(first.entries, ids(&["alpha", "bravo", "charlie", "delta"]));

    let last = c.vlv_by_offset(&search, 1, 5, 9)?;
    assert_eq!(last.target_position, 9);
    assert_eq!(last.entries, ids(&["hotel", "india"]));

    let past = c.vlv_by_offset(&search, 3, 3, 20)?;
    assert_eq!(past.target_position, 10);
    assert_eq!(past.content_count, 9);
    assert_eq!(past.entries, ids(&["golf", "hotel", "india"]));

    let negative = c.vlv_by_offset(&search, 3, 3, -1)?;
    assert_eq!(negative.result_code, VlvResultCode::OffsetRangeError);
    assert!(negative.entries.is_empty());
    assert_eq!(negative.content_count, 9);
    Ok(())
}

#[test]
fn descending_order_reverses_the_list() -> Result<()> {
    let c = populated(&["-sn"], Arc::default())?;
    let result = c.vlv_by_offset(&people_search("-sn"), 0, 2, 1)?;
    assert_eq!(result.entries, ids(&["india", "hotel", "golf"]));
    Ok(())
}

#[test]
fn assertion_targets_first_value_at_or_after() -> Result<()> {
    let c = populated(&["sn"], Arc::default())?;
    let search = people_search("sn");

    let result = c.vlv_by_assertion(&search, 1, 1, "d")?;
    assert_eq!(result.target_position, 4);
    assert_eq!(result.entries, ids(&["charlie", "delta", "echo"]));

    let exact = c.vlv_by_assertion(&search, 0, 0, "GOLF")?;
    assert_eq!(exact.target_position, 7);
    assert_eq!(exact.entries, ids(&["golf"]));

    let beyond = c.vlv_by_assertion(&search, 1, 1, "zzz")?;
    assert_eq!(beyond.target_position, 10);
    assert_eq!(beyond.entries, ids(&["india"]));
    Ok(())
}

#[test]
fn unindexed_requests_match_indexed_ones() -> Result<()> {
    let indexed_metrics = Arc::new(CounterMetrics::default());
    let plain_metrics = Arc::new(CounterMetrics::default());
    let indexed = populated(&["sn", "-sn"], indexed_metrics.clone())?;
    let plain = populated(&[], plain_metrics.clone())?;

    let mut requests = 0;
    for order in ["sn", "-sn"] {
        let search = people_search(order);
        for offset in -1..=11i64 {
            for (before, after) in [(0, 0), (2, 1), (0, 9), (5, 5)] {
                let a: VlvResult = indexed.vlv_by_offset(&search, before, after, offset)?;
                let b = plain.vlv_by_offset(&search, before, after, offset)?;
                assert_eq!(a, b, "{order} offset={offset} before={before} after={after}");
                requests += 1;
            }
        }
        for assertion in ["", "b", "Charlie", "h", "zz"] {
            let a = indexed.vlv_by_assertion(&search, 1, 2, assertion)?;
            let b = plain.vlv_by_assertion(&search, 1, 2, assertion)?;
            assert_eq!(a, b, "{order} assertion={assertion}");
            requests += 1;
        }
    }
    assert_eq!(indexed_metrics.vlv_indexed.load(Ordering::Relaxed), requests);
    assert_eq!(indexed_metrics.vlv_unindexed.load(Ordering::Relaxed), 0);
    assert_eq!(plain_metrics.vlv_unindexed.load(Ordering::Relaxed), requests);
    Ok(())
}

#[test]
fn index_follows_modify_and_delete() -> Result<()> {
    let c = populated(&["sn"], Arc::default())?;
    let search = people_search("sn");
    let mut ctx = c.lock_context();

    let alpha = dn(&format!("uid=u{},ou=people,dc=example", id_of("alpha").get() - 3));
    c.modify_entry(
        &mut ctx,
        &alpha,
        &[Modification::Replace("sn".into(), vec!["zulu".into()])],
    )?;
    let tail = c.vlv_by_offset(&search, 0, 0, 9)?;
    assert_eq!(tail.entries, vec![id_of("alpha")]);
    let head = c.vlv_by_offset(&search, 0, 0, 1)?;
    assert_eq!(head.entries, ids(&["bravo"]));

    let bravo = dn(&format!("uid=u{},ou=people,dc=example", id_of("bravo").get() - 3));
    c.delete_entry(&mut ctx, &bravo)?;
    let after_delete = c.vlv_by_offset(&search, 0, 1, 1)?;
    assert_eq!(after_delete.content_count, 8);
    assert_eq!(after_delete.entries, ids(&["charlie", "delta"]));

    // A modification that leaves the sort value alone keeps the position.
    let golf = dn(&format!("uid=u{},ou=people,dc=example", id_of("golf").get() - 3));
    c.modify_entry(&mut ctx, &golf, &[Modification::Add("cn".into(), "extra".into())])?;
    let at_golf = c.vlv_by_assertion(&search, 0, 0, "golf")?;
    assert_eq!(at_golf.target_position, 5);
    assert_eq!(at_golf.entries, ids(&["golf"]));
    Ok(())
}

#[test]
fn entries_without_sort_value_sort_last_ascending() -> Result<()> {
    let c = populated(&["sn"], Arc::default())?;
    let mut ctx = c.lock_context();
    let anonymous = c.add_entry(
        &mut ctx,
        EntryRecord::new(dn("uid=anon,ou=people,dc=example")).with("cn", "nobody"),
    )?;
    let search = people_search("sn");
    let last = c.vlv_by_offset(&search, 0, 0, 10)?;
    assert_eq!(last.content_count, 10);
    assert_eq!(last.entries, vec![anonymous]);
    Ok(())
}
