#![allow(missing_docs)]

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dirstore::{
    storage::{
        index::vlv::{SearchScope, SortOrder, VlvIndexConfig},
        BackendOptions, CounterMetrics, EntryContainer, EntryRecord, IndexConfig, MemStorage,
        Modification, SortedSearch,
    },
    types::{Dn, EntryId, Result, StoreError},
};

fn entry_id(raw: u64) -> EntryId {
    EntryId::new(raw).expect("valid entry id")
}

fn dn(s: &str) -> Dn {
    Dn::parse(s).expect("valid dn")
}

fn people_vlv() -> VlvIndexConfig {
    VlvIndexConfig {
        name: "people-by-sn".into(),
        base_dn: dn("ou=people,dc=example"),
        scope: SearchScope::SingleLevel,
        sort_order: SortOrder::parse("sn").expect("sort order"),
    }
}

fn open(options: BackendOptions) -> Result<EntryContainer<MemStorage>> {
    EntryContainer::open(
        MemStorage::new(),
        dn("dc=example"),
        options.id2count_shards(16),
        IndexConfig::default()
            .equality("objectClass")
            .equality("mail")
            .vlv(people_vlv()),
    )
}

fn with_base(container: &EntryContainer<MemStorage>) -> Result<()> {
    let mut ctx = container.lock_context();
    container.add_entry(&mut ctx, EntryRecord::new(dn("dc=example")))?;
    container.add_entry(
        &mut ctx,
        EntryRecord::new(dn("ou=people,dc=example")).with("objectClass", "organizationalUnit"),
    )?;
    Ok(())
}

fn person(n: usize) -> EntryRecord {
    EntryRecord::new(dn(&format!("uid=p{n},ou=people,dc=example")))
        .with("objectClass", "person")
        .with("sn", &format!("sn{n:04}"))
        .with("mail", &format!("p{n}@example.com"))
}

#[test]
fn concurrent_adds_under_one_parent() -> Result<()> {
    let container = Arc::new(open(BackendOptions::new())?);
    with_base(&container)?;
    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let container = Arc::clone(&container);
            thread::spawn(move || -> Result<Vec<EntryId>> {
                let mut ctx = container.lock_context();
                (0..25)
                    .map(|i| container.add_entry(&mut ctx, person(worker * 100 + i)))
                    .collect()
            })
        })
        .collect();
    let mut ids = Vec::new();
    for handle in handles {
        ids.extend(handle.join().expect("worker panicked")?);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 100);

    assert_eq!(container.number_of_children(&dn("ou=people,dc=example"))?, 100);
    assert_eq!(container.number_of_children(&dn("dc=example"))?, 1);
    assert_eq!(container.number_of_entries()?, 102);
    let people = container.search_equality("objectclass", "PERSON")?;
    assert_eq!(people.size(), 100);
    let search = SortedSearch {
        base_dn: dn("ou=people,dc=example"),
        scope: SearchScope::SingleLevel,
        sort_order: SortOrder::parse("sn").expect("sort order"),
    };
    assert_eq!(container.vlv_by_offset(&search, 0, 0, 1)?.content_count, 100);
    assert_eq!(container.lock_manager().table_len(), 0);
    Ok(())
}

#[test]
fn equality_index_degrades_past_entry_limit() -> Result<()> {
    let metrics = Arc::new(CounterMetrics::default());
    let container = open(BackendOptions::new().index_entry_limit(5).metrics(metrics.clone()))?;
    with_base(&container)?;
    let mut ctx = container.lock_context();
    for n in 0..8 {
        container.add_entry(&mut ctx, person(n))?;
    }
    let persons = container.search_equality("objectClass", "person")?;
    assert!(!persons.is_defined());
    assert_eq!(persons.size(), 8);
    assert_eq!(metrics.degraded_entries.load(Ordering::Relaxed), 1);

    let one = container.search_equality("mail", "p3@example.com")?;
    assert!(one.is_defined());
    assert_eq!(one.size(), 1);

    let unindexed = container.search_equality("sn", "sn0003")?;
    assert!(!unindexed.is_defined());
    Ok(())
}

#[test]
fn modify_moves_equality_postings() -> Result<()> {
    let container = open(BackendOptions::new())?;
    with_base(&container)?;
    let mut ctx = container.lock_context();
    let id = container.add_entry(&mut ctx, person(1))?;
    let target = dn("uid=p1,ou=people,dc=example");
    container.modify_entry(
        &mut ctx,
        &target,
        &[
            Modification::Delete("mail".into(), Some("P1@example.com".into())),
            Modification::Add("mail".into(), "first@example.com".into()),
        ],
    )?;
    assert!(container.search_equality("mail", "p1@example.com")?.is_empty());
    assert!(container
        .search_equality("mail", "first@example.com")?
        .contains(id));
    let entry = container.get_entry(&mut ctx, &target)?.expect("entry");
    assert_eq!(entry.values("mail"), &["first@example.com".to_string()]);

    assert!(matches!(
        container.modify_entry(&mut ctx, &dn("uid=nobody,ou=people,dc=example"), &[]),
        Err(StoreError::NoSuchEntry(_))
    ));
    Ok(())
}

#[test]
fn delete_rules_and_subtree_removal() -> Result<()> {
    let container = open(BackendOptions::new())?;
    with_base(&container)?;
    let mut ctx = container.lock_context();
    for n in 0..3 {
        container.add_entry(&mut ctx, person(n))?;
    }
    container.add_entry(
        &mut ctx,
        EntryRecord::new(dn("cn=phone,uid=p0,ou=people,dc=example")).with("objectClass", "device"),
    )?;

    let people = dn("ou=people,dc=example");
    assert!(matches!(
        container.delete_entry(&mut ctx, &people),
        Err(StoreError::NotAllowedOnNonLeaf(_))
    ));
    container.delete_entry(&mut ctx, &dn("uid=p2,ou=people,dc=example"))?;
    assert_eq!(container.number_of_children(&people)?, 2);
    assert_eq!(container.number_of_entries()?, 5);

    assert_eq!(container.delete_subtree(&mut ctx, &people)?, 4);
    assert_eq!(container.number_of_entries()?, 1);
    assert_eq!(container.number_of_children(&dn("dc=example"))?, 0);
    assert!(container.get_entry(&mut ctx, &people)?.is_none());
    assert!(container.search_equality("objectClass", "person")?.is_empty());
    assert!(matches!(
        container.delete_subtree(&mut ctx, &people),
        Err(StoreError::NoSuchEntry(_))
    ));
    Ok(())
}

#[test]
fn busy_entry_rejects_writers_after_timeout() -> Result<()> {
    let container = open(BackendOptions::new().lock_timeout(Duration::from_millis(20)))?;
    with_base(&container)?;
    let people = dn("ou=people,dc=example");
    let mut holder = container.lock_context();
    let _subtree = container
        .lock_manager()
        .try_write_lock_subtree(&mut holder, &people)
        .expect("subtree lock");

    let mut ctx = container.lock_context();
    assert!(matches!(
        container.add_entry(&mut ctx, person(1)),
        Err(StoreError::Busy(_))
    ));
    assert!(matches!(
        container.get_entry(&mut ctx, &people),
        Err(StoreError::Busy(_))
    ));
    // Entries outside the locked subtree stay available.
    container.add_entry(&mut ctx, EntryRecord::new(dn("ou=groups,dc=example")))?;
    Ok(())
}

#[test]
fn import_then_continue_online() -> Result<()> {
    let container = open(BackendOptions::new().index_entry_limit(50))?;
    let mut entries = vec![
        EntryRecord::new(dn("dc=example")),
        EntryRecord::new(dn("ou=people,dc=example")),
    ];
    entries.extend((0..60).rev().map(person));
    assert_eq!(container.import_entries(entries)?, 62);

    assert_eq!(container.number_of_entries()?, 62);
    assert_eq!(container.number_of_children(&dn("ou=people,dc=example"))?, 60);
    assert!(!container.search_equality("objectClass", "person")?.is_defined());
    assert_eq!(container.search_equality("mail", "p7@example.com")?.size(), 1);

    let search = SortedSearch {
        base_dn: dn("ou=people,dc=example"),
        scope: SearchScope::SingleLevel,
        sort_order: SortOrder::parse("sn").expect("sort order"),
    };
    let first = container.vlv_by_offset(&search, 0, 1, 1)?;
    assert_eq!(first.content_count, 60);
    // Imported in reverse, so p0 received the highest id.
    assert_eq!(first.entries, vec![entry_id(62), entry_id(61)]);

    let mut ctx = container.lock_context();
    let next = container.add_entry(&mut ctx, person(60))?;
    assert_eq!(next, entry_id(63));
    assert_eq!(container.number_of_entries()?, 63);
    Ok(())
}

#[test]
fn import_requires_parents_first() -> Result<()> {
    let container = open(BackendOptions::new())?;
    let entries = vec![EntryRecord::new(dn("dc=example")), person(1)];
    assert!(matches!(
        container.import_entries(entries),
        Err(StoreError::NoSuchEntry(_))
    ));
    Ok(())
}
