use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nativestore::index::Record;
use nativestore::journal;
use nativestore::triple_store::Mutations;
use nativestore::{
    ConnectionState, Contexts, Inferred, LockKind, NativeStore, Statement, StoreChange,
    StoreConfig, StoreError, StoreListener, Term,
};
use tempfile::tempdir;

fn ex(local: &str) -> Term {
    Term::iri(format!("http://example.org/{local}"))
}

fn open_store(dir: &Path, indexes: &str) -> NativeStore {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = NativeStore::with_data_dir(dir);
    store.set_triple_indexes(indexes).expect("set indexes");
    store.initialize().expect("initialize store");
    store
}

fn all_statements(store: &NativeStore) -> BTreeSet<Statement> {
    let conn = store.connection().expect("connection");
    conn.get_statements(None, None, None, Inferred::Include, &Contexts::All)
        .expect("scan")
        .collect::<nativestore::Result<_>>()
        .expect("decode")
}

fn entries(dir: &Path) -> BTreeSet<String> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

#[test]
fn lifecycle_is_enforced() {
    let dir = tempdir().unwrap();
    let store = NativeStore::with_data_dir(dir.path().join("db"));
    assert!(!store.is_initialized());
    assert!(matches!(
        store.connection(),
        Err(StoreError::IllegalState(_))
    ));
    // shutting down an unopened store changes nothing
    store.shut_down().unwrap();
    assert!(!store.is_initialized());

    store.initialize().unwrap();
    assert!(store.is_initialized());
    assert!(matches!(
        store.initialize(),
        Err(StoreError::IllegalState(_))
    ));
    assert!(matches!(
        store.set_triple_indexes("posc"),
        Err(StoreError::Configuration(_))
    ));
    assert!(matches!(
        store.set_track_locks(true),
        Err(StoreError::Configuration(_))
    ));

    store.shut_down().unwrap();
    store.shut_down().unwrap();
    assert!(!store.is_initialized());
    assert!(matches!(
        store.connection(),
        Err(StoreError::IllegalState(_))
    ));
    assert!(matches!(
        store.initialize(),
        Err(StoreError::IllegalState(_))
    ));
}

#[test]
fn invalid_index_configuration_is_rejected() {
    let dir = tempdir().unwrap();
    let store = NativeStore::with_data_dir(dir.path());
    assert!(matches!(
        store.set_triple_indexes("spoc,spoz"),
        Err(StoreError::Configuration(_))
    ));
    assert!(matches!(
        store.set_triple_indexes(""),
        Err(StoreError::Configuration(_))
    ));
    assert_eq!(store.config().unwrap().triple_indexes, "spoc");
}

#[test]
fn oversized_lock_timeout_saturates() {
    let dir = tempdir().unwrap();
    let store = NativeStore::with_data_dir(dir.path());
    store.set_lock_timeout(Some(Duration::MAX)).unwrap();
    assert_eq!(store.config().unwrap().lock_timeout_ms, Some(u64::MAX));
    store
        .set_lock_timeout(Some(Duration::from_millis(1500)))
        .unwrap();
    assert_eq!(store.config().unwrap().lock_timeout_ms, Some(1500));
    store.set_lock_timeout(None).unwrap();
    assert_eq!(store.config().unwrap().lock_timeout_ms, None);
}

#[test]
fn second_instance_cannot_open_the_same_directory() {
    let dir = tempdir().unwrap();
    let first = open_store(dir.path(), "spoc");
    let second = NativeStore::with_data_dir(dir.path());
    match second.initialize() {
        Err(StoreError::DirectoryLocked { path, .. }) => assert_eq!(path, dir.path()),
        other => panic!("expected DirectoryLocked, got {other:?}"),
    }
    // a failed attempt leaves the holder's files alone
    assert!(dir.path().join("lock").exists());
    assert!(dir.path().join("values.dat").exists());
    second.shut_down().unwrap();

    first.shut_down().unwrap();
    second.initialize().unwrap();
    assert!(second.is_initialized());
}

#[test]
fn failed_initialize_removes_what_it_created() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("values.dat"), b"GARBAGE!garbage").unwrap();

    let store = NativeStore::with_data_dir(dir.path());
    assert!(matches!(
        store.initialize(),
        Err(StoreError::Corruption(_))
    ));
    assert!(!store.is_initialized());
    assert_eq!(entries(dir.path()), BTreeSet::from(["values.dat".to_string()]));
    store.shut_down().unwrap();
}

#[test]
fn data_dir_that_is_a_file_is_rejected() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("file");
    fs::write(&blocker, b"not a directory").unwrap();

    let store = NativeStore::with_data_dir(&blocker);
    assert!(matches!(
        store.initialize(),
        Err(StoreError::Configuration(_))
    ));
    assert_eq!(entries(dir.path()), BTreeSet::from(["file".to_string()]));
}

#[test]
fn data_survives_reopen() {
    let dir = tempdir().unwrap();
    let expected = {
        let store = open_store(dir.path(), "spoc,posc");
        let mut conn = store.connection().unwrap();
        conn.add_statement(&ex("s"), &ex("p"), &Term::literal("plain"), &Contexts::All)
            .unwrap();
        conn.add_statement(
            &ex("s"),
            &ex("p"),
            &Term::lang_literal("bonjour", "fr"),
            &Contexts::named(ex("g")),
        )
        .unwrap();
        conn.add_statement(
            &Term::bnode("b0"),
            &ex("p"),
            &Term::typed_literal("42", "http://www.w3.org/2001/XMLSchema#integer"),
            &Contexts::named(ex("g")),
        )
        .unwrap();
        conn.commit().unwrap();
        conn.set_namespace("ex", "http://example.org/").unwrap();
        conn.commit().unwrap();
        drop(conn);
        let expected = all_statements(&store);
        assert_eq!(expected.len(), 3);
        store.shut_down().unwrap();
        expected
    };

    let store = open_store(dir.path(), "spoc,posc");
    assert_eq!(all_statements(&store), expected);
    let conn = store.connection().unwrap();
    assert_eq!(
        conn.namespace("ex").unwrap().as_deref(),
        Some("http://example.org/")
    );
    assert!(!dir.path().join("txn.journal").exists());
}

#[test]
fn reindexing_keeps_the_data() {
    let dir = tempdir().unwrap();
    let expected = {
        let store = open_store(dir.path(), "spoc");
        let mut conn = store.connection().unwrap();
        for i in 0..20 {
            let ctx = if i % 3 == 0 {
                Contexts::All
            } else {
                Contexts::named(ex(&format!("g{}", i % 3)))
            };
            conn.add_statement(&ex(&format!("s{i}")), &ex(&format!("p{}", i % 4)), &ex("o"), &ctx)
                .unwrap();
        }
        conn.commit().unwrap();
        drop(conn);
        let expected = all_statements(&store);
        store.shut_down().unwrap();
        expected
    };

    let store = open_store(dir.path(), "posc,cspo");
    assert!(!dir.path().join("triples-spoc.dat").exists());
    assert!(dir.path().join("triples-posc.dat").exists());
    assert!(dir.path().join("triples-cspo.dat").exists());
    assert_eq!(all_statements(&store), expected);
    let stats = store.stats().unwrap();
    assert_eq!(stats.statements, 20);
    assert!(stats.indexes.iter().all(|i| i.records == 20));
    store.verify().unwrap();
}

#[test]
fn deleted_metadata_is_repaired_on_open() {
    let dir = tempdir().unwrap();
    let expected = {
        let store = open_store(dir.path(), "spoc,posc");
        let mut conn = store.connection().unwrap();
        conn.add_statement(&ex("a"), &ex("b"), &ex("c"), &Contexts::named(ex("g")))
            .unwrap();
        conn.add_statement(&ex("c"), &ex("b"), &ex("a"), &Contexts::All)
            .unwrap();
        conn.commit().unwrap();
        drop(conn);
        let expected = all_statements(&store);
        store.shut_down().unwrap();
        expected
    };
    fs::remove_file(dir.path().join("triples.json")).unwrap();

    let store = open_store(dir.path(), "spoc,posc");
    assert!(dir.path().join("triples.json").exists());
    assert_eq!(all_statements(&store), expected);
    store.verify().unwrap();
}

#[test]
fn interrupted_commit_is_replayed() {
    let dir = tempdir().unwrap();
    {
        let store = open_store(dir.path(), "spoc,posc");
        let mut conn = store.connection().unwrap();
        // registers a=1, b=2, c=3
        conn.add_statement(&ex("a"), &ex("b"), &ex("c"), &Contexts::All)
            .unwrap();
        conn.commit().unwrap();
        drop(conn);
        store.shut_down().unwrap();
    }
    // a commit that reached the journal but not the indexes
    let batch = Mutations {
        removes: vec![[1, 2, 3, 0]],
        inserts: vec![Record::new([3, 2, 1, 0], true)],
    };
    journal::write(dir.path(), &batch).unwrap();

    let store = open_store(dir.path(), "spoc,posc");
    assert!(!dir.path().join("txn.journal").exists());
    assert_eq!(
        all_statements(&store),
        BTreeSet::from([Statement::new(ex("c"), ex("b"), ex("a"), None)])
    );
    store.verify().unwrap();
}

#[test]
fn corrupt_record_fails_the_reading_connection() {
    let dir = tempdir().unwrap();
    {
        let store = open_store(dir.path(), "spoc");
        let mut conn = store.connection().unwrap();
        // registers a=1, b=2, c=3
        conn.add_statement(&ex("a"), &ex("b"), &ex("c"), &Contexts::All)
            .unwrap();
        conn.commit().unwrap();
        drop(conn);
        store.shut_down().unwrap();
    }
    // a record whose object id was never registered
    let batch = Mutations {
        removes: vec![],
        inserts: vec![Record::new([1, 2, 999, 0], true)],
    };
    journal::write(dir.path(), &batch).unwrap();

    let store = open_store(dir.path(), "spoc");
    let mut reader = store.connection().unwrap();
    let mut it = reader
        .get_statements(None, None, None, Inferred::Include, &Contexts::All)
        .unwrap();
    assert_eq!(
        it.next().unwrap().unwrap(),
        Statement::new(ex("a"), ex("b"), ex("c"), None)
    );
    assert!(matches!(it.next(), Some(Err(StoreError::Corruption(_)))));
    assert!(!it.has_next());
    assert!(it.is_closed());

    assert_eq!(reader.state(), ConnectionState::Failed);
    assert!(matches!(
        reader.size(Inferred::Include, &Contexts::All),
        Err(StoreError::IllegalState(_))
    ));
    assert!(reader.begin().is_err());

    // the read lock went back with the failed iterator
    let mut writer = store.connection().unwrap();
    writer
        .add_statement(&ex("d"), &ex("b"), &ex("c"), &Contexts::All)
        .unwrap();
    writer.commit().unwrap();
    assert_eq!(writer.size(Inferred::Include, &Contexts::All).unwrap(), 3);

    reader.close();
    assert_eq!(reader.state(), ConnectionState::Closed);
}

#[test]
fn stats_count_values_statements_and_contexts() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path(), "spoc,cspo");
    let mut conn = store.connection().unwrap();
    conn.add_statement(&ex("s"), &ex("p"), &ex("o"), &Contexts::All)
        .unwrap();
    conn.add_statement(
        &ex("s"),
        &ex("p"),
        &ex("o"),
        &Contexts::Only(vec![Some(ex("g1")), Some(ex("g2"))]),
    )
    .unwrap();
    conn.set_namespace("ex", "http://example.org/").unwrap();
    conn.commit().unwrap();

    let stats = store.stats().unwrap();
    assert_eq!(stats.values, 5);
    assert_eq!(stats.statements, 3);
    assert_eq!(stats.contexts, 2);
    assert_eq!(stats.namespaces, 1);
    let specs: Vec<&str> = stats.indexes.iter().map(|i| i.spec.as_str()).collect();
    assert_eq!(specs, vec!["spoc", "cspo"]);

    let report = store.verify().unwrap();
    assert_eq!(report.values, 5);
    assert_eq!(report.records, 3);
}

#[derive(Default)]
struct Changes {
    seen: Mutex<Vec<StoreChange>>,
}

impl StoreListener for Changes {
    fn store_changed(&self, change: &StoreChange) {
        self.seen.lock().unwrap().push(*change);
    }
}

#[test]
fn store_listeners_see_effective_commits() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path(), "spoc");
    let changes = Arc::new(Changes::default());
    let listener: Arc<dyn StoreListener> = changes.clone();
    store.add_store_listener(Arc::clone(&listener));

    let mut conn = store.connection().unwrap();
    conn.add_statement(&ex("s"), &ex("p"), &ex("o"), &Contexts::All)
        .unwrap();
    conn.commit().unwrap();
    // already present: nothing changes
    conn.add_statement(&ex("s"), &ex("p"), &ex("o"), &Contexts::All)
        .unwrap();
    conn.commit().unwrap();
    conn.remove_statements(Some(&ex("s")), None, None, &Contexts::All)
        .unwrap();
    conn.commit().unwrap();

    assert_eq!(
        *changes.seen.lock().unwrap(),
        vec![
            StoreChange {
                statements_added: true,
                statements_removed: false
            },
            StoreChange {
                statements_added: false,
                statements_removed: true
            },
        ]
    );

    store.remove_store_listener(&listener);
    conn.add_statement(&ex("s"), &ex("p"), &ex("o"), &Contexts::All)
        .unwrap();
    conn.commit().unwrap();
    assert_eq!(changes.seen.lock().unwrap().len(), 2);
}

#[test]
fn tracked_locks_are_reported_while_held() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::builder()
        .data_dir(dir.path())
        .track_locks(true)
        .build()
        .unwrap();
    let store = NativeStore::new(config);
    store.initialize().unwrap();
    assert!(store.active_locks().unwrap().is_empty());

    let conn = store.connection().unwrap();
    let mut it = conn
        .get_statements(None, None, None, Inferred::Include, &Contexts::All)
        .unwrap();
    let held = store.active_locks().unwrap();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].kind, LockKind::Read);
    it.close();
    assert!(store.active_locks().unwrap().is_empty());
}

#[test]
fn shut_down_invalidates_open_connections() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path(), "spoc");
    let mut conn = store.connection().unwrap();
    store.shut_down().unwrap();
    assert!(matches!(
        conn.add_statement(&ex("s"), &ex("p"), &ex("o"), &Contexts::All),
        Err(StoreError::IllegalState(_))
    ));
    assert!(matches!(
        conn.size(Inferred::Include, &Contexts::All),
        Err(StoreError::IllegalState(_))
    ));
}

#[test]
fn dropping_the_store_releases_the_directory() {
    let dir = tempdir().unwrap();
    {
        let store = open_store(dir.path(), "spoc");
        let mut conn = store.connection().unwrap();
        conn.add_statement(&ex("s"), &ex("p"), &ex("o"), &Contexts::All)
            .unwrap();
        conn.commit().unwrap();
    }
    let store = open_store(dir.path(), "spoc");
    assert_eq!(all_statements(&store).len(), 1);
}
