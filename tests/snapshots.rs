//! # Snapshot Lifecycle Tests
//!
//! End-to-end coverage of the commit protocol and the snapshot-history
//! guarantees:
//!
//! 1. Committed state round-trips through close and reopen
//! 2. Snapshots are page-aligned and the file grows monotonically
//! 3. Bytes up to any checkpoint never change, no matter how many
//!    commits follow
//! 4. Historical checkpoints reopen to exactly the state they committed
//! 5. The trailer chain walks back to zero in strictly decreasing steps
//! 6. Compaction (`write_to`) produces an equivalent standalone file

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use shaledb::{Db, OpenMode, PutMode, Value};
use tempfile::tempdir;

const PAGE: u64 = 4096;

fn open(path: &Path) -> Db {
    Db::builder()
        .path(path)
        .page_size(PAGE)
        .max_map_size(1 << 24)
        .open()
        .unwrap()
}

fn doc(json: &str) -> Value {
    Value::from_json(json).unwrap()
}

fn put(db: &mut Db, key: &[u8], json: &str) {
    assert!(db.put(key, PutMode::Upsert, Some(&doc(json))).unwrap());
}

#[test]
fn first_commit_writes_one_page_with_header_and_trailer() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let mut db = open(&path);

    put(&mut db, b"a", r#"{"n": 1}"#);
    put(&mut db, b"b", r#"{"n": 2}"#);
    db.commit_changes().unwrap();

    assert_eq!(db.size(), PAGE);
    assert_eq!(db.previous_checkpoint(), 0);
    assert_eq!(db.get(b"a").unwrap().unwrap().get("n").unwrap().as_int(), Some(1));
    assert_eq!(db.get(b"b").unwrap().unwrap().get("n").unwrap().as_int(), Some(2));

    let raw = std::fs::read(&path).unwrap();
    assert_eq!(raw.len() as u64, PAGE);
    assert_eq!(&raw[..9], b"FleeceDB\n");
    let trailer_start = (PAGE - 32) as usize;
    assert_eq!(
        u64::from_le_bytes(raw[trailer_start..trailer_start + 8].try_into().unwrap()),
        0x332F_FAB5_BC64_4D0C
    );
    assert_eq!(
        u64::from_le_bytes(raw[raw.len() - 8..].try_into().unwrap()),
        0x84A7_32B5_C0E6_948B
    );
}

#[test]
fn removal_appends_a_snapshot_and_keeps_the_old_one() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let mut db = open(&path);

    put(&mut db, b"a", r#"{"n": 1}"#);
    put(&mut db, b"b", r#"{"n": 2}"#);
    db.commit_changes().unwrap();

    assert!(db.remove(b"a").unwrap());
    db.commit_changes().unwrap();

    assert_eq!(db.size(), 2 * PAGE);
    assert_eq!(db.previous_checkpoint(), PAGE);
    assert_eq!(db.get(b"a").unwrap(), None);
    assert_eq!(db.get(b"b").unwrap().unwrap().get("n").unwrap().as_int(), Some(2));

    // The old snapshot still answers with the removed document.
    let old = db.at_checkpoint(PAGE).unwrap();
    assert!(!old.is_writeable());
    assert_eq!(old.count(), 2);
    assert_eq!(old.get(b"a").unwrap().unwrap().get("n").unwrap().as_int(), Some(1));
}

#[test]
fn every_commit_is_page_aligned_and_grows_the_file() {
    let dir = tempdir().unwrap();
    let mut db = open(&dir.path().join("db"));

    let mut last_size = 0;
    for round in 0..8 {
        for i in 0..20 {
            put(
                &mut db,
                format!("key-{}-{}", round, i).as_bytes(),
                &format!(r#"{{"round": {}, "i": {}}}"#, round, i),
            );
        }
        db.commit_changes().unwrap();
        assert_eq!(db.size() % PAGE, 0);
        assert!(db.size() >= last_size + PAGE);
        last_size = db.size();
    }
}

#[test]
fn bytes_up_to_a_checkpoint_never_change() {
    let dir = tempdir().unwrap();
    let mut db = open(&dir.path().join("db"));

    put(&mut db, b"a", r#"{"n": 1}"#);
    db.commit_changes().unwrap();
    let first = db.checkpoint();
    let frozen = db.data_up_to_checkpoint(first).unwrap().to_vec();

    for i in 0..10 {
        put(&mut db, format!("k{}", i).as_bytes(), r#"{"x": true}"#);
        db.remove(b"a").unwrap();
        put(&mut db, b"a", &format!(r#"{{"n": {}}}"#, i));
        db.commit_changes().unwrap();
        assert_eq!(db.data_up_to_checkpoint(first).unwrap(), &frozen[..]);
    }

    // The data slices partition the file.
    let whole = db.data_up_to_checkpoint(db.checkpoint()).unwrap();
    let since = db.data_since_checkpoint(first).unwrap();
    assert_eq!(whole.len(), frozen.len() + since.len());
    assert_eq!(&whole[..frozen.len()], &frozen[..]);
}

#[test]
fn historical_checkpoints_reopen_to_their_exact_state() {
    let dir = tempdir().unwrap();
    let mut db = open(&dir.path().join("db"));

    put(&mut db, b"a", r#"{"v": 1}"#);
    db.commit_changes().unwrap();
    let first = db.checkpoint();

    put(&mut db, b"b", r#"{"v": 2}"#);
    put(&mut db, b"a", r#"{"v": 10}"#);
    db.commit_changes().unwrap();
    let second = db.checkpoint();

    db.remove(b"a").unwrap();
    put(&mut db, b"c", r#"{"v": 3}"#);
    db.commit_changes().unwrap();

    let at_first = db.at_checkpoint(first).unwrap();
    assert_eq!(at_first.count(), 1);
    assert_eq!(at_first.get(b"a").unwrap().unwrap().get("v").unwrap().as_int(), Some(1));
    assert_eq!(at_first.get(b"b").unwrap(), None);

    let at_second = db.at_checkpoint(second).unwrap();
    assert_eq!(at_second.count(), 2);
    assert_eq!(at_second.get(b"a").unwrap().unwrap().get("v").unwrap().as_int(), Some(10));
    assert_eq!(at_second.get(b"b").unwrap().unwrap().get("v").unwrap().as_int(), Some(2));

    assert_eq!(db.count(), 2);
    assert_eq!(db.get(b"a").unwrap(), None);
    assert_eq!(db.get(b"c").unwrap().unwrap().get("v").unwrap().as_int(), Some(3));
}

#[test]
fn the_trailer_chain_walks_back_to_zero() {
    let dir = tempdir().unwrap();
    let mut db = open(&dir.path().join("db"));

    for i in 0..5 {
        put(&mut db, format!("k{}", i).as_bytes(), r#"{"x": 0}"#);
        db.commit_changes().unwrap();
    }

    let mut checkpoint = db.checkpoint();
    let mut hops = 0;
    while checkpoint != 0 {
        let view = db.at_checkpoint(checkpoint).unwrap();
        let prev = view.previous_checkpoint();
        assert!(prev < checkpoint, "chain must strictly decrease");
        assert_eq!(prev % PAGE, 0);
        checkpoint = prev;
        hops += 1;
    }
    assert_eq!(hops, 5);
}

#[test]
fn many_documents_round_trip_across_commits() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let mut db = open(&path);

    for round in 0..3 {
        for i in 0..150 {
            put(
                &mut db,
                format!("doc-{:03}", i).as_bytes(),
                &format!(r#"{{"i": {}, "round": {}, "tag": "r{}"}}"#, i, round, round),
            );
        }
        db.commit_changes().unwrap();
    }
    for i in (0..150).step_by(3) {
        db.remove(format!("doc-{:03}", i).as_bytes()).unwrap();
    }
    db.commit_changes().unwrap();
    let expected = db.entries().unwrap();
    assert_eq!(expected.len(), 100);
    drop(db);

    let db = open(&path);
    assert_eq!(db.count(), 100);
    assert_eq!(db.entries().unwrap(), expected);
    for i in 0..150 {
        let key = format!("doc-{:03}", i);
        let got = db.get(key.as_bytes()).unwrap();
        if i % 3 == 0 {
            assert_eq!(got, None);
        } else {
            assert_eq!(got.unwrap().get("round").unwrap().as_int(), Some(2));
        }
    }
}

#[test]
fn mutable_documents_carry_edits_into_the_next_snapshot() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let mut db = open(&path);

    put(&mut db, b"a", r#"{"n": 1}"#);
    db.commit_changes().unwrap();
    assert_eq!(db.size(), PAGE);

    let handle = db.get_mutable(b"a").unwrap().unwrap();
    handle.set("n", 2i64).unwrap();
    db.commit_changes().unwrap();

    assert_eq!(db.size(), 2 * PAGE);
    drop(db);

    let db = open(&path);
    assert_eq!(db.get(b"a").unwrap().unwrap().get("n").unwrap().as_int(), Some(2));
}

#[test]
fn nested_collections_promote_and_persist() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let mut db = open(&path);

    put(
        &mut db,
        b"doc",
        r#"{"meta": {"tags": ["old"], "rank": 1}, "name": "thing"}"#,
    );
    db.commit_changes().unwrap();

    let root = db.get_mutable(b"doc").unwrap().unwrap();
    let meta = root.get_mutable_dict("meta").unwrap().unwrap();
    meta.set("rank", 2i64).unwrap();
    let tags = meta.get_mutable_array("tags").unwrap().unwrap();
    tags.push("new");
    tags.set(0, "renamed").unwrap();

    // Repeated promotion returns the same shared collection.
    let meta_again = root.get_mutable_dict("meta").unwrap().unwrap();
    assert_eq!(meta_again.get("rank").unwrap(), Some(Value::Int(2)));
    // The untouched sibling still reads through.
    assert_eq!(root.get("name").unwrap(), Some(Value::from("thing")));

    db.commit_changes().unwrap();
    drop(db);

    let db = open(&path);
    let doc = db.get(b"doc").unwrap().unwrap();
    assert_eq!(
        doc,
        Value::from_json(
            r#"{"meta": {"tags": ["renamed", "new"], "rank": 2}, "name": "thing"}"#
        )
        .unwrap()
    );
}

#[test]
fn mutable_handles_detach_after_commit() {
    let dir = tempdir().unwrap();
    let mut db = open(&dir.path().join("db"));
    put(&mut db, b"a", r#"{"n": 1}"#);
    db.commit_changes().unwrap();

    let handle = db.get_mutable(b"a").unwrap().unwrap();
    handle.set("n", 2i64).unwrap();
    db.commit_changes().unwrap();

    // The handle is no longer wired to the database.
    handle.set("n", 99i64).unwrap();
    db.commit_changes().unwrap();
    assert_eq!(db.get(b"a").unwrap().unwrap().get("n").unwrap().as_int(), Some(2));
}

#[test]
fn the_commit_observer_sees_every_new_size() {
    let dir = tempdir().unwrap();
    let mut db = open(&dir.path().join("db"));

    let observed = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&observed);
    db.set_commit_observer(Some(Box::new(move |db, new_size| {
        assert_eq!(db.size(), new_size);
        sink.store(new_size, Ordering::SeqCst);
    })));

    put(&mut db, b"a", r#"{"n": 1}"#);
    db.commit_changes().unwrap();
    assert_eq!(observed.load(Ordering::SeqCst), PAGE);

    // An unchanged overlay commits nothing and calls nobody.
    observed.store(0, Ordering::SeqCst);
    db.commit_changes().unwrap();
    assert_eq!(observed.load(Ordering::SeqCst), 0);

    put(&mut db, b"b", r#"{"n": 2}"#);
    db.commit_changes().unwrap();
    assert_eq!(observed.load(Ordering::SeqCst), 2 * PAGE);
}

#[test]
fn a_reader_is_unaffected_by_a_concurrent_commit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");

    let mut writer = open(&path);
    put(&mut writer, b"a", r#"{"n": 1}"#);
    writer.commit_changes().unwrap();

    let reader = Db::builder()
        .path(&path)
        .mode(OpenMode::ReadOnly)
        .page_size(PAGE)
        .max_map_size(1 << 24)
        .open()
        .unwrap();
    assert_eq!(reader.checkpoint(), PAGE);

    put(&mut writer, b"a", r#"{"n": 2}"#);
    put(&mut writer, b"b", r#"{"n": 3}"#);
    writer.commit_changes().unwrap();

    // The reader still sees its own snapshot...
    assert_eq!(reader.checkpoint(), PAGE);
    assert_eq!(reader.count(), 1);
    assert_eq!(reader.get(b"a").unwrap().unwrap().get("n").unwrap().as_int(), Some(1));

    // ...and a fresh open sees the new one.
    let fresh = Db::builder()
        .path(&path)
        .mode(OpenMode::ReadOnly)
        .page_size(PAGE)
        .max_map_size(1 << 24)
        .open()
        .unwrap();
    assert_eq!(fresh.count(), 2);
    assert_eq!(fresh.get(b"a").unwrap().unwrap().get("n").unwrap().as_int(), Some(2));
}

#[test]
fn compaction_writes_an_equivalent_standalone_file() {
    let dir = tempdir().unwrap();
    let mut db = open(&dir.path().join("db"));

    for i in 0..40 {
        put(&mut db, format!("k{:02}", i).as_bytes(), &format!(r#"{{"i": {}}}"#, i));
        if i % 10 == 9 {
            db.commit_changes().unwrap();
        }
    }
    for i in 0..10 {
        db.remove(format!("k{:02}", i * 4).as_bytes()).unwrap();
    }
    db.commit_changes().unwrap();
    let expected = db.entries().unwrap();
    let history_size = db.size();

    let compact_path = dir.path().join("compact");
    db.write_to(&compact_path).unwrap();

    let compacted = open(&compact_path);
    assert_eq!(compacted.previous_checkpoint(), 0);
    assert_eq!(compacted.size() % PAGE, 0);
    assert!(compacted.size() < history_size, "compaction must shed history");
    assert_eq!(compacted.entries().unwrap(), expected);
}

#[test]
fn compaction_includes_pending_changes() {
    let dir = tempdir().unwrap();
    let mut db = open(&dir.path().join("db"));

    put(&mut db, b"committed", r#"{"n": 1}"#);
    db.commit_changes().unwrap();
    put(&mut db, b"pending", r#"{"n": 2}"#);

    let out = dir.path().join("out");
    db.write_to(&out).unwrap();

    let copy = open(&out);
    assert_eq!(copy.count(), 2);
    assert!(copy.contains(b"pending").unwrap());

    // The source database itself still has the change uncommitted.
    assert!(db.has_changes());
}

#[test]
fn compaction_into_an_unwritable_location_errors() {
    let dir = tempdir().unwrap();
    let mut db = open(&dir.path().join("db"));
    put(&mut db, b"a", r#"{"n": 1}"#);
    db.commit_changes().unwrap();

    let missing_dir = dir.path().join("no-such-dir").join("out");
    assert!(db.write_to(&missing_dir).is_err());
}

#[test]
fn tombstones_hold_across_the_commit_boundary() {
    let dir = tempdir().unwrap();
    let mut db = open(&dir.path().join("db"));

    put(&mut db, b"gone", r#"{"n": 1}"#);
    put(&mut db, b"kept", r#"{"n": 2}"#);
    db.commit_changes().unwrap();

    // Pending tombstone.
    db.remove(b"gone").unwrap();
    assert_eq!(db.get(b"gone").unwrap(), None);
    assert_eq!(db.count(), 1);

    // Committed tombstone.
    db.commit_changes().unwrap();
    assert_eq!(db.get(b"gone").unwrap(), None);
    assert_eq!(db.count(), 1);

    // Overlay-only key removed before ever committing.
    put(&mut db, b"fleeting", r#"{"n": 3}"#);
    assert!(db.remove(b"fleeting").unwrap());
    db.commit_changes().unwrap();
    assert_eq!(db.get(b"fleeting").unwrap(), None);
}
