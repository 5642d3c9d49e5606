//! End-to-end scenarios over the public `Db` facade.

use std::path::PathBuf;

use triedb_mpt::{Db, DbConfig, Update};
use triedb_types::DbError;

const CHUNK: u64 = 1 << 20;

fn anon_db(history: u64) -> Db {
    Db::open_anonymous(64, CHUNK, history).unwrap()
}

/// A file-backed database that can be dropped and reopened.
fn file_db(path: &PathBuf, history: u64) -> Db {
    let cfg = DbConfig {
        paths: vec![path.clone()],
        chunk_capacity: CHUNK,
        history_length: history,
        ..DbConfig::default()
    };
    Db::open(cfg).unwrap()
}

fn sized_temp_file(chunks: u64) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("triedb.pool");
    let file = std::fs::File::create(&path).unwrap();
    file.set_len(triedb_io::METADATA_REGION_SIZE + chunks * CHUNK).unwrap();
    (dir, path)
}

#[test]
fn s1_simple_write_read() {
    let mut db = anon_db(100);
    let root = db
        .upsert(
            vec![Update::insert(&b"aa"[..], &b"1"[..], 0), Update::insert(&b"ab"[..], &b"2"[..], 0)],
            0,
            true,
            false,
        )
        .unwrap();
    assert_eq!(db.get(b"aa", 0).unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(b"ab", 0).unwrap(), Some(b"2".to_vec()));
    assert_eq!(db.get(b"ac", 0).unwrap(), None);
    assert_eq!(db.get_latest_version(), Some(0));
    assert_eq!(db.root_hash(0).unwrap(), root);

    // The same contents in a fresh database produce the same root.
    let mut db2 = anon_db(100);
    let root2 = db2
        .upsert(
            vec![Update::insert(&b"aa"[..], &b"1"[..], 0), Update::insert(&b"ab"[..], &b"2"[..], 0)],
            0,
            true,
            false,
        )
        .unwrap();
    assert_eq!(root, root2, "roots differ: {} vs {}", hex::encode(root), hex::encode(root2));
}

#[test]
fn upsert_version_skips_are_rejected() {
    let mut db = anon_db(100);
    // The first commit must be version zero.
    let err = db
        .upsert(vec![Update::insert(&b"k"[..], &b"v"[..], 1)], 1, true, false)
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidArgument(_)), "got {err:?}");
    db.upsert(vec![Update::insert(&b"k"[..], &b"v"[..], 0)], 0, true, false).unwrap();

    // Every later upsert must advance by exactly one; a skipped slot is
    // refused rather than silently filled.
    for bogus in [0u64, 3, 6] {
        let err = db
            .upsert(vec![Update::insert(&b"k2"[..], &b"w"[..], bogus)], bogus, true, false)
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument(_)), "version {bogus} accepted");
    }
    assert_eq!(db.get_latest_version(), Some(0));
    db.upsert(vec![Update::insert(&b"k2"[..], &b"w"[..], 1)], 1, true, false).unwrap();

    // copy_trie commits a version under the same rule.
    let err = db.copy_trie(b"k", b"j", 5, true).unwrap_err();
    assert!(matches!(err, DbError::InvalidArgument(_)), "got {err:?}");

    // Renaming a version forward is the one operation that may leave gaps;
    // the next upsert then continues right after the new maximum.
    db.move_trie_version_forward(1, 4).unwrap();
    let err = db
        .upsert(vec![Update::insert(&b"k3"[..], &b"x"[..], 6)], 6, true, false)
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidArgument(_)), "got {err:?}");
    db.upsert(vec![Update::insert(&b"k3"[..], &b"x"[..], 5)], 5, true, false).unwrap();
    assert_eq!(db.get_latest_version(), Some(5));
}

#[test]
fn s2_split_and_collapse() {
    let mut db = anon_db(100);
    let single = db
        .upsert(vec![Update::insert(&b"aaa"[..], &b"x"[..], 0)], 0, true, false)
        .unwrap();

    // Path split at the diverging nibble.
    db.upsert(vec![Update::insert(&b"aab"[..], &b"y"[..], 1)], 1, true, false).unwrap();
    assert_eq!(db.get(b"aaa", 1).unwrap(), Some(b"x".to_vec()));
    assert_eq!(db.get(b"aab", 1).unwrap(), Some(b"y".to_vec()));

    // Branch collapse on erase: back to a single leaf, same root as before.
    let collapsed = db
        .upsert(vec![Update::erase(&b"aab"[..], 2)], 2, true, false)
        .unwrap();
    assert_eq!(collapsed, single);
    assert_eq!(db.get(b"aaa", 2).unwrap(), Some(b"x".to_vec()));
    assert_eq!(db.get(b"aab", 2).unwrap(), None);

    // The split version is still queryable as it was.
    assert_eq!(db.get(b"aab", 1).unwrap(), Some(b"y".to_vec()));
}

#[test]
fn s4_copy_subtree() {
    let mut db = anon_db(100);
    db.upsert(
        vec![Update::nested(
            &b"src"[..],
            Some(b"table".to_vec()),
            0,
            vec![
                Update::insert(&b"/a"[..], &b"1"[..], 0),
                Update::insert(&b"/b"[..], &b"2"[..], 0),
            ],
        )],
        0,
        true,
        false,
    )
    .unwrap();

    db.copy_trie(b"src", b"dst", 1, true).unwrap();
    for (key, want) in
        [(&b"src/a"[..], &b"1"[..]), (b"src/b", b"2"), (b"dst/a", b"1"), (b"dst/b", b"2")]
    {
        assert_eq!(db.get(key, 1).unwrap(), Some(want.to_vec()), "key {key:?}");
    }

    // Dropping one side must not dangle the other: erase the whole copy and
    // the source remains intact.
    let mut drop_dst = Update::erase(&b"dst"[..], 2);
    drop_dst.incarnation = 1;
    db.upsert(vec![drop_dst], 2, true, false).unwrap();
    assert_eq!(db.get(b"dst/a", 2).unwrap(), None);
    assert_eq!(db.get(b"src/a", 2).unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(b"src/b", 2).unwrap(), Some(b"2".to_vec()));
}

#[test]
fn root_is_insertion_order_independent() {
    // The same final contents reached through differently ordered batches
    // hash identically.
    let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0u32..64)
        .map(|i| (format!("key-{i:03}").into_bytes(), format!("val-{i}").into_bytes()))
        .collect();

    let mut db1 = anon_db(100);
    let mut sorted = pairs.clone();
    sorted.sort();
    let batch: Vec<Update> =
        sorted.iter().map(|(k, v)| Update::insert(k.clone(), v.clone(), 0)).collect();
    let root1 = db1.upsert(batch, 0, true, false).unwrap();

    // Reverse half first, then the rest, across two versions.
    let mut db2 = anon_db(100);
    let (a, b) = sorted.split_at(sorted.len() / 2);
    let batch_b: Vec<Update> =
        b.iter().map(|(k, v)| Update::insert(k.clone(), v.clone(), 0)).collect();
    db2.upsert(batch_b, 0, true, false).unwrap();
    let batch_a: Vec<Update> =
        a.iter().map(|(k, v)| Update::insert(k.clone(), v.clone(), 1)).collect();
    let root2 = db2.upsert(batch_a, 1, true, false).unwrap();
    assert_eq!(root1, root2);
}

#[test]
fn version_window_expires_oldest() {
    let mut db = anon_db(4);
    let mut roots = Vec::new();
    for v in 0..10u64 {
        let key = format!("key-{v}");
        let root = db
            .upsert(vec![Update::insert(key.into_bytes(), vec![v as u8], v)], v, true, false)
            .unwrap();
        roots.push((v, root));
    }
    assert_eq!(db.get_latest_version(), Some(9));
    assert_eq!(db.get_earliest_version(), Some(6));

    // Expired versions answer VersionExpired, live ones are intact and
    // produce the same roots as when they committed.
    for (v, root) in roots {
        if v < 6 {
            assert!(matches!(db.get(b"key-1", v), Err(DbError::VersionExpired(_))));
        } else {
            assert_eq!(db.root_hash(v).unwrap(), root);
            let key = format!("key-{v}");
            assert_eq!(db.get(key.as_bytes(), v).unwrap(), Some(vec![v as u8]));
        }
    }

    // Monotone window: min never decreases, max advanced by one per upsert.
    db.upsert(vec![Update::insert(&b"k"[..], &b"v"[..], 10)], 10, true, false).unwrap();
    assert_eq!(db.get_earliest_version(), Some(7));
    assert_eq!(db.get_latest_version(), Some(10));
}

#[test]
fn expiration_recycles_chunks() {
    // A tiny history over many versions that overwrite the same keys churns
    // through chunks; the fast list must stay bounded as superseded chunks
    // return to the free list. Without recycling a 32-chunk pool could not
    // absorb 400 versions of this workload at all.
    let mut db = Db::open_anonymous(32, 1 << 16, 2).unwrap();
    for v in 0..400u64 {
        let updates: Vec<Update> = (0..8u8)
            .map(|i| Update::insert(vec![i, b'k'], vec![(v % 251) as u8; 200], v))
            .collect();
        db.upsert(updates, v, true, false).unwrap();
    }
    let fast = db.aux().fast_list_ids().len();
    assert!(fast < 16, "fast list grew unbounded: {fast} chunks");
    assert_eq!(db.get_latest_version(), Some(399));
    assert_eq!(db.get(&[3u8, b'k'], 399).unwrap(), Some(vec![(399 % 251) as u8; 200]));
}

#[test]
fn traverse_emits_leaves_under_prefix() {
    let mut db = anon_db(100);
    db.upsert(
        vec![
            Update::insert(&b"pre/a"[..], &b"1"[..], 0),
            Update::insert(&b"pre/b"[..], &b"2"[..], 0),
            Update::insert(&b"pre/c/d"[..], &b"3"[..], 0),
            Update::insert(&b"zzz"[..], &b"4"[..], 0),
        ],
        0,
        true,
        false,
    )
    .unwrap();

    let mut seen = Vec::new();
    db.traverse(
        b"pre/",
        0,
        &mut |key, value| {
            seen.push((format!("{key:?}"), value.to_vec()));
            true
        },
        None,
    )
    .unwrap();
    assert_eq!(seen.len(), 3);
    // Keys arrive in branch order and carry the full nibble path.
    assert_eq!(seen[0].0, "7072652f61"); // "pre/a"
    let values: Vec<Vec<u8>> = seen.iter().map(|(_, v)| v.clone()).collect();
    assert_eq!(values, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);

    // The visitor can stop early.
    let mut count = 0;
    db.traverse(
        b"pre/",
        0,
        &mut |_k, _v| {
            count += 1;
            false
        },
        None,
    )
    .unwrap();
    assert_eq!(count, 1);

    // A depth bound of zero stays on the prefix node.
    let mut bounded = 0;
    db.traverse(b"pre/", 0, &mut |_k, _v| {
        bounded += 1;
        true
    }, Some(0))
    .unwrap();
    assert_eq!(bounded, 0, "no leaf sits exactly at the prefix");
}

#[test]
fn facade_surface_round_trip() {
    let mut db = anon_db(100);
    db.upsert(
        vec![
            Update::insert(&b"deep/key"[..], &b"raw-bytes"[..], 0),
            Update::insert(&b"deep/other"[..], &b"x"[..], 0),
        ],
        0,
        true,
        false,
    )
    .unwrap();

    // get_data returns the leaf exactly as stored.
    assert_eq!(db.get_data(b"deep/key", 0).unwrap(), Some(b"raw-bytes".to_vec()));
    // A key that stops inside a compressed path is no leaf.
    assert_eq!(db.get_data(b"deep", 0).unwrap(), None);

    let cursor = db.load_root_for_version(0).unwrap().unwrap();
    assert_eq!(cursor.nibble_index, 0);
    assert_eq!(cursor.node.hash, db.root_hash(0).unwrap());

    // An empty trie version hashes to all zeroes.
    let mut empty = anon_db(100);
    let root = empty.upsert(vec![], 0, true, false).unwrap();
    assert_eq!(root, [0u8; 32]);
    assert_eq!(empty.root_hash(0).unwrap(), [0u8; 32]);
    assert!(empty.load_root_for_version(0).unwrap().is_none());
}

#[test]
fn move_version_forward_and_finalize() {
    let mut db = anon_db(100);
    db.upsert(vec![Update::insert(&b"k"[..], &b"v"[..], 0)], 0, true, false).unwrap();
    db.move_trie_version_forward(0, 4).unwrap();
    assert_eq!(db.get_latest_version(), Some(4));
    assert_eq!(db.get(b"k", 4).unwrap(), Some(b"v".to_vec()));
    // Skipped slots exist but hold no root.
    assert_eq!(db.get(b"k", 2).unwrap(), None);

    db.update_finalized_version(4).unwrap();
    assert_eq!(db.get_finalized_version(), 4);
}

#[test]
fn s5_crash_recovery_mid_upsert() {
    let (_dir, path) = sized_temp_file(16);
    const N: u64 = 5;
    let mut roots = Vec::new();
    {
        let mut db = file_db(&path, 100);
        for v in 0..N {
            let key = format!("key-{v}");
            let root = db
                .upsert(vec![Update::insert(key.into_bytes(), vec![v as u8], v)], v, true, false)
                .unwrap();
            roots.push(root);
        }
        // Begin an (N+1)-th upsert: dirty bit set, some node bytes flushed,
        // but the root offset never lands. Then the process dies.
        let (io, aux) = db.io_and_aux_mut();
        aux.set_dirty(io.pool(), true).unwrap();
        let garbage = vec![0xddu8; 700];
        aux.write_node_bytes(io, triedb_mpt::Stream::Fast, &garbage).unwrap();
        aux.flush_writers(io).unwrap();
        io.wait_until_done();
        // Drop without clearing the dirty bit: the "kill".
    }
    {
        let db = file_db(&path, 100);
        assert_eq!(db.get_latest_version(), Some(N - 1));
        for v in 0..N {
            assert_eq!(db.root_hash(v).unwrap(), roots[v as usize]);
            let key = format!("key-{v}");
            assert_eq!(db.get(key.as_bytes(), v).unwrap(), Some(vec![v as u8]));
        }
        // A new upsert must succeed after recovery.
        let mut db = db;
        db.upsert(vec![Update::insert(&b"after"[..], &b"ok"[..], N)], N, true, false).unwrap();
        assert_eq!(db.get(b"after", N).unwrap(), Some(b"ok".to_vec()));
    }
}

#[test]
fn s6_torn_root_recovery() {
    let (_dir, path) = sized_temp_file(16);
    {
        let mut db = file_db(&path, 100);
        db.upsert(vec![Update::insert(&b"k"[..], &b"v"[..], 0)], 0, true, false).unwrap();
        // Simulate a torn commit: a root offset appended whose bytes never
        // reached the durable cursor, dirty bit still set.
        let (io, aux) = db.io_and_aux_mut();
        let bogus = aux.get_start_of_wip_fast_offset().add_to_offset(8192);
        aux.append_root_offset(io.pool(), bogus.pack(0)).unwrap();
        aux.set_dirty(io.pool(), true).unwrap();
    }
    {
        // The writer rewinds: the torn version is gone, the previous one is
        // intact.
        let db = file_db(&path, 100);
        assert_eq!(db.get_latest_version(), Some(0));
        assert_eq!(db.get(b"k", 0).unwrap(), Some(b"v".to_vec()));
    }
}

#[test]
fn s6_torn_root_with_no_consistent_predecessor_is_fatal() {
    let (_dir, path) = sized_temp_file(16);
    {
        let mut db = file_db(&path, 100);
        let (io, aux) = db.io_and_aux_mut();
        let wip = aux.get_start_of_wip_fast_offset();
        aux.append_root_offset(io.pool(), wip.add_to_offset(4096).pack(0)).unwrap();
        aux.append_root_offset(io.pool(), wip.add_to_offset(8192).pack(0)).unwrap();
        aux.set_dirty(io.pool(), true).unwrap();
    }
    let cfg = DbConfig {
        paths: vec![path.clone()],
        chunk_capacity: CHUNK,
        history_length: 100,
        ..DbConfig::default()
    };
    let err = Db::open(cfg).unwrap_err();
    assert!(matches!(err, DbError::CorruptMetadata(_)), "got {err:?}");
}

#[test]
fn concurrent_readers_coalesce() {
    let mut db = anon_db(100);
    let updates: Vec<Update> = (0u32..128)
        .map(|i| Update::insert(format!("key-{i:04}").into_bytes(), format!("v{i}").into_bytes(), 0))
        .collect();
    db.upsert(updates, 0, true, false).unwrap();

    let (done_tx, done_rx) = crossbeam_channel::bounded(4);
    let mut joins = Vec::new();
    for t in 0..4u32 {
        let reader = db.reader();
        let done = done_tx.clone();
        joins.push(std::thread::spawn(move || {
            for i in 0..128u32 {
                let key = format!("key-{i:04}");
                let got = reader.get(key.as_bytes(), 0).unwrap();
                assert_eq!(got, Some(format!("v{i}").into_bytes()), "thread {t} key {key}");
            }
            assert_eq!(reader.get(b"missing", 0).unwrap(), None);
            let _ = done.send(());
        }));
    }
    // The io-owning thread drives posted finds until every reader is done.
    let mut finished = 0;
    while finished < 4 {
        db.poll();
        while done_rx.try_recv().is_ok() {
            finished += 1;
        }
        std::thread::yield_now();
    }
    for j in joins {
        j.join().unwrap();
    }
}

#[test]
fn read_only_open_sees_committed_state() {
    let (_dir, path) = sized_temp_file(16);
    {
        let mut db = file_db(&path, 100);
        db.upsert(vec![Update::insert(&b"shared"[..], &b"state"[..], 0)], 0, true, false)
            .unwrap();
    }
    // A read-only open on another thread (one io per thread) sees the data
    // and refuses writes.
    let path2 = path.clone();
    std::thread::spawn(move || {
        let cfg = DbConfig {
            paths: vec![path2],
            chunk_capacity: CHUNK,
            history_length: 100,
            read_only: true,
            ..DbConfig::default()
        };
        let mut db = Db::open(cfg).unwrap();
        assert_eq!(db.get(b"shared", 0).unwrap(), Some(b"state".to_vec()));
        let err = db
            .upsert(vec![Update::insert(&b"x"[..], &b"y"[..], 1)], 1, true, false)
            .unwrap_err();
        assert!(matches!(err, DbError::ReadOnly));
    })
    .join()
    .unwrap();
}

#[test]
fn proposal_chain_tracks_committed_roots() {
    use triedb_mpt::{BlockId, ProposalChain, RootHashBuffer};

    let mut db = anon_db(100);
    let genesis = db.upsert(vec![Update::insert(&b"g"[..], &b"0"[..], 0)], 0, true, false).unwrap();

    let mut finalized = RootHashBuffer::default();
    finalized.set(0, genesis);

    fn id(seed: u64) -> BlockId {
        let mut out = [0u8; 32];
        out[..8].copy_from_slice(&seed.to_le_bytes());
        out
    }

    // Each committed version's root hash is proposed; consensus later
    // finalizes the chain and the db's finalized marker follows.
    let mut chain = ProposalChain::new(&mut finalized);
    for v in 1..=3u64 {
        let key = format!("block-{v}");
        let root = db
            .upsert(vec![Update::insert(key.into_bytes(), vec![v as u8], v)], v, true, false)
            .unwrap();
        chain.propose(root, v, id(v), id(v - 1));
    }
    // A competing proposal for version 3 that never wins.
    chain.propose([0xee; 32], 3, id(33), id(2));

    let winner = chain.find_chain(id(3));
    assert_eq!(winner.n(), 4);
    for v in 1..=3u64 {
        assert_eq!(winner.get(v), db.root_hash(v).unwrap());
    }

    chain.finalize(id(3));
    db.update_finalized_version(3).unwrap();
    assert_eq!(db.get_finalized_version(), 3);
    assert_eq!(finalized.n(), 4);
    for v in 0..=3u64 {
        assert_eq!(finalized.get(v), db.root_hash(v).unwrap());
    }
}

#[test]
fn metadata_survives_one_torn_copy() {
    let (_dir, path) = sized_temp_file(16);
    {
        let mut db = file_db(&path, 100);
        db.upsert(vec![Update::insert(&b"k"[..], &b"v"[..], 0)], 0, true, false).unwrap();
        db.upsert(vec![Update::insert(&b"k2"[..], &b"w"[..], 1)], 1, true, false).unwrap();
    }
    // Shred the older metadata copy; the newer one carries the state.
    let older_slot = {
        let pool = triedb_io::StoragePool::open(
            &[path.clone()],
            &triedb_io::PoolOptions { chunk_capacity: CHUNK, ..Default::default() },
        )
        .unwrap();
        let current = triedb_mpt::meta::load(&pool).unwrap().unwrap();
        (current.generation + 1) % 2
    };
    {
        use std::os::unix::fs::FileExt;
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        let copy_size = triedb_io::METADATA_REGION_SIZE / 2;
        file.write_all_at(&vec![0xffu8; 4096], older_slot * copy_size).unwrap();
    }
    {
        let db = file_db(&path, 100);
        assert_eq!(db.get_latest_version(), Some(1));
        assert_eq!(db.get(b"k2", 1).unwrap(), Some(b"w".to_vec()));
    }
    // With both copies gone the database is unrecoverable.
    {
        use std::os::unix::fs::FileExt;
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        let copy_size = triedb_io::METADATA_REGION_SIZE / 2;
        file.write_all_at(&vec![0xffu8; 4096], 0).unwrap();
        file.write_all_at(&vec![0xffu8; 4096], copy_size).unwrap();
    }
    let cfg = DbConfig {
        paths: vec![path.clone()],
        chunk_capacity: CHUNK,
        history_length: 100,
        ..DbConfig::default()
    };
    let err = Db::open(cfg).unwrap_err();
    assert!(matches!(err, DbError::CorruptMetadata(_)), "got {err:?}");
}

#[test]
fn reader_observes_version_window() {
    let mut db = anon_db(2);
    for v in 0..5u64 {
        db.upsert(vec![Update::insert(&b"k"[..], vec![v as u8], v)], v, true, false).unwrap();
    }
    let reader = db.reader();
    assert_eq!(reader.min_version(), Some(3));
    assert_eq!(reader.max_version(), Some(4));
    let handle = std::thread::spawn(move || {
        assert!(matches!(reader.get(b"k", 0), Err(DbError::VersionExpired(0))));
        let (got3, got4) = (reader.get(b"k", 3), reader.get(b"k", 4));
        assert_eq!(got3.unwrap(), Some(vec![3u8]));
        assert_eq!(got4.unwrap(), Some(vec![4u8]));
    });
    while !handle.is_finished() {
        db.poll();
        std::thread::yield_now();
    }
    handle.join().unwrap();
}

#[test]
fn compaction_rewrites_cold_references() {
    let mut db = Db::open_anonymous(32, 1 << 16, 2).unwrap();
    // A cold key written once, then left alone while hot keys churn.
    db.upsert(vec![Update::insert(&b"cold"[..], &b"keep"[..], 0)], 0, true, false).unwrap();
    for v in 1..100u64 {
        let key = format!("hot-{}", v % 7);
        db.upsert(
            vec![Update::insert(key.into_bytes(), vec![0xe0u8; 120], v)],
            v,
            true,
            v % 10 == 0,
        )
        .unwrap();
    }
    assert_eq!(db.get(b"cold", 99).unwrap(), Some(b"keep".to_vec()));
}
