//! Shard table integration tests.
//!
//! Tests for the full storage path including:
//! - Writing, reading, and unlinking files through the table
//! - Table-wide stat, list, and flush over shards on disk
//! - Idle eviction and transparent reopen
//! - Persistence across table reopen with RocksDB shards

use std::io::Read;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use kfs_core::{coerce_key, ContentKey, KeyError, KEY_LEN};
use kfs_store::{ShardTable, StoreError};
use kfs_tests::{init_tracing, TestTable};

#[test]
fn test_end_to_end_padded_file() {
    init_tracing();

    let table = TestTable::memory(TestTable::small_config()).unwrap();
    let key = coerce_key(b"K");

    assert_eq!(table.write_for_key(&key, &b"0123456789"[..]).unwrap(), 3);

    let shard = table.route_for_key(key.as_slice()).unwrap();
    let chunks: Vec<Vec<u8>> = (0..3)
        .map(|i| shard.get_chunk(&key, i).unwrap().unwrap().to_vec())
        .collect();
    drop(shard);
    assert_eq!(chunks[0], b"0123");
    assert_eq!(chunks[1], b"4567");
    assert_eq!(chunks[2], b"89\0\0");

    assert!(table.exists_for_key(&key).unwrap());
    table.unlink_for_key(&key).unwrap();
    assert!(!table.exists_for_key(&key).unwrap());
}

#[test]
fn test_unpadded_roundtrip_through_reader() {
    init_tracing();

    let mut config = TestTable::small_config();
    config.stream.pad_last_chunk = false;
    let table = TestTable::memory(config).unwrap();

    let data: Vec<u8> = (0..=254u8).cycle().take(1001).collect();
    let key = coerce_key(b"large file");
    assert_eq!(table.write_for_key(&key, &data[..]).unwrap(), 251);

    let mut restored = Vec::new();
    table
        .read_for_key(&key)
        .unwrap()
        .read_to_end(&mut restored)
        .unwrap();
    assert_eq!(restored, data);
}

#[test]
fn test_same_shard_keys_share_one_open() {
    init_tracing();

    let table = TestTable::memory(TestTable::small_config()).unwrap();
    let keys: Vec<ContentKey> = (0..32).map(|salt| table.key_for_shard(1, salt)).collect();

    std::thread::scope(|scope| {
        for key in &keys {
            let table = table.table();
            scope.spawn(move || {
                table.write_for_key(key, &b"abc"[..]).unwrap();
                assert!(table.exists_for_key(key).unwrap());
            });
        }
    });

    let opener = table.memory_opener().unwrap();
    assert_eq!(opener.open_count(), 1);
    assert_eq!(table.list_with_index(1).unwrap().keys.len(), keys.len());
}

#[test]
fn test_concurrent_writes_across_shards() {
    init_tracing();

    let table = TestTable::memory(TestTable::small_config()).unwrap();
    let keys: Vec<ContentKey> = (0..4u32)
        .flat_map(|shard| (0..4).map(move |salt| (shard, salt)))
        .map(|(shard, salt)| table.key_for_shard(shard, salt))
        .collect();

    std::thread::scope(|scope| {
        for key in &keys {
            let table = table.table();
            scope.spawn(move || {
                table.write_for_key(key, key.as_slice()).unwrap();
            });
        }
    });

    assert_eq!(table.memory_opener().unwrap().open_count(), 4);
    for key in &keys {
        let data = table.read_for_key(key).unwrap().read_to_vec().unwrap();
        assert_eq!(data, key.as_slice());
    }
}

#[test]
fn test_fan_out_reopens_closed_shards() {
    init_tracing();

    let table = TestTable::memory(TestTable::small_config()).unwrap();
    let keys: Vec<ContentKey> = (0..3).map(|i| table.key_for_shard(i, 0)).collect();
    for key in &keys {
        table.write_for_key(key, &b"12345678"[..]).unwrap();
    }
    for index in 0..4 {
        table.destroy(index);
    }
    assert_eq!(table.open_shard_count(), 0);

    let listing = table.list().unwrap();
    let indexes: Vec<u32> = listing.iter().map(|l| l.index).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
    for (shard, key) in listing.iter().zip(&keys) {
        assert_eq!(shard.keys.len(), 1);
        assert_eq!(shard.keys[0].base_key, key.as_slice());
        assert_eq!(shard.keys[0].approximate_size, 8);
    }
    assert_eq!(table.open_shard_count(), 3);

    let stats = table.stat().unwrap();
    assert_eq!(stats.shards.len(), 3);
    assert!(stats.used_space > 0);
    assert_eq!(
        stats.free_space,
        table.config().max_table_size as i64 - stats.used_space as i64
    );

    table.flush().unwrap();
}

#[test]
fn test_stream_copy_into_unopened_shard() {
    init_tracing();

    let table = TestTable::memory(TestTable::small_config()).unwrap();
    let source = table.key_for_shard(0, 11);
    let target = table.key_for_shard(3, 11);
    table.write_for_key(&source, &b"copy me!"[..]).unwrap();

    let reader = table.read_for_key(&source).unwrap();
    assert_eq!(table.write_for_key(&target, reader).unwrap(), 2);

    let data = table.read_for_key(&target).unwrap().read_to_vec().unwrap();
    assert_eq!(data, b"copy me!");
}

#[test]
fn test_open_stream_leaves_other_shards_available() {
    init_tracing();

    let table = TestTable::memory(TestTable::small_config()).unwrap();
    let streamed = table.key_for_shard(0, 12);
    let other = table.key_for_shard(2, 12);
    table.write_for_key(&streamed, &b"long stream"[..]).unwrap();
    table.write_for_key(&other, &b"other"[..]).unwrap();
    table.resolve_or_open(3).unwrap();

    let mut reader = table.read_for_key(&streamed).unwrap();
    let mut head = [0u8; 4];
    reader.read_exact(&mut head).unwrap();

    let (tx, rx) = mpsc::channel();
    let shared = Arc::clone(table.table());
    std::thread::spawn(move || {
        let closed = shared.destroy(3);
        let found = shared.exists_for_key(&other).map_err(|e| e.to_string());
        let _ = tx.send((closed, found));
    });
    let (closed, found) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(closed);
    assert_eq!(found, Ok(true));

    // The streamed shard is busy and survives destroy
    assert!(!table.destroy(0));
    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).unwrap();
    assert_eq!(&head, b"long");
    assert_eq!(&rest[..7], b" stream");
}

#[test]
fn test_rewrite_drops_stale_chunks() {
    init_tracing();

    let mut config = TestTable::small_config();
    config.stream.pad_last_chunk = false;
    let table = TestTable::memory(config).unwrap();
    let key = coerce_key(b"rewritten");

    table.write_for_key(&key, &b"AAAABBBBCCCC"[..]).unwrap();
    table.write_for_key(&key, &b"zz"[..]).unwrap();

    let data = table.read_for_key(&key).unwrap().read_to_vec().unwrap();
    assert_eq!(data, b"zz");
    assert_eq!(table.unlink_for_key(&key).unwrap(), 1);
}

#[test]
fn test_fan_out_propagates_open_failure() {
    init_tracing();

    let table = TestTable::memory(TestTable::small_config()).unwrap();
    table
        .write_for_key(&table.key_for_shard(0, 0), &b"x"[..])
        .unwrap();
    table.destroy(0);

    table.memory_opener().unwrap().set_fail_opens(true);
    assert!(matches!(
        table.stat().unwrap_err(),
        StoreError::ShardOpen { .. }
    ));
    assert!(table.list().is_err());
}

#[test]
fn test_idle_shards_are_closed_and_reopened() {
    init_tracing();

    let mut config = TestTable::small_config();
    config.idle_timeout_ms = 30;
    let table = TestTable::memory(config).unwrap();
    let key = table.key_for_shard(2, 7);
    table.write_for_key(&key, &b"evict me"[..]).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while table.is_open(2) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!table.is_open(2));
    assert_eq!(table.memory_opener().unwrap().open_handles(), 0);

    let data = table.read_for_key(&key).unwrap().read_to_vec().unwrap();
    assert_eq!(data, b"evict me");
}

#[test]
fn test_rocksdb_table_persists_across_reopen() {
    init_tracing();

    let mut config = TestTable::small_config();
    config.stream.pad_last_chunk = false;
    let mut table = TestTable::rocksdb(config).unwrap();
    let reference_id = *table.reference_id();

    let key = coerce_key(b"persisted file");
    table.write_for_key(&key, &b"hello rocksdb"[..]).unwrap();
    table.flush().unwrap();

    table.reopen().unwrap();
    assert_eq!(*table.reference_id(), reference_id);
    assert_eq!(table.open_shard_count(), 0);

    let data = table.read_for_key(&key).unwrap().read_to_vec().unwrap();
    assert_eq!(data, b"hello rocksdb");

    let listing = table.list().unwrap();
    let total: usize = listing.iter().map(|l| l.keys.len()).sum();
    assert_eq!(total, 1);
}

#[test]
fn test_table_path_gets_extension() {
    init_tracing();

    let table = TestTable::memory(TestTable::small_config()).unwrap();
    assert_eq!(table.root(), table.dir().join("table.kfs"));
    assert!(table.root().join("r.id").is_file());
}

#[test]
fn test_invalid_content_key_length() {
    init_tracing();

    let table = TestTable::memory(TestTable::small_config()).unwrap();
    let shard = table.resolve_or_open(0).unwrap();
    let err = shard
        .layout()
        .item_key(&[0u8; KEY_LEN - 1], 0)
        .unwrap_err();
    assert_eq!(
        err,
        KeyError::InvalidKey {
            expected: KEY_LEN,
            actual: KEY_LEN - 1
        }
    );
}

#[test]
fn test_table_handle_is_shareable() {
    init_tracing();

    let table = TestTable::memory(TestTable::small_config()).unwrap();
    let shared: Arc<ShardTable> = Arc::clone(table.table());
    let handle = std::thread::spawn(move || shared.resolve_or_open(3).map(|s| s.index()));
    assert_eq!(handle.join().unwrap().unwrap(), 3);
    assert!(table.is_open(3));
}
