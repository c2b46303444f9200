mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use common::*;
use tessera_storage::{PropertyStore, Transaction};

/// Two writer threads commit interleaved batches on one shard; every
/// commit timestamp must be unique and the retained commit log strictly
/// increasing.
#[test]
fn concurrent_commits_produce_strictly_increasing_timestamps() {
    let t = Arc::new(test_shard());
    const PER_THREAD: i64 = 200;

    let mut handles = Vec::new();
    for writer in 0..2i64 {
        let t = Arc::clone(&t);
        handles.push(thread::spawn(move || {
            let mut timestamps = Vec::with_capacity(PER_THREAD as usize);
            for n in 0..PER_THREAD {
                let key = writer * PER_THREAD + n;
                let txn = t.shard.access(None).unwrap();
                t.shard
                    .create_vertex(&txn, &[t.person], pk(key), PropertyStore::default())
                    .unwrap();
                timestamps.push(txn.commit().unwrap());
            }
            timestamps
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        let timestamps = handle.join().unwrap();
        // Within one thread, commit order is program order.
        for window in timestamps.windows(2) {
            assert!(window[1] > window[0]);
        }
        all.extend(timestamps);
    }

    // Across threads, no timestamp repeats.
    let distinct: BTreeSet<_> = all.iter().copied().collect();
    assert_eq!(distinct.len(), all.len());

    // The commit log (what GC has not yet reclaimed) is keyed by commit
    // timestamp and therefore strictly increasing.
    let log = t.shard.txn_manager().commit_log();
    for window in log.windows(2) {
        assert!(window[1] > window[0]);
    }
    assert!(!log.is_empty());

    // Every vertex landed.
    let reader = t.shard.access(None).unwrap();
    assert_eq!(
        t.shard.vertices_iter(&reader, tessera_storage::View::New).count(),
        2 * PER_THREAD as usize
    );
}
