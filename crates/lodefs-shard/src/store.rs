//! The embedded key-value store backing a shard.
//!
//! Seven column families of sorted byte keys, with the operations the state
//! engine needs from its storage layer:
//!
//! - point gets and bounded forward/backward scans over committed state
//! - atomic write batches with a savepoint (the apply path rolls back a
//!   failed operation while keeping the log-index advance)
//! - an integer-add merge operation for the block-service reverse index
//! - point-in-time read snapshots, atomically swapped on flush
//!
//! The backing structure is a BTreeMap per column family. Keys encode
//! big-endian so lexicographic order equals numeric order.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use tracing::debug;

/// The column families of a shard database.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ColumnFamily {
    /// Shard info, id allocators, applied-log cursor.
    Default = 0,
    /// Directory inodes.
    Directories = 1,
    /// Committed file and symlink inodes.
    Files = 2,
    /// Files in construction or reclamation.
    Transient = 3,
    /// Per-file span maps.
    Spans = 4,
    /// Directory entries, current and snapshot.
    Edges = 5,
    /// Reverse index: (block service, file) -> block count.
    BlockServicesToFiles = 6,
}

const CF_COUNT: usize = 7;

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// The full contents of a store at one point in time.
#[derive(Clone, Default)]
pub struct StoreState {
    cfs: [Map; CF_COUNT],
}

impl StoreState {
    fn cf(&self, cf: ColumnFamily) -> &Map {
        &self.cfs[cf as usize]
    }

    fn cf_mut(&mut self, cf: ColumnFamily) -> &mut Map {
        &mut self.cfs[cf as usize]
    }

    /// Point lookup.
    pub fn get(&self, cf: ColumnFamily, key: &[u8]) -> Option<Vec<u8>> {
        self.cf(cf).get(key).cloned()
    }

    /// Forward scan over `[start, end)`; the callback returns false to stop.
    pub fn scan_forward(
        &self,
        cf: ColumnFamily,
        start: &[u8],
        end: Option<&[u8]>,
        mut f: impl FnMut(&[u8], &[u8]) -> bool,
    ) {
        let upper = match end {
            Some(end) => Bound::Excluded(end.to_vec()),
            None => Bound::Unbounded,
        };
        for (k, v) in self
            .cf(cf)
            .range::<Vec<u8>, _>((Bound::Included(start.to_vec()), upper))
        {
            if !f(k, v) {
                break;
            }
        }
    }

    /// Backward scan starting from the largest key `<= start` down to
    /// `end` (inclusive); the callback returns false to stop.
    pub fn scan_backward(
        &self,
        cf: ColumnFamily,
        start: &[u8],
        end: Option<&[u8]>,
        mut f: impl FnMut(&[u8], &[u8]) -> bool,
    ) {
        let lower = match end {
            Some(end) => Bound::Included(end.to_vec()),
            None => Bound::Unbounded,
        };
        for (k, v) in self
            .cf(cf)
            .range::<Vec<u8>, _>((lower, Bound::Included(start.to_vec())))
            .rev()
        {
            if !f(k, v) {
                break;
            }
        }
    }

    /// The largest entry with key `<= key`, like an iterator seek-for-prev.
    pub fn seek_for_prev(&self, cf: ColumnFamily, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.cf(cf)
            .range::<Vec<u8>, _>((Bound::Unbounded, Bound::Included(key.to_vec())))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    /// The smallest entry with key `>= key`.
    pub fn seek(&self, cf: ColumnFamily, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.cf(cf)
            .range::<Vec<u8>, _>(key.to_vec()..)
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }
}

/// One operation of a write batch.
#[derive(Clone, Debug)]
enum BatchOp {
    Put {
        cf: ColumnFamily,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: ColumnFamily,
        key: Vec<u8>,
    },
    /// Adds a signed delta to a little-endian i64 value, treating a missing
    /// key as zero.
    MergeAdd {
        cf: ColumnFamily,
        key: Vec<u8>,
        delta: i64,
    },
}

/// A buffered set of writes, committed atomically.
///
/// Reads do not see buffered writes; apply handlers read committed state and
/// the batch lands at the end. The savepoint marks the boundary between the
/// log-cursor advance and the per-operation mutations.
#[derive(Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    savepoint: usize,
}

impl WriteBatch {
    pub fn new() -> WriteBatch {
        WriteBatch::default()
    }

    pub fn put(&mut self, cf: ColumnFamily, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put { cf, key, value });
    }

    pub fn delete(&mut self, cf: ColumnFamily, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete { cf, key });
    }

    pub fn merge_add(&mut self, cf: ColumnFamily, key: Vec<u8>, delta: i64) {
        self.ops.push(BatchOp::MergeAdd { cf, key, delta });
    }

    /// Marks the current position; a later rollback drops everything after
    /// it.
    pub fn set_savepoint(&mut self) {
        self.savepoint = self.ops.len();
    }

    /// Drops all operations buffered since the savepoint.
    pub fn rollback_to_savepoint(&mut self) {
        self.ops.truncate(self.savepoint);
    }

    /// Number of buffered operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// A shard's store: committed state plus the published read snapshot.
pub struct Store {
    live: RwLock<StoreState>,
    snapshot: RwLock<Arc<StoreState>>,
}

impl Store {
    /// Creates an empty store with an empty published snapshot.
    pub fn new() -> Store {
        Store {
            live: RwLock::new(StoreState::default()),
            snapshot: RwLock::new(Arc::new(StoreState::default())),
        }
    }

    /// Point lookup against committed state.
    pub fn get(&self, cf: ColumnFamily, key: &[u8]) -> Option<Vec<u8>> {
        self.live.read().unwrap().get(cf, key)
    }

    /// Direct write to committed state. Only bootstrap uses this; everything
    /// else goes through batches.
    pub fn put(&self, cf: ColumnFamily, key: Vec<u8>, value: Vec<u8>) {
        self.live.write().unwrap().cf_mut(cf).insert(key, value);
    }

    /// Runs a closure against committed state under the read lock.
    pub fn with_committed<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        f(&self.live.read().unwrap())
    }

    /// The currently published read snapshot.
    pub fn snapshot(&self) -> Arc<StoreState> {
        self.snapshot.read().unwrap().clone()
    }

    /// Applies a batch atomically to committed state.
    pub fn commit(&self, batch: WriteBatch) {
        let mut live = self.live.write().unwrap();
        for op in batch.ops {
            match op {
                BatchOp::Put { cf, key, value } => {
                    live.cf_mut(cf).insert(key, value);
                }
                BatchOp::Delete { cf, key } => {
                    live.cf_mut(cf).remove(&key);
                }
                BatchOp::MergeAdd { cf, key, delta } => {
                    let map = live.cf_mut(cf);
                    let prev = map.get(&key).map(decode_i64).unwrap_or(0);
                    map.insert(key, (prev + delta).to_le_bytes().to_vec());
                }
            }
        }
    }

    /// Publishes a fresh snapshot of committed state for readers.
    pub fn flush(&self) {
        let fresh = Arc::new(self.live.read().unwrap().clone());
        *self.snapshot.write().unwrap() = fresh;
        debug!("published fresh read snapshot");
    }
}

impl Default for Store {
    fn default() -> Self {
        Store::new()
    }
}

fn decode_i64(bytes: &Vec<u8>) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[..8]);
    i64::from_le_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_commit_atomic() {
        let store = Store::new();
        let mut batch = WriteBatch::new();
        batch.put(ColumnFamily::Files, b"a".to_vec(), b"1".to_vec());
        batch.put(ColumnFamily::Files, b"b".to_vec(), b"2".to_vec());
        batch.delete(ColumnFamily::Files, b"a".to_vec());
        store.commit(batch);

        assert_eq!(store.get(ColumnFamily::Files, b"a"), None);
        assert_eq!(store.get(ColumnFamily::Files, b"b"), Some(b"2".to_vec()));
    }

    #[test]
    fn test_column_families_are_disjoint() {
        let store = Store::new();
        store.put(ColumnFamily::Files, b"k".to_vec(), b"files".to_vec());
        store.put(ColumnFamily::Edges, b"k".to_vec(), b"edges".to_vec());
        assert_eq!(store.get(ColumnFamily::Files, b"k"), Some(b"files".to_vec()));
        assert_eq!(store.get(ColumnFamily::Edges, b"k"), Some(b"edges".to_vec()));
        assert_eq!(store.get(ColumnFamily::Spans, b"k"), None);
    }

    #[test]
    fn test_savepoint_rollback() {
        let store = Store::new();
        let mut batch = WriteBatch::new();
        batch.put(ColumnFamily::Default, b"cursor".to_vec(), b"1".to_vec());
        batch.set_savepoint();
        batch.put(ColumnFamily::Files, b"x".to_vec(), b"y".to_vec());
        batch.rollback_to_savepoint();
        store.commit(batch);

        assert_eq!(
            store.get(ColumnFamily::Default, b"cursor"),
            Some(b"1".to_vec())
        );
        assert_eq!(store.get(ColumnFamily::Files, b"x"), None);
    }

    #[test]
    fn test_merge_add() {
        let store = Store::new();
        let mut batch = WriteBatch::new();
        batch.merge_add(ColumnFamily::BlockServicesToFiles, b"k".to_vec(), 3);
        batch.merge_add(ColumnFamily::BlockServicesToFiles, b"k".to_vec(), -1);
        store.commit(batch);

        let bytes = store
            .get(ColumnFamily::BlockServicesToFiles, b"k")
            .unwrap();
        assert_eq!(decode_i64(&bytes), 2);

        let mut batch = WriteBatch::new();
        batch.merge_add(ColumnFamily::BlockServicesToFiles, b"k".to_vec(), -2);
        store.commit(batch);
        let bytes = store
            .get(ColumnFamily::BlockServicesToFiles, b"k")
            .unwrap();
        assert_eq!(decode_i64(&bytes), 0);
    }

    #[test]
    fn test_snapshot_isolation() {
        let store = Store::new();
        store.put(ColumnFamily::Files, b"k".to_vec(), b"old".to_vec());
        store.flush();
        let snap = store.snapshot();

        store.put(ColumnFamily::Files, b"k".to_vec(), b"new".to_vec());
        // snapshot still sees the old value until the next flush
        assert_eq!(snap.get(ColumnFamily::Files, b"k"), Some(b"old".to_vec()));
        assert_eq!(
            store.snapshot().get(ColumnFamily::Files, b"k"),
            Some(b"old".to_vec())
        );

        store.flush();
        assert_eq!(
            store.snapshot().get(ColumnFamily::Files, b"k"),
            Some(b"new".to_vec())
        );
    }

    #[test]
    fn test_scan_forward_bounds() {
        let store = Store::new();
        for k in [b"a", b"b", b"c", b"d"] {
            store.put(ColumnFamily::Spans, k.to_vec(), k.to_vec());
        }
        let mut seen = Vec::new();
        store.with_committed(|state| {
            state.scan_forward(ColumnFamily::Spans, b"b", Some(b"d"), |k, _| {
                seen.push(k.to_vec());
                true
            });
        });
        assert_eq!(seen, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_scan_backward() {
        let store = Store::new();
        for k in [b"a", b"b", b"c", b"d"] {
            store.put(ColumnFamily::Spans, k.to_vec(), k.to_vec());
        }
        let mut seen = Vec::new();
        store.with_committed(|state| {
            state.scan_backward(ColumnFamily::Spans, b"c", Some(b"b"), |k, _| {
                seen.push(k.to_vec());
                true
            });
        });
        assert_eq!(seen, vec![b"c".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_seek_for_prev() {
        let store = Store::new();
        store.put(ColumnFamily::Spans, b"b".to_vec(), b"1".to_vec());
        store.put(ColumnFamily::Spans, b"d".to_vec(), b"2".to_vec());
        store.with_committed(|state| {
            // exact hit
            assert_eq!(
                state.seek_for_prev(ColumnFamily::Spans, b"b").unwrap().0,
                b"b".to_vec()
            );
            // between keys lands on the lower one
            assert_eq!(
                state.seek_for_prev(ColumnFamily::Spans, b"c").unwrap().0,
                b"b".to_vec()
            );
            // below the smallest key finds nothing
            assert_eq!(state.seek_for_prev(ColumnFamily::Spans, b"a"), None);
        });
    }
}
