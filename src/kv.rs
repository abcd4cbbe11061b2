/// Ordered key-value store with checkpoint/rollback.
///
/// Each physical store owns exactly one [`OrderedStore`]: an in-memory
/// ordered map over binary keys, shared behind an `RwLock`. Readers run
/// concurrently; every compound mutation takes the write lock, records a
/// checkpoint, applies all of its index steps, and rolls back to the
/// checkpoint before propagating any error. Partially-applied multi-index
/// writes are therefore never observable.
///
/// Range scans are lazy: [`BatchScan`] pages through the map in bounded
/// batches, re-acquiring the read lock per batch instead of holding it
/// across iterator yields. A scan is restartable only by re-issuing it;
/// entries written behind the scan cursor after a batch was fetched are not
/// revisited.
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

/// The ordered byte map underlying one physical store.
#[derive(Debug, Default)]
pub struct OrderedStore {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    checkpoint: Option<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl OrderedStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a key.
    pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.map.get(key)
    }

    /// Whether a key is present.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.map.contains_key(key)
    }

    /// Insert or replace, returning the previous value.
    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) -> Option<Vec<u8>> {
        self.map.insert(key, value)
    }

    /// Remove a key, returning its value.
    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.remove(key)
    }

    /// Number of entries across all keyspaces.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// First entry at or after `key`.
    pub fn ceiling(&self, key: &[u8]) -> Option<(&Vec<u8>, &Vec<u8>)> {
        self.map
            .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
            .next()
    }

    /// Last entry at or before `key`.
    pub fn floor(&self, key: &[u8]) -> Option<(&Vec<u8>, &Vec<u8>)> {
        self.map
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
    }

    /// Up to `limit` entries with `start <= key < end`, in order.
    /// `end = None` means unbounded above.
    pub fn scan(
        &self,
        start: Bound<&[u8]>,
        end: Option<&[u8]>,
        limit: usize,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let upper = match end {
            Some(e) => Bound::Excluded(e),
            None => Bound::Unbounded,
        };
        self.map
            .range::<[u8], _>((start, upper))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Remove every entry with `start <= key < end`, returning the count.
    pub fn remove_range(&mut self, start: &[u8], end: Option<&[u8]>) -> usize {
        let upper = match end {
            Some(e) => Bound::Excluded(e.to_vec()),
            None => Bound::Unbounded,
        };
        let doomed: Vec<Vec<u8>> = self
            .map
            .range::<[u8], _>((Bound::Included(start), as_slice_bound(&upper)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.map.remove(key);
        }
        doomed.len()
    }

    /// Record the current state as the rollback point for a compound
    /// mutation. Checkpoints don't nest; callers hold the write lock for the
    /// whole critical section.
    pub fn begin(&mut self) {
        debug_assert!(self.checkpoint.is_none(), "checkpoint already active");
        self.checkpoint = Some(self.map.clone());
    }

    /// Discard the rollback point, keeping all changes.
    pub fn commit(&mut self) {
        self.checkpoint = None;
    }

    /// Restore the state recorded by the last [`OrderedStore::begin`].
    pub fn rollback(&mut self) {
        if let Some(saved) = self.checkpoint.take() {
            self.map = saved;
        }
    }
}

fn as_slice_bound(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(v) => Bound::Included(v.as_slice()),
        Bound::Excluded(v) => Bound::Excluded(v.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Handle to one physical store's ordered map.
pub type SharedStore = Arc<RwLock<OrderedStore>>;

/// Create a fresh shared store.
pub fn shared_store() -> SharedStore {
    Arc::new(RwLock::new(OrderedStore::new()))
}

/// Run a compound mutation under the write lock with rollback on error.
///
/// The closure sees the exclusively-locked store with a checkpoint already
/// recorded; if it returns an error the store is restored to the checkpoint
/// before the error propagates.
pub fn with_rollback<T, E>(
    store: &SharedStore,
    f: impl FnOnce(&mut OrderedStore) -> Result<T, E>,
) -> Result<T, E> {
    let mut guard = store.write().unwrap_or_else(|e| e.into_inner());
    guard.begin();
    match f(&mut guard) {
        Ok(value) => {
            guard.commit();
            Ok(value)
        }
        Err(err) => {
            guard.rollback();
            Err(err)
        }
    }
}

/// The exclusive upper bound of a prefix range, or `None` when the prefix is
/// all `0xFF` bytes (unbounded above).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last() {
        if *last == 0xFF {
            end.pop();
        } else {
            *end.last_mut().unwrap() += 1;
            return Some(end);
        }
    }
    None
}

/// A lazy, batched range scan over a shared store.
pub struct BatchScan {
    store: SharedStore,
    /// Next key to fetch from (inclusive on the first batch only).
    cursor: Bound<Vec<u8>>,
    end: Option<Vec<u8>>,
    batch: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
    batch_size: usize,
    exhausted: bool,
}

impl BatchScan {
    /// Scan `[start, end)` in `batch_size`-entry pages.
    pub fn new(store: SharedStore, start: Vec<u8>, end: Option<Vec<u8>>, batch_size: usize) -> Self {
        Self {
            store,
            cursor: Bound::Included(start),
            end,
            batch: Vec::new().into_iter(),
            batch_size: batch_size.max(1),
            exhausted: false,
        }
    }

    /// Scan every key beginning with `prefix`.
    pub fn prefix(store: SharedStore, prefix: Vec<u8>, batch_size: usize) -> Self {
        let end = prefix_end(&prefix);
        Self::new(store, prefix, end, batch_size)
    }

    fn refill(&mut self) {
        let guard = self.store.read().unwrap_or_else(|e| e.into_inner());
        let start = match &self.cursor {
            Bound::Included(k) => Bound::Included(k.as_slice()),
            Bound::Excluded(k) => Bound::Excluded(k.as_slice()),
            Bound::Unbounded => Bound::Unbounded,
        };
        let batch = guard.scan(start, self.end.as_deref(), self.batch_size);
        drop(guard);
        if batch.len() < self.batch_size {
            self.exhausted = true;
        }
        if let Some((last_key, _)) = batch.last() {
            self.cursor = Bound::Excluded(last_key.clone());
        }
        self.batch = batch.into_iter();
    }
}

impl Iterator for BatchScan {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.batch.next() {
                return Some(entry);
            }
            if self.exhausted {
                return None;
            }
            self.refill();
            if self.batch.len() == 0 && self.exhausted {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> SharedStore {
        let store = shared_store();
        {
            let mut guard = store.write().unwrap();
            for i in 0u8..10 {
                guard.insert(vec![1, i], vec![i]);
            }
            guard.insert(vec![2, 0], vec![99]);
        }
        store
    }

    #[test]
    fn test_floor_and_ceiling() {
        let store = populated();
        let guard = store.read().unwrap();
        assert_eq!(guard.floor(&[1, 5]).unwrap().0, &vec![1, 5]);
        assert_eq!(guard.floor(&[1, 255]).unwrap().0, &vec![1, 9]);
        assert_eq!(guard.ceiling(&[1, 10]).unwrap().0, &vec![2, 0]);
        assert!(guard.ceiling(&[3]).is_none());
    }

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end(&[1, 2]), Some(vec![1, 3]));
        assert_eq!(prefix_end(&[1, 0xFF]), Some(vec![2]));
        assert_eq!(prefix_end(&[0xFF, 0xFF]), None);
    }

    #[test]
    fn test_rollback_restores_state() {
        let store = shared_store();
        store.write().unwrap().insert(vec![1], vec![1]);

        let result: Result<(), &str> = with_rollback(&store, |s| {
            s.insert(vec![2], vec![2]);
            s.remove(&[1]);
            Err("boom")
        });
        assert!(result.is_err());

        let guard = store.read().unwrap();
        assert!(guard.contains(&[1]));
        assert!(!guard.contains(&[2]));
    }

    #[test]
    fn test_commit_keeps_changes() {
        let store = shared_store();
        let result: Result<(), &str> = with_rollback(&store, |s| {
            s.insert(vec![7], vec![7]);
            Ok(())
        });
        assert!(result.is_ok());
        assert!(store.read().unwrap().contains(&[7]));
    }

    #[test]
    fn test_batch_scan_is_ordered_and_complete() {
        let store = populated();
        let keys: Vec<Vec<u8>> = BatchScan::prefix(store, vec![1], 3).map(|(k, _)| k).collect();
        assert_eq!(keys.len(), 10);
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_batch_scan_respects_end_bound() {
        let store = populated();
        let keys: Vec<Vec<u8>> = BatchScan::new(store, vec![1, 3], Some(vec![1, 7]), 2)
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![vec![1, 3], vec![1, 4], vec![1, 5], vec![1, 6]]);
    }

    #[test]
    fn test_remove_range() {
        let store = populated();
        let mut guard = store.write().unwrap();
        let removed = guard.remove_range(&[1, 2], Some(&[1, 5]));
        assert_eq!(removed, 3);
        assert!(!guard.contains(&[1, 3]));
        assert!(guard.contains(&[1, 5]));
    }
}
