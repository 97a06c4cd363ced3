use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use crate::error::{CResult, Error};
use crate::storage::engine::Engine;
use crate::storage::{ScanIteratorT, Status};

const DEFAULT_SHARDS: usize = 512;

/// An in-memory storage engine sharded across a power-of-two number of
/// independent maps (default 512), keyed on a hash of the key.
///
/// Point operations (get/set/delete) only ever lock the single shard that
/// owns the key, so puts and deletes on keys that hash to different shards
/// proceed without mutual exclusion. A range or prefix scan cannot know in
/// advance which shards its keys live in -- hashing deliberately discards
/// lexicographic locality -- so scans acquire every shard's lock, always in
/// ascending shard-id order, to avoid deadlocking against a concurrent scan
/// going the other way.
pub struct ShardedMemory {
    shards: Vec<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl ShardedMemory {
    /// Creates a sharded in-memory engine with `shard_count` shards, rounded
    /// up to the next power of two if it isn't one already.
    pub fn with_shards(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1).next_power_of_two();
        let mut shards = Vec::with_capacity(shard_count);
        shards.resize_with(shard_count, || Mutex::new(BTreeMap::new()));
        Self { shards }
    }

    /// Creates a sharded in-memory engine with the default shard count (512).
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & (self.shards.len() - 1)
    }

    /// Locks every shard in ascending shard-id order and collects the
    /// key/value pairs whose key falls within `range`.
    fn collect_range(&self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let guard = shard.lock().expect("shard lock poisoned");
            for (k, v) in guard.range((range.start_bound().cloned(), range.end_bound().cloned())) {
                out.push((k.clone(), v.clone()));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

impl Default for ShardedMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ShardedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "memory")
    }
}

impl Engine for ShardedMemory {
    type ScanIterator<'a> = MemoryScanIterator;

    fn delete(&mut self, key: &[u8]) -> CResult<bool> {
        let idx = self.shard_index(key);
        let mut shard = self.shards[idx].lock().expect("shard lock poisoned");
        Ok(shard.remove(key).is_some())
    }

    fn flush(&mut self) -> CResult<()> {
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        let idx = self.shard_index(key);
        let shard = self.shards[idx].lock().expect("shard lock poisoned");
        Ok(shard.get(key).cloned())
    }

    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_>
        where Self: Sized {
        MemoryScanIterator { items: self.collect_range(range).into_iter().collect() }
    }

    fn scan_dyn(
        &mut self,
        range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
    ) -> Box<dyn ScanIteratorT + '_> {
        Box::new(self.scan(range))
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        let idx = self.shard_index(key);
        let mut shard = self.shards[idx].lock().expect("shard lock poisoned");
        shard.insert(key.to_vec(), value);
        Ok(())
    }

    fn status(&mut self) -> CResult<Status> {
        let mut keys = 0u64;
        let mut size = 0u64;
        for shard in &self.shards {
            let guard = shard.lock().expect("shard lock poisoned");
            keys += guard.len() as u64;
            size += guard.iter().fold(0, |acc, (k, v)| acc + k.len() as u64 + v.len() as u64);
        }
        Ok(Status {
            name: self.to_string(),
            keys,
            size,
            total_disk_size: 0,
            live_disk_size: 0,
            garbage_disk_size: 0,
        })
    }

    fn snapshot(&mut self) -> CResult<Vec<u8>> {
        let all = self.collect_range(..);
        bincode::serialize(&all).map_err(|e| Error::Encode(e.to_string()))
    }

    fn restore(&mut self, snapshot: &[u8]) -> CResult<()> {
        let all: Vec<(Vec<u8>, Vec<u8>)> =
            bincode::deserialize(snapshot).map_err(|e| Error::Decode(e.to_string()))?;
        for shard in &self.shards {
            shard.lock().expect("shard lock poisoned").clear();
        }
        for (k, v) in all {
            self.set(&k, v)?;
        }
        Ok(())
    }
}

/// Scan iterator over a materialized, already-sorted snapshot of the matched
/// range. Unlike a single BTreeMap's range iterator this can't borrow
/// directly from the engine, since the matched entries were collected across
/// many independently locked shards.
pub struct MemoryScanIterator {
    items: std::collections::VecDeque<(Vec<u8>, Vec<u8>)>,
}

impl Iterator for MemoryScanIterator {
    type Item = CResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.items.pop_front().map(Ok)
    }
}

impl DoubleEndedIterator for MemoryScanIterator {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.items.pop_back().map(Ok)
    }
}
