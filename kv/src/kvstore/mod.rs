pub mod keyspace;

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};

/// The current state of one key. Unlike a true MVCC store, only the current
/// record is retained -- there is no historical version chain. A read at a
/// revision older than `mod_revision` (and not equal to it) cannot be
/// satisfied from here; the caller is expected to reject it as compacted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub value: Vec<u8>,

    /// The revision at which this key was most recently created, i.e. the
    /// revision of the put that transitioned it from absent to present.
    pub create_revision: i64,

    /// The revision of the most recent modification to this key (create,
    /// overwrite, or value-preserving lease rebind all count).
    pub mod_revision: i64,

    /// Number of modifications since the key was created. Resets to 1 each
    /// time the key is recreated after a delete.
    pub version: i64,

    /// Id of the lease this key is attached to, or 0 for none.
    pub lease: i64,
}

/// The authoritative in-memory key index. The apply loop is the only writer;
/// every mutation receives the revision it should record as a parameter,
/// since revision allocation is owned by `RevisionSource` one layer up.
#[derive(Debug, Default)]
pub struct KvState {
    records: BTreeMap<Vec<u8>, KeyRecord>,
}

impl KvState {
    pub fn new() -> Self {
        Self { records: BTreeMap::new() }
    }

    /// Rebuilds state from records read back exactly as a storage engine
    /// persisted them, with no version/revision recomputation. Used to
    /// restore the in-memory index from disk at startup.
    pub fn restore(records: Vec<(Vec<u8>, KeyRecord)>) -> Self {
        Self { records: records.into_iter().collect() }
    }

    /// The highest `mod_revision` across every record, or 0 if empty. Used to
    /// resume the revision counter after restoring from disk.
    pub fn max_mod_revision(&self) -> i64 {
        self.records.values().map(|r| r.mod_revision).max().unwrap_or(0)
    }

    pub fn get(&self, key: &[u8]) -> Option<&KeyRecord> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Writes `value` under `key` at `revision`, binding it to `lease` (0 for
    /// none). Returns the new record and the record that was replaced, if
    /// any.
    pub fn put(
        &mut self,
        key: &[u8],
        value: Vec<u8>,
        lease: i64,
        revision: i64,
    ) -> (KeyRecord, Option<KeyRecord>) {
        let prev = self.records.get(key).cloned();
        let record = match &prev {
            Some(existing) => KeyRecord {
                value,
                create_revision: existing.create_revision,
                mod_revision: revision,
                version: existing.version + 1,
                lease,
            },
            None => KeyRecord { value, create_revision: revision, mod_revision: revision, version: 1, lease },
        };
        self.records.insert(key.to_vec(), record.clone());
        (record, prev)
    }

    /// Returns up to `limit` records (0 meaning unlimited) whose key falls in
    /// `[key, range_end)` per `keyspace::to_bounds`, in key order.
    pub fn range(&self, key: &[u8], range_end: &[u8], limit: usize) -> Vec<(Vec<u8>, KeyRecord)> {
        let (start, end) = keyspace::to_bounds(key, range_end);
        let iter = self.records.range((start, end)).map(|(k, v)| (k.clone(), v.clone()));
        if limit == 0 {
            iter.collect()
        } else {
            iter.take(limit).collect()
        }
    }

    /// Removes every key in `[key, range_end)` and returns the removed
    /// records, in key order, for the caller to turn into watch events and
    /// lease detachments.
    pub fn delete_range(&mut self, key: &[u8], range_end: &[u8]) -> Vec<(Vec<u8>, KeyRecord)> {
        let (start, end) = keyspace::to_bounds(key, range_end);
        let keys: Vec<Vec<u8>> = self.records.range((start, end)).map(|(k, _)| k.clone()).collect();
        keys.into_iter()
            .map(|k| {
                let record = self.records.remove(&k).expect("key just observed in range");
                (k, record)
            })
            .collect()
    }

    /// Removes a single key unconditionally (used by cascading lease
    /// revocation, where the key set is already known). Returns the removed
    /// record, if it existed.
    pub fn delete(&mut self, key: &[u8]) -> Option<KeyRecord> {
        self.records.remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_on_absent_key_sets_create_and_mod_revision_equal() {
        let mut state = KvState::new();
        let (record, prev) = state.put(b"a", vec![1], 0, 5);
        assert!(prev.is_none());
        assert_eq!(record.create_revision, 5);
        assert_eq!(record.mod_revision, 5);
        assert_eq!(record.version, 1);
    }

    #[test]
    fn put_on_existing_key_preserves_create_revision_and_bumps_version() {
        let mut state = KvState::new();
        state.put(b"a", vec![1], 0, 5);
        let (record, prev) = state.put(b"a", vec![2], 0, 9);
        assert_eq!(prev.unwrap().value, vec![1]);
        assert_eq!(record.create_revision, 5);
        assert_eq!(record.mod_revision, 9);
        assert_eq!(record.version, 2);
    }

    #[test]
    fn recreated_key_resets_version_to_one() {
        let mut state = KvState::new();
        state.put(b"a", vec![1], 0, 1);
        state.put(b"a", vec![2], 0, 2);
        state.delete_range(b"a", b"");
        let (record, prev) = state.put(b"a", vec![3], 0, 3);
        assert!(prev.is_none());
        assert_eq!(record.create_revision, 3);
        assert_eq!(record.version, 1);
    }

    #[test]
    fn range_is_half_open() {
        let mut state = KvState::new();
        state.put(b"a", vec![1], 0, 1);
        state.put(b"b", vec![2], 0, 2);
        state.put(b"c", vec![3], 0, 3);

        let got = state.range(b"a", b"c", 0);
        assert_eq!(got.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn range_open_ended_sentinel_covers_rest_of_keyspace() {
        let mut state = KvState::new();
        state.put(b"a", vec![1], 0, 1);
        state.put(b"z", vec![2], 0, 2);

        let got = state.range(b"b", &[0], 0);
        assert_eq!(got.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(), vec![b"z".to_vec()]);
    }

    #[test]
    fn single_key_request_ignores_other_keys() {
        let mut state = KvState::new();
        state.put(b"a", vec![1], 0, 1);
        state.put(b"ab", vec![2], 0, 2);

        let got = state.range(b"a", b"", 0);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, b"a".to_vec());
    }

    #[test]
    fn delete_range_removes_and_returns_matched_keys() {
        let mut state = KvState::new();
        state.put(b"a", vec![1], 0, 1);
        state.put(b"b", vec![2], 0, 2);

        let deleted = state.delete_range(b"a", &[0]);
        assert_eq!(deleted.len(), 2);
        assert!(state.is_empty());
    }

    #[test]
    fn range_respects_limit() {
        let mut state = KvState::new();
        for (i, k) in [b"a", b"b", b"c"].into_iter().enumerate() {
            state.put(k, vec![i as u8], 0, i as i64 + 1);
        }
        let got = state.range(b"a", &[0], 2);
        assert_eq!(got.len(), 2);
    }
}
