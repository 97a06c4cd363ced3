use std::path::PathBuf;
use crate::error::{CResult, Error};
use crate::storage::{KeyDir, ScanIteratorT, Status};
use crate::storage::engine::Engine;
use crate::storage::log::Log;

/// A log-structured persistent engine, adapted from a classic bitcask design.
///
/// `Persistent` writes key-value pairs to a single append-only log file and
/// keeps a mapping of keys to file positions in memory (the keydir). All live
/// keys must fit in memory. Deletes write a tombstone to the log. To remove
/// old garbage, the log can be compacted by writing a new log containing only
/// live data.
///
/// The apply loop uses one logical keyspace per record kind (`kv`, `lease`,
/// `meta`), distinguished by a single-byte prefix prepended to every key
/// before it reaches the log. This lets the three spaces share one log file
/// and one keydir while still being independently scannable.
///
/// Simplifications relative to a production bitcask:
///
/// - A single append-only log file of arbitrary size is used instead of
///   multiple fixed-size segments. This increases compaction cost, since the
///   entire log is rewritten on every compaction.
/// - No hint files; the log is scanned on open to rebuild the keydir.
/// - Log entries carry no timestamps or checksums.
///
/// The structure of a log entry is:
///
/// - Key length as big-endian u32.
/// - Value length as big-endian i32, or -1 for tombstones.
/// - Key as raw bytes (max 2 GB), prefix byte included.
/// - Value as raw bytes (max 2 GB).
pub struct Persistent {
    log: Log,
    keydir: KeyDir,
}

/// Logical keyspace prefixes multiplexed onto the single log file.
pub mod keyspace {
    use std::ops::Bound;

    pub const KV: u8 = b'k';
    pub const LEASE: u8 = b'l';
    pub const META: u8 = b'm';

    /// Half-open bounds covering every key tagged with `space`, for use with
    /// `Engine::scan_dyn` by layers that only see a `&mut dyn Engine`.
    pub fn bounds(space: u8) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
        let start = Bound::Included(vec![space]);
        let end = match space.checked_add(1) {
            Some(next) => Bound::Excluded(vec![next]),
            None => Bound::Unbounded,
        };
        (start, end)
    }
}

/// Prepends a logical-space tag byte to `key`. Exposed so other layers (the
/// apply loop) can address the same keyspaces through the `Engine` trait
/// without depending on `Persistent` directly.
pub fn prefixed(space: u8, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.push(space);
    out.extend_from_slice(key);
    out
}

impl Persistent {
    /// Opens or creates a persistent engine backed by the given file.
    pub fn new(path: PathBuf) -> CResult<Self> {
        Self::new_with_lock(path, true)
    }

    pub fn new_with_lock(path: PathBuf, try_lock: bool) -> CResult<Self> {
        let mut log = Log::new_with_lock(path, try_lock)?;
        let keydir = log.build_keydir()?;
        Ok(Self { log, keydir })
    }

    /// Opens a persistent engine, automatically compacting it if the amount
    /// of garbage exceeds the given ratio when opened.
    pub fn new_compact(path: PathBuf, garbage_ratio_threshold: f64) -> CResult<Self> {
        let mut s = Self::new(path)?;

        let status = s.status()?;
        let garbage_ratio = status.garbage_disk_size as f64 / status.total_disk_size as f64;
        if status.garbage_disk_size > 0 && garbage_ratio >= garbage_ratio_threshold {
            log::info!(
                "compacting {} to remove {} bytes of garbage ({:.0}% of {} bytes)",
                s.log.path.display(),
                status.garbage_disk_size,
                garbage_ratio * 100.0,
                status.total_disk_size,
            );
            s.compact()?;
        }

        Ok(s)
    }

    pub fn get_path(&self) -> Option<&str> {
        self.log.path.to_str()
    }

    /// Scans a logical keyspace by prefix, stripping the prefix byte from
    /// returned keys.
    pub fn scan_keyspace(&mut self, space: u8) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan_prefix(&[space])
            .map(|r| r.map(|(k, v)| (k[1..].to_vec(), v)))
            .collect()
    }

    /// Compacts the current log file by writing out a new log file containing
    /// only live keys and replacing the current file with it.
    pub fn compact(&mut self) -> CResult<()> {
        let mut tmp_path = self.log.path.clone();
        tmp_path.set_extension("new");

        let (mut new_log, new_keydir) = self.write_log(tmp_path)?;

        std::fs::rename(&new_log.path, &self.log.path).map_err(|err| {
            Error::Internal(format!(
                "compact rename from {:?} to {:?} failed: {}",
                new_log.path, self.log.path, err
            ))
        })?;

        new_log.path = self.log.path.clone();
        self.log = new_log;
        self.keydir = new_keydir;
        Ok(())
    }

    /// Writes out a new log file with the live entries of the current log
    /// file, in key order, and returns it along with its keydir.
    fn write_log(&mut self, path: PathBuf) -> CResult<(Log, KeyDir)> {
        let mut new_keydir = KeyDir::new();
        let mut new_log = Log::new(path)?;
        new_log.file.set_len(0)?;
        for (key, (value_pos, value_len)) in self.keydir.iter() {
            let value = self.log.read_value(*value_pos, *value_len)?;
            let (pos, len) = new_log.write_entry(key, Some(&value))?;
            new_keydir.insert(key.clone(), (pos + len as u64 - *value_len as u64, *value_len));
        }
        Ok((new_log, new_keydir))
    }
}

impl std::fmt::Display for Persistent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "persistent")
    }
}

impl Engine for Persistent {
    type ScanIterator<'a> = PersistentScanIterator<'a>;

    fn delete(&mut self, key: &[u8]) -> CResult<bool> {
        let existed = self.keydir.contains_key(key);
        self.log.write_entry(key, None)?;
        self.keydir.remove(key);
        Ok(existed)
    }

    fn flush(&mut self) -> CResult<()> {
        Ok(self.log.file.sync_all()?)
    }

    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        if let Some((value_pos, value_len)) = self.keydir.get(key) {
            Ok(Some(self.log.read_value(*value_pos, *value_len)?))
        } else {
            Ok(None)
        }
    }

    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_>
        where Self: Sized {
        PersistentScanIterator { inner: self.keydir.range(range), log: &mut self.log }
    }

    fn scan_dyn(
        &mut self,
        range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
    ) -> Box<dyn ScanIteratorT + '_> {
        Box::new(self.scan(range))
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        let (pos, len) = self.log.write_entry(key, Some(&value))?;
        let value_len = value.len() as u32;
        self.keydir.insert(key.to_vec(), (pos + len as u64 - value_len as u64, value_len));
        Ok(())
    }

    fn status(&mut self) -> CResult<Status> {
        let keys = self.keydir.len() as u64;
        let size = self
            .keydir
            .iter()
            .fold(0, |size, (key, (_, value_len))| size + key.len() as u64 + *value_len as u64);
        let total_disk_size = self.log.file.metadata()?.len();
        let live_disk_size = size + 8 * keys;
        let garbage_disk_size = total_disk_size - live_disk_size;
        Ok(Status {
            name: self.to_string(),
            keys,
            size,
            total_disk_size,
            live_disk_size,
            garbage_disk_size,
        })
    }

    fn snapshot(&mut self) -> CResult<Vec<u8>> {
        let entries = self.scan(..).collect::<CResult<Vec<_>>>()?;
        bincode::serialize(&entries).map_err(|e| Error::Encode(e.to_string()))
    }

    fn restore(&mut self, snapshot: &[u8]) -> CResult<()> {
        let entries: Vec<(Vec<u8>, Vec<u8>)> =
            bincode::deserialize(snapshot).map_err(|e| Error::Decode(e.to_string()))?;
        let keys: Vec<Vec<u8>> = self.keydir.keys().cloned().collect();
        for key in keys {
            self.delete(&key)?;
        }
        for (key, value) in entries {
            self.set(&key, value)?;
        }
        self.flush()
    }

    fn defragment(&mut self) -> CResult<()> {
        self.compact()
    }
}

/// Attempts to flush the file when the engine is dropped.
impl Drop for Persistent {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            log::error!("failed to flush file: {}", error)
        }
    }
}

pub struct PersistentScanIterator<'a> {
    inner: std::collections::btree_map::Range<'a, Vec<u8>, (u64, u32)>,
    log: &'a mut Log,
}

impl<'a> PersistentScanIterator<'a> {
    fn map(&mut self, item: (&Vec<u8>, &(u64, u32))) -> <Self as Iterator>::Item {
        let (key, (value_pos, value_len)) = item;
        Ok((key.clone(), self.log.read_value(*value_pos, *value_len)?))
    }
}

impl<'a> Iterator for PersistentScanIterator<'a> {
    type Item = CResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|item| self.map(item))
    }
}

impl<'a> DoubleEndedIterator for PersistentScanIterator<'a> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(|item| self.map(item))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use crate::error::CResult;
    use crate::storage::engine::{BatchWrite, Engine};
    use crate::storage::log::Log;
    use crate::storage::persistent::{keyspace, prefixed, Persistent};
    use crate::storage::Status;

    super::super::tests::test_engine!({
        let path = tempdir::TempDir::new("demo")?.path().join("whosdb");
        Persistent::new(path)?
    });

    /// Creates a new persistent engine for testing.
    fn setup() -> CResult<Persistent> {
        let path = tempdir::TempDir::new("demo")?.path().join("mydb");
        Persistent::new_with_lock(path, false)
    }

    /// Writes various values primarily for testing log file handling.
    ///
    /// - '': empty key and value
    /// - a: write
    /// - b: write, write
    /// - c: write, delete, write
    /// - d: delete, write
    /// - e: write, delete
    /// - f: delete
    fn setup_log(s: &mut Persistent) -> CResult<()> {
        s.set(b"b", vec![0x01])?;
        s.set(b"b", vec![0x02])?;

        s.set(b"e", vec![0x05])?;
        s.delete(b"e")?;

        s.set(b"c", vec![0x00])?;
        s.delete(b"c")?;
        s.set(b"c", vec![0x03])?;

        s.set(b"", vec![])?;
        s.set(b"a", vec![0x01])?;

        s.delete(b"f")?;

        s.delete(b"d")?;
        s.set(b"d", vec![0x04])?;

        assert_eq!(
            vec![
                (b"".to_vec(), vec![]),
                (b"a".to_vec(), vec![0x01]),
                (b"b".to_vec(), vec![0x02]),
                (b"c".to_vec(), vec![0x03]),
                (b"d".to_vec(), vec![0x04]),
            ],
            s.scan(..).collect::<CResult<Vec<_>>>()?,
        );

        s.flush()?;
        Ok(())
    }

    #[test]
    fn reopen() -> CResult<()> {
        // Don't use setup(), the tempdir would be removed once it falls out of scope.
        let path = tempdir::TempDir::new("demo")?.path().join("adb");
        let mut s = Persistent::new(path.clone())?;
        setup_log(&mut s)?;

        let expect = s.scan(..).collect::<CResult<Vec<_>>>()?;
        drop(s);
        let mut s = Persistent::new(path)?;
        assert_eq!(expect, s.scan(..).collect::<CResult<Vec<_>>>()?);

        Ok(())
    }

    #[test]
    fn new_compact() -> CResult<()> {
        let dir = tempdir::TempDir::new("demo")?;
        let path = dir.path().join("orig");
        let compactpath = dir.path().join("compact");

        let mut s = Persistent::new_compact(path.clone(), 0.2)?;
        setup_log(&mut s)?;
        let status = s.status()?;
        let garbage_ratio = status.garbage_disk_size as f64 / status.total_disk_size as f64;
        drop(s);

        let cases = vec![
            (-1.0, true),
            (0.0, true),
            (garbage_ratio - 0.001, true),
            (garbage_ratio, true),
            (garbage_ratio + 0.001, false),
            (1.0, false),
        ];
        for (threshold, expect_compact) in cases.into_iter() {
            std::fs::copy(&path, &compactpath)?;
            let mut s = Persistent::new_compact(compactpath.clone(), threshold)?;
            let new_status = s.status()?;
            assert_eq!(new_status.live_disk_size, status.live_disk_size);
            if expect_compact {
                assert_eq!(new_status.total_disk_size, status.live_disk_size);
                assert_eq!(new_status.garbage_disk_size, 0);
            } else {
                assert_eq!(new_status, status);
            }
        }

        Ok(())
    }

    #[test]
    fn log_lock() -> CResult<()> {
        let path = tempdir::TempDir::new("demo")?.path().join("t_app");
        let s = Persistent::new(path.clone())?;

        assert!(Persistent::new(path.clone()).is_err());
        drop(s);
        assert!(Persistent::new(path.clone()).is_ok());

        Ok(())
    }

    #[test]
    /// Tests that an incomplete write at the end of the log file is
    /// recovered by discarding the last entry.
    fn recovery() -> CResult<()> {
        let dir = tempdir::TempDir::new("demmo")?;
        let path = dir.path().join("complete");
        let truncpath = dir.path().join("truncated");

        let mut log = Log::new(path.clone())?;
        let mut ends = vec![];

        let (pos, len) = log.write_entry("deleted".as_bytes(), Some(&[1, 2, 3]))?;
        ends.push(pos + len as u64);

        let (pos, len) = log.write_entry("deleted".as_bytes(), None)?;
        ends.push(pos + len as u64);

        let (pos, len) = log.write_entry(&[], Some(&[]))?;
        ends.push(pos + len as u64);

        let (pos, len) = log.write_entry("key".as_bytes(), Some(&[1, 2, 3, 4, 5]))?;
        ends.push(pos + len as u64);

        drop(log);

        let size = std::fs::metadata(&path)?.len();
        for pos in 0..=size {
            std::fs::copy(&path, &truncpath)?;
            let f = std::fs::OpenOptions::new().write(true).open(&truncpath)?;
            f.set_len(pos)?;
            drop(f);

            let mut expect = vec![];
            if pos >= ends[0] {
                expect.push((b"deleted".to_vec(), vec![1, 2, 3]))
            }
            if pos >= ends[1] {
                expect.pop();
            }
            if pos >= ends[2] {
                expect.push((b"".to_vec(), vec![]))
            }
            if pos >= ends[3] {
                expect.push((b"key".to_vec(), vec![1, 2, 3, 4, 5]))
            }

            let mut s = Persistent::new(truncpath.clone())?;
            assert_eq!(expect, s.scan(..).collect::<CResult<Vec<_>>>()?);
        }

        Ok(())
    }

    #[test]
    fn status_before_and_after_compaction() -> CResult<()> {
        let mut s = setup()?;
        setup_log(&mut s)?;

        let before = s.status()?;
        assert_eq!(before.keys, 5);
        assert_eq!(before.size, 8);
        assert!(before.garbage_disk_size > 0);

        s.compact()?;
        let after = s.status()?;
        assert_eq!(after.keys, 5);
        assert_eq!(after.size, 8);
        assert_eq!(after.garbage_disk_size, 0);
        assert_eq!(after.total_disk_size, after.live_disk_size);

        Ok(())
    }

    #[test]
    fn delete_reports_whether_key_existed() -> CResult<()> {
        let mut s = setup()?;
        assert_eq!(s.delete(b"missing")?, false);
        s.set(b"a", vec![1])?;
        assert_eq!(s.delete(b"a")?, true);
        assert_eq!(s.delete(b"a")?, false);
        Ok(())
    }

    #[test]
    fn snapshot_restore_round_trip() -> CResult<()> {
        let mut s = setup()?;
        setup_log(&mut s)?;
        let snap = s.snapshot()?;

        let mut restored = setup()?;
        restored.set(b"stale", vec![9])?;
        restored.restore(&snap)?;

        assert_eq!(restored.scan(..).collect::<CResult<Vec<_>>>()?, s.scan(..).collect::<CResult<Vec<_>>>()?);
        assert_eq!(restored.get(b"stale")?, None);

        Ok(())
    }

    #[test]
    fn keyspace_prefixes_are_independently_scannable() -> CResult<()> {
        let mut s = setup()?;
        s.set(&prefixed(keyspace::KV, b"x"), vec![1])?;
        s.set(&prefixed(keyspace::LEASE, b"x"), vec![2])?;
        s.set(&prefixed(keyspace::META, b"revision"), vec![3])?;

        let kv_entries = s.scan_keyspace(keyspace::KV)?;
        assert_eq!(kv_entries, vec![(b"x".to_vec(), vec![1])]);

        let lease_entries = s.scan_keyspace(keyspace::LEASE)?;
        assert_eq!(lease_entries, vec![(b"x".to_vec(), vec![2])]);

        Ok(())
    }

    #[test]
    fn write_batch_applies_all_ops_and_flushes_once() -> CResult<()> {
        let mut s = setup()?;
        s.set(b"keep", vec![0])?;

        let writes = vec![
            BatchWrite::Set(b"a".to_vec(), vec![1]),
            BatchWrite::Set(b"b".to_vec(), vec![2]),
            BatchWrite::Delete(b"keep".to_vec()),
        ];
        s.apply_batch(writes)?;

        assert_eq!(s.get(b"a")?, Some(vec![1]));
        assert_eq!(s.get(b"b")?, Some(vec![2]));
        assert_eq!(s.get(b"keep")?, None);

        Ok(())
    }
}
