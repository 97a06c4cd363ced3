use crate::error::CResult;
use crate::storage::{ScanIteratorT, Status};

/// One write in a group passed to `Engine::apply_batch`.
pub enum BatchWrite {
    Set(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// A key/value storage engine, where both keys and values are arbitrary byte
/// strings between 0 B and 2 GB, stored in lexicographical key order. Writes
/// are only guaranteed durable after calling flush().
///
/// Only supports single-threaded use since all methods (including reads) take a
/// mutable reference -- serialized access can't be avoided anyway,
/// since both Raft execution and file access is serial.
pub trait Engine: std::fmt::Display + Send + Sync {
    /// The iterator returned by scan().
    type ScanIterator<'a>: ScanIteratorT + 'a
        where
            Self: Sized + 'a; // omit in trait objects, for object safety

    /// Deletes a key. Returns whether the key existed.
    fn delete(&mut self, key: &[u8]) -> CResult<bool>;

    /// Flushes any buffered data to the underlying storage medium.
    fn flush(&mut self) -> CResult<()>;

    /// Gets a value for a key, if it exists.
    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>>;

    /// Iterates over an ordered range of key/value pairs.
    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_>
        where Self: Sized; // omit in trait objects, for object safety

    /// Like scan, but can be used from trait objects. The iterator will use
    /// dynamic dispatch, which has a minor performance penalty.
    fn scan_dyn(
        &mut self,
        range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
    ) -> Box<dyn ScanIteratorT + '_>;

    /// Iterates over all key/value pairs starting with prefix.
    fn scan_prefix(&mut self, prefix: &[u8]) -> Self::ScanIterator<'_>
        where
            Self: Sized, // omit in trait objects, for object safety
    {
        let start = std::ops::Bound::Included(prefix.to_vec());
        let end = match prefix.iter().rposition(|b| *b != 0xff) {
            Some(i) => std::ops::Bound::Excluded(
                prefix.iter().take(i).copied().chain(std::iter::once(prefix[i] + 1)).collect(),
            ),
            None => std::ops::Bound::Unbounded,
        };
        self.scan((start, end))
    }

    /// Sets a value for a key, replacing the existing value if any.
    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()>;

    /// Returns engine status.
    fn status(&mut self) -> CResult<Status>;

    /// Produces an opaque byte-stream snapshot of the full engine contents,
    /// sufficient to recover via `restore`. Used both to install state on a
    /// follower and to serve `Maintenance.Snapshot`.
    fn snapshot(&mut self) -> CResult<Vec<u8>>;

    /// Restores engine contents from a snapshot produced by `snapshot`,
    /// replacing anything currently stored.
    fn restore(&mut self, snapshot: &[u8]) -> CResult<()>;

    /// Reclaims space held by stale data, if the engine has any notion of
    /// it. A no-op by default; engines that accumulate garbage (e.g. an
    /// append-only log) override this.
    fn defragment(&mut self) -> CResult<()> {
        Ok(())
    }

    /// Applies a group of writes as a single unit, flushing once at the end
    /// rather than per write, so a mid-batch crash can't leave a multi-key
    /// mutation partially applied. The default loops `set`/`delete`;
    /// engines with a cheaper atomic-group primitive can override this.
    fn apply_batch(&mut self, writes: Vec<BatchWrite>) -> CResult<()> {
        for write in writes {
            match write {
                BatchWrite::Set(key, value) => self.set(&key, value)?,
                BatchWrite::Delete(key) => {
                    self.delete(&key)?;
                }
            }
        }
        self.flush()
    }
}
