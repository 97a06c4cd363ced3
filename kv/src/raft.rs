use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::{CResult, Error};

/// One committed log entry, ready for the apply loop to decode and apply.
/// `index` is the consensus log position, used purely for observability --
/// the apply loop doesn't need gaps detection since delivery is in order.
#[derive(Debug, Clone)]
pub struct CommittedEntry {
    pub index: u64,
    pub data: Vec<u8>,
}

/// What the apply loop needs from a consensus layer, kept deliberately
/// narrow: propose an opaque payload, learn whether this node may propose
/// right now, and manage cluster membership. Running an actual consensus
/// protocol is out of scope; this trait is the seam a real Raft
/// implementation would be plugged in behind.
pub trait RaftHandle: Send + Sync {
    /// Proposes `data` for replication. Returns once the proposal has been
    /// accepted for replication, not once it's committed -- the caller
    /// learns of commit by reading from the committed-entry stream.
    fn propose(&self, data: Vec<u8>) -> CResult<()>;

    /// Whether this node currently believes it is the leader and may
    /// propose entries.
    fn is_leader(&self) -> bool;

    fn add_member(&self, member_id: u64, address: String) -> CResult<()>;

    fn remove_member(&self, member_id: u64) -> CResult<()>;

    /// Hands over the receiving half of the committed-entry stream. Returns
    /// `None` if already taken -- there is only ever one apply loop per
    /// handle.
    fn take_committed_receiver(&self) -> Option<mpsc::UnboundedReceiver<CommittedEntry>>;
}

/// A trivial `RaftHandle` for a cluster of one: every proposal commits
/// immediately, in submission order, with no replication. This exists so
/// the crate is runnable and testable standalone without a real consensus
/// implementation; production deployments supply their own `RaftHandle`.
pub struct SingleNodeRaft {
    next_index: AtomicU64,
    sender: mpsc::UnboundedSender<CommittedEntry>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<CommittedEntry>>>,
}

impl SingleNodeRaft {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self { next_index: AtomicU64::new(1), sender, receiver: Mutex::new(Some(receiver)) }
    }
}

impl Default for SingleNodeRaft {
    fn default() -> Self {
        Self::new()
    }
}

impl RaftHandle for SingleNodeRaft {
    fn propose(&self, data: Vec<u8>) -> CResult<()> {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        self.sender
            .send(CommittedEntry { index, data })
            .map_err(|_| Error::Unavailable("raft committed-entry channel closed".into()))
    }

    fn is_leader(&self) -> bool {
        true
    }

    fn add_member(&self, _member_id: u64, _address: String) -> CResult<()> {
        Err(Error::InvalidArgument("single-node raft does not support membership changes".into()))
    }

    fn remove_member(&self, _member_id: u64) -> CResult<()> {
        Err(Error::InvalidArgument("single-node raft does not support membership changes".into()))
    }

    fn take_committed_receiver(&self) -> Option<mpsc::UnboundedReceiver<CommittedEntry>> {
        self.receiver.lock().expect("receiver lock poisoned").take()
    }
}
