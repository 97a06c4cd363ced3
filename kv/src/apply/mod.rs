pub mod codec;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::apply::codec::{decode, encode, Envelope, RaftOp};
use crate::error::{CResult, Error};
use crate::kvstore::{KeyRecord, KvState};
use crate::lease::LeaseManager;
use crate::raft::RaftHandle;
use crate::revision::RevisionSource;
use crate::storage::engine::{BatchWrite, Engine};
use crate::storage::persistent::{keyspace, prefixed};
use crate::txn::{OpResponse, TxnExecutor, TxnRequest, TxnResponse};
use crate::watch::{Event, EventKind, WatchManager};

/// The effect a committed `RaftOp` had, handed back to whichever caller
/// proposed it.
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Put { record: KeyRecord, prev: Option<KeyRecord> },
    DeleteRange { deleted: Vec<(Vec<u8>, KeyRecord)> },
    Txn(TxnResponse),
    LeaseGranted { id: i64 },
    LeaseRevoked { deleted_keys: Vec<Vec<u8>> },
    Compacted { revision: i64 },
}

fn batch_set(key: &[u8], record: &KeyRecord) -> CResult<BatchWrite> {
    let bytes = bincode::serialize(record).map_err(|e| Error::Encode(e.to_string()))?;
    Ok(BatchWrite::Set(prefixed(keyspace::KV, key), bytes))
}

fn batch_delete(key: &[u8]) -> BatchWrite {
    BatchWrite::Delete(prefixed(keyspace::KV, key))
}

fn lease_key(id: i64) -> Vec<u8> {
    prefixed(keyspace::LEASE, &id.to_be_bytes())
}

/// Builds a write of `id`'s current (ttl, bound keys) to the lease keyspace,
/// so the lease table can be rebuilt from disk on restart. Fails only if the
/// lease no longer exists by the time this runs, which the caller treats as
/// nothing to persist.
fn batch_lease_state(leases: &LeaseManager, id: i64) -> CResult<BatchWrite> {
    let (ttl_secs, _, keys) = leases.time_to_live(id, std::time::Instant::now())?;
    let bytes = bincode::serialize(&(ttl_secs, keys)).map_err(|e| Error::Encode(e.to_string()))?;
    Ok(BatchWrite::Set(lease_key(id), bytes))
}

fn batch_lease_delete(id: i64) -> BatchWrite {
    BatchWrite::Delete(lease_key(id))
}

fn put_event(key: Vec<u8>, record: KeyRecord, prev: Option<KeyRecord>) -> Event {
    Event { kind: EventKind::Put, key, record: Some(record), prev_record: prev }
}

fn delete_event(key: Vec<u8>, prev: KeyRecord) -> Event {
    Event { kind: EventKind::Delete, key, record: None, prev_record: Some(prev) }
}

/// Turns a transaction's op-by-op responses into watch events, recursing
/// into nested transactions. Pure `Range` reads produce nothing to notify.
fn txn_events(responses: &[OpResponse], out: &mut Vec<Event>) {
    for response in responses {
        match response {
            OpResponse::Range(_) => {}
            OpResponse::Put(key, record) => out.push(put_event(key.clone(), record.clone(), None)),
            OpResponse::DeleteRange(removed) => {
                for (key, prev) in removed {
                    out.push(delete_event(key.clone(), prev.clone()));
                }
            }
            OpResponse::Txn(nested) => txn_events(&nested.responses, out),
        }
    }
}

/// The single linearization point for all mutating requests: every `RaftOp`
/// that reaches state does so by being applied here, in commit order, by
/// exactly one task. Everything this type owns is therefore only ever
/// mutated from `spawn_apply_loop`'s task; other callers only read through
/// the `Mutex`es while waiting on their own proposal to resolve.
pub struct Node {
    kv: Mutex<KvState>,
    leases: Mutex<LeaseManager>,
    watches: WatchManager,
    revisions: RevisionSource,
    engine: Mutex<Box<dyn Engine>>,
    raft: Arc<dyn RaftHandle>,
    pending: DashMap<u64, oneshot::Sender<CResult<ApplyOutcome>>>,
    next_seq: AtomicU64,
}

impl Node {
    pub fn new(engine: Box<dyn Engine>, raft: Arc<dyn RaftHandle>, start_revision: i64) -> Self {
        Self {
            kv: Mutex::new(KvState::new()),
            leases: Mutex::new(LeaseManager::new()),
            watches: WatchManager::new(),
            revisions: RevisionSource::new(start_revision),
            engine: Mutex::new(engine),
            raft,
            pending: DashMap::new(),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Rebuilds a node's in-memory state from what `engine` already holds on
    /// disk: every key, every lease, and the revision counter resumed from
    /// the highest persisted `mod_revision`. Used at startup so a restart
    /// continues from where the process left off instead of starting over
    /// at revision 0. A fresh, empty engine restores to the same state
    /// `Node::new` would produce.
    pub fn restore(mut engine: Box<dyn Engine>, raft: Arc<dyn RaftHandle>) -> CResult<Self> {
        let mut kv_records = Vec::new();
        for entry in engine.scan_dyn(keyspace::bounds(keyspace::KV)) {
            let (key, value) = entry?;
            let record: KeyRecord = bincode::deserialize(&value).map_err(|e| Error::Decode(e.to_string()))?;
            kv_records.push((key[1..].to_vec(), record));
        }
        let kv = KvState::restore(kv_records);
        let start_revision = kv.max_mod_revision();

        let mut leases = LeaseManager::new();
        let now = std::time::Instant::now();
        for entry in engine.scan_dyn(keyspace::bounds(keyspace::LEASE)) {
            let (key, value) = entry?;
            let id_bytes: [u8; 8] =
                key[1..].try_into().map_err(|_| Error::Decode("malformed lease key".into()))?;
            let (ttl_secs, bound_keys): (i64, Vec<Vec<u8>>) =
                bincode::deserialize(&value).map_err(|e| Error::Decode(e.to_string()))?;
            leases.restore_lease(i64::from_be_bytes(id_bytes), ttl_secs, bound_keys, now);
        }

        Ok(Self {
            kv: Mutex::new(kv),
            leases: Mutex::new(leases),
            watches: WatchManager::new(),
            revisions: RevisionSource::new(start_revision),
            engine: Mutex::new(engine),
            raft,
            pending: DashMap::new(),
            next_seq: AtomicU64::new(1),
        })
    }

    pub fn watches(&self) -> &WatchManager {
        &self.watches
    }

    /// Adds a member to the consensus membership. Delegates straight to the
    /// `RaftHandle`; `SingleNodeRaft` always rejects this.
    pub fn add_member(&self, member_id: u64, address: String) -> CResult<()> {
        self.raft.add_member(member_id, address)
    }

    /// Removes a member from the consensus membership. Delegates straight to
    /// the `RaftHandle`; `SingleNodeRaft` always rejects this.
    pub fn remove_member(&self, member_id: u64) -> CResult<()> {
        self.raft.remove_member(member_id)
    }

    pub fn current_revision(&self) -> i64 {
        self.revisions.get()
    }

    /// Whether this node currently holds leadership, per the underlying
    /// consensus handle. A linearizable read must only be served locally
    /// while this holds.
    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    pub fn with_kv<R>(&self, f: impl FnOnce(&KvState) -> R) -> R {
        f(&self.kv.lock().expect("kv state lock poisoned"))
    }

    pub fn with_leases<R>(&self, f: impl FnOnce(&LeaseManager) -> R) -> R {
        f(&self.leases.lock().expect("lease manager lock poisoned"))
    }

    /// Mutable access to the lease table for operations that don't need to
    /// go through the apply loop: keep-alive renewal is local bookkeeping,
    /// not a state transition the log needs to agree on.
    pub fn with_leases_mut<R>(&self, f: impl FnOnce(&mut LeaseManager) -> R) -> R {
        f(&mut self.leases.lock().expect("lease manager lock poisoned"))
    }

    /// Mutable access to the storage engine for maintenance operations
    /// (status, hashing, snapshotting, defragmenting) that read or
    /// reshape the engine without going through consensus.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut dyn Engine) -> R) -> R {
        f(self.engine.lock().expect("engine lock poisoned").as_mut())
    }

    /// Proposes `op` for replication and waits for it to be applied,
    /// returning the effect it had once this node's apply loop processes it.
    /// Non-leaders are rejected immediately rather than proposing and
    /// waiting on a proposal that will never commit here.
    pub async fn propose(&self, op: RaftOp) -> CResult<ApplyOutcome> {
        if !self.raft.is_leader() {
            return Err(Error::Unavailable("not the leader".into()));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);

        let bytes = encode(&Envelope { seq, op })?;
        if let Err(err) = self.raft.propose(bytes) {
            self.pending.remove(&seq);
            return Err(err);
        }

        rx.await.map_err(|_| Error::Unavailable("apply loop dropped the proposal".into()))?
    }

    /// Drains committed entries from the consensus layer and applies them
    /// one at a time, in order. Meant to be spawned once per running node.
    ///
    /// Only holds a `Weak` reference across the `.await` on the committed
    /// channel: if this task kept its own strong `Arc<Node>` alive while
    /// waiting, `Node.raft`'s sender half could never drop, and the channel
    /// would never close even once every other handle to the node was gone.
    pub async fn spawn_apply_loop(self: Arc<Self>) {
        let mut receiver = match self.raft.take_committed_receiver() {
            Some(r) => r,
            None => return,
        };
        let weak = Arc::downgrade(&self);
        drop(self);
        while let Some(entry) = receiver.recv().await {
            let Some(node) = weak.upgrade() else { break };
            let envelope = match decode(&entry.data) {
                Ok(envelope) => envelope,
                Err(err) => {
                    log::error!("discarding unreadable committed entry: {err}");
                    continue;
                }
            };
            let outcome = node.apply_op(envelope.op);
            if let Some((_, sender)) = node.pending.remove(&envelope.seq) {
                let _ = sender.send(outcome);
            }
        }
    }

    fn apply_op(&self, op: RaftOp) -> CResult<ApplyOutcome> {
        match op {
            RaftOp::Put { key, value, lease } => self.apply_put(key, value, lease),
            RaftOp::DeleteRange { key, range_end } => self.apply_delete_range(key, range_end),
            RaftOp::Txn(txn) => self.apply_txn(txn),
            RaftOp::LeaseGrant { id, ttl_secs } => self.apply_lease_grant(id, ttl_secs),
            RaftOp::LeaseRevoke { id } => self.apply_lease_revoke(id),
            RaftOp::Compact { revision } => Ok(ApplyOutcome::Compacted { revision }),
        }
    }

    fn apply_put(&self, key: Vec<u8>, value: Vec<u8>, lease: i64) -> CResult<ApplyOutcome> {
        let mut writes = Vec::new();

        if lease != 0 {
            let mut leases = self.leases.lock().expect("lease manager lock poisoned");
            leases.attach(lease, &key)?;
            writes.push(batch_lease_state(&leases, lease)?);
        }

        let revision = self.revisions.next();
        let mut kv = self.kv.lock().expect("kv state lock poisoned");
        let (record, prev) = kv.put(&key, value, lease, revision);
        drop(kv);

        if let Some(prev) = &prev {
            if prev.lease != 0 && prev.lease != lease {
                let mut leases = self.leases.lock().expect("lease manager lock poisoned");
                leases.detach(prev.lease, &key);
                if let Ok(w) = batch_lease_state(&leases, prev.lease) {
                    writes.push(w);
                }
            }
        }

        writes.push(batch_set(&key, &record)?);
        self.engine.lock().expect("engine lock poisoned").apply_batch(writes)?;

        self.watches.notify(revision, &[put_event(key, record.clone(), prev.clone())]);
        Ok(ApplyOutcome::Put { record, prev })
    }

    fn apply_delete_range(&self, key: Vec<u8>, range_end: Vec<u8>) -> CResult<ApplyOutcome> {
        let revision = self.revisions.next();
        let mut kv = self.kv.lock().expect("kv state lock poisoned");
        let deleted = kv.delete_range(&key, &range_end);
        drop(kv);

        let mut writes = Vec::with_capacity(deleted.len());
        let mut events = Vec::with_capacity(deleted.len());
        for (k, record) in &deleted {
            if record.lease != 0 {
                let mut leases = self.leases.lock().expect("lease manager lock poisoned");
                leases.detach(record.lease, k);
                if let Ok(w) = batch_lease_state(&leases, record.lease) {
                    writes.push(w);
                }
            }
            writes.push(batch_delete(k));
            events.push(delete_event(k.clone(), record.clone()));
        }
        self.engine.lock().expect("engine lock poisoned").apply_batch(writes)?;

        self.watches.notify(revision, &events);
        Ok(ApplyOutcome::DeleteRange { deleted })
    }

    fn apply_txn(&self, txn: TxnRequest) -> CResult<ApplyOutcome> {
        let mut kv = self.kv.lock().expect("kv state lock poisoned");
        let mut leases = self.leases.lock().expect("lease manager lock poisoned");
        let mut executor = TxnExecutor::new(&mut kv, &mut leases, &self.revisions);
        let response = executor.execute(&txn)?;
        let revision = executor.revision();
        let lease_writes: Vec<BatchWrite> = executor
            .touched_leases()
            .iter()
            .filter_map(|&id| batch_lease_state(&leases, id).ok())
            .collect();
        drop(leases);

        if let Some(revision) = revision {
            let mut events = Vec::new();
            txn_events(&response.responses, &mut events);
            let mut writes = lease_writes;
            for event in &events {
                match event.kind {
                    EventKind::Put => {
                        if let Some(record) = kv.get(&event.key) {
                            writes.push(batch_set(&event.key, record)?);
                        }
                    }
                    EventKind::Delete => writes.push(batch_delete(&event.key)),
                }
            }
            drop(kv);
            self.engine.lock().expect("engine lock poisoned").apply_batch(writes)?;
            self.watches.notify(revision, &events);
        } else {
            drop(kv);
        }

        Ok(ApplyOutcome::Txn(response))
    }

    fn apply_lease_grant(&self, id: i64, ttl_secs: i64) -> CResult<ApplyOutcome> {
        let now = std::time::Instant::now();
        let mut leases = self.leases.lock().expect("lease manager lock poisoned");
        let id = leases.grant(id, ttl_secs, now)?;
        let write = batch_lease_state(&leases, id)?;
        drop(leases);
        self.engine.lock().expect("engine lock poisoned").apply_batch(vec![write])?;
        Ok(ApplyOutcome::LeaseGranted { id })
    }

    fn apply_lease_revoke(&self, id: i64) -> CResult<ApplyOutcome> {
        let keys = self.leases.lock().expect("lease manager lock poisoned").revoke(id)?;
        let mut writes = vec![batch_lease_delete(id)];
        if keys.is_empty() {
            self.engine.lock().expect("engine lock poisoned").apply_batch(writes)?;
            return Ok(ApplyOutcome::LeaseRevoked { deleted_keys: keys });
        }

        let revision = self.revisions.next();
        let mut kv = self.kv.lock().expect("kv state lock poisoned");
        let mut events = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(record) = kv.delete(key) {
                writes.push(batch_delete(key));
                events.push(delete_event(key.clone(), record));
            }
        }
        drop(kv);
        self.engine.lock().expect("engine lock poisoned").apply_batch(writes)?;

        self.watches.notify(revision, &events);
        Ok(ApplyOutcome::LeaseRevoked { deleted_keys: keys })
    }
}
