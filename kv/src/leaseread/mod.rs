use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn millis_since_epoch(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_millis() as u64
}

/// Which protocol a read was served through. Exposed so callers can log or
/// account for the split between cheap lease reads and full read-index
/// round trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPath {
    LeaseRead,
    ReadIndex,
}

/// Tracks whether this node's lease-read grant is currently valid, i.e.
/// whether it can answer a linearizable read from local state without going
/// through the replication protocol.
///
/// The grant is renewed by a quorum heartbeat: the leader starts a round,
/// counts acks from followers, and on reaching quorum extends `valid_until`
/// by the lease duration. A single-node cluster is always its own quorum.
pub struct LeaseReadCoordinator {
    total_nodes: usize,
    valid_until_millis: AtomicU64,
    enabled: AtomicBool,
}

impl LeaseReadCoordinator {
    pub fn new(total_nodes: usize) -> Self {
        Self {
            total_nodes: total_nodes.max(1),
            valid_until_millis: AtomicU64::new(0),
            enabled: AtomicBool::new(total_nodes <= 1),
        }
    }

    /// Starts a new heartbeat round requiring acks from a quorum of nodes.
    pub fn begin_round(&self) -> HeartbeatRound {
        HeartbeatRound { needed: self.total_nodes / 2 + 1, acked: AtomicUsize::new(0) }
    }

    /// Records that `round` reached quorum, extending the lease-read grant
    /// to `now + lease_duration`.
    pub fn extend(&self, lease_duration: Duration, now: SystemTime) {
        let until = millis_since_epoch(now) + lease_duration.as_millis() as u64;
        self.valid_until_millis.store(until, Ordering::SeqCst);
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Revokes the current grant, e.g. on a leadership change.
    pub fn revoke(&self) {
        if self.total_nodes > 1 {
            self.enabled.store(false, Ordering::SeqCst);
        }
    }

    /// Returns whether a linearizable read can be served from local state
    /// right now without a read-index round trip.
    pub fn is_lease_read_valid(&self, now: SystemTime) -> bool {
        if self.total_nodes <= 1 {
            return true;
        }
        if !self.enabled.load(Ordering::SeqCst) {
            return false;
        }
        millis_since_epoch(now) < self.valid_until_millis.load(Ordering::SeqCst)
    }

    /// Convenience wrapper returning which path a read at `now` should take.
    pub fn read_path(&self, now: SystemTime) -> ReadPath {
        if self.is_lease_read_valid(now) {
            ReadPath::LeaseRead
        } else {
            ReadPath::ReadIndex
        }
    }
}

/// An in-flight heartbeat round, counting acks toward quorum.
pub struct HeartbeatRound {
    needed: usize,
    acked: AtomicUsize,
}

impl HeartbeatRound {
    /// Records one ack. Returns true exactly once, on the ack that reaches
    /// quorum.
    pub fn ack(&self) -> bool {
        let prev = self.acked.fetch_add(1, Ordering::SeqCst);
        prev + 1 == self.needed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_node_cluster_is_always_valid() {
        let coord = LeaseReadCoordinator::new(1);
        assert!(coord.is_lease_read_valid(SystemTime::now()));
    }

    #[test]
    fn multi_node_cluster_starts_invalid_until_quorum_extends_it() {
        let coord = LeaseReadCoordinator::new(3);
        let now = SystemTime::now();
        assert!(!coord.is_lease_read_valid(now));

        coord.extend(Duration::from_secs(2), now);
        assert!(coord.is_lease_read_valid(now));
        assert!(coord.is_lease_read_valid(now + Duration::from_secs(1)));
        assert!(!coord.is_lease_read_valid(now + Duration::from_secs(3)));
    }

    #[test]
    fn heartbeat_round_reports_quorum_exactly_once() {
        let coord = LeaseReadCoordinator::new(5); // quorum = 3
        let round = coord.begin_round();
        assert!(!round.ack());
        assert!(!round.ack());
        assert!(round.ack());
        assert!(!round.ack());
    }

    #[test]
    fn revoke_invalidates_a_multi_node_grant() {
        let coord = LeaseReadCoordinator::new(3);
        let now = SystemTime::now();
        coord.extend(Duration::from_secs(10), now);
        assert!(coord.is_lease_read_valid(now));
        coord.revoke();
        assert!(!coord.is_lease_read_valid(now));
    }

    #[test]
    fn read_path_reflects_validity() {
        let coord = LeaseReadCoordinator::new(3);
        let now = SystemTime::now();
        assert_eq!(coord.read_path(now), ReadPath::ReadIndex);
        coord.extend(Duration::from_secs(5), now);
        assert_eq!(coord.read_path(now), ReadPath::LeaseRead);
    }
}
