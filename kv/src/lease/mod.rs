use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::error::{CResult, Error};

/// A granted lease: a TTL and the set of keys currently bound to it. When
/// the lease is revoked, every bound key is deleted in the same apply step
/// that removes the lease itself.
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: i64,
    pub ttl_secs: i64,
    granted_at: Instant,
    keys: HashSet<Vec<u8>>,
}

impl Lease {
    fn remaining(&self, now: Instant) -> i64 {
        let elapsed = now.saturating_duration_since(self.granted_at).as_secs() as i64;
        (self.ttl_secs - elapsed).max(0)
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.remaining(now) == 0
    }
}

/// Tracks every granted lease and which keys are bound to each. Expiry
/// detection (`expired_leases`) is read-only: the spec requires the 1Hz
/// ticker to *propose* a Revoke through the apply loop rather than expiring
/// leases locally, so that expiry is itself part of the replicated log and
/// every replica agrees on when a lease died.
#[derive(Debug, Default)]
pub struct LeaseManager {
    leases: HashMap<i64, Lease>,
    next_id_hint: i64,
}

impl LeaseManager {
    pub fn new() -> Self {
        Self { leases: HashMap::new(), next_id_hint: 1 }
    }

    /// Grants a lease. If `id` is 0, an unused id is allocated; otherwise
    /// `id` is used as given and an error is returned if it's already
    /// granted.
    pub fn grant(&mut self, id: i64, ttl_secs: i64, now: Instant) -> CResult<i64> {
        let id = if id == 0 { self.allocate_id() } else { id };
        if self.leases.contains_key(&id) {
            return Err(Error::LeaseExists { id });
        }
        self.leases.insert(id, Lease { id, ttl_secs, granted_at: now, keys: HashSet::new() });
        Ok(id)
    }

    /// Rebuilds a lease exactly as granted, for restoring from disk. The
    /// lease is given a fresh TTL window starting `now` -- a restarting
    /// process has no record of wall-clock grant time, so this is
    /// equivalent to every outstanding lease being renewed on restart
    /// rather than continuing to count down through the outage.
    pub fn restore_lease(&mut self, id: i64, ttl_secs: i64, keys: Vec<Vec<u8>>, now: Instant) {
        self.next_id_hint = self.next_id_hint.max(id.wrapping_add(1));
        self.leases.insert(id, Lease { id, ttl_secs, granted_at: now, keys: keys.into_iter().collect() });
    }

    fn allocate_id(&mut self) -> i64 {
        loop {
            let candidate = self.next_id_hint;
            self.next_id_hint = self.next_id_hint.wrapping_add(1).max(1);
            if candidate != 0 && !self.leases.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Revokes a lease, returning the keys that were bound to it so the
    /// caller can delete them in the same apply step.
    pub fn revoke(&mut self, id: i64) -> CResult<Vec<Vec<u8>>> {
        let lease = self.leases.remove(&id).ok_or(Error::LeaseNotFound { id })?;
        Ok(lease.keys.into_iter().collect())
    }

    /// Renews a lease's TTL window from `now`. Returns the (unchanged) TTL.
    pub fn keep_alive(&mut self, id: i64, now: Instant) -> CResult<i64> {
        let lease = self.leases.get_mut(&id).ok_or(Error::LeaseNotFound { id })?;
        lease.granted_at = now;
        Ok(lease.ttl_secs)
    }

    /// Returns (granted TTL, remaining TTL, bound keys) for a lease.
    pub fn time_to_live(&self, id: i64, now: Instant) -> CResult<(i64, i64, Vec<Vec<u8>>)> {
        let lease = self.leases.get(&id).ok_or(Error::LeaseNotFound { id })?;
        Ok((lease.ttl_secs, lease.remaining(now), lease.keys.iter().cloned().collect()))
    }

    /// Lists every currently granted lease id.
    pub fn leases(&self) -> Vec<i64> {
        self.leases.keys().copied().collect()
    }

    /// Binds `key` to lease `id`, detaching it from whatever lease (if any)
    /// it was previously bound to.
    pub fn attach(&mut self, id: i64, key: &[u8]) -> CResult<()> {
        if id == 0 {
            return Ok(());
        }
        if !self.leases.contains_key(&id) {
            return Err(Error::LeaseNotFound { id });
        }
        self.leases.get_mut(&id).unwrap().keys.insert(key.to_vec());
        Ok(())
    }

    /// Unbinds `key` from lease `id` (e.g. on delete, or before rebinding to
    /// a different lease). A no-op if the lease doesn't exist or doesn't
    /// hold the key.
    pub fn detach(&mut self, id: i64, key: &[u8]) {
        if let Some(lease) = self.leases.get_mut(&id) {
            lease.keys.remove(key);
        }
    }

    /// Returns the ids of leases whose TTL has elapsed as of `now`. The
    /// caller must propose a Revoke for each through the apply loop; this
    /// method performs no mutation.
    pub fn expired_leases(&self, now: Instant) -> Vec<i64> {
        self.leases.values().filter(|l| l.is_expired(now)).map(|l| l.id).collect()
    }
}
