use std::collections::HashSet;

/// Alarm conditions a member can raise. `NoSpace` is the only kind the spec
/// requires; the type exists so more kinds can be added without reshaping
/// the state it's stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmType {
    NoSpace,
}

/// Tracks which members currently have which alarms raised. Membership in
/// the set is as simple as it looks: raising the same alarm on the same
/// member twice is a no-op, and there is no severity or expiry, matching the
/// spec's alarm model.
#[derive(Debug, Default)]
pub struct AlarmState {
    active: HashSet<(i64, AlarmType)>,
}

impl AlarmState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises `alarm` on `member_id`. Returns whether it was newly raised.
    pub fn activate(&mut self, member_id: i64, alarm: AlarmType) -> bool {
        self.active.insert((member_id, alarm))
    }

    /// Clears `alarm` on `member_id`. Returns whether it had been raised.
    pub fn deactivate(&mut self, member_id: i64, alarm: AlarmType) -> bool {
        self.active.remove(&(member_id, alarm))
    }

    /// Lists every currently raised (member, alarm) pair.
    pub fn list(&self) -> Vec<(i64, AlarmType)> {
        self.active.iter().copied().collect()
    }

    /// Returns whether any member currently has `alarm` raised.
    pub fn is_active(&self, alarm: AlarmType) -> bool {
        self.active.iter().any(|(_, a)| *a == alarm)
    }
}
