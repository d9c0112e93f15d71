//! Advisory, non-blocking named locks
//!
//! Two namespaces exist and never overlap:
//!
//! - [`LockName::CampaignData`]: guards mutation of one campaign's queue and state
//! - [`LockName::WorkerSlot`]: admission control, one lock per actively sending worker
//!
//! Acquisition never waits. A contended lock is reported as busy and the
//! caller moves on; the next trigger retries. Every lock carries an expiry so a
//! crashed holder cannot lock a resource out forever: an expired lock is free
//! for anyone to take over.

use std::{fmt, sync::Arc};

use bulkmail_common::{CampaignId, Clock, WorkerId, internal};
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::{DashMap, mapref::entry::Entry};

/// Name of a lockable resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockName {
    /// Exclusive access to one campaign's queue and lifecycle state
    CampaignData(CampaignId),
    /// One of the fungible, counted worker slots
    WorkerSlot(usize),
}

impl LockName {
    #[must_use]
    pub const fn is_worker_slot(&self) -> bool {
        matches!(self, Self::WorkerSlot(_))
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CampaignData(campaign) => write!(f, "data.mailing.{}", campaign.0),
            Self::WorkerSlot(slot) => write!(f, "worker.mailing.{slot}"),
        }
    }
}

/// Current holder of a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRecord {
    pub holder: WorkerId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Table of advisory locks shared by every worker
#[derive(Debug)]
pub struct LockManager {
    locks: DashMap<LockName, LockRecord>,
    clock: Arc<dyn Clock>,
}

impl LockManager {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            locks: DashMap::new(),
            clock,
        }
    }

    /// Try to take `name` for `holder` for `ttl`.
    ///
    /// Returns `false` immediately if another holder has an unexpired lock.
    /// Re-acquiring a lock already held by `holder` refreshes its expiry.
    pub fn try_acquire(&self, name: LockName, holder: WorkerId, ttl: TimeDelta) -> bool {
        let now = self.clock.now();
        let record = LockRecord {
            holder,
            acquired_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        match self.locks.entry(name) {
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                true
            }
            Entry::Occupied(mut occupied) => {
                let current = *occupied.get();
                if current.holder == holder {
                    occupied.insert(LockRecord {
                        acquired_at: current.acquired_at,
                        ..record
                    });
                    true
                } else if current.is_expired(now) {
                    internal!(
                        level = WARN,
                        lock = %name,
                        previous = %current.holder,
                        holder = %holder,
                        "Taking over expired lock"
                    );
                    occupied.insert(record);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Release `name` if `holder` owns it. Returns whether anything was released.
    pub fn release(&self, name: LockName, holder: WorkerId) -> bool {
        self.locks
            .remove_if(&name, |_, record| record.holder == holder)
            .is_some()
    }

    /// `true` while an unexpired lock exists for `name`
    #[must_use]
    pub fn is_held(&self, name: LockName) -> bool {
        let now = self.clock.now();
        self.locks
            .get(&name)
            .is_some_and(|record| !record.is_expired(now))
    }

    /// Current unexpired holder of `name`
    #[must_use]
    pub fn holder(&self, name: LockName) -> Option<WorkerId> {
        let now = self.clock.now();
        self.locks
            .get(&name)
            .filter(|record| !record.is_expired(now))
            .map(|record| record.holder)
    }

    /// Number of unexpired worker-slot locks, i.e. workers actively sending
    #[must_use]
    pub fn active_worker_slots(&self) -> usize {
        let now = self.clock.now();
        self.locks
            .iter()
            .filter(|entry| entry.key().is_worker_slot() && !entry.value().is_expired(now))
            .count()
    }

    /// Like [`LockManager::try_acquire`], returning a guard that releases on drop
    #[must_use]
    pub fn acquire_guard(
        &self,
        name: LockName,
        holder: WorkerId,
        ttl: TimeDelta,
    ) -> Option<LockGuard<'_>> {
        self.try_acquire(name, holder, ttl).then_some(LockGuard {
            manager: self,
            name,
            holder,
        })
    }
}

/// A held lock, released when dropped
#[derive(Debug)]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    name: LockName,
    holder: WorkerId,
}

impl LockGuard<'_> {
    #[must_use]
    pub const fn name(&self) -> LockName {
        self.name
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.manager.release(self.name, self.holder) {
            internal!(
                level = DEBUG,
                lock = %self.name,
                holder = %self.holder,
                "Lock was no longer held at release"
            );
        }
    }
}
