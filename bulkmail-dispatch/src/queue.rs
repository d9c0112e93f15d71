//! Recipient queue with atomic batch claims
//!
//! Each campaign owns an ordered list of entries. A worker claims a batch by
//! stamping its id and the claim time on pending entries; it later finalizes
//! each entry with an outcome. Claim and finalize are separate steps so a
//! worker that dies in between leaves its entries pending: once the claim is
//! older than the claim TTL another worker picks them up.

use std::fmt;

use ahash::AHashMap;
use bulkmail_common::{CampaignId, ContactId, EntryId, WorkerId, dispatch, internal};
use bulkmail_tracing::traced;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::directory::RecipientDirectory;

/// Why an entry was finalized without sending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkipReason {
    Deleted,
    Deceased,
    OptedOut,
    OnHold,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Deleted => "contact deleted",
            Self::Deceased => "contact deceased",
            Self::OptedOut => "contact opted out",
            Self::OnHold => "address on hold",
        })
    }
}

/// Final outcome of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Delivered,
    Bounced,
    Failed,
    Skipped(SkipReason),
}

/// Claim marker left on an entry by the worker sending it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Claim {
    pub worker: WorkerId,
    pub claimed_at: DateTime<Utc>,
}

/// One (campaign, recipient address) delivery task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub campaign: CampaignId,
    pub contact: ContactId,
    pub address: String,
    pub claim: Option<Claim>,
    /// `None` while the entry is pending
    pub outcome: Option<Outcome>,
}

impl QueueEntry {
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.outcome.is_none()
    }

    fn is_claimable(&self, now: DateTime<Utc>, claim_ttl: TimeDelta) -> bool {
        self.is_pending()
            && self
                .claim
                .is_none_or(|claim| claim.claimed_at + claim_ttl <= now)
    }
}

/// Result of one [`RecipientQueueStore::claim_batch`] call
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClaimedBatch {
    /// Entries claimed for sending, in creation order
    pub entries: Vec<QueueEntry>,
    /// Entries finalized as skipped because the contact became ineligible
    pub skipped: Vec<QueueEntry>,
}

impl ClaimedBatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.skipped.is_empty()
    }
}

#[derive(Debug, Default)]
struct CampaignQueue {
    ids: Vec<EntryId>,
    /// Everything before this index is finalized
    head: usize,
}

#[derive(Debug, Default)]
struct Inner {
    entries: AHashMap<EntryId, QueueEntry>,
    campaigns: AHashMap<CampaignId, CampaignQueue>,
    next_id: u64,
}

/// In-memory recipient queue shared by every worker
#[derive(Debug, Default)]
pub struct RecipientQueueStore {
    inner: Mutex<Inner>,
}

impl RecipientQueueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pending entry for `campaign`
    pub fn enqueue(
        &self,
        campaign: CampaignId,
        contact: ContactId,
        address: impl Into<String>,
    ) -> EntryId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = EntryId(inner.next_id);

        inner.entries.insert(
            id,
            QueueEntry {
                id,
                campaign,
                contact,
                address: address.into(),
                claim: None,
                outcome: None,
            },
        );
        inner.campaigns.entry(campaign).or_default().ids.push(id);

        id
    }

    /// Claim up to `max` pending entries of `campaign` for `worker`
    ///
    /// The whole claim runs in one critical section, so concurrent callers
    /// never receive the same entry. Entries whose contact is no longer
    /// eligible are finalized as [`Outcome::Skipped`] on the way and do not
    /// count towards `max`.
    #[traced(
        instrument(level = tracing::Level::TRACE, skip(self, directory), fields(campaign = %campaign, worker = %worker)),
        timing(precision = "us")
    )]
    pub fn claim_batch(
        &self,
        campaign: CampaignId,
        max: usize,
        worker: WorkerId,
        now: DateTime<Utc>,
        claim_ttl: TimeDelta,
        directory: &dyn RecipientDirectory,
    ) -> ClaimedBatch {
        let mut batch = ClaimedBatch::default();
        if max == 0 {
            return batch;
        }

        let mut guard = self.inner.lock();
        let Inner {
            entries, campaigns, ..
        } = &mut *guard;

        let Some(queue) = campaigns.get_mut(&campaign) else {
            return batch;
        };

        while queue
            .ids
            .get(queue.head)
            .and_then(|id| entries.get(id))
            .is_some_and(|entry| !entry.is_pending())
        {
            queue.head += 1;
        }

        for id in &queue.ids[queue.head..] {
            if batch.entries.len() >= max {
                break;
            }

            let Some(entry) = entries.get_mut(id) else {
                continue;
            };

            if !entry.is_claimable(now, claim_ttl) {
                continue;
            }

            if let Some(stale) = entry.claim {
                internal!(
                    level = WARN,
                    campaign = %campaign,
                    entry = %entry.id,
                    previous = %stale.worker,
                    worker = %worker,
                    "Reclaiming entry abandoned by another worker"
                );
            }

            if let Some(reason) = directory.eligibility(entry.contact).skip_reason() {
                entry.outcome = Some(Outcome::Skipped(reason));
                dispatch!(
                    level = DEBUG,
                    campaign = %campaign,
                    entry = %entry.id,
                    contact = %entry.contact,
                    %reason,
                    "Skipping ineligible recipient"
                );
                batch.skipped.push(entry.clone());
                continue;
            }

            entry.claim = Some(Claim {
                worker,
                claimed_at: now,
            });
            batch.entries.push(entry.clone());
        }

        drop(guard);

        dispatch!(
            level = DEBUG,
            campaign = %campaign,
            worker = %worker,
            claimed = batch.entries.len(),
            skipped = batch.skipped.len(),
            "Claimed batch"
        );

        batch
    }

    /// Return claimed but unsent entries to the pending pool
    ///
    /// Only entries still claimed by `worker` and not yet finalized are
    /// released. Returns how many were released.
    pub fn release(&self, ids: &[EntryId], worker: WorkerId) -> usize {
        let mut inner = self.inner.lock();
        let mut released = 0;

        for id in ids {
            let Some(entry) = inner.entries.get_mut(id) else {
                continue;
            };

            if entry.is_pending() && entry.claim.is_some_and(|claim| claim.worker == worker) {
                entry.claim = None;
                released += 1;
            }
        }

        released
    }

    /// Re-stamp the claims `worker` still holds on `ids`
    ///
    /// A worker sending a long batch calls this so its claims never look
    /// abandoned. Returns how many claims were renewed.
    pub fn renew(&self, ids: &[EntryId], worker: WorkerId, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock();
        let mut renewed = 0;

        for id in ids {
            let Some(entry) = inner.entries.get_mut(id) else {
                continue;
            };

            if let Some(claim) = entry.claim.as_mut()
                && entry.outcome.is_none()
                && claim.worker == worker
            {
                claim.claimed_at = now;
                renewed += 1;
            }
        }

        renewed
    }

    /// `true` while `worker` holds the claim on a pending entry
    #[must_use]
    pub fn is_claimed_by(&self, id: EntryId, worker: WorkerId) -> bool {
        self.inner.lock().entries.get(&id).is_some_and(|entry| {
            entry.is_pending() && entry.claim.is_some_and(|claim| claim.worker == worker)
        })
    }

    /// Record the outcome of an entry
    ///
    /// The first outcome wins; later calls leave the entry untouched and
    /// return `false`.
    pub fn finalize(&self, id: EntryId, outcome: Outcome) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&id) {
            Some(entry) if entry.is_pending() => {
                entry.outcome = Some(outcome);
                true
            }
            Some(entry) => {
                internal!(
                    level = DEBUG,
                    entry = %id,
                    existing = ?entry.outcome,
                    ignored = ?outcome,
                    "Entry already finalized"
                );
                false
            }
            None => false,
        }
    }

    /// Number of entries of `campaign` still pending, claimed or not
    #[must_use]
    pub fn unfinalized(&self, campaign: CampaignId) -> usize {
        let inner = self.inner.lock();
        inner.campaigns.get(&campaign).map_or(0, |queue| {
            queue.ids[queue.head..]
                .iter()
                .filter_map(|id| inner.entries.get(id))
                .filter(|entry| entry.is_pending())
                .count()
        })
    }

    /// Snapshot of every entry of `campaign`, in creation order
    #[must_use]
    pub fn entries(&self, campaign: CampaignId) -> Vec<QueueEntry> {
        let inner = self.inner.lock();
        inner.campaigns.get(&campaign).map_or_else(Vec::new, |queue| {
            queue
                .ids
                .iter()
                .filter_map(|id| inner.entries.get(id).cloned())
                .collect()
        })
    }

    #[must_use]
    pub fn get(&self, id: EntryId) -> Option<QueueEntry> {
        self.inner.lock().entries.get(&id).cloned()
    }
}
