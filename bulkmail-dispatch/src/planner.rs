//! Admission control, batch sizing and round-robin rotation
//!
//! Nothing here waits for capacity. When the system is saturated the planner
//! says no and the invocation reports that it did nothing; the next trigger
//! is the retry.

use bulkmail_common::{CampaignId, internal};
use parking_lot::Mutex;

use crate::{campaign::CampaignState, config::DispatchSettings};

/// Number of recipients one invocation may still send
///
/// The limit is shared by every campaign the invocation serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvocationBudget {
    limit: Option<usize>,
    used: usize,
}

impl InvocationBudget {
    #[must_use]
    pub const fn new(settings: &DispatchSettings) -> Self {
        Self {
            limit: settings.batch_budget(),
            used: 0,
        }
    }

    /// Recipients left, `usize::MAX` when unbounded
    #[must_use]
    pub const fn remaining(&self) -> usize {
        match self.limit {
            Some(limit) => limit.saturating_sub(self.used),
            None => usize::MAX,
        }
    }

    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    /// Charge `count` claimed recipients against the budget
    pub fn consume(&mut self, count: usize) {
        self.used = self.used.saturating_add(count);
    }

    /// Give back recipients that were claimed but never sent
    pub fn refund(&mut self, count: usize) {
        self.used = self.used.saturating_sub(count);
    }
}

/// Decides whether and how much an invocation may send
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchPlanner;

impl BatchPlanner {
    /// `false` when `active_workers` already meets the configured cap
    #[must_use]
    pub const fn admits(&self, settings: &DispatchSettings, active_workers: usize) -> bool {
        settings.max_active_workers == 0 || active_workers < settings.max_active_workers
    }

    /// How many entries to claim for a campaign in `state`
    #[must_use]
    pub const fn plan_batch_size(&self, state: CampaignState, budget: &InvocationBudget) -> usize {
        if state.is_claimable() {
            budget.remaining()
        } else {
            0
        }
    }

    /// Pacing delay between two sends
    pub async fn throttle(&self, settings: &DispatchSettings) {
        if let Some(interval) = settings.throttle_interval() {
            tokio::time::sleep(interval).await;
        }
    }

    /// Keep the worker slot occupied for `lock_hold_secs`
    pub async fn hold(&self, settings: &DispatchSettings) {
        if let Some(hold) = settings.lock_hold() {
            internal!(hold = ?hold, "Holding worker slot");
            tokio::time::sleep(hold).await;
        }
    }
}

/// Process-wide round-robin position across campaigns
///
/// Remembers which campaign the previous invocation started with; the next
/// invocation starts with the following one. Shared by reference between
/// every worker of a process.
#[derive(Debug, Default)]
pub struct RotationCursor {
    last_start: Mutex<Option<CampaignId>>,
}

impl RotationCursor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn last_start(&self) -> Option<CampaignId> {
        *self.last_start.lock()
    }

    /// `eligible` (sorted by id) rotated to start after the last starting
    /// campaign, and records the new start
    pub fn rotate(&self, eligible: &[CampaignId]) -> Vec<CampaignId> {
        let mut last_start = self.last_start.lock();

        let start = last_start
            .and_then(|last| eligible.iter().position(|id| *id > last))
            .unwrap_or(0);

        let mut order = Vec::with_capacity(eligible.len());
        order.extend_from_slice(&eligible[start..]);
        order.extend_from_slice(&eligible[..start]);

        if let Some(first) = order.first() {
            *last_start = Some(*first);
            internal!(campaign = %first, "Rotation starts");
        }

        order
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn ids(raw: &[u64]) -> Vec<CampaignId> {
        raw.iter().copied().map(CampaignId).collect()
    }

    #[test]
    fn test_budget_is_shared_and_refundable() {
        let settings = DispatchSettings {
            batch_limit: 6,
            ..Default::default()
        };
        let mut budget = InvocationBudget::new(&settings);

        budget.consume(4);
        assert_eq!(budget.remaining(), 2);
        budget.consume(2);
        assert!(budget.is_exhausted());

        budget.refund(3);
        assert_eq!(budget.remaining(), 3);
        assert_eq!(budget.used(), 3);
    }

    #[test]
    fn test_unbounded_budget() {
        let mut budget = InvocationBudget::new(&DispatchSettings::default());
        budget.consume(1_000_000);
        assert_eq!(budget.remaining(), usize::MAX);
        assert!(!budget.is_exhausted());
    }

    #[test]
    fn test_admission_against_cap() {
        let planner = BatchPlanner;
        let capped = DispatchSettings {
            max_active_workers: 2,
            ..Default::default()
        };

        assert!(planner.admits(&capped, 0));
        assert!(planner.admits(&capped, 1));
        assert!(!planner.admits(&capped, 2));
        assert!(!planner.admits(&capped, 5));
        assert!(planner.admits(&DispatchSettings::default(), 500));
    }

    #[test]
    fn test_paused_and_complete_campaigns_get_nothing() {
        let planner = BatchPlanner;
        let settings = DispatchSettings {
            batch_limit: 5,
            ..Default::default()
        };
        let budget = InvocationBudget::new(&settings);

        assert_eq!(planner.plan_batch_size(CampaignState::Scheduled, &budget), 5);
        assert_eq!(planner.plan_batch_size(CampaignState::Running, &budget), 5);
        assert_eq!(planner.plan_batch_size(CampaignState::Paused, &budget), 0);
        assert_eq!(planner.plan_batch_size(CampaignState::Complete, &budget), 0);
    }

    #[test]
    fn test_rotation_advances_one_position() {
        let cursor = RotationCursor::new();
        let eligible = ids(&[1, 2, 3]);

        assert_eq!(cursor.rotate(&eligible), ids(&[1, 2, 3]));
        assert_eq!(cursor.rotate(&eligible), ids(&[2, 3, 1]));
        assert_eq!(cursor.rotate(&eligible), ids(&[3, 1, 2]));
        assert_eq!(cursor.rotate(&eligible), ids(&[1, 2, 3]));
    }

    #[test]
    fn test_rotation_survives_campaigns_leaving() {
        let cursor = RotationCursor::new();

        assert_eq!(cursor.rotate(&ids(&[1, 2, 3])), ids(&[1, 2, 3]));
        assert_eq!(cursor.rotate(&ids(&[1, 2, 3])), ids(&[2, 3, 1]));
        // Campaign 3 completed
        assert_eq!(cursor.rotate(&ids(&[1, 2])), ids(&[1, 2]));
        assert_eq!(cursor.last_start(), Some(CampaignId(1)));
        assert!(cursor.rotate(&[]).is_empty());
        assert_eq!(cursor.last_start(), Some(CampaignId(1)));
    }
}
