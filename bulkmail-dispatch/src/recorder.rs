//! Delivery outcome ledger
//!
//! Each campaign keeps an append-only list of [`DeliveryEvent`]s. Events are
//! keyed by queue entry, so a replayed outcome is acknowledged but never
//! counted twice. Reports are derived by summing the ledger, which keeps them
//! correct however many invocations contributed to it.

use ahash::{AHashMap, AHashSet};
use bulkmail_common::{CampaignId, ContactId, EntryId, dispatch};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::queue::{Outcome, QueueEntry};

/// Immutable record of one finalized queue entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryEvent {
    pub campaign: CampaignId,
    pub entry: EntryId,
    pub contact: ContactId,
    pub address: String,
    pub outcome: Outcome,
    pub recorded_at: DateTime<Utc>,
}

impl DeliveryEvent {
    #[must_use]
    pub fn for_entry(entry: &QueueEntry, outcome: Outcome, recorded_at: DateTime<Utc>) -> Self {
        Self {
            campaign: entry.campaign,
            entry: entry.id,
            contact: entry.contact,
            address: entry.address.clone(),
            outcome,
            recorded_at,
        }
    }
}

/// Whether [`DeliveryRecorder::record`] stored a new event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    New,
    Duplicate,
}

/// Aggregate counts for one campaign
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CampaignReport {
    pub campaign: CampaignId,
    pub delivered: usize,
    pub bounced: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Contacts that received the campaign, each listed once, in delivery order
    pub activity_targets: Vec<ContactId>,
}

impl CampaignReport {
    #[must_use]
    pub const fn empty(campaign: CampaignId) -> Self {
        Self {
            campaign,
            delivered: 0,
            bounced: 0,
            failed: 0,
            skipped: 0,
            activity_targets: Vec::new(),
        }
    }

    /// Every recorded outcome
    #[must_use]
    pub const fn total(&self) -> usize {
        self.delivered + self.bounced + self.failed + self.skipped
    }
}

#[derive(Debug, Default)]
struct Ledger {
    events: Vec<DeliveryEvent>,
    seen: AHashSet<EntryId>,
    targets: Vec<ContactId>,
    target_set: AHashSet<ContactId>,
}

/// Outcome store shared by every worker
#[derive(Debug, Default)]
pub struct DeliveryRecorder {
    ledgers: Mutex<AHashMap<CampaignId, Ledger>>,
}

impl DeliveryRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `event` unless its entry already has one
    pub fn record(&self, event: DeliveryEvent) -> Recorded {
        let mut ledgers = self.ledgers.lock();
        let ledger = ledgers.entry(event.campaign).or_default();

        if !ledger.seen.insert(event.entry) {
            dispatch!(
                level = DEBUG,
                campaign = %event.campaign,
                entry = %event.entry,
                "Ignoring replayed outcome"
            );
            return Recorded::Duplicate;
        }

        // A contact with several addresses is still one activity target
        if event.outcome == Outcome::Delivered && ledger.target_set.insert(event.contact) {
            ledger.targets.push(event.contact);
        }

        ledger.events.push(event);
        Recorded::New
    }

    /// Sum of every outcome recorded for `campaign`
    #[must_use]
    pub fn report(&self, campaign: CampaignId) -> CampaignReport {
        let ledgers = self.ledgers.lock();
        let mut report = CampaignReport::empty(campaign);

        let Some(ledger) = ledgers.get(&campaign) else {
            return report;
        };

        for event in &ledger.events {
            match event.outcome {
                Outcome::Delivered => report.delivered += 1,
                Outcome::Bounced => report.bounced += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::Skipped(_) => report.skipped += 1,
            }
        }
        report.activity_targets.clone_from(&ledger.targets);

        report
    }

    /// Every event recorded for `campaign`, oldest first
    #[must_use]
    pub fn events(&self, campaign: CampaignId) -> Vec<DeliveryEvent> {
        self.ledgers
            .lock()
            .get(&campaign)
            .map(|ledger| ledger.events.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::queue::SkipReason;

    fn event(entry: u64, contact: u64, outcome: Outcome) -> DeliveryEvent {
        DeliveryEvent {
            campaign: CampaignId(1),
            entry: EntryId(entry),
            contact: ContactId(contact),
            address: format!("c{contact}@example.org"),
            outcome,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_replay_is_not_counted() {
        let recorder = DeliveryRecorder::new();

        assert_eq!(recorder.record(event(1, 1, Outcome::Delivered)), Recorded::New);
        assert_eq!(recorder.record(event(1, 1, Outcome::Delivered)), Recorded::Duplicate);
        // A different outcome for the same entry is still a replay
        assert_eq!(recorder.record(event(1, 1, Outcome::Bounced)), Recorded::Duplicate);

        let report = recorder.report(CampaignId(1));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.bounced, 0);
        assert_eq!(report.total(), 1);
    }

    #[test]
    fn test_report_sums_all_outcomes() {
        let recorder = DeliveryRecorder::new();
        recorder.record(event(1, 1, Outcome::Delivered));
        recorder.record(event(2, 2, Outcome::Bounced));
        recorder.record(event(3, 3, Outcome::Failed));
        recorder.record(event(4, 4, Outcome::Skipped(SkipReason::Deceased)));
        recorder.record(event(5, 5, Outcome::Delivered));

        assert_eq!(
            recorder.report(CampaignId(1)),
            CampaignReport {
                campaign: CampaignId(1),
                delivered: 2,
                bounced: 1,
                failed: 1,
                skipped: 1,
                activity_targets: vec![ContactId(1), ContactId(5)],
            }
        );
    }

    #[test]
    fn test_activity_targets_accumulate_across_batches() {
        let recorder = DeliveryRecorder::new();

        recorder.record(event(1, 10, Outcome::Delivered));
        recorder.record(event(2, 11, Outcome::Delivered));
        let first = recorder.report(CampaignId(1)).activity_targets;

        recorder.record(event(3, 12, Outcome::Delivered));
        // Second address of an existing contact
        recorder.record(event(4, 10, Outcome::Delivered));
        let second = recorder.report(CampaignId(1)).activity_targets;

        assert_eq!(first, vec![ContactId(10), ContactId(11)]);
        assert_eq!(second, vec![ContactId(10), ContactId(11), ContactId(12)]);
        assert_eq!(recorder.report(CampaignId(1)).delivered, 4);
    }

    #[test]
    fn test_unknown_campaign_reports_zero() {
        let recorder = DeliveryRecorder::new();
        let report = recorder.report(CampaignId(8));
        assert_eq!(report.campaign, CampaignId(8));
        assert_eq!(report.total(), 0);
        assert!(recorder.events(CampaignId(8)).is_empty());
    }
}
