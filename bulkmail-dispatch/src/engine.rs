//! One worker invocation, end to end
//!
//! [`DispatchEngine::run_once`] is what the external trigger calls. It may be
//! called any number of times, from any number of tasks, at once:
//!
//! 1. Validate the live settings and apply the environment gate
//! 2. Find eligible campaigns, take a worker slot, rotate the campaign order
//! 3. Per campaign: take its data lock, claim a batch, release the lock
//! 4. Send the claimed entries, recording every outcome
//! 5. Release the worker slot and report what was done
//!
//! Contention never blocks. A busy slot or data lock means less work for this
//! invocation, and the next trigger picks up the rest.

use std::sync::Arc;

use bulkmail_common::{CampaignId, Clock, SystemClock, WorkerId, dispatch, internal};
use bulkmail_tracing::traced;
use chrono::{DateTime, Utc};

use crate::{
    campaign::{CampaignState, CampaignStore, MessageRef},
    config::DispatchSettings,
    directory::{RecipientDirectory, StaticDirectory},
    error::{CampaignError, DeclineReason, DispatchError},
    lock::{LockGuard, LockManager, LockName},
    mailer::{Mailer, SendOutcome},
    planner::{BatchPlanner, InvocationBudget, RotationCursor},
    queue::{Outcome, QueueEntry, RecipientQueueStore},
    recorder::{CampaignReport, DeliveryEvent, DeliveryRecorder},
    report::{CampaignTally, DispatchIssue, DispatchReport, DispatchStatus},
};

/// State threaded through a single invocation
struct Invocation<'a> {
    settings: &'a DispatchSettings,
    worker: WorkerId,
    slot: LockName,
    budget: InvocationBudget,
    report: DispatchReport,
}

/// Claimed work for one campaign, ready to send
struct ClaimedWork {
    message: MessageRef,
    entries: Vec<QueueEntry>,
    claimed_at: DateTime<Utc>,
}

/// Builder for [`DispatchEngine`]
///
/// Only the mailer is required; every store defaults to a fresh in-memory one.
pub struct DispatchEngineBuilder {
    mailer: Arc<dyn Mailer>,
    directory: Option<Arc<dyn RecipientDirectory>>,
    clock: Option<Arc<dyn Clock>>,
    campaigns: Option<Arc<CampaignStore>>,
    queue: Option<Arc<RecipientQueueStore>>,
    recorder: Option<Arc<DeliveryRecorder>>,
    locks: Option<Arc<LockManager>>,
}

impl DispatchEngineBuilder {
    #[must_use]
    pub fn directory(mut self, directory: Arc<dyn RecipientDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn campaigns(mut self, campaigns: Arc<CampaignStore>) -> Self {
        self.campaigns = Some(campaigns);
        self
    }

    #[must_use]
    pub fn queue(mut self, queue: Arc<RecipientQueueStore>) -> Self {
        self.queue = Some(queue);
        self
    }

    #[must_use]
    pub fn recorder(mut self, recorder: Arc<DeliveryRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Share a lock table with other engines
    ///
    /// The lock table reads time from its own clock, which should be the
    /// engine's clock.
    #[must_use]
    pub fn locks(mut self, locks: Arc<LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    #[must_use]
    pub fn build(self) -> DispatchEngine {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let locks = self
            .locks
            .unwrap_or_else(|| Arc::new(LockManager::new(Arc::clone(&clock))));

        DispatchEngine {
            campaigns: self.campaigns.unwrap_or_default(),
            queue: self.queue.unwrap_or_default(),
            recorder: self.recorder.unwrap_or_default(),
            directory: self
                .directory
                .unwrap_or_else(|| Arc::new(StaticDirectory::new())),
            planner: BatchPlanner,
            mailer: self.mailer,
            locks,
            clock,
        }
    }
}

/// Composes the dispatch components into worker invocations
pub struct DispatchEngine {
    campaigns: Arc<CampaignStore>,
    queue: Arc<RecipientQueueStore>,
    recorder: Arc<DeliveryRecorder>,
    locks: Arc<LockManager>,
    planner: BatchPlanner,
    mailer: Arc<dyn Mailer>,
    directory: Arc<dyn RecipientDirectory>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("campaigns", &self.campaigns)
            .field("queue", &self.queue)
            .field("locks", &self.locks)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl DispatchEngine {
    #[must_use]
    pub fn builder(mailer: Arc<dyn Mailer>) -> DispatchEngineBuilder {
        DispatchEngineBuilder {
            mailer,
            directory: None,
            clock: None,
            campaigns: None,
            queue: None,
            recorder: None,
            locks: None,
        }
    }

    /// Run one worker invocation
    ///
    /// Declines are reported through [`DispatchStatus::Declined`] with zero
    /// processed; per-recipient and per-campaign problems are collected in
    /// [`DispatchReport::issues`].
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidSettings`] if `settings` fail validation.
    #[traced(
        instrument(level = tracing::Level::DEBUG, skip_all, err, fields(environment = %settings.environment)),
        timing(precision = "ms")
    )]
    pub async fn run_once(
        &self,
        settings: &DispatchSettings,
        cursor: &RotationCursor,
    ) -> Result<DispatchReport, DispatchError> {
        settings.validate()?;
        let worker = WorkerId::generate();

        if let Some(reason) = Self::environment_gate(settings) {
            return Ok(Self::decline(worker, reason));
        }

        let eligible = self.campaigns.eligible(self.clock.now());
        if eligible.is_empty() {
            return Ok(Self::decline(worker, DeclineReason::NothingEligible));
        }

        let slot = match self.acquire_worker_slot(settings, worker) {
            Ok(slot) => slot,
            Err(reason) => return Ok(Self::decline(worker, reason)),
        };

        let order = cursor.rotate(&eligible);
        internal!(
            level = DEBUG,
            worker = %worker,
            slot = %slot.name(),
            campaigns = order.len(),
            "Worker admitted"
        );

        let mut invocation = Invocation {
            settings,
            worker,
            slot: slot.name(),
            budget: InvocationBudget::new(settings),
            report: DispatchReport {
                worker,
                status: DispatchStatus::Completed,
                processed: 0,
                campaigns: Vec::with_capacity(order.len()),
                issues: Vec::new(),
            },
        };

        for campaign in order {
            if invocation.budget.is_exhausted() {
                break;
            }

            let mut tally = CampaignTally::new(campaign);
            let Some(work) = self.claim(&mut invocation, &mut tally) else {
                continue;
            };

            self.send(&mut invocation, &mut tally, work).await;
            invocation.report.processed += tally.sent;
            invocation.report.campaigns.push(tally);
        }

        self.planner.hold(settings).await;
        drop(slot);

        dispatch!(
            level = INFO,
            worker = %worker,
            processed = invocation.report.processed,
            issues = invocation.report.issues.len(),
            "Invocation finished"
        );

        Ok(invocation.report)
    }

    /// Reason to refuse all work in this environment, if any
    #[must_use]
    pub const fn environment_gate(settings: &DispatchSettings) -> Option<DeclineReason> {
        if !settings.environment.is_production() && !settings.allow_non_production {
            Some(DeclineReason::NonProduction(settings.environment))
        } else if !settings.outbound_enabled {
            Some(DeclineReason::OutboundDisabled)
        } else {
            None
        }
    }

    fn decline(worker: WorkerId, reason: DeclineReason) -> DispatchReport {
        if reason.is_configuration() {
            internal!(
                level = WARN,
                worker = %worker,
                code = reason.code(),
                status = %reason.status_message(),
                "{reason}"
            );
        } else {
            internal!(
                level = DEBUG,
                worker = %worker,
                code = reason.code(),
                "{reason}"
            );
        }

        DispatchReport::declined(worker, reason)
    }

    /// Take one of the counted worker slots, or say why not
    fn acquire_worker_slot(
        &self,
        settings: &DispatchSettings,
        worker: WorkerId,
    ) -> Result<LockGuard<'_>, DeclineReason> {
        let max = settings.max_active_workers;
        let exhausted = |active| DeclineReason::WorkerSlotsExhausted { active, max };

        let active = self.locks.active_worker_slots();
        if !self.planner.admits(settings, active) {
            return Err(exhausted(active));
        }

        let ttl = settings.lock_ttl();
        let acquired = if max == 0 {
            // Unbounded: a free index always exists
            (0..).find_map(|slot| {
                self.locks
                    .acquire_guard(LockName::WorkerSlot(slot), worker, ttl)
            })
        } else {
            (0..max).find_map(|slot| {
                self.locks
                    .acquire_guard(LockName::WorkerSlot(slot), worker, ttl)
            })
        };

        acquired.ok_or_else(|| exhausted(self.locks.active_worker_slots()))
    }

    /// Claim a batch for `tally.campaign` under its data lock
    ///
    /// Returns `None` when the campaign is busy, unusable or has nothing to
    /// send; skips and completion are recorded on the way.
    fn claim(&self, invocation: &mut Invocation<'_>, tally: &mut CampaignTally) -> Option<ClaimedWork> {
        let id = tally.campaign;
        let settings = invocation.settings;
        let worker = invocation.worker;

        let Some(_data_lock) =
            self.locks
                .acquire_guard(LockName::CampaignData(id), worker, settings.lock_ttl())
        else {
            internal!(level = DEBUG, campaign = %id, worker = %worker, "Campaign is busy, skipping");
            return None;
        };

        let Some(campaign) = self.campaigns.get(id) else {
            invocation
                .report
                .issues
                .push(DispatchIssue::Campaign(CampaignError::NotFound(id)));
            return None;
        };

        let message = match campaign.validate() {
            Ok(message) => message.clone(),
            Err(err) => {
                dispatch!(level = WARN, campaign = %id, error = %err, "Cannot send campaign");
                invocation.report.issues.push(DispatchIssue::Campaign(err));
                return None;
            }
        };

        let size = self
            .planner
            .plan_batch_size(campaign.state, &invocation.budget);
        if size == 0 {
            return None;
        }

        let now = self.clock.now();
        let batch = self.queue.claim_batch(
            id,
            size,
            worker,
            now,
            settings.lock_ttl(),
            self.directory.as_ref(),
        );

        for entry in &batch.skipped {
            let Some(outcome) = entry.outcome else {
                continue;
            };

            self.recorder
                .record(DeliveryEvent::for_entry(entry, outcome, now));
            if let Outcome::Skipped(reason) = outcome {
                invocation.report.issues.push(DispatchIssue::RecipientSkipped {
                    campaign: id,
                    entry: entry.id,
                    contact: entry.contact,
                    reason,
                });
            }
            tally.skipped += 1;
        }

        if batch.entries.is_empty() {
            if self.queue.unfinalized(id) == 0 {
                match self.campaigns.mark_complete(id, now) {
                    Ok(completed) => tally.completed = completed,
                    Err(err) => invocation.report.issues.push(DispatchIssue::Campaign(err)),
                }
            }
        } else {
            invocation.budget.consume(batch.entries.len());
        }

        Some(ClaimedWork {
            message,
            entries: batch.entries,
            claimed_at: now,
        })
    }

    /// Give back the entries from `index` on and refund their budget
    fn return_unsent(&self, invocation: &mut Invocation<'_>, work: &ClaimedWork, index: usize) -> usize {
        let unsent: Vec<_> = work.entries[index..].iter().map(|entry| entry.id).collect();
        invocation.budget.refund(unsent.len());
        self.queue.release(&unsent, invocation.worker)
    }

    /// Extend the worker slot and the remaining claims of a long batch
    ///
    /// Renewal happens once half the lock lifetime has passed since the last
    /// one, so at the ownership check no claim is old enough to be taken.
    /// Returns `false` if the worker slot was lost.
    fn keep_alive(
        &self,
        invocation: &Invocation<'_>,
        remaining: &[QueueEntry],
        renewed_at: &mut DateTime<Utc>,
    ) -> bool {
        let ttl = invocation.settings.lock_ttl();
        let now = self.clock.now();
        if now - *renewed_at < ttl / 2 {
            return true;
        }

        if !self.locks.try_acquire(invocation.slot, invocation.worker, ttl) {
            return false;
        }

        let ids: Vec<_> = remaining.iter().map(|entry| entry.id).collect();
        let renewed = self.queue.renew(&ids, invocation.worker, now);
        internal!(
            level = DEBUG,
            worker = %invocation.worker,
            slot = %invocation.slot,
            renewed,
            "Renewed worker slot and claims"
        );
        *renewed_at = now;
        true
    }

    /// Send claimed entries one by one, outside any data lock
    async fn send(&self, invocation: &mut Invocation<'_>, tally: &mut CampaignTally, work: ClaimedWork) {
        let id = tally.campaign;
        let settings = invocation.settings;
        let worker = invocation.worker;
        let mut renewed_at = work.claimed_at;

        for (index, entry) in work.entries.iter().enumerate() {
            if index > 0 {
                self.planner.throttle(settings).await;
            }

            if !self
                .campaigns
                .state(id)
                .is_some_and(CampaignState::is_claimable)
            {
                let released = self.return_unsent(invocation, &work, index);
                dispatch!(
                    level = INFO,
                    campaign = %id,
                    worker = %worker,
                    released,
                    "Campaign paused mid-batch, returned unsent entries"
                );
                break;
            }

            if !self.keep_alive(invocation, &work.entries[index..], &mut renewed_at) {
                let released = self.return_unsent(invocation, &work, index);
                dispatch!(
                    level = WARN,
                    campaign = %id,
                    worker = %worker,
                    slot = %invocation.slot,
                    released,
                    "Worker slot lost mid-batch, returned unsent entries"
                );
                break;
            }

            if !self.queue.is_claimed_by(entry.id, worker) {
                invocation.budget.refund(1);
                dispatch!(
                    level = WARN,
                    campaign = %id,
                    entry = %entry.id,
                    worker = %worker,
                    "Claim was taken over, not sending"
                );
                continue;
            }

            let result = self.mailer.send(&work.message, &entry.address).await;
            let outcome = result.outcome();
            let now = self.clock.now();

            if let SendOutcome::Failed(reason) = result {
                dispatch!(
                    level = WARN,
                    campaign = %id,
                    entry = %entry.id,
                    error = %reason,
                    "Send failed"
                );
                invocation.report.issues.push(DispatchIssue::SendFailed {
                    campaign: id,
                    entry: entry.id,
                    address: entry.address.clone(),
                    reason,
                });
            }

            if self.queue.finalize(entry.id, outcome) {
                self.recorder
                    .record(DeliveryEvent::for_entry(entry, outcome, now));
            }
            tally.sent += 1;

            if tally.sent == 1
                && let Err(err) = self.campaigns.mark_running(id, now)
            {
                invocation.report.issues.push(DispatchIssue::Campaign(err));
            }
        }
    }

    /// Stop `campaign` from being claimed
    ///
    /// The pause is cooperative. A worker already sending the campaign keeps
    /// its claimed entries until it checks the state before its next send,
    /// then returns the unsent ones to the queue.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown or completed campaign.
    pub fn pause(&self, campaign: CampaignId) -> Result<bool, CampaignError> {
        self.campaigns.pause(campaign)
    }

    /// Make a paused `campaign` eligible again
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown or completed campaign.
    pub fn resume(&self, campaign: CampaignId) -> Result<bool, CampaignError> {
        self.campaigns.resume(campaign)
    }

    /// Aggregate outcomes recorded for `campaign`
    #[must_use]
    pub fn report(&self, campaign: CampaignId) -> CampaignReport {
        self.recorder.report(campaign)
    }

    #[must_use]
    pub fn campaigns(&self) -> &Arc<CampaignStore> {
        &self.campaigns
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<RecipientQueueStore> {
        &self.queue
    }

    #[must_use]
    pub fn recorder(&self) -> &Arc<DeliveryRecorder> {
        &self.recorder
    }

    #[must_use]
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use async_trait::async_trait;
    use bulkmail_common::ContactId;
    use chrono::Utc;

    use super::*;
    use crate::{campaign::CampaignDraft, config::Environment};

    struct Accepting;

    #[async_trait]
    impl Mailer for Accepting {
        async fn send(&self, _message: &MessageRef, _address: &str) -> SendOutcome {
            SendOutcome::Delivered
        }
    }

    fn engine() -> DispatchEngine {
        DispatchEngine::builder(Arc::new(Accepting)).build()
    }

    fn draft() -> CampaignDraft {
        CampaignDraft {
            name: "Test".to_string(),
            message: Some(MessageRef {
                subject: "Subject".to_string(),
                body: "body".to_string(),
            }),
            scheduled_at: Utc::now(),
        }
    }

    #[test]
    fn test_environment_gate() {
        let production = DispatchSettings::default();
        assert_eq!(DispatchEngine::environment_gate(&production), None);

        let staging = DispatchSettings {
            environment: Environment::Staging,
            ..Default::default()
        };
        assert_eq!(
            DispatchEngine::environment_gate(&staging),
            Some(DeclineReason::NonProduction(Environment::Staging))
        );

        let overridden = DispatchSettings {
            allow_non_production: true,
            outbound_enabled: false,
            ..staging.clone()
        };
        assert_eq!(
            DispatchEngine::environment_gate(&overridden),
            Some(DeclineReason::OutboundDisabled)
        );

        let disabled = DispatchSettings {
            outbound_enabled: false,
            ..Default::default()
        };
        assert_eq!(
            DispatchEngine::environment_gate(&disabled),
            Some(DeclineReason::OutboundDisabled)
        );
    }

    #[tokio::test]
    async fn test_invalid_settings_are_an_error() {
        let settings = DispatchSettings {
            lock_ttl_secs: 0,
            ..Default::default()
        };
        let result = engine().run_once(&settings, &RotationCursor::new()).await;
        assert!(matches!(result, Err(DispatchError::InvalidSettings(_))));
    }

    #[tokio::test]
    async fn test_nothing_eligible() {
        let report = engine()
            .run_once(&DispatchSettings::default(), &RotationCursor::new())
            .await
            .unwrap();
        assert_eq!(report.decline_reason(), Some(DeclineReason::NothingEligible));
    }

    #[tokio::test]
    async fn test_slot_is_released_after_run() {
        let engine = engine();
        let settings = DispatchSettings::default();
        let campaign = engine.campaigns().schedule(draft(), &settings);
        engine
            .queue()
            .enqueue(campaign, ContactId(1), "one@example.org");

        let report = engine
            .run_once(&settings, &RotationCursor::new())
            .await
            .unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(engine.locks().active_worker_slots(), 0);
        assert!(!engine.locks().is_held(LockName::CampaignData(campaign)));
    }

    #[tokio::test]
    async fn test_worker_slots_exhausted() {
        let engine = engine();
        let settings = DispatchSettings {
            max_active_workers: 1,
            ..Default::default()
        };
        engine.campaigns().schedule(draft(), &settings);

        let other = WorkerId::generate();
        assert!(
            engine
                .locks()
                .try_acquire(LockName::WorkerSlot(0), other, settings.lock_ttl())
        );

        let report = engine
            .run_once(&settings, &RotationCursor::new())
            .await
            .unwrap();
        assert_eq!(
            report.decline_reason(),
            Some(DeclineReason::WorkerSlotsExhausted { active: 1, max: 1 })
        );
    }
}
