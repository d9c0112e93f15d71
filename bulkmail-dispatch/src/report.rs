//! Result of one dispatch invocation

use bulkmail_common::{CampaignId, ContactId, EntryId, WorkerId};
use serde::Serialize;

use crate::{
    error::{CampaignError, DeclineReason},
    queue::SkipReason,
};

/// Whether the invocation did its work or declined up front
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DispatchStatus {
    Completed,
    Declined(DeclineReason),
}

/// Work done on one campaign during an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CampaignTally {
    pub campaign: CampaignId,
    /// Send attempts, whatever their outcome
    pub sent: usize,
    pub skipped: usize,
    /// This invocation moved the campaign to `Complete`
    pub completed: bool,
}

impl CampaignTally {
    #[must_use]
    pub const fn new(campaign: CampaignId) -> Self {
        Self {
            campaign,
            sent: 0,
            skipped: 0,
            completed: false,
        }
    }
}

/// Problem confined to one recipient or one campaign
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DispatchIssue {
    /// The contact became ineligible after it was queued
    RecipientSkipped {
        campaign: CampaignId,
        entry: EntryId,
        contact: ContactId,
        reason: SkipReason,
    },
    /// The transport could not send the message
    SendFailed {
        campaign: CampaignId,
        entry: EntryId,
        address: String,
        reason: String,
    },
    /// The campaign could not be processed at all
    Campaign(CampaignError),
}

/// Everything one call to [`crate::DispatchEngine::run_once`] did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub worker: WorkerId,
    pub status: DispatchStatus,
    /// Total send attempts across every campaign
    pub processed: usize,
    pub campaigns: Vec<CampaignTally>,
    pub issues: Vec<DispatchIssue>,
}

impl DispatchReport {
    #[must_use]
    pub const fn declined(worker: WorkerId, reason: DeclineReason) -> Self {
        Self {
            worker,
            status: DispatchStatus::Declined(reason),
            processed: 0,
            campaigns: Vec::new(),
            issues: Vec::new(),
        }
    }

    #[must_use]
    pub const fn decline_reason(&self) -> Option<DeclineReason> {
        match self.status {
            DispatchStatus::Declined(reason) => Some(reason),
            DispatchStatus::Completed => None,
        }
    }

    /// Tally for `campaign`, if this invocation touched it
    #[must_use]
    pub fn tally(&self, campaign: CampaignId) -> Option<&CampaignTally> {
        self.campaigns.iter().find(|tally| tally.campaign == campaign)
    }

    /// Send attempts for `campaign` in this invocation
    #[must_use]
    pub fn sent_for(&self, campaign: CampaignId) -> usize {
        self.tally(campaign).map_or(0, |tally| tally.sent)
    }
}
