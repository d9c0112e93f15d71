//! Campaign definitions and their lifecycle
//!
//! ```text
//!            pause              resume
//! Scheduled -------> Paused -----------> Scheduled
//!     |                ^
//!     | first send     | pause
//!     v                |
//!  Running ------------+
//!     |
//!     | claim finds nothing left
//!     v
//!  Complete
//! ```
//!
//! Every transition happens inside a single critical section of the store, so
//! two workers racing to complete the same campaign observe the transition
//! exactly once.

use std::{collections::BTreeMap, fmt};

use bulkmail_common::{CampaignId, internal};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    config::{DispatchSettings, SettingsSnapshot},
    error::CampaignError,
};

/// Lifecycle state of a campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CampaignState {
    Scheduled,
    Running,
    Paused,
    Complete,
}

impl CampaignState {
    /// Whether entries of a campaign in this state may be claimed
    #[must_use]
    pub const fn is_claimable(self) -> bool {
        matches!(self, Self::Scheduled | Self::Running)
    }
}

impl fmt::Display for CampaignState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Scheduled => "Scheduled",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Complete => "Complete",
        })
    }
}

/// Subject and body reference of the message a campaign sends
///
/// The body is opaque here; only the [`crate::Mailer`] interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub subject: String,
    pub body: String,
}

/// Input for scheduling a new campaign
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignDraft {
    pub name: String,
    #[serde(default)]
    pub message: Option<MessageRef>,
    pub scheduled_at: DateTime<Utc>,
}

/// One scheduled bulk send
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub message: Option<MessageRef>,
    pub scheduled_at: DateTime<Utc>,
    pub state: CampaignState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub snapshot: SettingsSnapshot,
}

impl Campaign {
    /// Check that the campaign carries everything needed to send it
    ///
    /// # Errors
    ///
    /// Returns [`CampaignError::Malformed`] when the message is missing or
    /// has an empty subject.
    pub fn validate(&self) -> Result<&MessageRef, CampaignError> {
        let message = self.message.as_ref().ok_or_else(|| CampaignError::Malformed {
            campaign: self.id,
            reason: "no message attached".to_string(),
        })?;

        if message.subject.trim().is_empty() {
            return Err(CampaignError::Malformed {
                campaign: self.id,
                reason: "message subject is empty".to_string(),
            });
        }

        Ok(message)
    }

    fn transition(&self, to: CampaignState) -> CampaignError {
        CampaignError::InvalidTransition {
            campaign: self.id,
            from: self.state,
            to,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    campaigns: BTreeMap<CampaignId, Campaign>,
    next_id: u64,
}

impl Inner {
    fn get_mut(&mut self, id: CampaignId) -> Result<&mut Campaign, CampaignError> {
        self.campaigns
            .get_mut(&id)
            .ok_or(CampaignError::NotFound(id))
    }
}

/// In-memory campaign table
#[derive(Debug, Default)]
pub struct CampaignStore {
    inner: Mutex<Inner>,
}

impl CampaignStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a campaign in the `Scheduled` state
    ///
    /// The live settings are copied onto the campaign for reference.
    pub fn schedule(&self, draft: CampaignDraft, settings: &DispatchSettings) -> CampaignId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = CampaignId(inner.next_id);

        inner.campaigns.insert(
            id,
            Campaign {
                id,
                name: draft.name,
                message: draft.message,
                scheduled_at: draft.scheduled_at,
                state: CampaignState::Scheduled,
                started_at: None,
                ended_at: None,
                snapshot: settings.snapshot(),
            },
        );

        internal!(level = DEBUG, campaign = %id, "Campaign scheduled");
        id
    }

    #[must_use]
    pub fn get(&self, id: CampaignId) -> Option<Campaign> {
        self.inner.lock().campaigns.get(&id).cloned()
    }

    #[must_use]
    pub fn state(&self, id: CampaignId) -> Option<CampaignState> {
        self.inner.lock().campaigns.get(&id).map(|campaign| campaign.state)
    }

    /// Claimable campaigns whose scheduled time has passed, ordered by id
    #[must_use]
    pub fn eligible(&self, now: DateTime<Utc>) -> Vec<CampaignId> {
        self.inner
            .lock()
            .campaigns
            .values()
            .filter(|campaign| campaign.state.is_claimable() && campaign.scheduled_at <= now)
            .map(|campaign| campaign.id)
            .collect()
    }

    /// Move a campaign to `Running` once it has started sending
    ///
    /// Returns `Ok(false)` if the campaign was paused or completed in the
    /// meantime. The start time is only ever recorded once.
    ///
    /// # Errors
    ///
    /// Returns [`CampaignError::NotFound`] for an unknown campaign.
    pub fn mark_running(&self, id: CampaignId, now: DateTime<Utc>) -> Result<bool, CampaignError> {
        let mut inner = self.inner.lock();
        let campaign = inner.get_mut(id)?;

        if !campaign.state.is_claimable() {
            return Ok(false);
        }

        campaign.state = CampaignState::Running;
        if campaign.started_at.is_none() {
            campaign.started_at = Some(now);
            internal!(level = INFO, campaign = %id, "Campaign started sending");
        }

        Ok(true)
    }

    /// Move a campaign to `Complete`
    ///
    /// Returns `true` only for the call that performed the transition.
    ///
    /// # Errors
    ///
    /// Returns [`CampaignError::NotFound`] for an unknown campaign.
    pub fn mark_complete(&self, id: CampaignId, now: DateTime<Utc>) -> Result<bool, CampaignError> {
        let mut inner = self.inner.lock();
        let campaign = inner.get_mut(id)?;

        if !campaign.state.is_claimable() {
            return Ok(false);
        }

        campaign.state = CampaignState::Complete;
        campaign.ended_at = Some(now);
        // A campaign with nothing to send still gets a start time
        campaign.started_at.get_or_insert(now);

        internal!(level = INFO, campaign = %id, "Campaign complete");
        Ok(true)
    }

    /// Stop a campaign from being claimed
    ///
    /// Only the state changes here. Entries a worker has already claimed
    /// stay claimed until that worker sees the pause before its next send
    /// and releases them.
    ///
    /// Pausing an already paused campaign is a no-op returning `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown or completed campaign.
    pub fn pause(&self, id: CampaignId) -> Result<bool, CampaignError> {
        let mut inner = self.inner.lock();
        let campaign = inner.get_mut(id)?;

        match campaign.state {
            CampaignState::Scheduled | CampaignState::Running => {
                campaign.state = CampaignState::Paused;
                internal!(level = INFO, campaign = %id, "Campaign paused");
                Ok(true)
            }
            CampaignState::Paused => Ok(false),
            CampaignState::Complete => Err(campaign.transition(CampaignState::Paused)),
        }
    }

    /// Make a paused campaign eligible again
    ///
    /// Resuming a campaign that is already eligible is a no-op returning
    /// `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown or completed campaign.
    pub fn resume(&self, id: CampaignId) -> Result<bool, CampaignError> {
        let mut inner = self.inner.lock();
        let campaign = inner.get_mut(id)?;

        match campaign.state {
            CampaignState::Paused => {
                campaign.state = CampaignState::Scheduled;
                internal!(level = INFO, campaign = %id, "Campaign resumed");
                Ok(true)
            }
            CampaignState::Scheduled | CampaignState::Running => Ok(false),
            CampaignState::Complete => Err(campaign.transition(CampaignState::Scheduled)),
        }
    }
}
