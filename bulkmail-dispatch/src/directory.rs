//! Recipient eligibility, looked up when entries are claimed
//!
//! Contacts can be deleted, marked deceased or opt out between the moment a
//! campaign is queued and the moment a worker reaches them, so eligibility is
//! checked at claim time rather than trusted from queue-build time.

use bulkmail_common::ContactId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::queue::SkipReason;

/// Whether a contact may still be mailed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Eligibility {
    #[default]
    Eligible,
    Deleted,
    Deceased,
    OptedOut,
    OnHold,
}

impl Eligibility {
    /// The skip reason to record, `None` for an eligible contact
    #[must_use]
    pub const fn skip_reason(self) -> Option<SkipReason> {
        match self {
            Self::Eligible => None,
            Self::Deleted => Some(SkipReason::Deleted),
            Self::Deceased => Some(SkipReason::Deceased),
            Self::OptedOut => Some(SkipReason::OptedOut),
            Self::OnHold => Some(SkipReason::OnHold),
        }
    }
}

/// Lookup into the external contact store
///
/// Called while the queue is locked for a claim, so implementations must be
/// quick and must not call back into the queue.
pub trait RecipientDirectory: Send + Sync {
    fn eligibility(&self, contact: ContactId) -> Eligibility;
}

/// In-memory directory: every contact is eligible unless marked otherwise
#[derive(Debug, Default)]
pub struct StaticDirectory {
    overrides: DashMap<ContactId, Eligibility>,
}

impl StaticDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a contact's current status
    pub fn set(&self, contact: ContactId, eligibility: Eligibility) {
        if eligibility == Eligibility::Eligible {
            self.overrides.remove(&contact);
        } else {
            self.overrides.insert(contact, eligibility);
        }
    }
}

impl RecipientDirectory for StaticDirectory {
    fn eligibility(&self, contact: ContactId) -> Eligibility {
        self.overrides
            .get(&contact)
            .map_or(Eligibility::Eligible, |entry| *entry.value())
    }
}
