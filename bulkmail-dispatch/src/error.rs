//! Typed error handling for dispatch operations.
//!
//! Failures are split by blast radius:
//! - [`DispatchError`]: caller misuse, fails the whole invocation
//! - [`CampaignError`]: aborts work on one campaign, others proceed
//! - [`DeclineReason`]: an expected "not now", reported as a zero-work result

use bulkmail_common::CampaignId;
use serde::Serialize;
use thiserror::Error;

use crate::{campaign::CampaignState, config::Environment};

/// Invocation-level error.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The live settings passed to the invocation are unusable.
    #[error("Invalid dispatch settings: {0}")]
    InvalidSettings(#[from] SettingsError),
}

/// Problems with [`crate::DispatchSettings`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("lock_ttl_secs must be greater than zero")]
    ZeroLockTtl,

    #[error("lock_ttl_secs ({ttl}) exceeds the maximum of {max}")]
    LockTtlTooLong { ttl: u64, max: u64 },

    #[error("lock_hold_secs ({hold}) must be shorter than lock_ttl_secs ({ttl})")]
    HoldOutlivesLock { hold: u64, ttl: u64 },

    #[error("Failed to parse settings: {0}")]
    Parse(String),
}

impl From<ron::error::SpannedError> for SettingsError {
    fn from(error: ron::error::SpannedError) -> Self {
        Self::Parse(error.to_string())
    }
}

/// Errors scoped to a single campaign.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
pub enum CampaignError {
    #[error("{0} not found")]
    NotFound(CampaignId),

    /// Required campaign data is missing; the campaign cannot be sent.
    #[error("{campaign} is malformed: {reason}")]
    Malformed {
        campaign: CampaignId,
        reason: String,
    },

    #[error("{campaign} cannot move from {from} to {to}")]
    InvalidTransition {
        campaign: CampaignId,
        from: CampaignState,
        to: CampaignState,
    },
}

/// Why an invocation did no work.
///
/// A decline is a normal outcome: the trigger fires again later.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeclineReason {
    #[error("Job has not been executed as it is a {0} (non-production) environment.")]
    NonProduction(Environment),

    #[error("Outbound mail has been disabled")]
    OutboundDisabled,

    #[error("All {max} worker slots are busy ({active} active)")]
    WorkerSlotsExhausted { active: usize, max: usize },

    #[error("No campaigns are eligible for sending")]
    NothingEligible,
}

impl DeclineReason {
    /// Stable machine-readable code
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NonProduction(_) => "non_production",
            Self::OutboundDisabled => "outbound_disabled",
            Self::WorkerSlotsExhausted { .. } => "worker_slots_exhausted",
            Self::NothingEligible => "nothing_eligible",
        }
    }

    /// Message meant for an administrator reading the job log
    #[must_use]
    pub fn status_message(&self) -> String {
        match self {
            Self::NonProduction(environment) => format!(
                "Scheduled mailings are not sent from a {environment} environment. \
                 Switch the environment to Production or explicitly allow non-production sending."
            ),
            Self::OutboundDisabled => "Outbound emails have been disabled. \
                 Mailings stay queued until outbound delivery is enabled."
                .to_string(),
            Self::WorkerSlotsExhausted { active, max } => format!(
                "{active} of {max} mailing workers are already running; this run did nothing."
            ),
            Self::NothingEligible => "There are no scheduled or running mailings to send.".to_string(),
        }
    }

    /// `true` for declines caused by configuration rather than load
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::NonProduction(_) | Self::OutboundDisabled)
    }
}
