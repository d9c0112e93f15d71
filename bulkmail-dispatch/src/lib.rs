//! Dispatch engine for scheduled bulk-mail campaigns
//!
//! Turns a scheduled campaign into delivery work that many independently
//! triggered workers can share safely:
//! - Advisory, expiring locks for campaign data and counted worker slots
//! - A recipient queue with atomic, FIFO batch claims
//! - Per-invocation batch budgets, worker caps and send pacing
//! - Campaign lifecycle tracking (scheduled, running, paused, complete)
//! - An idempotent delivery ledger with per-campaign reports

mod campaign;
mod config;
mod directory;
mod engine;
mod error;
pub mod lock;
mod mailer;
mod planner;
pub mod queue;
mod recorder;
mod report;

// Re-export campaign types
pub use campaign::{Campaign, CampaignDraft, CampaignState, CampaignStore, MessageRef};
// Re-export configuration types
pub use config::{DispatchSettings, Environment, SettingsSnapshot};
// Re-export collaborator seams
pub use directory::{Eligibility, RecipientDirectory, StaticDirectory};
pub use mailer::{Mailer, SendOutcome};
// Re-export error types
pub use error::{CampaignError, DeclineReason, DispatchError, SettingsError};
// Re-export core types
pub use engine::{DispatchEngine, DispatchEngineBuilder};
pub use lock::{LockManager, LockName};
pub use planner::{BatchPlanner, InvocationBudget, RotationCursor};
pub use queue::{ClaimedBatch, Outcome, QueueEntry, RecipientQueueStore, SkipReason};
pub use recorder::{CampaignReport, DeliveryEvent, DeliveryRecorder, Recorded};
pub use report::{CampaignTally, DispatchIssue, DispatchReport, DispatchStatus};
