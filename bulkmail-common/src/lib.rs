//! Shared building blocks for the bulkmail workspace

pub mod clock;
pub mod ids;
pub mod logging;

pub use chrono;
pub use clock::{Clock, ManualClock, SystemClock};
pub use ids::{CampaignId, ContactId, EntryId, WorkerId};
pub use tracing;
