//! Command-line driver for the bulkmail dispatch engine
//!
//! Seeds in-memory stores from a RON fixture and runs rounds of worker
//! invocations against them with a logging transport.

pub mod fixture;
pub mod mailer;
pub mod runner;

pub use fixture::{Fixture, FixtureError};
pub use mailer::LogMailer;
pub use runner::{
    CampaignSummary, RunEnd, RunOptions, Runner, describe, refused_by_configuration,
};
