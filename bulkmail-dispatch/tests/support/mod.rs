//! Shared fixtures for dispatch integration tests
#![allow(dead_code)] // Test utility module - not all helpers used in every test

pub mod mailer;

use std::sync::Arc;

use bulkmail_common::{CampaignId, Clock, ContactId, ManualClock};
use bulkmail_dispatch::{
    CampaignDraft, CampaignStore, DispatchEngine, DispatchReport, DispatchSettings, Environment, MessageRef,
    RotationCursor, StaticDirectory,
};
use chrono::TimeDelta;

use self::mailer::RecordingMailer;

/// Engine wired to in-memory stores, a recording mailer and a frozen clock
pub struct Harness {
    pub engine: Arc<DispatchEngine>,
    pub mailer: Arc<RecordingMailer>,
    pub directory: Arc<StaticDirectory>,
    pub clock: ManualClock,
    pub cursor: Arc<RotationCursor>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_mailer(Arc::new(RecordingMailer::new()))
    }

    pub fn with_mailer(mailer: Arc<RecordingMailer>) -> Self {
        Self::with_stores(mailer, Arc::new(CampaignStore::new()))
    }

    /// Share `campaigns` with the engine, for mailers that act on campaigns
    pub fn with_stores(mailer: Arc<RecordingMailer>, campaigns: Arc<CampaignStore>) -> Self {
        Self::assemble(mailer, campaigns, ManualClock::default())
    }

    /// Every send takes `per_send` of the harness clock
    pub fn slow(per_send: TimeDelta) -> Self {
        let clock = ManualClock::default();
        let mailer = RecordingMailer::new().advancing(clock.clone(), per_send);
        Self::assemble(Arc::new(mailer), Arc::new(CampaignStore::new()), clock)
    }

    fn assemble(mailer: Arc<RecordingMailer>, campaigns: Arc<CampaignStore>, clock: ManualClock) -> Self {
        let directory = Arc::new(StaticDirectory::new());
        let engine = DispatchEngine::builder(mailer.clone())
            .campaigns(campaigns)
            .directory(directory.clone())
            .clock(Arc::new(clock.clone()))
            .build();

        Self {
            engine: Arc::new(engine),
            mailer,
            directory,
            clock,
            cursor: Arc::new(RotationCursor::new()),
        }
    }

    /// Schedule a campaign due now
    pub fn campaign(&self, name: &str) -> CampaignId {
        self.engine.campaigns().schedule(
            CampaignDraft {
                name: name.to_string(),
                message: Some(MessageRef {
                    subject: format!("{name} subject"),
                    body: format!("{name} body"),
                }),
                scheduled_at: self.clock.now(),
            },
            &DispatchSettings::default(),
        )
    }

    /// Schedule a campaign with `recipients` contacts, one address each
    pub fn campaign_with_recipients(&self, name: &str, recipients: u64) -> CampaignId {
        let campaign = self.campaign(name);
        self.enqueue(campaign, 1..=recipients);
        campaign
    }

    pub fn enqueue(&self, campaign: CampaignId, contacts: impl IntoIterator<Item = u64>) {
        for contact in contacts {
            self.engine
                .queue()
                .enqueue(campaign, ContactId(contact), address(campaign, contact));
        }
    }

    pub async fn run(&self, settings: &DispatchSettings) -> DispatchReport {
        self.engine
            .run_once(settings, &self.cursor)
            .await
            .expect("settings are valid")
    }
}

/// Address used for `contact` in `campaign`
pub fn address(campaign: CampaignId, contact: u64) -> String {
    format!("mail{}-contact{contact}@example.org", campaign.0)
}

/// Production settings with the given caps
pub fn settings(batch_limit: usize, max_active_workers: usize) -> DispatchSettings {
    DispatchSettings {
        batch_limit,
        max_active_workers,
        environment: Environment::Production,
        ..Default::default()
    }
}

/// How many invocations processed each count, as sorted `(processed, invocations)` pairs
pub fn tally_histogram(reports: &[DispatchReport]) -> Vec<(usize, usize)> {
    let mut histogram = std::collections::BTreeMap::new();
    for report in reports {
        *histogram.entry(report.processed).or_insert(0) += 1;
    }
    histogram.into_iter().collect()
}
