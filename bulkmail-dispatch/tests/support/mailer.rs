//! Test doubles for the outbound transport

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use bulkmail_common::{CampaignId, ManualClock};
use bulkmail_dispatch::{CampaignStore, Mailer, MessageRef, SendOutcome};
use chrono::TimeDelta;
use parking_lot::Mutex;

/// Message handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub subject: String,
    pub address: String,
}

/// Records every send; bounces or fails chosen addresses
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<Sent>>,
    bounce: HashSet<String>,
    fail: HashSet<String>,
    pause: Option<PauseAfter>,
    slow: Option<(ManualClock, TimeDelta)>,
}

/// Pause a campaign once a number of messages went out
#[derive(Debug)]
struct PauseAfter {
    campaigns: Arc<CampaignStore>,
    campaign: CampaignId,
    after: usize,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bouncing(mut self, address: impl Into<String>) -> Self {
        self.bounce.insert(address.into());
        self
    }

    pub fn failing(mut self, address: impl Into<String>) -> Self {
        self.fail.insert(address.into());
        self
    }

    /// Pause `campaign` right after the `after`-th send
    pub fn pausing(mut self, campaigns: Arc<CampaignStore>, campaign: CampaignId, after: usize) -> Self {
        self.pause = Some(PauseAfter {
            campaigns,
            campaign,
            after,
        });
        self
    }

    /// Each send takes `per_send` on `clock` and yields to other workers
    pub fn advancing(mut self, clock: ManualClock, per_send: TimeDelta) -> Self {
        self.slow = Some((clock, per_send));
        self
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.sent.lock().iter().map(|sent| sent.address.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, message: &MessageRef, address: &str) -> SendOutcome {
        let count = {
            let mut sent = self.sent.lock();
            sent.push(Sent {
                subject: message.subject.clone(),
                address: address.to_string(),
            });
            sent.len()
        };

        if let Some(pause) = &self.pause
            && pause.after == count
        {
            let _ = pause.campaigns.pause(pause.campaign);
        }

        if let Some((clock, per_send)) = &self.slow {
            clock.advance(*per_send);
            tokio::task::yield_now().await;
        }

        if self.fail.contains(address) {
            SendOutcome::Failed("connection refused".to_string())
        } else if self.bounce.contains(address) {
            SendOutcome::Bounced("550 mailbox unavailable".to_string())
        } else {
            SendOutcome::Delivered
        }
    }
}
