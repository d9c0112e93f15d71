//! Seed data for the in-memory stores
//!
//! A fixture stands in for the campaign scheduler and recipient resolution:
//! it lists campaigns with their resolved recipients, plus any contacts that
//! became ineligible after queueing.
//!
//! ```ron
//! Fixture(
//!     campaigns: [
//!         (
//!             name: "Spring newsletter",
//!             subject: Some("Spring is here"),
//!             body: "templates/spring.html",
//!             recipients: [(contact: 1, address: "ada@example.org")],
//!             generate: 20,
//!         ),
//!     ],
//!     contacts: { 3: Deceased },
//!     bounces: ["nobody@example.org"],
//! )
//! ```

use std::{collections::BTreeMap, path::Path};

use bulkmail_common::{
    CampaignId, ContactId,
    chrono::{DateTime, TimeDelta, Utc},
};
use bulkmail_dispatch::{
    CampaignDraft, DispatchEngine, DispatchSettings, Eligibility, MessageRef, StaticDirectory,
};
use serde::Deserialize;
use thiserror::Error;

/// Problems loading a fixture
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse fixture: {0}")]
    Parse(#[from] ron::error::SpannedError),

    #[error("Campaign '{0}' has no recipients")]
    NoRecipients(String),
}

/// One resolved recipient row
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FixtureRecipient {
    pub contact: ContactId,
    pub address: String,
}

/// A campaign and its resolved recipients
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FixtureCampaign {
    pub name: String,

    /// Leave out to model a campaign whose message was never attached
    #[serde(default)]
    pub subject: Option<String>,

    #[serde(default)]
    pub body: String,

    /// Seconds from now until the campaign is due
    #[serde(default)]
    pub scheduled_in_secs: i64,

    #[serde(default)]
    pub recipients: Vec<FixtureRecipient>,

    /// Number of synthetic recipients appended after `recipients`
    #[serde(default)]
    pub generate: u64,

    /// Start the campaign paused
    #[serde(default)]
    pub paused: bool,
}

impl FixtureCampaign {
    fn draft(&self, now: DateTime<Utc>) -> CampaignDraft {
        CampaignDraft {
            name: self.name.clone(),
            message: self.subject.as_ref().map(|subject| MessageRef {
                subject: subject.clone(),
                body: self.body.clone(),
            }),
            scheduled_at: now + TimeDelta::try_seconds(self.scheduled_in_secs).unwrap_or_default(),
        }
    }

    fn rows(&self, campaign: CampaignId) -> impl Iterator<Item = FixtureRecipient> + '_ {
        let offset = self
            .recipients
            .iter()
            .map(|recipient| recipient.contact.0)
            .max()
            .unwrap_or(0);

        self.recipients.iter().cloned().chain((1..=self.generate).map(move |n| {
            FixtureRecipient {
                contact: ContactId(offset + n),
                address: format!("mailing{}-contact{}@example.org", campaign.0, offset + n),
            }
        }))
    }
}

/// Campaigns, contact status and simulated bounces
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub campaigns: Vec<FixtureCampaign>,

    /// Contacts that are no longer eligible
    #[serde(default)]
    pub contacts: BTreeMap<ContactId, Eligibility>,

    /// Addresses the simulated transport bounces
    #[serde(default)]
    pub bounces: Vec<String>,
}

impl Fixture {
    /// Parse a fixture from RON text
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid fixture or a campaign has
    /// no recipients at all.
    pub fn from_ron(text: &str) -> Result<Self, FixtureError> {
        let fixture: Self = ron::from_str(text)?;

        if let Some(empty) = fixture
            .campaigns
            .iter()
            .find(|campaign| campaign.recipients.is_empty() && campaign.generate == 0)
        {
            return Err(FixtureError::NoRecipients(empty.name.clone()));
        }

        Ok(fixture)
    }

    /// Read and parse a fixture file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, FixtureError> {
        let text = std::fs::read_to_string(path).map_err(|source| FixtureError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_ron(&text)
    }

    /// Schedule every campaign, enqueue its recipients and apply contact status
    pub fn seed(
        &self,
        engine: &DispatchEngine,
        directory: &StaticDirectory,
        settings: &DispatchSettings,
    ) -> Vec<(CampaignId, String)> {
        let now = engine.clock().now();

        for (contact, eligibility) in &self.contacts {
            directory.set(*contact, *eligibility);
        }

        self.campaigns
            .iter()
            .map(|campaign| {
                let id = engine.campaigns().schedule(campaign.draft(now), settings);
                for row in campaign.rows(id) {
                    engine.queue().enqueue(id, row.contact, row.address);
                }

                if campaign.paused {
                    // Freshly scheduled campaigns can always be paused
                    let _ = engine.pause(id);
                }

                (id, campaign.name.clone())
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use bulkmail_dispatch::{CampaignState, RecipientDirectory};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::mailer::LogMailer;

    const FIXTURE: &str = r#"
        Fixture(
            campaigns: [
                (
                    name: "Spring newsletter",
                    subject: Some("Spring is here"),
                    body: "spring.html",
                    recipients: [
                        (contact: 1, address: "ada@example.org"),
                        (contact: 2, address: "grace@example.org"),
                    ],
                    generate: 3,
                ),
                (
                    name: "Draft",
                    generate: 1,
                    paused: true,
                ),
            ],
            contacts: { 2: Deceased },
            bounces: ["ada@example.org"],
        )
    "#;

    #[test]
    fn test_parse_fixture() {
        let fixture = Fixture::from_ron(FIXTURE).expect("valid fixture");

        assert_eq!(fixture.campaigns.len(), 2);
        assert_eq!(fixture.campaigns[0].subject.as_deref(), Some("Spring is here"));
        assert_eq!(fixture.campaigns[1].subject, None);
        assert_eq!(fixture.contacts.get(&ContactId(2)), Some(&Eligibility::Deceased));
        assert_eq!(fixture.bounces, vec!["ada@example.org".to_string()]);
    }

    #[test]
    fn test_campaign_without_recipients_is_rejected() {
        let err = Fixture::from_ron(r#"Fixture(campaigns: [(name: "Empty")])"#).unwrap_err();
        assert!(matches!(err, FixtureError::NoRecipients(name) if name == "Empty"));
    }

    #[test]
    fn test_seed_populates_stores() {
        let fixture = Fixture::from_ron(FIXTURE).unwrap();
        let directory = Arc::new(StaticDirectory::new());
        let engine = DispatchEngine::builder(Arc::new(LogMailer::default()))
            .directory(directory.clone())
            .build();

        let seeded = fixture.seed(&engine, &directory, &DispatchSettings::default());

        assert_eq!(seeded.len(), 2);
        let spring = seeded[0].0;
        let draft = seeded[1].0;
        assert_eq!(seeded[0].1, "Spring newsletter");

        let entries = engine.queue().entries(spring);
        assert_eq!(entries.len(), 5);
        // Generated contacts continue after the listed ones
        assert_eq!(entries[2].contact, ContactId(3));
        assert_eq!(entries[4].contact, ContactId(5));

        assert_eq!(engine.campaigns().state(draft), Some(CampaignState::Paused));
        assert!(engine.campaigns().get(draft).unwrap().message.is_none());
        assert_eq!(directory.eligibility(ContactId(2)), Eligibility::Deceased);
    }
}
