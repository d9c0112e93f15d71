//! Cron-style driver
//!
//! Each round re-reads the live settings and fires a number of worker
//! invocations at once, the way overlapping cron triggers would.

use std::{fmt::Write as _, path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use bulkmail_common::{CampaignId, internal};
use bulkmail_dispatch::{
    CampaignReport, CampaignState, DeclineReason, DispatchEngine, DispatchIssue, DispatchReport,
    DispatchSettings, DispatchStatus, RotationCursor, StaticDirectory,
};
use futures_util::future::join_all;

use crate::{fixture::Fixture, mailer::LogMailer};

/// Final state of one seeded campaign
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignSummary {
    pub name: String,
    pub state: Option<CampaignState>,
    pub report: CampaignReport,
}

/// How [`Runner::run`] paces its rounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Invocations fired per round
    pub workers: usize,
    /// Number of rounds; 0 runs until no campaign can make progress
    pub iterations: usize,
    /// Pause between rounds
    pub interval: Duration,
}

/// Why [`Runner::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// The requested number of rounds ran
    Iterations(usize),
    /// Every campaign is finished, paused or unusable
    Idle(usize),
    /// Every invocation of the last round was refused by configuration
    Refused(usize, DeclineReason),
}

#[derive(Debug)]
pub struct Runner {
    engine: Arc<DispatchEngine>,
    mailer: Arc<LogMailer>,
    cursor: Arc<RotationCursor>,
    campaigns: Vec<(CampaignId, String)>,
}

impl Runner {
    /// Build an engine over in-memory stores seeded from `fixture`
    #[must_use]
    pub fn seeded(fixture: &Fixture, settings: &DispatchSettings, mailer: LogMailer) -> Self {
        let mailer = Arc::new(mailer);
        let directory = Arc::new(StaticDirectory::new());
        let engine = DispatchEngine::builder(mailer.clone())
            .directory(directory.clone())
            .build();

        let campaigns = fixture.seed(&engine, &directory, settings);
        internal!(level = INFO, campaigns = campaigns.len(), "Fixture seeded");

        Self {
            engine: Arc::new(engine),
            mailer,
            cursor: Arc::new(RotationCursor::new()),
            campaigns,
        }
    }

    /// Read the live settings
    ///
    /// `allow_non_production` only ever widens what the file allows.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load_settings(
        path: &Path,
        allow_non_production: bool,
    ) -> anyhow::Result<DispatchSettings> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;

        let mut settings = DispatchSettings::from_ron(&text)
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        settings.allow_non_production |= allow_non_production;

        Ok(settings)
    }

    /// Fire `workers` invocations concurrently and wait for all of them
    ///
    /// # Errors
    ///
    /// Returns an error if an invocation rejects the settings or a worker
    /// task panics.
    pub async fn round(
        &self,
        settings: &DispatchSettings,
        workers: usize,
    ) -> anyhow::Result<Vec<DispatchReport>> {
        let tasks = (0..workers).map(|_| {
            let engine = Arc::clone(&self.engine);
            let cursor = Arc::clone(&self.cursor);
            let settings = settings.clone();
            tokio::spawn(async move { engine.run_once(&settings, &cursor).await })
        });

        join_all(tasks)
            .await
            .into_iter()
            .map(|joined| -> anyhow::Result<DispatchReport> {
                Ok(joined.context("Worker task failed")??)
            })
            .collect()
    }

    /// Run rounds until `options` says stop
    ///
    /// Settings are re-read from `config` before every round. `on_report`
    /// sees each invocation's report along with its round number.
    ///
    /// When running until idle, a round in which every invocation is refused
    /// by configuration ends the run: nothing changes until the settings
    /// file does, and looping would never finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings cannot be loaded or a round fails.
    pub async fn run(
        &self,
        config: &Path,
        allow_non_production: bool,
        options: RunOptions,
        mut on_report: impl FnMut(usize, &DispatchReport),
    ) -> anyhow::Result<RunEnd> {
        let until_idle = options.iterations == 0;
        let mut round = 0;

        loop {
            if until_idle && self.is_idle() {
                return Ok(RunEnd::Idle(round));
            }
            if !until_idle && round >= options.iterations {
                return Ok(RunEnd::Iterations(round));
            }

            if round > 0 && !options.interval.is_zero() {
                tokio::time::sleep(options.interval).await;
            }
            round += 1;

            let settings = Self::load_settings(config, allow_non_production)?;
            let reports = self.round(&settings, options.workers).await?;
            for report in &reports {
                on_report(round, report);
            }

            if until_idle && let Some(reason) = refused_by_configuration(&reports) {
                internal!(
                    level = WARN,
                    round,
                    code = reason.code(),
                    "Every invocation was refused, stopping"
                );
                return Ok(RunEnd::Refused(round, reason));
            }
        }
    }

    /// `true` once no seeded campaign can make further progress
    ///
    /// Paused, complete and malformed campaigns never will.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.campaigns.iter().all(|(id, _)| {
            self.engine.campaigns().get(*id).is_none_or(|campaign| {
                !campaign.state.is_claimable() || campaign.validate().is_err()
            })
        })
    }

    #[must_use]
    pub fn summaries(&self) -> Vec<CampaignSummary> {
        self.campaigns
            .iter()
            .map(|(id, name)| CampaignSummary {
                name: name.clone(),
                state: self.engine.campaigns().state(*id),
                report: self.engine.report(*id),
            })
            .collect()
    }

    #[must_use]
    pub const fn engine(&self) -> &Arc<DispatchEngine> {
        &self.engine
    }

    #[must_use]
    pub const fn mailer(&self) -> &Arc<LogMailer> {
        &self.mailer
    }
}

/// The shared reason, if every report was declined because of configuration
#[must_use]
pub fn refused_by_configuration(reports: &[DispatchReport]) -> Option<DeclineReason> {
    let first = reports.first()?.decline_reason()?;
    reports
        .iter()
        .all(|report| {
            report
                .decline_reason()
                .is_some_and(|reason| reason.is_configuration())
        })
        .then_some(first)
}

/// One line per invocation, plus one per issue
#[must_use]
pub fn describe(report: &DispatchReport) -> String {
    let mut out = match report.status {
        DispatchStatus::Completed => {
            let per_campaign = report
                .campaigns
                .iter()
                .map(|tally| {
                    let done = if tally.completed { ", complete" } else { "" };
                    format!("{}: {} sent, {} skipped{done}", tally.campaign, tally.sent, tally.skipped)
                })
                .collect::<Vec<_>>()
                .join("; ");
            format!("{} processed {} [{per_campaign}]", report.worker, report.processed)
        }
        DispatchStatus::Declined(reason) => format!(
            "{} declined ({}): {}",
            report.worker,
            reason.code(),
            reason.status_message()
        ),
    };

    for issue in &report.issues {
        let _ = match issue {
            DispatchIssue::RecipientSkipped {
                entry,
                contact,
                reason,
                ..
            } => write!(out, "\n  skipped {entry} ({contact}): {reason}"),
            DispatchIssue::SendFailed {
                entry,
                address,
                reason,
                ..
            } => write!(out, "\n  failed {entry} <{address}>: {reason}"),
            DispatchIssue::Campaign(error) => write!(out, "\n  {error}"),
        };
    }

    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::io::Write;

    use bulkmail_common::{EntryId, WorkerId};
    use bulkmail_dispatch::{DeclineReason, Environment, SkipReason};
    use pretty_assertions::assert_eq;

    use super::*;

    const FIXTURE: &str = r#"
        Fixture(
            campaigns: [
                (name: "Autumn", subject: Some("Leaves"), body: "autumn.html", generate: 12),
                (name: "Winter", subject: Some("Snow"), body: "winter.html", generate: 5),
            ],
            contacts: { 4: Deleted },
            bounces: ["mailing2-contact1@example.org"],
        )
    "#;

    fn settings_file(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_settings_applies_override() {
        let file = settings_file("(environment: Staging, batch_limit: 10)");

        let settings = Runner::load_settings(file.path(), false).unwrap();
        assert_eq!(settings.environment, Environment::Staging);
        assert!(!settings.allow_non_production);

        let settings = Runner::load_settings(file.path(), true).unwrap();
        assert!(settings.allow_non_production);
        assert_eq!(settings.batch_limit, 10);
    }

    #[test]
    fn test_load_settings_rejects_invalid_file() {
        let file = settings_file("(lock_ttl_secs: 0)");
        assert!(Runner::load_settings(file.path(), false).is_err());

        let missing = Path::new("/nonexistent/bulkmail.ron");
        let error = Runner::load_settings(missing, false).unwrap_err();
        assert!(error.to_string().contains("/nonexistent/bulkmail.ron"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rounds_drain_every_campaign() {
        let fixture = Fixture::from_ron(FIXTURE).unwrap();
        let settings = DispatchSettings {
            batch_limit: 4,
            max_active_workers: 2,
            ..DispatchSettings::default()
        };
        let runner = Runner::seeded(
            &fixture,
            &settings,
            LogMailer::new(fixture.bounces.clone()),
        );

        for _ in 0..50 {
            if runner.is_idle() {
                break;
            }
            runner.round(&settings, 3).await.unwrap();
        }

        assert!(runner.is_idle());
        let summaries = runner.summaries();
        assert_eq!(summaries[0].name, "Autumn");
        assert_eq!(summaries[0].state, Some(CampaignState::Complete));
        assert_eq!(summaries[0].report.delivered, 11);
        assert_eq!(summaries[0].report.skipped, 1);
        assert_eq!(summaries[1].report.delivered, 3);
        assert_eq!(summaries[1].report.bounced, 1);
        assert_eq!(summaries[1].report.skipped, 1);
        assert_eq!(runner.mailer().sent(), 15);
    }

    #[tokio::test]
    async fn test_round_reports_declines() {
        let fixture = Fixture::from_ron(FIXTURE).unwrap();
        let settings = DispatchSettings {
            environment: Environment::Development,
            ..DispatchSettings::default()
        };
        let runner = Runner::seeded(&fixture, &settings, LogMailer::default());

        let reports = runner.round(&settings, 2).await.unwrap();

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|report| {
            report.decline_reason() == Some(DeclineReason::NonProduction(Environment::Development))
        }));
        assert_eq!(runner.mailer().sent(), 0);
        assert!(!runner.is_idle());
    }

    #[tokio::test]
    async fn test_run_until_idle_stops_when_refused() {
        let fixture = Fixture::from_ron(FIXTURE).unwrap();
        let config = settings_file("(environment: Staging)");
        let settings = Runner::load_settings(config.path(), false).unwrap();
        let runner = Runner::seeded(&fixture, &settings, LogMailer::default());
        let options = RunOptions {
            workers: 2,
            iterations: 0,
            interval: Duration::ZERO,
        };

        let mut seen = Vec::new();
        let end = runner
            .run(config.path(), false, options, |round, report| {
                seen.push((round, report.decline_reason()));
            })
            .await
            .unwrap();

        let refused = DeclineReason::NonProduction(Environment::Staging);
        assert_eq!(end, RunEnd::Refused(1, refused));
        assert_eq!(seen, vec![(1, Some(refused)), (1, Some(refused))]);
        assert_eq!(runner.mailer().sent(), 0);

        // The override lets the same configuration drain everything
        let end = runner
            .run(config.path(), true, options, |_, _| {})
            .await
            .unwrap();
        assert!(matches!(end, RunEnd::Idle(rounds) if rounds > 0));
        assert_eq!(runner.mailer().sent(), 15);
    }

    #[tokio::test]
    async fn test_fixed_iterations_run_through_refusals() {
        let fixture = Fixture::from_ron(FIXTURE).unwrap();
        let config = settings_file("(outbound_enabled: false)");
        let settings = Runner::load_settings(config.path(), false).unwrap();
        let runner = Runner::seeded(&fixture, &settings, LogMailer::default());
        let options = RunOptions {
            workers: 1,
            iterations: 3,
            interval: Duration::ZERO,
        };

        let mut reports = 0;
        let end = runner
            .run(config.path(), false, options, |_, _| reports += 1)
            .await
            .unwrap();

        assert_eq!(end, RunEnd::Iterations(3));
        assert_eq!(reports, 3);
    }

    #[test]
    fn test_refusal_needs_every_report() {
        let worker = WorkerId::generate();
        let disabled = DispatchReport::declined(worker, DeclineReason::OutboundDisabled);
        let busy = DispatchReport::declined(
            worker,
            DeclineReason::WorkerSlotsExhausted { active: 1, max: 1 },
        );

        assert_eq!(refused_by_configuration(&[]), None);
        assert_eq!(
            refused_by_configuration(&[disabled.clone(), disabled.clone()]),
            Some(DeclineReason::OutboundDisabled)
        );
        assert_eq!(refused_by_configuration(&[disabled, busy.clone()]), None);
        assert_eq!(refused_by_configuration(&[busy]), None);
    }

    #[test]
    fn test_describe_lists_issues() {
        let worker = WorkerId::generate();
        let report = DispatchReport {
            worker,
            status: DispatchStatus::Completed,
            processed: 2,
            campaigns: Vec::new(),
            issues: vec![DispatchIssue::RecipientSkipped {
                campaign: CampaignId(1),
                entry: EntryId(3),
                contact: bulkmail_common::ContactId(3),
                reason: SkipReason::Deceased,
            }],
        };

        let text = describe(&report);
        assert!(text.starts_with(&format!("{worker} processed 2")));
        assert_eq!(text.lines().count(), 2);

        let declined = describe(&DispatchReport::declined(worker, DeclineReason::OutboundDisabled));
        assert!(declined.contains("outbound_disabled"));
    }
}
