//! Cron-style driver for scheduled mailings

use std::{path::PathBuf, time::Duration};

use bulkmail::{Fixture, LogMailer, RunEnd, RunOptions, Runner, describe};
use clap::{Parser, Subcommand};

/// Run scheduled bulk-mail campaigns against an in-memory fixture
#[derive(Parser, Debug)]
#[command(name = "bulkmail")]
#[command(about = "Dispatch scheduled mailings", long_about = None)]
#[command(version)]
struct Cli {
    /// Live settings, re-read before every round
    #[arg(short, long, global = true, env = "BULKMAIL_CONFIG", default_value = "./bulkmail.settings.ron")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fire rounds of concurrent worker invocations
    Run {
        /// Campaigns, recipients and contact status to seed
        #[arg(short, long)]
        fixture: PathBuf,

        /// Invocations fired per round
        #[arg(short, long, default_value_t = 1)]
        workers: usize,

        /// Number of rounds; 0 runs until every campaign is finished or paused
        #[arg(short, long, default_value_t = 1)]
        iterations: usize,

        /// Seconds between rounds
        #[arg(long, default_value_t = 0)]
        interval: u64,

        /// Send even though the environment is not production
        #[arg(long)]
        allow_non_production: bool,

        /// Simulated transport latency per message, in milliseconds
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,
    },
    /// Validate the settings file and report what an invocation would do
    Check {
        /// Send even though the environment is not production
        #[arg(long)]
        allow_non_production: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    bulkmail_common::logging::init();

    match cli.command {
        Commands::Run {
            fixture,
            workers,
            iterations,
            interval,
            allow_non_production,
            latency_ms,
        } => {
            let fixture = Fixture::load(&fixture)?;
            let settings = Runner::load_settings(&cli.config, allow_non_production)?;

            let mut mailer = LogMailer::new(fixture.bounces.iter().cloned());
            if latency_ms > 0 {
                mailer = mailer.with_latency(Duration::from_millis(latency_ms));
            }
            let runner = Runner::seeded(&fixture, &settings, mailer);

            let options = RunOptions {
                workers,
                iterations,
                interval: Duration::from_secs(interval),
            };
            let mut last_round = 0;
            let end = runner
                .run(&cli.config, allow_non_production, options, |round, report| {
                    if round != last_round {
                        println!("Round {round}");
                        last_round = round;
                    }
                    println!("  {}", describe(report));
                })
                .await?;

            if let RunEnd::Refused(round, reason) = end {
                println!();
                println!("Stopped after round {round}: {}", reason.status_message());
            }

            println!();
            for summary in runner.summaries() {
                let state = summary
                    .state
                    .map_or_else(|| "unknown".to_string(), |state| state.to_string());
                println!(
                    "{} ({state}): {} delivered, {} bounced, {} failed, {} skipped, {} contacts reached",
                    summary.name,
                    summary.report.delivered,
                    summary.report.bounced,
                    summary.report.failed,
                    summary.report.skipped,
                    summary.report.activity_targets.len(),
                );
            }
        }
        Commands::Check {
            allow_non_production,
        } => {
            let settings = Runner::load_settings(&cli.config, allow_non_production)?;
            println!("{settings:#?}");

            match bulkmail_dispatch::DispatchEngine::environment_gate(&settings) {
                Some(reason) => println!("Invocations decline: {}", reason.status_message()),
                None => println!("Invocations will send"),
            }
        }
    }

    Ok(())
}
