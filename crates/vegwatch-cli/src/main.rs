use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use vegwatch_core::format_day;
use vegwatch_sync::{DayStatus, Pipeline, ScrapeRequest};

#[derive(Debug, Parser)]
#[command(name = "vegwatch")]
#[command(about = "Vegetable market price scraper and alerting")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape one day or an inclusive range of days (default: today)
    Scrape {
        #[arg(long)]
        city: Option<String>,
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        start_date: Option<String>,
        #[arg(long)]
        end_date: Option<String>,
    },
    /// Queue price alert emails for the latest stored day
    Alerts,
    /// Queue the weekly price digest
    WeeklyReport,
    /// Print the stored prices as JSON
    Prices,
    /// List queued emails
    Emails {
        #[arg(long)]
        pending: bool,
    },
    /// Print a queued email's HTML body
    ViewEmail { id: i64 },
    /// Mark a queued email as sent
    MarkSent { id: i64 },
    /// Write a JSON + parquet snapshot of the price table
    Export,
    Migrate,
    Serve,
    /// Run the cron scheduler until interrupted
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Scrape {
        city: None,
        date: None,
        start_date: None,
        end_date: None,
    });

    let pipeline = Pipeline::from_env().await?;

    match command {
        Commands::Scrape {
            city,
            date,
            start_date,
            end_date,
        } => {
            let summary = pipeline
                .scrape(&ScrapeRequest {
                    city,
                    start_date,
                    end_date,
                    date,
                })
                .await?;
            for day in &summary.days {
                let outcome = match &day.status {
                    DayStatus::Inserted(n) => format!("{n} records"),
                    DayStatus::NoData => "no data".to_string(),
                    DayStatus::UpstreamFailed(err) => format!("upstream failed: {err}"),
                    DayStatus::StoreFailed(err) => format!("store failed: {err}"),
                };
                println!("{}  {}", format_day(day.date), outcome);
            }
            println!(
                "scrape complete: run_id={} city={} from={} to={} total_records={} failed_days={}",
                summary.run_id,
                summary.city,
                format_day(summary.from),
                format_day(summary.to),
                summary.total_records,
                summary.failed_days
            );
        }
        Commands::Alerts => {
            let run = pipeline.run_alerts().await?;
            if run.is_empty() {
                println!("no matches");
            }
            if run.failed > 0 {
                println!("{} alert(s) could not be queued; see logs", run.failed);
            }
            for m in &run.matches {
                println!(
                    "queued #{} {} +{}% vs {} ({})",
                    m.email_id, m.vegetable, m.change_percent, m.average, m.criterion
                );
            }
        }
        Commands::WeeklyReport => {
            let report = pipeline.run_weekly_report().await?;
            match report.ids.first() {
                Some(id) => println!("queued weekly report #{id} with {} vegetables", report.rows.len()),
                None => println!("nothing to report"),
            }
        }
        Commands::Prices => {
            let rows = pipeline.db().prices().list_all().await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::Emails { pending } => {
            for entry in pipeline.db().email_queue().list(pending).await? {
                println!(
                    "#{} sent={} to={} subject={}",
                    entry.id, entry.is_sent, entry.to, entry.subject
                );
            }
        }
        Commands::ViewEmail { id } => match pipeline.db().email_queue().html_body(id).await? {
            Some(html) => println!("{html}"),
            None => bail!("email #{id} not found"),
        },
        Commands::MarkSent { id } => {
            if !pipeline.db().email_queue().mark_sent(id).await? {
                bail!("email #{id} is unknown or already sent");
            }
            println!("email #{id} marked sent");
        }
        Commands::Export => {
            let summary = pipeline.export().await?;
            println!(
                "exported {} rows to {} (manifest {})",
                summary.rows,
                summary.dir.display(),
                summary.manifest_path.display()
            );
        }
        Commands::Migrate => {
            // Database::open already applied pending migrations.
            println!("migrations applied to {}", pipeline.config().database_url);
        }
        Commands::Serve => {
            vegwatch_web::serve(Arc::new(pipeline)).await?;
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline);
            let Some(sched) = pipeline.clone().maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set VEGWATCH_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                scrape_cron = %pipeline.config().scrape_cron,
                report_cron = %pipeline.config().report_cron,
                "scheduler running"
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
        }
    }

    Ok(())
}
