//! Scrape orchestration, alert and weekly report engines, exports and the
//! cron scheduler, tied together by [`Pipeline`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use vegwatch_adapters::{MarketSource, UpstreamConfig, VegetableMarketAdapter, DEFAULT_BASE_URL, DEFAULT_IMAGE_ORIGIN};
use vegwatch_core::{Criterion, DEFAULT_CITY};
use vegwatch_storage::{BackoffPolicy, Database, HttpClientConfig, HttpFetcher, ResponseArchive, StoreError};

pub mod alerts;
pub mod criteria;
pub mod export;
pub mod render;
pub mod scrape;
pub mod weekly;

pub use alerts::{AlertEngine, AlertMatch, AlertRun};
pub use criteria::{load_criteria, parse_criteria, select_criteria, CriteriaFormat};
pub use export::{export_prices, ExportSummary};
pub use scrape::{DayReport, DayStatus, ScrapeError, ScrapeRequest, ScrapeSummary, Scraper};
pub use weekly::{ReportRow, WeeklyReport, WeeklyReportEngine};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("price store failure: {0}")]
    Store(#[from] StoreError),
    #[error("rendering email: {0}")]
    Render(#[from] askama::Error),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub city: String,
    pub upstream_base_url: String,
    pub image_origin: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub artifacts_dir: Option<PathBuf>,
    pub criteria_path: PathBuf,
    pub alert_criterion: Option<String>,
    pub recipients: String,
    pub weekly_offset_days: u32,
    pub export_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub scrape_cron: String,
    pub report_cron: String,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://vegwatch.db".to_string(),
            city: DEFAULT_CITY.to_string(),
            upstream_base_url: DEFAULT_BASE_URL.to_string(),
            image_origin: DEFAULT_IMAGE_ORIGIN.to_string(),
            user_agent: "Mozilla/5.0 (compatible; vegwatch/0.1)".to_string(),
            http_timeout_secs: 20,
            http_max_retries: 0,
            artifacts_dir: None,
            criteria_path: PathBuf::from("filter_criteria.json"),
            alert_criterion: None,
            recipients: "market-alerts@example.com".to_string(),
            weekly_offset_days: weekly::DEFAULT_OFFSET_DAYS,
            export_dir: PathBuf::from("./exports"),
            scheduler_enabled: false,
            scrape_cron: "0 6 * * *".to_string(),
            report_cron: "0 8 * * Mon".to_string(),
            web_port: 8000,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_or("DATABASE_URL", defaults.database_url),
            city: env_or("VEGWATCH_CITY", defaults.city),
            upstream_base_url: env_or("VEGWATCH_UPSTREAM_BASE_URL", defaults.upstream_base_url),
            image_origin: env_or("VEGWATCH_IMAGE_ORIGIN", defaults.image_origin),
            user_agent: env_or("VEGWATCH_USER_AGENT", defaults.user_agent),
            http_timeout_secs: env_parse("VEGWATCH_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            http_max_retries: env_parse("VEGWATCH_HTTP_MAX_RETRIES").unwrap_or(defaults.http_max_retries),
            artifacts_dir: env_opt("VEGWATCH_ARTIFACTS_DIR").map(PathBuf::from),
            criteria_path: env_opt("VEGWATCH_CRITERIA_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.criteria_path),
            alert_criterion: env_opt("VEGWATCH_ALERT_CRITERION"),
            recipients: env_or("VEGWATCH_RECIPIENTS", defaults.recipients),
            weekly_offset_days: env_parse("VEGWATCH_WEEKLY_OFFSET_DAYS").unwrap_or(defaults.weekly_offset_days),
            export_dir: env_opt("VEGWATCH_EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.export_dir),
            scheduler_enabled: std::env::var("VEGWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            scrape_cron: env_or("VEGWATCH_SCRAPE_CRON", defaults.scrape_cron),
            report_cron: env_or("VEGWATCH_REPORT_CRON", defaults.report_cron),
            web_port: env_parse("VEGWATCH_WEB_PORT").unwrap_or(defaults.web_port),
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or(key: &str, default: String) -> String {
    env_opt(key).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|v| v.trim().parse().ok())
}

/// Everything the triggers need: the store, the upstream source and the
/// active criteria.
pub struct Pipeline {
    config: SyncConfig,
    db: Database,
    source: Arc<dyn MarketSource>,
    criteria: Vec<Criterion>,
}

impl Pipeline {
    pub fn new(config: SyncConfig, db: Database, source: Arc<dyn MarketSource>, criteria: Vec<Criterion>) -> Self {
        Self {
            config,
            db,
            source,
            criteria,
        }
    }

    /// Opens the database, builds the upstream adapter and loads criteria.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let db = Database::open(&config.database_url)
            .await
            .with_context(|| format!("opening database {}", config.database_url))?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: config.http_max_retries,
                ..Default::default()
            },
        })?;
        let adapter = VegetableMarketAdapter::new(
            http,
            UpstreamConfig {
                base_url: config.upstream_base_url.clone(),
                image_origin: config.image_origin.clone(),
                archive: config.artifacts_dir.clone().map(ResponseArchive::new),
            },
        )?;
        let criteria = select_criteria(
            load_criteria(&config.criteria_path)?,
            config.alert_criterion.as_deref(),
        )?;
        info!(
            database = %config.database_url,
            city = %config.city,
            criteria = criteria.len(),
            "pipeline ready"
        );
        Ok(Self::new(config, db, Arc::new(adapter), criteria))
    }

    pub async fn from_env() -> Result<Self> {
        Self::from_config(SyncConfig::from_env()).await
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn criteria(&self) -> &[Criterion] {
        &self.criteria
    }

    pub fn scraper(&self) -> Scraper {
        Scraper::new(self.source.clone(), self.db.prices())
    }

    /// Alerts and reports read only rows for the configured city.
    pub fn alert_engine(&self) -> AlertEngine {
        AlertEngine::new(self.db.prices(), self.db.email_queue(), &self.config.recipients)
            .with_city(Some(self.config.city.clone()))
    }

    pub fn weekly_engine(&self) -> WeeklyReportEngine {
        WeeklyReportEngine::new(self.db.prices(), self.db.email_queue(), &self.config.recipients)
            .with_offset_days(self.config.weekly_offset_days)
            .with_city(Some(self.config.city.clone()))
    }

    pub async fn scrape(&self, request: &ScrapeRequest) -> Result<ScrapeSummary, ScrapeError> {
        self.scrape_as_of(request, Local::now().date_naive()).await
    }

    /// Like [`Pipeline::scrape`] with an explicit "today" for requests that
    /// carry no dates.
    pub async fn scrape_as_of(&self, request: &ScrapeRequest, today: NaiveDate) -> Result<ScrapeSummary, ScrapeError> {
        self.scraper().scrape(request, today, &self.config.city).await
    }

    pub async fn run_alerts(&self) -> Result<AlertRun, JobError> {
        self.alert_engine().run_all(&self.criteria).await
    }

    pub async fn run_weekly_report(&self) -> Result<WeeklyReport, JobError> {
        self.weekly_engine().run().await
    }

    pub async fn export(&self) -> Result<ExportSummary> {
        export_prices(&self.db.prices(), &self.config.export_dir).await
    }

    /// Scrapes today for the configured city, then evaluates alerts.
    pub async fn run_daily(&self) -> Result<()> {
        let summary = self.scrape(&ScrapeRequest::default()).await?;
        let alerts = self.run_alerts().await?;
        info!(
            total_records = summary.total_records,
            alerts = alerts.ids.len(),
            "daily run finished"
        );
        Ok(())
    }

    /// Registers the daily and weekly cron jobs when the scheduler is enabled.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let pipeline = Arc::clone(&self);
        let daily = Job::new_async(self.config.scrape_cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                if let Err(err) = pipeline.run_daily().await {
                    error!(error = %format!("{err:#}"), "scheduled daily run failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {}", self.config.scrape_cron))?;
        sched.add(daily).await.context("adding daily scheduler job")?;

        let pipeline = Arc::clone(&self);
        let weekly = Job::new_async(self.config.report_cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_weekly_report().await {
                    Ok(report) => info!(ids = ?report.ids, "scheduled weekly report finished"),
                    Err(err) => error!(error = %err, "scheduled weekly report failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {}", self.config.report_cron))?;
        sched.add(weekly).await.context("adding weekly scheduler job")?;

        Ok(Some(sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_configuration() {
        let config = SyncConfig::default();
        assert_eq!(config.city, "kerala");
        assert_eq!(config.http_max_retries, 0);
        assert_eq!(config.weekly_offset_days, 12);
        assert_eq!(config.criteria_path, PathBuf::from("filter_criteria.json"));
        assert!(!config.scheduler_enabled);
    }
}
