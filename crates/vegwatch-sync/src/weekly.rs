//! Weekly digest comparing the latest day against a fixed earlier day.

use std::collections::{HashMap, HashSet};

use chrono::{Days, NaiveDate};
use serde::Serialize;
use tracing::info;
use vegwatch_core::{usable_price, EmailDraft};
use vegwatch_storage::{DayPrice, EmailQueueStore, PriceStore};

use crate::render::render_weekly_report;
use crate::JobError;

pub const DEFAULT_OFFSET_DAYS: u32 = 12;
pub const WEEKLY_SUBJECT: &str = "Vegetable Prices Update";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRow {
    pub name: String,
    pub price: i64,
    pub prev_price: i64,
    pub avg_price: f64,
    pub image: Option<String>,
}

impl ReportRow {
    /// `|price - prev| / prev`, the ranking key.
    pub fn relative_change(&self) -> f64 {
        ((self.price - self.prev_price) as f64 / self.prev_price as f64).abs()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyReport {
    pub today: Option<NaiveDate>,
    pub comparison_date: Option<NaiveDate>,
    pub rows: Vec<ReportRow>,
    pub ids: Vec<i64>,
}

impl WeeklyReport {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Rows for every vegetable priced on both days at different prices, largest
/// relative change first. Only the first row per vegetable on either day counts.
pub fn build_rows(today: &[DayPrice], previous: &[DayPrice], averages: &HashMap<String, f64>) -> Vec<ReportRow> {
    let mut prev_by_name: HashMap<&str, Option<i64>> = HashMap::with_capacity(previous.len());
    for row in previous {
        prev_by_name.entry(row.vegetable.as_str()).or_insert(row.wholesale_price);
    }

    let mut seen = HashSet::new();
    let mut rows = today
        .iter()
        .filter(|row| seen.insert(row.vegetable.as_str()))
        .filter_map(|row| {
            let price = row.wholesale_price?;
            let prev_price = usable_price(prev_by_name.get(row.vegetable.as_str()).copied().flatten())?;
            (price != prev_price).then(|| ReportRow {
                name: row.vegetable.clone(),
                price,
                prev_price,
                avg_price: averages.get(&row.vegetable).copied().unwrap_or(price as f64),
                image: row.image.clone(),
            })
        })
        .collect::<Vec<_>>();

    rows.sort_by(|a, b| b.relative_change().total_cmp(&a.relative_change()));
    rows
}

pub struct WeeklyReportEngine {
    prices: PriceStore,
    queue: EmailQueueStore,
    recipients: String,
    offset_days: u32,
    city: Option<String>,
}

impl WeeklyReportEngine {
    pub fn new(prices: PriceStore, queue: EmailQueueStore, recipients: impl Into<String>) -> Self {
        Self {
            prices,
            queue,
            recipients: recipients.into(),
            offset_days: DEFAULT_OFFSET_DAYS,
            city: None,
        }
    }

    pub fn with_offset_days(mut self, offset_days: u32) -> Self {
        self.offset_days = offset_days;
        self
    }

    pub fn with_city(mut self, city: Option<String>) -> Self {
        self.city = city;
        self
    }

    /// Enqueues at most one digest. An empty store or no changed vegetable
    /// yields a report with no ids.
    pub async fn run(&self) -> Result<WeeklyReport, JobError> {
        let city = self.city.as_deref();
        let Some(today) = self.prices.latest_date(city).await? else {
            info!("no price data; skipping weekly report");
            return Ok(WeeklyReport::default());
        };
        let comparison_date = today
            .checked_sub_days(Days::new(u64::from(self.offset_days)))
            .unwrap_or(NaiveDate::MIN);
        let average_end = today.checked_add_days(Days::new(1)).unwrap_or(NaiveDate::MAX);

        let current = self.prices.prices_on(today, city).await?;
        let previous = self.prices.prices_on(comparison_date, city).await?;
        let averages = self.prices.average_wholesale(comparison_date, average_end, city).await?;

        let rows = build_rows(&current, &previous, &averages);
        let mut report = WeeklyReport {
            today: Some(today),
            comparison_date: Some(comparison_date),
            rows,
            ids: Vec::new(),
        };
        if report.rows.is_empty() {
            info!(%today, %comparison_date, "nothing to report");
            return Ok(report);
        }

        let html = render_weekly_report(comparison_date, today, &report.rows)?;
        let id = self
            .queue
            .enqueue(&EmailDraft::new(&self.recipients, WEEKLY_SUBJECT, html))
            .await?;
        info!(%today, %comparison_date, rows = report.rows.len(), email_id = id, "weekly report queued");
        report.ids.push(id);
        Ok(report)
    }
}
