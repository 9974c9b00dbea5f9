//! Date-range scraping into the price store.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use vegwatch_adapters::{FetchContext, MarketSource};
use vegwatch_core::{parse_day, DayRange, InvalidDate, PriceDraft};
use vegwatch_storage::PriceStore;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    InvalidInput(#[from] InvalidDate),
}

/// Caller-facing scrape trigger. Blank values count as absent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeRequest {
    pub city: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub date: Option<String>,
}

impl ScrapeRequest {
    pub fn single(city: impl Into<String>, date: impl Into<String>) -> Self {
        Self {
            city: Some(city.into()),
            date: Some(date.into()),
            ..Default::default()
        }
    }

    pub fn range(city: impl Into<String>, start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            city: Some(city.into()),
            start_date: Some(start.into()),
            end_date: Some(end.into()),
            date: None,
        }
    }

    /// Resolves the inclusive day range. `startDate` falls back to `date` then
    /// `endDate` (and symmetrically for the end); with nothing given the range
    /// is the single day `today`.
    pub fn resolve(&self, today: NaiveDate) -> Result<DayRange, InvalidDate> {
        let start = present(&self.start_date)
            .or(present(&self.date))
            .or(present(&self.end_date));
        let end = present(&self.end_date)
            .or(present(&self.date))
            .or(present(&self.start_date));

        let start = start.map(parse_day).transpose()?.unwrap_or(today);
        let end = end.map(parse_day).transpose()?.unwrap_or(today);
        Ok(DayRange::new(start, end))
    }

    pub fn city_or<'a>(&'a self, default_city: &'a str) -> &'a str {
        present(&self.city).unwrap_or(default_city)
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum DayStatus {
    Inserted(u64),
    /// Upstream had nothing for the day; any stored rows were cleared.
    NoData,
    /// Fetch failed; stored rows for the day were left as they were.
    UpstreamFailed(String),
    /// Replacing the day's rows failed; the transaction rolled back.
    StoreFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayReport {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub status: DayStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeSummary {
    pub run_id: Uuid,
    pub city: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub total_records: u64,
    /// Days whose fetch or store step failed.
    pub failed_days: usize,
    pub records: Vec<PriceDraft>,
    pub days: Vec<DayReport>,
}

impl DayStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, DayStatus::UpstreamFailed(_) | DayStatus::StoreFailed(_))
    }
}

pub struct Scraper {
    source: Arc<dyn MarketSource>,
    prices: PriceStore,
}

impl Scraper {
    pub fn new(source: Arc<dyn MarketSource>, prices: PriceStore) -> Self {
        Self { source, prices }
    }

    /// Validates the request before touching the store, then scrapes the range.
    pub async fn scrape(
        &self,
        request: &ScrapeRequest,
        today: NaiveDate,
        default_city: &str,
    ) -> Result<ScrapeSummary, ScrapeError> {
        let range = request.resolve(today)?;
        self.scrape_range(request.city_or(default_city), range).await
    }

    /// Scrapes every day of `range` in ascending order. Upstream and store
    /// failures are recorded against their day and the run moves on.
    pub async fn scrape_range(&self, city: &str, range: DayRange) -> Result<ScrapeSummary, ScrapeError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("scrape", %run_id, source = self.source.source_id(), city);
        async move {
            if range.is_empty() {
                warn!(from = %range.start, to = %range.end, "start date is after end date; nothing to scrape");
            }

            let ctx = FetchContext { run_id };
            let mut records = Vec::new();
            let mut days = Vec::with_capacity(range.len());
            let mut total_records = 0u64;

            for day in range.days() {
                let status = match self.source.fetch_day(&ctx, city, day).await {
                    Ok(fetched) => {
                        let drafts = fetched.into_records();
                        match self.prices.replace_day(day, city, &drafts).await {
                            Ok(inserted) => {
                                total_records += inserted;
                                records.extend(drafts);
                                info!(%day, inserted, "day scraped");
                                if inserted == 0 {
                                    DayStatus::NoData
                                } else {
                                    DayStatus::Inserted(inserted)
                                }
                            }
                            Err(err) => {
                                error!(%day, error = %err, "replacing day failed; day skipped");
                                DayStatus::StoreFailed(err.to_string())
                            }
                        }
                    }
                    Err(err) => {
                        warn!(%day, error = %err, "upstream fetch failed; keeping stored rows");
                        DayStatus::UpstreamFailed(err.to_string())
                    }
                };
                days.push(DayReport { date: day, status });
            }

            let summary = ScrapeSummary {
                run_id,
                city: city.to_string(),
                from: range.start,
                to: range.end,
                total_records,
                failed_days: days.iter().filter(|d| d.status.is_failure()).count(),
                records,
                days,
            };
            info!(
                total_records = summary.total_records,
                days = summary.days.len(),
                failed_days = summary.failed_days,
                "scrape finished"
            );
            Ok::<_, ScrapeError>(summary)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        parse_day(s).unwrap()
    }

    #[test]
    fn request_defaults_to_today() {
        let range = ScrapeRequest::default().resolve(day("2025-03-10")).unwrap();
        assert_eq!(range, DayRange::single(day("2025-03-10")));
    }

    #[test]
    fn single_date_fills_both_ends() {
        let today = day("2025-03-10");
        let only_start = ScrapeRequest {
            start_date: Some("2025-01-01".into()),
            ..Default::default()
        };
        let only_date = ScrapeRequest::single("kerala", "2025-01-01");
        assert_eq!(only_start.resolve(today).unwrap(), DayRange::single(day("2025-01-01")));
        assert_eq!(only_date.resolve(today).unwrap(), DayRange::single(day("2025-01-01")));
    }

    #[test]
    fn blank_values_are_ignored() {
        let request = ScrapeRequest {
            city: Some("  ".into()),
            start_date: Some("".into()),
            end_date: Some("2025-01-02".into()),
            date: None,
        };
        assert_eq!(request.city_or("kerala"), "kerala");
        assert_eq!(
            request.resolve(day("2025-03-10")).unwrap(),
            DayRange::single(day("2025-01-02"))
        );
    }

    #[test]
    fn malformed_date_is_rejected() {
        let request = ScrapeRequest::range("kerala", "2025-01-01", "not-a-date");
        let err = request.resolve(day("2025-03-10")).unwrap_err();
        assert_eq!(err.input, "not-a-date");
    }

    #[test]
    fn day_status_serializes_with_tag() {
        let report = DayReport {
            date: day("2025-01-01"),
            status: DayStatus::Inserted(4),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["date"], "2025-01-01");
        assert_eq!(json["status"], "inserted");
        assert_eq!(json["detail"], 4);
    }

    #[test]
    fn store_failures_count_as_failed_days() {
        assert!(DayStatus::StoreFailed("locked".into()).is_failure());
        assert!(DayStatus::UpstreamFailed("503".into()).is_failure());
        assert!(!DayStatus::NoData.is_failure());
        let json = serde_json::to_value(DayStatus::StoreFailed("locked".into())).unwrap();
        assert_eq!(json["status"], "store_failed");
    }
}
