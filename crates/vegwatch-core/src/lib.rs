//! Core domain model for vegwatch: price observations, queued emails and alert criteria.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CITY: &str = "kerala";

/// Calendar-day format used on the wire, in the store and in upstream URLs.
pub const DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid date `{input}` (expected YYYY-MM-DD)")]
pub struct InvalidDate {
    pub input: String,
}

pub fn parse_day(input: &str) -> Result<NaiveDate, InvalidDate> {
    NaiveDate::parse_from_str(input.trim(), DAY_FORMAT).map_err(|_| InvalidDate {
        input: input.to_string(),
    })
}

pub fn format_day(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

/// Inclusive span of calendar days. A range whose start is after its end is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DayRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn single(day: NaiveDate) -> Self {
        Self::new(day, day)
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |day| *day <= end)
    }

    pub fn len(&self) -> usize {
        if self.start > self.end {
            0
        } else {
            (self.end - self.start).num_days() as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A `min-max` price pair as published upstream, kept as numeric text.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PriceRange {
    pub min: Option<String>,
    pub max: Option<String>,
}

impl PriceRange {
    /// Splits `"20-35"` into `min = "20"`, `max = "35"`. A missing field, a missing
    /// separator or an empty side yields an empty pair. Pieces past the second
    /// hyphen are ignored.
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::default();
        };
        let mut parts = raw.split('-').map(str::trim);
        let (Some(min), Some(max)) = (parts.next(), parts.next()) else {
            return Self::default();
        };
        if min.is_empty() || max.is_empty() {
            return Self::default();
        }
        Self {
            min: Some(min.to_string()),
            max: Some(max.to_string()),
        }
    }
}

/// One scraped row before it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceDraft {
    pub date: NaiveDate,
    pub city: String,
    pub vegetable: String,
    pub wholesale_price: Option<i64>,
    pub retail_min_price: Option<String>,
    pub retail_max_price: Option<String>,
    pub shopmall_min_price: Option<String>,
    pub shopmall_max_price: Option<String>,
    pub unit: Option<String>,
    pub image: Option<String>,
}

/// Persisted per-day/per-city/per-vegetable observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub id: i64,
    pub date: NaiveDate,
    pub city: String,
    pub vegetable: String,
    pub wholesale_price: Option<i64>,
    pub retail_min_price: Option<String>,
    pub retail_max_price: Option<String>,
    pub shopmall_min_price: Option<String>,
    pub shopmall_max_price: Option<String>,
    pub unit: Option<String>,
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Wholesale price usable for averaging and comparison: present and positive.
pub fn usable_price(price: Option<i64>) -> Option<i64> {
    price.filter(|p| *p > 0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailDraft {
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub cc: Option<String>,
    pub attachment_path: Option<String>,
}

impl EmailDraft {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, html_body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            html_body: html_body.into(),
            cc: None,
            attachment_path: None,
        }
    }
}

/// Durable outbound email awaiting an external dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailQueueEntry {
    pub id: i64,
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub cc: Option<String>,
    pub attachment_path: Option<String>,
    pub is_sent: bool,
    pub created_at: DateTime<Utc>,
    pub sent_on: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CriterionError {
    #[error("criterion `{name}`: invalid interval `{interval}` (expected \"<N> day\")")]
    Interval { name: String, interval: String },
    #[error("criterion `{name}`: unknown type_value `{type_value}`")]
    Kind { name: String, type_value: String },
    #[error("criterion `{name}`: threshold `{value}` is not a non-negative number")]
    Value { name: String, value: String },
}

/// Criterion record as written in the criteria file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionConfig {
    pub name: String,
    pub interval: String,
    pub type_value: String,
    pub value: ThresholdValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for ThresholdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdValue::Number(n) => write!(f, "{n}"),
            ThresholdValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type_value", content = "value", rename_all = "lowercase")]
pub enum Threshold {
    Percentage(f64),
    Absolute(f64),
}

impl Threshold {
    /// True when `today` rose above `average` by at least the threshold.
    /// Flat or falling prices never match.
    pub fn matches(&self, today: f64, average: f64) -> bool {
        let diff = today - average;
        if diff <= 0.0 || average <= 0.0 {
            return false;
        }
        match *self {
            Threshold::Percentage(min_pct) => diff / average * 100.0 >= min_pct,
            Threshold::Absolute(min_delta) => diff >= min_delta,
        }
    }
}

/// Validated alert rule: a threshold evaluated against a trailing average.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub name: String,
    pub interval: String,
    pub lookback_days: u32,
    pub threshold: Threshold,
}

impl Criterion {
    /// Human label for the averaging window, e.g. `"60 day Average Price"`.
    pub fn window_label(&self) -> String {
        format!("{} Average Price", self.interval)
    }
}

impl TryFrom<CriterionConfig> for Criterion {
    type Error = CriterionError;

    fn try_from(config: CriterionConfig) -> Result<Self, Self::Error> {
        let lookback_days = parse_interval_days(&config.interval).ok_or_else(|| CriterionError::Interval {
            name: config.name.clone(),
            interval: config.interval.clone(),
        })?;

        let value = match &config.value {
            ThresholdValue::Number(n) => Some(*n),
            ThresholdValue::Text(s) => s.trim().parse::<f64>().ok(),
        }
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or_else(|| CriterionError::Value {
            name: config.name.clone(),
            value: config.value.to_string(),
        })?;

        let threshold = match config.type_value.trim().to_ascii_lowercase().as_str() {
            "percentage" => Threshold::Percentage(value),
            "absolute" => Threshold::Absolute(value),
            _ => {
                return Err(CriterionError::Kind {
                    name: config.name,
                    type_value: config.type_value,
                })
            }
        };

        Ok(Self {
            name: config.name,
            interval: config.interval.trim().to_string(),
            lookback_days,
            threshold,
        })
    }
}

fn parse_interval_days(interval: &str) -> Option<u32> {
    let mut parts = interval.split_whitespace();
    let count: u32 = parts.next()?.parse().ok()?;
    let per_unit = match parts.next().map(|u| u.to_ascii_lowercase()) {
        None => 1,
        Some(unit) if matches!(unit.as_str(), "d" | "day" | "days") => 1,
        Some(unit) if matches!(unit.as_str(), "w" | "week" | "weeks") => 7,
        Some(_) => return None,
    };
    if parts.next().is_some() || count == 0 {
        return None;
    }
    count.checked_mul(per_unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        parse_day(s).unwrap()
    }

    fn config(interval: &str, type_value: &str, value: ThresholdValue) -> CriterionConfig {
        CriterionConfig {
            name: "test".into(),
            interval: interval.into(),
            type_value: type_value.into(),
            value,
        }
    }

    #[test]
    fn price_range_splits_and_trims() {
        let range = PriceRange::parse(Some("20 - 35"));
        assert_eq!(range.min.as_deref(), Some("20"));
        assert_eq!(range.max.as_deref(), Some("35"));
    }

    #[test]
    fn price_range_without_separator_is_empty() {
        assert_eq!(PriceRange::parse(Some("20")), PriceRange::default());
        assert_eq!(PriceRange::parse(None), PriceRange::default());
        assert_eq!(PriceRange::parse(Some("-35")), PriceRange::default());
        assert_eq!(PriceRange::parse(Some("20-")), PriceRange::default());
    }

    #[test]
    fn price_range_keeps_first_two_pieces() {
        let range = PriceRange::parse(Some("20-35-40"));
        assert_eq!(range.min.as_deref(), Some("20"));
        assert_eq!(range.max.as_deref(), Some("35"));
    }

    #[test]
    fn day_range_is_inclusive_and_ascending() {
        let range = DayRange::new(day("2024-12-30"), day("2025-01-02"));
        let days: Vec<_> = range.days().map(format_day).collect();
        assert_eq!(days, vec!["2024-12-30", "2024-12-31", "2025-01-01", "2025-01-02"]);
        assert_eq!(range.len(), 4);
        assert_eq!(DayRange::single(day("2025-01-01")).len(), 1);
        assert!(DayRange::new(day("2025-01-02"), day("2025-01-01")).is_empty());
        assert_eq!(DayRange::new(day("2025-01-02"), day("2025-01-01")).days().count(), 0);
    }

    #[test]
    fn parse_day_rejects_garbage() {
        assert!(parse_day("not-a-date").is_err());
        assert!(parse_day("2025-02-30").is_err());
        assert_eq!(format_day(day(" 2025-01-03 ")), "2025-01-03");
    }

    #[test]
    fn percentage_threshold_matches_increase_only() {
        let t = Threshold::Percentage(15.0);
        assert!(t.matches(120.0, 100.0));
        assert!(!Threshold::Percentage(25.0).matches(120.0, 100.0));
        assert!(!t.matches(50.0, 100.0));
        assert!(!t.matches(100.0, 100.0));
    }

    #[test]
    fn absolute_threshold_matches_increase_only() {
        let t = Threshold::Absolute(10.0);
        assert!(t.matches(110.0, 100.0));
        assert!(!t.matches(109.0, 100.0));
        assert!(!t.matches(10.0, 100.0));
    }

    #[test]
    fn criterion_from_config() {
        let c = Criterion::try_from(config("60 day", "percentage", ThresholdValue::Text("15".into()))).unwrap();
        assert_eq!(c.lookback_days, 60);
        assert_eq!(c.threshold, Threshold::Percentage(15.0));
        assert_eq!(c.window_label(), "60 day Average Price");

        let c = Criterion::try_from(config("2 weeks", "Absolute", ThresholdValue::Number(5.0))).unwrap();
        assert_eq!(c.lookback_days, 14);
        assert_eq!(c.threshold, Threshold::Absolute(5.0));
    }

    #[test]
    fn criterion_rejects_bad_config() {
        assert!(matches!(
            Criterion::try_from(config("sixty day", "percentage", ThresholdValue::Number(1.0))),
            Err(CriterionError::Interval { .. })
        ));
        assert!(matches!(
            Criterion::try_from(config("0 day", "percentage", ThresholdValue::Number(1.0))),
            Err(CriterionError::Interval { .. })
        ));
        assert!(matches!(
            Criterion::try_from(config("7 day", "ratio", ThresholdValue::Number(1.0))),
            Err(CriterionError::Kind { .. })
        ));
        assert!(matches!(
            Criterion::try_from(config("7 day", "absolute", ThresholdValue::Text("lots".into()))),
            Err(CriterionError::Value { .. })
        ));
    }

    #[test]
    fn criterion_serializes_with_tagged_threshold() {
        let c = Criterion::try_from(config("7 day", "absolute", ThresholdValue::Number(5.0))).unwrap();
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["threshold"]["type_value"], "absolute");
        assert_eq!(json["threshold"]["value"], 5.0);
        assert_eq!(json["lookback_days"], 7);
    }
}
