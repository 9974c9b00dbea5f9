//! Threshold alerts against a trailing average of wholesale prices.

use std::collections::HashSet;

use chrono::{Days, NaiveDate};
use serde::Serialize;
use tracing::{debug, error, info, info_span, Instrument};
use vegwatch_core::{usable_price, Criterion, EmailDraft};
use vegwatch_storage::{EmailQueueStore, PriceStore};

use crate::render::{change_percent, render_price_alert};
use crate::JobError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertMatch {
    pub email_id: i64,
    pub criterion: String,
    pub vegetable: String,
    pub price: i64,
    pub average: f64,
    pub change_percent: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRun {
    pub today: Option<NaiveDate>,
    pub ids: Vec<i64>,
    pub matches: Vec<AlertMatch>,
    /// Matches whose email could not be queued.
    pub failed: usize,
}

impl AlertRun {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn absorb(&mut self, other: AlertRun) {
        self.today = self.today.or(other.today);
        self.ids.extend(other.ids);
        self.matches.extend(other.matches);
        self.failed += other.failed;
    }
}

/// Average rounded to cents; comparisons run against the rounded value.
fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub struct AlertEngine {
    prices: PriceStore,
    queue: EmailQueueStore,
    recipients: String,
    city: Option<String>,
}

impl AlertEngine {
    pub fn new(prices: PriceStore, queue: EmailQueueStore, recipients: impl Into<String>) -> Self {
        Self {
            prices,
            queue,
            recipients: recipients.into(),
            city: None,
        }
    }

    pub fn with_city(mut self, city: Option<String>) -> Self {
        self.city = city;
        self
    }

    /// Evaluates every criterion in order; ids are returned in enqueue order.
    pub async fn run_all(&self, criteria: &[Criterion]) -> Result<AlertRun, JobError> {
        let mut all = AlertRun::default();
        for criterion in criteria {
            all.absorb(self.run(criterion).await?);
        }
        Ok(all)
    }

    /// Queues one alert per vegetable whose price on the latest stored day rose
    /// past `criterion` relative to the average of the preceding window.
    pub async fn run(&self, criterion: &Criterion) -> Result<AlertRun, JobError> {
        let span = info_span!("alerts", criterion = %criterion.name);
        async move {
            let city = self.city.as_deref();
            let Some(today) = self.prices.latest_date(city).await? else {
                info!("no price data; skipping alerts");
                return Ok(AlertRun::default());
            };
            let window_start = today
                .checked_sub_days(Days::new(u64::from(criterion.lookback_days)))
                .unwrap_or(NaiveDate::MIN);

            let current = self.prices.prices_on(today, city).await?;
            let averages = self.prices.average_wholesale(window_start, today, city).await?;
            let label = criterion.window_label();

            let mut run = AlertRun {
                today: Some(today),
                ..Default::default()
            };
            let mut seen = HashSet::new();
            for row in &current {
                if !seen.insert(row.vegetable.as_str()) {
                    continue;
                }
                let (Some(price), Some(average)) = (usable_price(row.wholesale_price), averages.get(&row.vegetable))
                else {
                    continue;
                };
                let average = round_cents(*average);
                if !criterion.threshold.matches(price as f64, average) {
                    debug!(vegetable = %row.vegetable, price, average, "below threshold");
                    continue;
                }

                let html = render_price_alert(&row.vegetable, price as f64, average, true, &label)?;
                let subject = format!("🚨 Price Alert: {} Increased ({})", row.vegetable, criterion.name);
                let email_id = match self
                    .queue
                    .enqueue(&EmailDraft::new(&self.recipients, subject, html))
                    .await
                {
                    Ok(id) => id,
                    Err(err) => {
                        error!(vegetable = %row.vegetable, error = %err, "queueing alert failed");
                        run.failed += 1;
                        continue;
                    }
                };

                let change = change_percent(price as f64, average);
                info!(vegetable = %row.vegetable, price, average, change = %change, email_id, "price alert queued");
                run.ids.push(email_id);
                run.matches.push(AlertMatch {
                    email_id,
                    criterion: criterion.name.clone(),
                    vegetable: row.vegetable.clone(),
                    price,
                    average,
                    change_percent: change,
                });
            }

            info!(%today, %window_start, matches = run.ids.len(), failed = run.failed, "alerts evaluated");
            Ok::<_, JobError>(run)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_round_to_cents() {
        assert_eq!(round_cents(98.33333), 98.33);
        assert_eq!(round_cents(100.0), 100.0);
        assert_eq!(round_cents(12.346), 12.35);
    }
}
