//! HTML bodies for queued emails.

use askama::Template;
use chrono::{NaiveDate, Utc};

use crate::weekly::ReportRow;

const PLACEHOLDER_IMAGE: &str = "https://via.placeholder.com/40";

#[derive(Template)]
#[template(path = "alert_email.html")]
struct AlertEmailTemplate<'a> {
    vegetable: &'a str,
    label: &'a str,
    increase: bool,
    percent: String,
    current_price: String,
    reference_price: String,
    theme_color: &'static str,
    badge_color: &'static str,
    generated_at: String,
}

struct WeeklyRowView<'a> {
    name: &'a str,
    image: &'a str,
    prev_price: String,
    price: String,
    percent: String,
    increase: bool,
}

#[derive(Template)]
#[template(path = "weekly_report.html")]
struct WeeklyReportTemplate<'a> {
    period_start: String,
    period_end: String,
    start_column: String,
    end_column: String,
    rows: Vec<WeeklyRowView<'a>>,
}

/// Relative change of `current` against `reference` in percent, one decimal,
/// without sign. A zero reference renders as `0.0`.
pub fn change_percent(current: f64, reference: f64) -> String {
    if reference == 0.0 {
        return "0.0".to_string();
    }
    format!("{:.1}", ((current - reference) / reference * 100.0).abs())
}

/// Price as shown in alerts: at most two decimals, trailing zeros dropped.
pub fn display_amount(value: f64) -> String {
    let rounded = (value * 100.0).round() / 100.0;
    format!("{rounded}")
}

pub fn render_price_alert(
    vegetable: &str,
    current_price: f64,
    reference_price: f64,
    increase: bool,
    label: &str,
) -> askama::Result<String> {
    let (theme_color, badge_color) = if increase {
        ("#EF4444", "#FEF2F2")
    } else {
        ("#10B981", "#ECFDF5")
    };
    AlertEmailTemplate {
        vegetable,
        label,
        increase,
        percent: change_percent(current_price, reference_price),
        current_price: display_amount(current_price),
        reference_price: display_amount(reference_price),
        theme_color,
        badge_color,
        generated_at: Utc::now().format("%H:%M UTC").to_string(),
    }
    .render()
}

/// Digest of every changed vegetable between `start` and `end`. Each row's
/// badge compares the current price with the period average.
pub fn render_weekly_report(start: NaiveDate, end: NaiveDate, rows: &[ReportRow]) -> askama::Result<String> {
    let rows = rows
        .iter()
        .map(|row| {
            let current = row.price as f64;
            WeeklyRowView {
                name: &row.name,
                image: row.image.as_deref().unwrap_or(PLACEHOLDER_IMAGE),
                prev_price: format!("{:.2}", row.prev_price as f64),
                price: format!("{:.2}", current),
                percent: change_percent(current, row.avg_price),
                increase: current > row.avg_price,
            }
        })
        .collect();

    WeeklyReportTemplate {
        period_start: start.format("%b %d").to_string(),
        period_end: end.format("%b %d, %Y").to_string(),
        start_column: start.format("%b %d").to_string(),
        end_column: end.format("%b %d").to_string(),
        rows,
    }
    .render()
}
