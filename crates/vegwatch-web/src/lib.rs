//! Axum JSON/HTML surface over the vegwatch pipeline.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use vegwatch_core::{Criterion, EmailQueueEntry, PriceObservation};
use vegwatch_sync::{AlertMatch, Pipeline, ScrapeError, ScrapeRequest, ScrapeSummary};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScrapeResponse {
    message: &'static str,
    #[serde(flatten)]
    summary: ScrapeSummary,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PricesResponse {
    data: Vec<PriceObservation>,
    total_records: usize,
}

#[derive(Debug, Serialize)]
struct JobResponse {
    success: bool,
    data: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    matches: Option<Vec<AlertMatch>>,
}

/// Queue entry without its rendered body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmailSummary {
    id: i64,
    to: String,
    subject: String,
    cc: Option<String>,
    is_sent: bool,
    created_at: DateTime<Utc>,
    sent_on: Option<DateTime<Utc>>,
}

impl From<EmailQueueEntry> for EmailSummary {
    fn from(entry: EmailQueueEntry) -> Self {
        Self {
            id: entry.id,
            to: entry.to,
            subject: entry.subject,
            cc: entry.cc,
            is_sent: entry.is_sent,
            created_at: entry.created_at,
            sent_on: entry.sent_on,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct EmailsQuery {
    #[serde(default)]
    pending: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "App running" }))
        .route("/health", get(|| async { "OK" }))
        .route("/scrape", get(scrape_handler))
        .route("/prices", get(prices_handler))
        .route("/emails", get(emails_handler))
        .route("/view-email/{id}", get(view_email_handler))
        .route("/send-mail-queue", post(send_mail_queue_handler))
        .route("/send-weekly-report", post(send_weekly_report_handler))
        .route("/criteria", get(criteria_handler))
        .with_state(Arc::new(state))
}

/// Serves on `VEGWATCH_WEB_PORT` (default 8000).
pub async fn serve(pipeline: Arc<Pipeline>) -> anyhow::Result<()> {
    let port = pipeline.config().web_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web server listening");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let pipeline = Arc::new(Pipeline::from_env().await?);
    serve(pipeline).await
}

async fn scrape_handler(State(state): State<Arc<AppState>>, Query(request): Query<ScrapeRequest>) -> Response {
    match state.pipeline.scrape(&request).await {
        Ok(summary) => Json(ScrapeResponse {
            message: "Scraping completed",
            summary,
        })
        .into_response(),
        Err(ScrapeError::InvalidInput(err)) => {
            (StatusCode::BAD_REQUEST, format!("Invalid date format (YYYY-MM-DD): {}", err.input)).into_response()
        }
    }
}

async fn prices_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.db().prices().list_all().await {
        Ok(data) => Json(PricesResponse {
            total_records: data.len(),
            data,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn emails_handler(State(state): State<Arc<AppState>>, Query(query): Query<EmailsQuery>) -> Response {
    match state.pipeline.db().email_queue().list(query.pending).await {
        Ok(entries) => Json(entries.into_iter().map(EmailSummary::from).collect::<Vec<_>>()).into_response(),
        Err(err) => server_error(err),
    }
}

async fn view_email_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<i64>) -> Response {
    match state.pipeline.db().email_queue().html_body(id).await {
        Ok(Some(html)) => Html(html).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Not found").into_response(),
        Err(err) => server_error(err),
    }
}

async fn send_mail_queue_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run_alerts().await {
        Ok(run) => Json(JobResponse {
            success: !run.ids.is_empty(),
            data: run.ids,
            matches: Some(run.matches),
        })
        .into_response(),
        Err(err) => job_error(err),
    }
}

async fn send_weekly_report_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run_weekly_report().await {
        Ok(report) => Json(JobResponse {
            success: !report.ids.is_empty(),
            data: report.ids,
            matches: None,
        })
        .into_response(),
        Err(err) => job_error(err),
    }
}

async fn criteria_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Criterion>> {
    Json(state.pipeline.criteria().to_vec())
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}

fn job_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "job failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "message": err.to_string() })),
    )
        .into_response()
}
