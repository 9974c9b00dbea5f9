//! Market source contract and the vegetablemarketprice.com day-wise adapter.

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Url;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;
use vegwatch_core::{format_day, PriceDraft, PriceRange};
use vegwatch_storage::{FetchError, HttpFetcher, ResponseArchive};

pub const DEFAULT_BASE_URL: &str = "https://vegetablemarketprice.com/api/dataapi";
pub const DEFAULT_IMAGE_ORIGIN: &str = "https://vegetablemarketprice.com/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
}

/// What one `(city, day)` request produced.
#[derive(Debug, Clone, PartialEq)]
pub enum DayFetch {
    Records(Vec<PriceDraft>),
    /// Upstream answered but had no usable rows for the day.
    NoData,
}

impl DayFetch {
    pub fn into_records(self) -> Vec<PriceDraft> {
        match self {
            DayFetch::Records(records) => records,
            DayFetch::NoData => Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("upstream unavailable: {0}")]
    Upstream(#[from] FetchError),
    #[error("malformed upstream payload: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait MarketSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_day(&self, ctx: &FetchContext, city: &str, day: NaiveDate) -> Result<DayFetch, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub image_origin: String,
    pub archive: Option<ResponseArchive>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            image_origin: DEFAULT_IMAGE_ORIGIN.to_string(),
            archive: None,
        }
    }
}

#[derive(Debug)]
pub struct VegetableMarketAdapter {
    http: HttpFetcher,
    base_url: String,
    image_origin: Url,
    archive: Option<ResponseArchive>,
}

impl VegetableMarketAdapter {
    pub fn new(http: HttpFetcher, config: UpstreamConfig) -> anyhow::Result<Self> {
        let image_origin = Url::parse(&config.image_origin)
            .with_context(|| format!("parsing image origin {}", config.image_origin))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            image_origin,
            archive: config.archive,
        })
    }

    pub fn day_url(&self, city: &str, day: NaiveDate) -> String {
        format!(
            "{}/market/{}/daywisedata?date={}",
            self.base_url,
            city.trim(),
            format_day(day)
        )
    }
}

#[async_trait]
impl MarketSource for VegetableMarketAdapter {
    fn source_id(&self) -> &'static str {
        "vegetablemarketprice"
    }

    async fn fetch_day(&self, ctx: &FetchContext, city: &str, day: NaiveDate) -> Result<DayFetch, AdapterError> {
        let url = self.day_url(city, day);
        let response = self.http.get_json_bytes(ctx.run_id, &url).await?;

        if let Some(archive) = &self.archive {
            match archive.archive(city, day, "json", &response.body).await {
                Ok(stored) => debug!(path = %stored.relative_path.display(), deduplicated = stored.deduplicated, "archived upstream body"),
                Err(err) => warn!(error = %err, city, %day, "failed to archive upstream body"),
            }
        }

        parse_day_payload(&response.body, city, day, &self.image_origin)
    }
}

/// Parses one day-wise response body. A missing or non-array top-level `data`
/// field means no data; records without a vegetable name are skipped.
pub fn parse_day_payload(
    body: &[u8],
    city: &str,
    day: NaiveDate,
    image_origin: &Url,
) -> Result<DayFetch, AdapterError> {
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|e| AdapterError::Malformed(e.to_string()))?;

    let Some(items) = value.get("data").and_then(JsonValue::as_array) else {
        return Ok(DayFetch::NoData);
    };

    let drafts = items
        .iter()
        .filter_map(|item| parse_record(item, city, day, image_origin))
        .collect::<Vec<_>>();

    if drafts.is_empty() {
        Ok(DayFetch::NoData)
    } else {
        Ok(DayFetch::Records(drafts))
    }
}

fn parse_record(item: &JsonValue, city: &str, day: NaiveDate, image_origin: &Url) -> Option<PriceDraft> {
    let Some(vegetable) = json_str(item, &["vegetablename"]).and_then(text_or_none) else {
        debug!(record = %item, "skipping record without vegetablename");
        return None;
    };
    let retail = PriceRange::parse(json_str(item, &["retailprice"]));
    let shopmall = PriceRange::parse(json_str(item, &["shopingmallprice"]));

    Some(PriceDraft {
        date: day,
        city: city.to_string(),
        vegetable,
        wholesale_price: wholesale_price(item.get("price")),
        retail_min_price: retail.min,
        retail_max_price: retail.max,
        shopmall_min_price: shopmall.min,
        shopmall_max_price: shopmall.max,
        unit: json_str(item, &["units"]).and_then(text_or_none),
        image: json_str(item, &["table", "imageUrl"]).and_then(|raw| resolve_image(image_origin, raw)),
    })
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Integer wholesale price; falsy values (null, 0, empty text) become `None`.
fn wholesale_price(value: Option<&JsonValue>) -> Option<i64> {
    let price = match value? {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        JsonValue::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f.round() as i64))
        }
        _ => None,
    }?;
    (price != 0).then_some(price)
}

fn resolve_image(origin: &Url, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    origin.join(raw).ok().map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use vegwatch_core::parse_day;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn origin() -> Url {
        Url::parse(DEFAULT_IMAGE_ORIGIN).unwrap()
    }

    fn fixture_bytes() -> Vec<u8> {
        let path = workspace_root()
            .join("fixtures/vegetablemarketprice/kerala/2025-01-01.json");
        std::fs::read(path).expect("read fixture")
    }

    #[test]
    fn fixture_parses_into_drafts() {
        let day = parse_day("2025-01-01").unwrap();
        let drafts = parse_day_payload(&fixture_bytes(), "kerala", day, &origin())
            .unwrap()
            .into_records();

        let names = drafts.iter().map(|d| d.vegetable.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["Tomato", "Onion Big", "Drumstick", "Coconut"]);
        assert!(drafts.iter().all(|d| d.date == day && d.city == "kerala"));

        let tomato = &drafts[0];
        assert_eq!(tomato.wholesale_price, Some(30));
        assert_eq!(tomato.retail_min_price.as_deref(), Some("36"));
        assert_eq!(tomato.retail_max_price.as_deref(), Some("40"));
        assert_eq!(tomato.shopmall_min_price.as_deref(), Some("40"));
        assert_eq!(tomato.shopmall_max_price.as_deref(), Some("45"));
        assert_eq!(
            tomato.image.as_deref(),
            Some("https://vegetablemarketprice.com/img/vegetables/tomato.jpg")
        );

        let onion = &drafts[1];
        assert_eq!(onion.wholesale_price, Some(42));
        assert_eq!(onion.shopmall_min_price, None);
        assert_eq!(onion.shopmall_max_price, None);
        assert_eq!(
            onion.image.as_deref(),
            Some("https://vegetablemarketprice.com/img/vegetables/onion-big.jpg")
        );

        let drumstick = &drafts[2];
        assert_eq!(drumstick.wholesale_price, None);
        assert_eq!(drumstick.retail_min_price, None);
        assert_eq!(drumstick.image, None);

        let coconut = &drafts[3];
        assert_eq!(coconut.wholesale_price, Some(39));
        assert_eq!(coconut.unit.as_deref(), Some("piece"));
        assert_eq!(
            coconut.image.as_deref(),
            Some("https://cdn.vegetablemarketprice.com/img/coconut.jpg")
        );
    }

    #[test]
    fn missing_data_field_is_no_data() {
        let day = parse_day("2025-01-01").unwrap();
        let bodies: [&[u8]; 4] = [br#"{}"#, br#"{"data":null}"#, br#"{"data":[]}"#, br#"{"data":{"x":1}}"#];
        for body in bodies {
            assert_eq!(parse_day_payload(body, "kerala", day, &origin()).unwrap(), DayFetch::NoData);
        }
    }

    #[test]
    fn non_json_body_is_malformed() {
        let day = parse_day("2025-01-01").unwrap();
        let err = parse_day_payload(b"<html>maintenance</html>", "kerala", day, &origin()).unwrap_err();
        assert!(matches!(err, AdapterError::Malformed(_)));
    }

    #[test]
    fn repeated_vegetable_is_kept_twice() {
        let day = parse_day("2025-01-01").unwrap();
        let body = br#"{"data":[{"vegetablename":"Tomato","price":30},{"vegetablename":"Tomato","price":31}]}"#;
        let drafts = parse_day_payload(body, "kerala", day, &origin()).unwrap().into_records();
        assert_eq!(drafts.len(), 2);
    }

    #[test]
    fn wholesale_price_treats_falsy_as_missing() {
        assert_eq!(wholesale_price(Some(&serde_json::json!(0))), None);
        assert_eq!(wholesale_price(Some(&serde_json::json!(""))), None);
        assert_eq!(wholesale_price(Some(&serde_json::json!(null))), None);
        assert_eq!(wholesale_price(None), None);
        assert_eq!(wholesale_price(Some(&serde_json::json!(" 55 "))), Some(55));
    }
}
