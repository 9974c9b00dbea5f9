use std::time::Duration;

use serde_json::json;
use tempfile::tempdir;
use uuid::Uuid;
use vegwatch_adapters::{AdapterError, DayFetch, FetchContext, MarketSource, UpstreamConfig, VegetableMarketAdapter};
use vegwatch_core::parse_day;
use vegwatch_storage::{FetchError, HttpClientConfig, HttpFetcher, ResponseArchive};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const UA: &str = "Mozilla/5.0 (test)";

fn adapter(server: &MockServer, archive: Option<ResponseArchive>) -> VegetableMarketAdapter {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        user_agent: Some(UA.to_string()),
        ..Default::default()
    })
    .unwrap();
    VegetableMarketAdapter::new(
        http,
        UpstreamConfig {
            base_url: format!("{}/api/dataapi/", server.uri()),
            image_origin: "https://vegetablemarketprice.com/".to_string(),
            archive,
        },
    )
    .unwrap()
}

fn ctx() -> FetchContext {
    FetchContext { run_id: Uuid::new_v4() }
}

#[tokio::test]
async fn fetch_day_requests_daywise_endpoint_with_browser_agent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/dataapi/market/kerala/daywisedata"))
        .and(query_param("date", "2025-01-02"))
        .and(header("user-agent", UA))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {
                    "vegetablename": "Carrot",
                    "price": 55,
                    "retailprice": "60 - 66",
                    "shopingmallprice": "64 - 70",
                    "units": "kg",
                    "table": { "imageUrl": "img/carrot.jpg" }
                }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let day = parse_day("2025-01-02").unwrap();
    let fetched = adapter(&server, None).fetch_day(&ctx(), "kerala", day).await.unwrap();

    let DayFetch::Records(records) = fetched else {
        panic!("expected records");
    };
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].vegetable, "Carrot");
    assert_eq!(records[0].wholesale_price, Some(55));
    assert_eq!(records[0].retail_min_price.as_deref(), Some("60"));
    assert_eq!(records[0].image.as_deref(), Some("https://vegetablemarketprice.com/img/carrot.jpg"));
}

#[tokio::test]
async fn missing_data_is_reported_as_no_data() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "message": "no market" })))
        .mount(&server)
        .await;

    let day = parse_day("2025-01-02").unwrap();
    let fetched = adapter(&server, None).fetch_day(&ctx(), "kerala", day).await.unwrap();
    assert_eq!(fetched, DayFetch::NoData);
}

#[tokio::test]
async fn server_error_is_an_upstream_failure_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let day = parse_day("2025-01-02").unwrap();
    let err = adapter(&server, None).fetch_day(&ctx(), "kerala", day).await.unwrap_err();
    assert!(matches!(
        err,
        AdapterError::Upstream(FetchError::HttpStatus { status: 503, .. })
    ));
}

#[tokio::test]
async fn successful_bodies_are_archived() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let archive = ResponseArchive::new(dir.path());
    let day = parse_day("2025-01-02").unwrap();
    adapter(&server, Some(archive)).fetch_day(&ctx(), "kerala", day).await.unwrap();

    let day_dir = dir.path().join("kerala").join("2025-01-02");
    let files = std::fs::read_dir(&day_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
        .count();
    assert_eq!(files, 1);
}
