use super::*;
use crate::auth::{Credential, CredentialStore};
use crate::clock::ManualClock;
use crate::config::OAuthSettings;
use crate::database::test_db;
use chrono::{TimeZone, Utc};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(server: &MockServer) -> SyncConfig {
    SyncConfig {
        api_base_url: server.uri(),
        seller_id: "555".into(),
        oauth: OAuthSettings {
            client_id: "app".into(),
            // no secret: reads fall back to the user credential
            client_secret: String::new(),
            redirect_uri: "https://example.com/cb".into(),
        },
        requests_per_minute: 60_000,
        retry: RetryPolicy::immediate(3),
        rate_limit_fallback: Duration::ZERO,
        max_rate_limit_waits: 2,
        ..SyncConfig::default()
    }
}

fn client_with(config: SyncConfig) -> MarketplaceClient {
    let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
    let store = CredentialStore::new(test_db());
    store
        .save(&Credential {
            access_token: "APP_USR-1".into(),
            refresh_token: Some("TG-1".into()),
            token_type: "Bearer".into(),
            scope: None,
            expires_at: now + chrono::Duration::hours(6),
            subject_id: Some("777".into()),
            invalid: false,
            issued_at: now,
        })
        .unwrap();
    let clock = Arc::new(ManualClock::new(now));
    let credentials = Arc::new(CredentialManager::new(&config, store, clock).unwrap());
    let limiter = RateLimiter::new(config.requests_per_minute, config.max_concurrency);
    MarketplaceClient::new(&config, credentials, limiter).unwrap()
}

fn item_json(id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "title": "Pastilha de Freio",
        "price": 89.9,
        "available_quantity": 3,
        "status": "active",
        "pictures": []
    })
}

async fn requests_to(server: &MockServer, target: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == target)
        .count()
}

#[tokio::test]
async fn item_detail_sends_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items/MLB1"))
        .and(header("Authorization", "Bearer APP_USR-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(item_json("MLB1")))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_with(test_config(&server));
    let item = client.item_detail("MLB1").await.unwrap();
    assert_eq!(item.id, "MLB1");
    assert_eq!(item.price, Some(89.9));
}

#[tokio::test]
async fn seller_search_sends_query_parameters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/555/items/search"))
        .and(query_param("status", "paused"))
        .and(query_param("offset", "50"))
        .and(query_param("limit", "50"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": ["MLB1", "MLB2"],
            "paging": {"total": 52, "offset": 50, "limit": 50}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_with(test_config(&server));
    let page = client
        .search_seller_items(&SearchQuery::page(50, 50).with_status("paused"))
        .await
        .unwrap();
    assert_eq!(page.results, vec!["MLB1", "MLB2"]);
    assert_eq!(page.paging.total, 52);
}

#[tokio::test]
async fn seller_id_is_resolved_once_from_authorized_user() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/me"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": 777, "nickname": "LOJA"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/777/items/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [],
            "paging": {"total": 0, "offset": 0, "limit": 50}
        })))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_with(SyncConfig {
        seller_id: String::new(),
        ..test_config(&server)
    });
    client.search_seller_items(&SearchQuery::page(0, 50)).await.unwrap();
    client.search_seller_items(&SearchQuery::page(0, 50)).await.unwrap();
}

#[tokio::test]
async fn rate_limit_waits_do_not_consume_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items/MLB1"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/items/MLB1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(item_json("MLB1")))
        .mount(&server)
        .await;

    let client = client_with(SyncConfig {
        retry: RetryPolicy::immediate(1),
        ..test_config(&server)
    });
    assert!(client.item_detail("MLB1").await.is_ok());
    assert_eq!(requests_to(&server, "/items/MLB1").await, 3);
}

#[tokio::test]
async fn persistent_rate_limiting_gives_up() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items/MLB1"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let client = client_with(test_config(&server));
    let result = client.item_detail("MLB1").await;
    assert!(matches!(result, Err(SyncError::RateLimited { .. })));
    assert_eq!(requests_to(&server, "/items/MLB1").await, 3);
}

#[tokio::test]
async fn unauthorized_triggers_one_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items/MLB1"))
        .and(header("Authorization", "Bearer APP_USR-1"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/items/MLB1"))
        .and(header("Authorization", "Bearer APP_USR-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(item_json("MLB1")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "APP_USR-2",
            "expires_in": 21600,
            "refresh_token": "TG-2"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_with(test_config(&server));
    assert_eq!(client.item_detail("MLB1").await.unwrap().id, "MLB1");
}

#[tokio::test]
async fn second_unauthorized_is_reported_as_expired() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items/MLB1"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "APP_USR-2",
            "expires_in": 21600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_with(test_config(&server));
    let result = client.item_detail("MLB1").await;
    assert!(matches!(result, Err(SyncError::Auth(AuthError::Expired))));
    assert_eq!(requests_to(&server, "/items/MLB1").await, 2);
}

#[tokio::test]
async fn server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items/MLB1"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/items/MLB1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(item_json("MLB1")))
        .mount(&server)
        .await;

    let client = client_with(test_config(&server));
    assert!(client.item_detail("MLB1").await.is_ok());
    assert_eq!(requests_to(&server, "/items/MLB1").await, 3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items/MLB404"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .mount(&server)
        .await;

    let client = client_with(test_config(&server));
    match client.item_detail("MLB404").await {
        Err(SyncError::HttpStatus { status, body }) => {
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body, "not found");
        }
        other => panic!("expected HttpStatus, got {:?}", other.map(|i| i.id)),
    }
    assert_eq!(requests_to(&server, "/items/MLB404").await, 1);
}

#[test]
fn retry_after_header_is_parsed_as_seconds() {
    let mut headers = HeaderMap::new();
    headers.insert(RETRY_AFTER, "7".parse().unwrap());
    assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

    headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
    assert_eq!(parse_retry_after(&headers), None);
}
