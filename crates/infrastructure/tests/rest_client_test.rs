use std::time::Duration;

use application::{ConversationApi, FetchError, MetricsApi};
use chrono::{TimeZone, Utc};
use domain::{ConversationId, DeliveryStatus};
use infrastructure::RestClient;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn client(server: &MockServer) -> RestClient {
    RestClient::new(format!("{}/api/", server.uri()), Duration::from_millis(500))
        .unwrap()
        .with_token("secret")
}

#[tokio::test]
async fn test_dashboard_snapshot_with_generated_at() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/admin/dashboard"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "users": { "total": 10 },
            "jobs": { "open": 3 },
            "generatedAt": "2024-05-01T12:00:00Z"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let fetched = client(&server).await.fetch_dashboard().await.unwrap();
    assert_eq!(
        fetched.generated_at,
        Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
    );
    let groups: Vec<&str> = fetched.delta.groups().map(|(name, _)| name).collect();
    assert_eq!(groups, vec!["jobs", "users"]);
}

#[tokio::test]
async fn test_live_metrics_without_timestamp() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/admin/metrics/live"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "users": { "online": 4 } })))
        .mount(&server)
        .await;

    let fetched = client(&server).await.fetch_live_metrics().await.unwrap();
    assert!(fetched.generated_at.is_none());
    assert!(!fetched.delta.is_empty());
}

#[tokio::test]
async fn test_rate_limited_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/admin/dashboard"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
        .mount(&server)
        .await;

    let err = client(&server).await.fetch_dashboard().await.unwrap_err();
    assert_eq!(
        err,
        FetchError::RateLimited {
            retry_after_secs: Some(7)
        }
    );
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/admin/dashboard"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({}))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let err = client(&server).await.fetch_dashboard().await.unwrap_err();
    assert_eq!(err, FetchError::Timeout);
}

#[tokio::test]
async fn test_unauthorized_and_unexpected_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/admin/dashboard"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/admin/metrics/live"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = client(&server).await;
    assert_eq!(client.fetch_dashboard().await.unwrap_err(), FetchError::Unauthorized);
    assert_eq!(client.fetch_live_metrics().await.unwrap_err(), FetchError::Status(503));
}

#[tokio::test]
async fn test_fetch_messages_accepts_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/conversations/c-1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [{
                "id": "m-1",
                "conversationId": "c-1",
                "senderId": "peer",
                "content": "hi",
                "status": "delivered",
                "createdAt": "2024-05-01T12:00:00Z",
                "deliveredAt": "2024-05-01T12:00:01Z"
            }]
        })))
        .mount(&server)
        .await;

    let messages = client(&server)
        .await
        .fetch_messages(&ConversationId::from("c-1"))
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn test_mark_read_returns_server_time_when_present() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/conversations/c-1/read"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "readAt": "2024-05-01T12:30:00Z" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/conversations/c-2/read"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = client(&server).await;
    assert_eq!(
        client.mark_read(&ConversationId::from("c-1")).await.unwrap(),
        Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap())
    );
    assert_eq!(client.mark_read(&ConversationId::from("c-2")).await.unwrap(), None);
}
