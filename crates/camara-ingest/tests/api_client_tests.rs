//! API client tests against a mock HTTP server
//!
//! Retries are observed through a [`RecordingSleeper`], so nothing here
//! actually waits.

#![allow(clippy::unwrap_used)]

mod common;

use camara_common::DateRange;
use camara_ingest::{
    api::{ApiClient, Endpoint, PageRequest, PageSource, RetryPolicy},
    clock::RecordingSleeper,
    config::IngestConfig,
    error::IngestError,
};
use common::date;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

// ============================================================================
// Test Helpers
// ============================================================================

fn client(server: &MockServer, page_size: u32) -> (ApiClient, Arc<RecordingSleeper>) {
    let config = IngestConfig {
        api_base_url: server.uri(),
        page_size,
        min_request_interval_ms: 0,
        ..IngestConfig::default()
    };
    let sleeper = Arc::new(RecordingSleeper::new());
    let client = ApiClient::new(&config)
        .unwrap()
        .with_sleeper(sleeper.clone())
        .with_retry_policy(RetryPolicy::new(
            3,
            Duration::from_secs(1),
            Duration::from_secs(30),
        ));
    (client, sleeper)
}

fn deputies(ids: std::ops::Range<i64>) -> serde_json::Value {
    json!(ids.map(|id| json!({ "id": id, "nome": format!("D{id}") })).collect::<Vec<_>>())
}

async fn received(server: &MockServer) -> usize {
    server.received_requests().await.unwrap_or_default().len()
}

// ============================================================================
// Retry behavior
// ============================================================================

#[tokio::test]
async fn test_server_error_is_retried_then_succeeds() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/deputados"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/deputados"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "dados": deputies(1..3),
            "links": []
        })))
        .mount(&server)
        .await;

    let (client, sleeper) = client(&server, 100);
    let page = client
        .fetch_page(&PageRequest::first(Endpoint::Deputies))
        .await
        .unwrap();

    assert_eq!(page.records.len(), 2);
    assert!(!page.has_more);
    assert_eq!(received(&server).await, 2);
    assert_eq!(sleeper.recorded(), vec![Duration::from_secs(1)]);
}

#[tokio::test]
async fn test_rate_limited_response_honors_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/votacoes"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/votacoes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "dados": [] })))
        .mount(&server)
        .await;

    let (client, sleeper) = client(&server, 100);
    let range = DateRange::new(date(2024, 1, 1), date(2024, 1, 31)).unwrap();
    let page = client
        .fetch_page(&PageRequest::first(Endpoint::VotingSessions { range }))
        .await
        .unwrap();

    assert!(page.records.is_empty());
    assert_eq!(sleeper.recorded(), vec![Duration::from_secs(7)]);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let (client, sleeper) = client(&server, 100);
    let err = client
        .fetch_page(&PageRequest::first(Endpoint::Deputies))
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(received(&server).await, 3);
    assert_eq!(
        sleeper.recorded(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
}

#[tokio::test]
async fn test_not_found_fails_without_retry() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/deputados/1"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Recurso não encontrado"))
        .mount(&server)
        .await;

    let (client, sleeper) = client(&server, 100);
    let err = client
        .fetch_page(&PageRequest::first(Endpoint::DeputyDetail(1)))
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Client { status: 404, .. }));
    assert_eq!(received(&server).await, 1);
    assert!(sleeper.recorded().is_empty());
}

#[tokio::test]
async fn test_malformed_body_is_a_decode_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let (client, _) = client(&server, 100);
    let err = client
        .fetch_page(&PageRequest::first(Endpoint::Deputies))
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Decode(_)));
    assert_eq!(received(&server).await, 1);
}

// ============================================================================
// Request shape and pagination
// ============================================================================

#[tokio::test]
async fn test_query_carries_filters_and_paging() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/deputados/204554/despesas"))
        .and(query_param("ano", "2024"))
        .and(query_param("mes", "3"))
        .and(query_param("pagina", "2"))
        .and(query_param("itens", "50"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "dados": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _) = client(&server, 50);
    let request = PageRequest::first(Endpoint::Expenses {
        deputy_id: 204554,
        year: 2024,
        month: 3,
    })
    .next();
    client.fetch_page(&request).await.unwrap();
}

#[tokio::test]
async fn test_votes_endpoint_is_unpaginated() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/votacoes/2384703-55/votos"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "dados": [{ "tipoVoto": "Sim" }, { "tipoVoto": "Não" }]
        })))
        .mount(&server)
        .await;

    let (client, _) = client(&server, 2);
    let page = client
        .fetch_page(&PageRequest::first(Endpoint::Votes {
            session_id: "2384703-55".to_string(),
        }))
        .await
        .unwrap();

    assert_eq!(page.records.len(), 2);
    assert!(!page.has_more);

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].url.query().is_none());
}

#[tokio::test]
async fn test_paging_follows_next_links_until_exhausted() {
    let server = MockServer::start().await;
    let page_size = 100;
    let total = 250;

    for page in 1..=3i64 {
        let first = (page - 1) * page_size + 1;
        let last = (page * page_size).min(total) + 1;
        let mut links = vec![json!({ "rel": "self", "href": "x" })];
        if page < 3 {
            links.push(json!({ "rel": "next", "href": "y" }));
        }
        Mock::given(method("GET"))
            .and(path("/deputados"))
            .and(query_param("pagina", page.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "dados": deputies(first..last),
                "links": links
            })))
            .expect(1)
            .mount(&server)
            .await;
    }

    let (client, _) = client(&server, page_size as u32);
    let mut request = PageRequest::first(Endpoint::Deputies);
    let mut fetched = 0;
    loop {
        let page = client.fetch_page(&request).await.unwrap();
        fetched += page.records.len();
        if !page.has_more {
            break;
        }
        request = request.next();
    }

    assert_eq!(fetched, 250);
    assert_eq!(received(&server).await, 3);
}

#[tokio::test]
async fn test_full_last_page_without_next_link_stops() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/deputados"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "dados": deputies(1..3),
            "links": [{ "rel": "self", "href": "x" }, { "rel": "last", "href": "x" }]
        })))
        .mount(&server)
        .await;

    let (client, _) = client(&server, 2);
    let page = client
        .fetch_page(&PageRequest::first(Endpoint::Deputies))
        .await
        .unwrap();

    assert_eq!(page.records.len(), 2);
    assert!(!page.has_more);
}
