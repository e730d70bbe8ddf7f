//! Integration tests for `HttpTransport` against a real (mocked) HTTP server.
//!
//! Unlike the `FakeTransport` unit tests exercised inside `exchange.rs`,
//! this drives the actual `reqwest` client against `wiremock`, proving the
//! request shape (headers, JSON body) and response decoding work end to end.

use landscape_broker::message::Message;
use landscape_broker::transport::{ExchangeRequest, HttpTransport, ProxyConfig, Transport};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn exchange_posts_request_and_decodes_response() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/message-system"))
        .and(header("X-Computer-ID", "secure-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "next-expected-sequence": 1,
            "messages": [],
            "server-uuid": "srv-1",
            "client-accepted-types-changed": false,
        })))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(
        format!("{}/message-system", server.uri()),
        format!("{}/ping", server.uri()),
        None,
        &ProxyConfig::default(),
    )
    .unwrap();

    let request = ExchangeRequest {
        client_api: "3.3".to_string(),
        server_api: "3.3".to_string(),
        next_expected_sequence: 1,
        last_exchange_time: 0.0,
        accepted_types: vec!["register".to_string()],
        messages: vec![Message::new("register")],
    };

    let response = transport.exchange(&request, Some("secure-123")).await.unwrap();
    assert_eq!(response.next_expected_sequence, 1);
    assert_eq!(response.server_uuid.as_deref(), Some("srv-1"));
}

#[tokio::test]
async fn exchange_surfaces_non_success_status_as_transport_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/message-system"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(
        format!("{}/message-system", server.uri()),
        format!("{}/ping", server.uri()),
        None,
        &ProxyConfig::default(),
    )
    .unwrap();

    let request = ExchangeRequest {
        client_api: "3.3".to_string(),
        server_api: "3.3".to_string(),
        next_expected_sequence: 1,
        last_exchange_time: 0.0,
        accepted_types: vec![],
        messages: vec![],
    };

    assert!(transport.exchange(&request, None).await.is_err());
}

#[tokio::test]
async fn ping_sends_insecure_id_as_query_param() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "messages": true })))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(
        format!("{}/message-system", server.uri()),
        format!("{}/ping", server.uri()),
        None,
        &ProxyConfig::default(),
    )
    .unwrap();

    let response = transport.ping("insecure-abc").await.unwrap();
    assert!(response.messages);
}
