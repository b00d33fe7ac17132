//! Optimistic-concurrency writes through the public client API

mod common;

use common::*;
use reqwest::StatusCode;
use serde_json::json;
use settings_client::{
    ClientConfig, ClientError, HttpResponse, MutationState, ResourceVersion, SettingsClient,
    SettingsScope,
};
use std::sync::Arc;

fn client(transport: Arc<ScriptedTransport>) -> SettingsClient {
    init_tracing();
    SettingsClient::with_transport(ClientConfig::realtime("http://localhost/api"), transport)
}

fn created(version: i64) -> HttpResponse {
    HttpResponse::new(StatusCode::CREATED)
        .with_json(&json!({"id": "r-1", "threadId": "42", "version": version}))
}

fn thread_conflict() -> HttpResponse {
    HttpResponse::new(StatusCode::PRECONDITION_FAILED)
        .with_json(&json!({"detail": "Thread was modified"}))
}

fn thread_at(version: i64) -> HttpResponse {
    HttpResponse::new(StatusCode::OK)
        .with_json(&json!({"id": "42", "subject": "Delivery", "version": version}))
}

#[tokio::test]
async fn test_reply_conflict_recovers_once() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(thread_conflict());
    transport.push(thread_at(6));
    transport.push(created(7));
    let client = client(transport.clone());

    let report = client
        .submit_with_concurrency_control("42", ResourceVersion::Number(5), json!({"body": "On my way"}))
        .await
        .unwrap();

    assert!(report.is_committed());
    assert_eq!(report.conflicts(), 1);
    assert_eq!(report.attempts.len(), 2);
    assert_eq!(
        report.transitions.last(),
        Some(&MutationState::Committed)
    );

    let requests = transport.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].path(), "/threads/42/reply");
    assert_eq!(requests[0].header_value("If-Match"), Some("\"v5\""));
    assert_eq!(requests[1].path(), "/threads/42");
    assert_eq!(requests[2].header_value("If-Match"), Some("\"v6\""));
    assert_eq!(requests[2].body, Some(json!({"body": "On my way"})));
}

#[tokio::test]
async fn test_double_conflict_is_reported_not_retried_again() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(thread_conflict());
    transport.push(thread_at(6));
    transport.push(thread_conflict());
    transport.push(thread_at(8));
    let client = client(transport.clone());

    let error = client
        .submit_with_concurrency_control("42", ResourceVersion::Number(5), json!({"body": "On my way"}))
        .await
        .unwrap_err();

    let conflict = error.conflict().expect("conflict report");
    assert_eq!(conflict.resource_id, "42");
    assert_eq!(conflict.attempts, 2);
    assert_eq!(conflict.detail.as_deref(), Some("Thread was modified"));
    assert_eq!(
        conflict.current.as_ref().and_then(|c| c.version.clone()),
        Some(ResourceVersion::Number(8))
    );
    assert!(error.is_retryable());
    assert_eq!(transport.request_count(), 4);
}

#[tokio::test]
async fn test_larger_retry_budget() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(thread_conflict());
    transport.push(thread_at(6));
    transport.push(thread_conflict());
    transport.push(thread_at(7));
    transport.push(created(8));
    init_tracing();
    let config = ClientConfig::builder()
        .base_url("http://localhost/api")
        .max_conflict_retries(2)
        .build();
    let client = SettingsClient::with_transport(config, transport);

    let report = client
        .submit_with_concurrency_control("42", ResourceVersion::Number(5), json!({"body": "third time"}))
        .await
        .unwrap();

    assert_eq!(report.conflicts(), 2);
    assert_eq!(report.attempts[2].expected_version, ResourceVersion::Number(7));
}

#[tokio::test]
async fn test_validation_and_server_errors() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(status(400));
    transport.push(status(502));
    let client = client(transport);

    let error = client
        .submit_with_concurrency_control("42", ResourceVersion::Number(5), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(error, ClientError::Validation { status: 400, .. }));
    assert!(!error.is_retryable());

    let error = client
        .submit_with_concurrency_control("42", ResourceVersion::Number(5), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(error, ClientError::Transport(_)));
}

#[tokio::test]
async fn test_setting_update_conflict_uses_fresh_etag() {
    let transport = Arc::new(ScriptedTransport::new());
    let theme = setting(SettingsScope::Global, "ui.theme", json!({"primary": "#000000"}))
        .with_etag("\"e1\"");
    let updated = settings_client::Setting {
        value: json!({"primary": "#94C456"}),
        ..theme.clone()
    };

    // Prime the cache with a direct lookup.
    transport.push(ok_setting(&theme, "\"e1\""));
    // PUT conflicts, re-read shows e2, retry commits as e3.
    transport.push(HttpResponse::new(StatusCode::PRECONDITION_FAILED));
    transport.push(ok_setting(&theme, "\"e2\""));
    transport.push(ok_setting(&updated, "\"e3\""));
    let client = client(transport.clone());

    let cached = client
        .fetch_setting("ui.theme", SettingsScope::Global, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(client.cache_stats().await.entries, 1);

    let report = client
        .update_setting(&cached, json!({"primary": "#94C456"}))
        .await
        .unwrap();

    assert_eq!(
        report.committed_version,
        Some(ResourceVersion::Tag("\"e3\"".to_string()))
    );
    let requests = transport.requests();
    assert_eq!(requests[1].header_value("If-Match"), Some("\"e1\""));
    assert_eq!(requests[2].path(), "/settings");
    assert_eq!(requests[2].query_value("key"), Some("ui.theme"));
    assert_eq!(requests[3].header_value("If-Match"), Some("\"e2\""));

    // Committed update dropped the cached lookup.
    assert_eq!(client.cache_stats().await.entries, 0);
}
