//! Shared helpers for integration tests

#![allow(dead_code)]

use reqwest::StatusCode;
use serde_json::Value;
use settings_client::{HttpResponse, Setting, SettingsScope};
use std::sync::Once;

pub use settings_client::transport::test_support::ScriptedTransport;

static TRACING: Once = Once::new();

/// Route `tracing` output to the test harness, filtered by `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "settings_client=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn setting(scope: SettingsScope, key: &str, value: Value) -> Setting {
    Setting::new(scope, key, value)
}

/// `200` carrying `setting` as body and `etag` as header
pub fn ok_setting(setting: &Setting, etag: &str) -> HttpResponse {
    let body = Setting {
        etag: Some(etag.to_string()),
        ..setting.clone()
    };
    HttpResponse::new(StatusCode::OK)
        .with_header("ETag", etag)
        .with_json(&body)
}

pub fn not_modified() -> HttpResponse {
    HttpResponse::new(StatusCode::NOT_MODIFIED)
}

pub fn not_found() -> HttpResponse {
    HttpResponse::new(StatusCode::NOT_FOUND)
}

pub fn status(code: u16) -> HttpResponse {
    HttpResponse::new(StatusCode::from_u16(code).unwrap())
}
