//! Settings client facade
//!
//! One [`SettingsClient`] owns its cache, in-flight request table and
//! mutation locks. Two clients never share state.

use crate::cache::{CacheStats, CacheStore, FreshnessPolicy};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::fetch::ConditionalFetcher;
use crate::mutation::{
    classify_failure, MutationCoordinator, MutationReport, MutationTarget, ResourceVersion,
    SettingUpdate, ThreadReply,
};
use crate::read_through::ReadThroughCache;
use crate::resolve::ScopeHierarchyResolver;
use crate::settings::{
    create_request, delete_request, key_tag, list_request, setting_key, setting_request,
    ResolvedSetting, Setting, SettingsContext, SettingsScope,
};
use crate::transport::{HttpRequest, HttpTransport, ReqwestTransport};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

pub struct SettingsClient {
    config: ClientConfig,
    transport: Arc<dyn HttpTransport>,
    reader: ReadThroughCache<Setting>,
    resolver: ScopeHierarchyResolver,
    coordinator: MutationCoordinator,
}

impl SettingsClient {
    /// Create a client talking HTTP to `config.base_url`
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(ReqwestTransport::new(&config)?);
        Ok(Self::with_transport(config, transport))
    }

    /// Create a client from `SETTINGS_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    /// Create a client over a custom transport
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn HttpTransport>) -> Self {
        info!("Initializing settings client for {}", config.base_url);

        let reader = ReadThroughCache::new(ConditionalFetcher::new(Arc::clone(&transport)));
        let resolver = ScopeHierarchyResolver::new(reader.clone());
        let coordinator =
            MutationCoordinator::new(Arc::clone(&transport), config.max_conflict_retries);

        Self {
            config,
            transport,
            reader,
            resolver,
            coordinator,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Cache backing setting reads
    pub fn cache(&self) -> &CacheStore<Setting> {
        self.reader.store()
    }

    /// Read one setting stored at `(scope, scope_id)`.
    ///
    /// `Ok(None)` when the server has no such setting.
    pub async fn fetch_setting(
        &self,
        key: &str,
        scope: SettingsScope,
        scope_id: Option<&str>,
    ) -> Result<Option<Setting>> {
        self.fetch_setting_with_policy(key, scope, scope_id, &self.config.freshness)
            .await
    }

    pub async fn fetch_setting_with_policy(
        &self,
        key: &str,
        scope: SettingsScope,
        scope_id: Option<&str>,
        policy: &FreshnessPolicy,
    ) -> Result<Option<Setting>> {
        let cache_key = setting_key(key, scope, scope_id);
        let request = setting_request(key, scope, scope_id);
        self.reader
            .read_tagged(&cache_key, request, vec![key_tag(key)], policy)
            .await
    }

    /// Resolve the most specific value of `key` for `context`
    pub async fn resolve_setting(
        &self,
        key: &str,
        context: &SettingsContext,
    ) -> Result<Option<ResolvedSetting>> {
        self.resolver
            .resolve(key, context, &self.config.freshness)
            .await
    }

    pub async fn resolve_setting_with_policy(
        &self,
        key: &str,
        context: &SettingsContext,
        policy: &FreshnessPolicy,
    ) -> Result<Option<ResolvedSetting>> {
        self.resolver.resolve(key, context, policy).await
    }

    /// Read-through access to any setting-shaped resource
    pub async fn read(
        &self,
        cache_key: &str,
        request: HttpRequest,
        policy: &FreshnessPolicy,
    ) -> Result<Option<Setting>> {
        self.reader.read(cache_key, request, policy).await
    }

    /// All settings stored at `(scope, scope_id)`; never cached
    pub async fn list_settings(
        &self,
        scope: SettingsScope,
        scope_id: Option<&str>,
    ) -> Result<Vec<Setting>> {
        let request = list_request(scope, scope_id);
        let context = request.describe();
        let response = self.transport.send(request).await?;

        match response.status() {
            StatusCode::OK => response.json().map_err(|e| {
                ClientError::Transport(format!("unparseable body from {}: {}", context, e))
            }),
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status => Err(ClientError::UnexpectedStatus {
                status: status.as_u16(),
                context,
            }),
        }
    }

    /// Drop a cached entry so the next read is unconditional
    pub async fn invalidate(&self, cache_key: &str) -> bool {
        self.reader.invalidate(cache_key).await
    }

    /// Drop every cached lookup (direct and resolved) of a setting key
    pub async fn invalidate_key(&self, key: &str) -> usize {
        self.cache().invalidate_by_tag(&key_tag(key)).await
    }

    /// Drop every cached value and ETag
    pub async fn clear_cache(&self) {
        self.reader.invalidate_all().await;
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.reader.stats().await
    }

    /// Reply to a thread conditioned on `expected_version`
    pub async fn submit_with_concurrency_control(
        &self,
        resource_id: &str,
        expected_version: ResourceVersion,
        payload: Value,
    ) -> Result<MutationReport> {
        self.submit_to(&ThreadReply, resource_id, expected_version, payload)
            .await
    }

    /// Conditional write against any [`MutationTarget`]
    pub async fn submit_to(
        &self,
        target: &dyn MutationTarget,
        resource_id: &str,
        expected_version: ResourceVersion,
        payload: Value,
    ) -> Result<MutationReport> {
        self.coordinator
            .submit(target, resource_id, expected_version, payload)
            .await
    }

    /// Replace the value of `setting`, conditioned on its ETag.
    ///
    /// On success every cached lookup of the setting's key is dropped.
    pub async fn update_setting(&self, setting: &Setting, value: Value) -> Result<MutationReport> {
        let target = SettingUpdate::new(setting.clone()).with_cache(self.cache().clone());
        let expected = target.expected_version().ok_or_else(|| {
            ClientError::Config(format!(
                "setting {} carries neither an etag nor a version",
                setting.key
            ))
        })?;

        let mut payload = json!({ "value": value });
        if let Some(metadata) = &setting.metadata {
            payload["metadata"] = metadata.clone();
        }

        debug!("Updating setting {} ({})", setting.key, setting.id);
        self.submit_to(&target, &setting.id.to_string(), expected, payload)
            .await
    }

    /// Create `key` at `(scope, scope_id)`.
    ///
    /// A `409` (the setting already exists) is reported as
    /// [`ClientError::Validation`]. On success every cached lookup of `key` is
    /// dropped, since the new value may now win hierarchy resolution.
    pub async fn create_setting(
        &self,
        scope: SettingsScope,
        scope_id: Option<&str>,
        key: &str,
        value: Value,
        metadata: Option<Value>,
    ) -> Result<Setting> {
        let request = create_request(scope, scope_id, key, value, metadata);
        let context = request.describe();
        let response = self.transport.send(request).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_failure(status, &response, context));
        }

        let mut created: Setting = response.json().map_err(|e| {
            ClientError::Transport(format!("unparseable body from {}: {}", context, e))
        })?;
        if let Some(etag) = response.etag() {
            created.etag = Some(etag);
        }

        let dropped = self.invalidate_key(key).await;
        info!(
            "Created setting {} at {} ({} cached lookups dropped)",
            key, scope, dropped
        );
        Ok(created)
    }

    /// Delete `setting`; `Ok(false)` when the server no longer has it.
    ///
    /// Cached lookups of the setting's key are dropped either way.
    pub async fn delete_setting(&self, setting: &Setting) -> Result<bool> {
        let request = delete_request(&setting.id);
        let context = request.describe();
        let response = self.transport.send(request).await?;

        let deleted = match response.status() {
            status if status.is_success() => true,
            StatusCode::NOT_FOUND => false,
            status => return Err(classify_failure(status, &response, context)),
        };

        let dropped = self.invalidate_key(&setting.key).await;
        info!(
            "Deleted setting {} ({}): {} ({} cached lookups dropped)",
            setting.key,
            setting.id,
            if deleted { "removed" } else { "already gone" },
            dropped
        );
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::ScriptedTransport;
    use crate::transport::HttpResponse;

    fn client(transport: Arc<ScriptedTransport>) -> SettingsClient {
        SettingsClient::with_transport(ClientConfig::realtime("http://localhost/api"), transport)
    }

    #[tokio::test]
    async fn test_independent_clients_share_nothing() {
        let transport = Arc::new(ScriptedTransport::new());
        let setting = Setting::new(SettingsScope::Global, "ui.theme", json!({"primary": "#94C456"}));
        transport.push(
            HttpResponse::new(StatusCode::OK)
                .with_header("ETag", "\"abc123\"")
                .with_json(&setting),
        );
        let a = client(transport.clone());
        let b = client(transport);

        a.fetch_setting("ui.theme", SettingsScope::Global, None)
            .await
            .unwrap();

        assert_eq!(a.cache_stats().await.entries, 1);
        assert_eq!(b.cache_stats().await.entries, 0);
    }

    #[tokio::test]
    async fn test_list_settings_is_not_cached() {
        let transport = Arc::new(ScriptedTransport::new());
        let settings = vec![
            Setting::new(SettingsScope::Tenant, "a", json!(1)).with_scope_id("t-1"),
            Setting::new(SettingsScope::Tenant, "b", json!(2)).with_scope_id("t-1"),
        ];
        transport.push(HttpResponse::new(StatusCode::OK).with_json(&settings));
        let client = client(transport.clone());

        let listed = client
            .list_settings(SettingsScope::Tenant, Some("t-1"))
            .await
            .unwrap();

        assert_eq!(listed, settings);
        assert_eq!(transport.requests()[0].path(), "/settings/list");
        assert!(client.cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_update_setting_requires_validator() {
        let client = client(Arc::new(ScriptedTransport::new()));
        let setting = Setting::new(SettingsScope::Global, "ui.theme", json!({}));

        let result = client.update_setting(&setting, json!({"primary": "#fff"})).await;
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[tokio::test]
    async fn test_update_setting_sends_value_and_metadata() {
        let transport = Arc::new(ScriptedTransport::new());
        let mut setting = Setting::new(SettingsScope::Global, "ui.theme", json!({})).with_etag("\"e1\"");
        setting.metadata = Some(json!({"owner": "design"}));
        transport.push(
            HttpResponse::new(StatusCode::OK)
                .with_header("ETag", "\"e2\"")
                .with_json(&setting),
        );
        let client = client(transport.clone());

        let report = client
            .update_setting(&setting, json!({"primary": "#fff"}))
            .await
            .unwrap();

        assert!(report.is_committed());
        let request = &transport.requests()[0];
        assert_eq!(request.path(), format!("/settings/{}", setting.id));
        assert_eq!(
            request.body,
            Some(json!({"value": {"primary": "#fff"}, "metadata": {"owner": "design"}}))
        );
    }

    #[tokio::test]
    async fn test_create_setting_drops_cached_resolution() {
        let transport = Arc::new(ScriptedTransport::new());
        let global = Setting::new(SettingsScope::Global, "tax.config", json!({"currency": "EUR"}));
        let territory = Setting::new(SettingsScope::Territory, "tax.config", json!({"currency": "CHF"}))
            .with_scope_id("CH");
        transport.push(
            HttpResponse::new(StatusCode::OK)
                .with_header("ETag", "\"g1\"")
                .with_json(&global),
        );
        transport.push(
            HttpResponse::new(StatusCode::CREATED)
                .with_header("ETag", "\"t1\"")
                .with_json(&territory),
        );
        let client = SettingsClient::with_transport(
            ClientConfig::static_content("http://localhost/api"),
            transport.clone(),
        );
        let context = SettingsContext::new().territory("CH");

        let before = client.resolve_setting("tax.config", &context).await.unwrap().unwrap();
        assert_eq!(before.matched_scope, SettingsScope::Global);
        assert_eq!(client.cache_stats().await.entries, 1);

        let created = client
            .create_setting(
                SettingsScope::Territory,
                Some("CH"),
                "tax.config",
                json!({"currency": "CHF"}),
                None,
            )
            .await
            .unwrap();

        assert_eq!(created.etag.as_deref(), Some("\"t1\""));
        assert_eq!(transport.requests()[1].method, reqwest::Method::POST);
        assert!(client.cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_create_existing_setting_is_validation_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(HttpResponse::new(StatusCode::CONFLICT).with_body("Setting already exists"));
        let client = client(transport);

        let result = client
            .create_setting(SettingsScope::Global, None, "ui.theme", json!({}), None)
            .await;

        match result {
            Err(ClientError::Validation { status, detail }) => {
                assert_eq!(status, 409);
                assert_eq!(detail, "Setting already exists");
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_setting() {
        let transport = Arc::new(ScriptedTransport::new());
        let setting = Setting::new(SettingsScope::Global, "ui.theme", json!({"primary": "#fff"}));
        transport.push(
            HttpResponse::new(StatusCode::OK)
                .with_header("ETag", "\"e1\"")
                .with_json(&setting),
        );
        transport.push(HttpResponse::new(StatusCode::NO_CONTENT));
        transport.push(HttpResponse::new(StatusCode::NOT_FOUND));
        let client = client(transport.clone());

        client
            .fetch_setting("ui.theme", SettingsScope::Global, None)
            .await
            .unwrap();
        assert!(client.delete_setting(&setting).await.unwrap());
        assert!(client.cache().is_empty().await);
        assert_eq!(transport.requests()[1].path(), format!("/settings/{}", setting.id));

        assert!(!client.delete_setting(&setting).await.unwrap());
    }
}
