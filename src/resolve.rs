//! Scope hierarchy resolution
//!
//! The server walks `CONTACT_ROLE → ACCOUNT → TERRITORY → TENANT → GLOBAL`
//! and answers with the most specific setting it found. This module only
//! shapes the request and caches the answer; the matched scope is always the
//! one the server reported.

use crate::cache::FreshnessPolicy;
use crate::error::Result;
use crate::read_through::ReadThroughCache;
use crate::settings::{key_tag, resolve_key, resolve_request, ResolvedSetting, Setting, SettingsContext};
use tracing::debug;

pub struct ScopeHierarchyResolver {
    reader: ReadThroughCache<Setting>,
}

impl ScopeHierarchyResolver {
    pub fn new(reader: ReadThroughCache<Setting>) -> Self {
        Self { reader }
    }

    /// Resolve `key` for `context`.
    ///
    /// `Ok(None)` means no level of the hierarchy holds the key.
    pub async fn resolve(
        &self,
        key: &str,
        context: &SettingsContext,
        policy: &FreshnessPolicy,
    ) -> Result<Option<ResolvedSetting>> {
        let cache_key = resolve_key(key, context);
        let request = resolve_request(key, context);

        let resolved = self
            .reader
            .read_tagged(&cache_key, request, vec![key_tag(key)], policy)
            .await?
            .map(ResolvedSetting::from);

        match &resolved {
            Some(resolved) => debug!(
                "Resolved {} at scope {} ({:?})",
                key, resolved.matched_scope, resolved.setting.scope_id
            ),
            None => debug!("No setting for {} at any scope", key),
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::ConditionalFetcher;
    use crate::settings::SettingsScope;
    use crate::transport::test_support::ScriptedTransport;
    use crate::transport::HttpResponse;
    use reqwest::StatusCode;
    use serde_json::json;
    use std::sync::Arc;

    fn resolver(transport: Arc<ScriptedTransport>) -> ScopeHierarchyResolver {
        ScopeHierarchyResolver::new(ReadThroughCache::new(ConditionalFetcher::new(transport)))
    }

    #[tokio::test]
    async fn test_matched_scope_comes_from_response() {
        let transport = Arc::new(ScriptedTransport::new());
        let body = Setting::new(SettingsScope::Tenant, "tax.config", json!({"currency": "EUR"}))
            .with_scope_id("t-1");
        transport.push(
            HttpResponse::new(StatusCode::OK)
                .with_header("ETag", "\"t1\"")
                .with_json(&body),
        );
        let resolver = resolver(transport.clone());

        // Caller context names an account, but the server matched at tenant level.
        let context = SettingsContext::new().tenant_id("t-1").account_id("a-9");
        let resolved = resolver
            .resolve("tax.config", &context, &FreshnessPolicy::conditional())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(resolved.matched_scope, SettingsScope::Tenant);
        assert_eq!(resolved.value(), &json!({"currency": "EUR"}));

        let request = &transport.requests()[0];
        assert_eq!(request.path(), "/settings/resolve/tax.config");
        assert_eq!(request.query_value("accountId"), Some("a-9"));
        assert_eq!(request.query_value("tenantId"), Some("t-1"));
    }

    #[tokio::test]
    async fn test_no_match_anywhere() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(HttpResponse::new(StatusCode::NOT_FOUND));
        let resolver = resolver(transport);

        let resolved = resolver
            .resolve("missing", &SettingsContext::new(), &FreshnessPolicy::default())
            .await
            .unwrap();
        assert!(resolved.is_none());
    }
}
