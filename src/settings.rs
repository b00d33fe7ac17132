//! Setting wire types and request builders
//!
//! Mirrors the JSON the settings server speaks: a [`Setting`] is one value
//! stored at one level of the scope hierarchy, and a [`SettingsContext`]
//! describes the caller for hierarchy resolution.

use crate::cache::key::{CacheKeyBuilder, KeyKind};
use crate::cache::types::CacheKey;
use crate::transport::HttpRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Level of the settings hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettingsScope {
    ContactRole,
    Account,
    Territory,
    Tenant,
    Global,
}

impl SettingsScope {
    /// Resolution order, most specific first
    pub const CHAIN: [SettingsScope; 5] = [
        SettingsScope::ContactRole,
        SettingsScope::Account,
        SettingsScope::Territory,
        SettingsScope::Tenant,
        SettingsScope::Global,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingsScope::ContactRole => "CONTACT_ROLE",
            SettingsScope::Account => "ACCOUNT",
            SettingsScope::Territory => "TERRITORY",
            SettingsScope::Tenant => "TENANT",
            SettingsScope::Global => "GLOBAL",
        }
    }

    /// Position in [`SettingsScope::CHAIN`]; lower is more specific
    pub fn specificity(&self) -> usize {
        Self::CHAIN
            .iter()
            .position(|scope| scope == self)
            .unwrap_or(Self::CHAIN.len())
    }
}

impl fmt::Display for SettingsScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingsScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::CHAIN
            .iter()
            .copied()
            .find(|scope| scope.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown settings scope: {}", s))
    }
}

/// A stored setting as returned by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setting {
    pub id: Uuid,

    /// Level the value is stored at (for resolved lookups, the level that matched)
    pub scope: SettingsScope,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,

    pub key: String,

    pub value: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,

    /// Server-issued ETag mirrored into the body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Setting {
    pub fn new(scope: SettingsScope, key: impl Into<String>, value: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope,
            scope_id: None,
            key: key.into(),
            value,
            metadata: None,
            etag: None,
            version: None,
            updated_at: None,
        }
    }

    pub fn with_scope_id(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    /// Cache key of the direct lookup that addresses this setting
    pub fn cache_key(&self) -> CacheKey {
        setting_key(&self.key, self.scope, self.scope_id.as_deref())
    }
}

/// Caller context for hierarchy resolution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub territory: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_role: Option<String>,
}

impl SettingsContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn territory(mut self, territory: impl Into<String>) -> Self {
        self.territory = Some(territory.into());
        self
    }

    pub fn account_id(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn contact_role(mut self, contact_role: impl Into<String>) -> Self {
        self.contact_role = Some(contact_role.into());
        self
    }

    /// Non-empty fields as `(wire name, value)`, sorted by name
    pub fn query_pairs(&self) -> Vec<(&'static str, &str)> {
        let fields = [
            ("accountId", self.account_id.as_deref()),
            ("contactRole", self.contact_role.as_deref()),
            ("tenantId", self.tenant_id.as_deref()),
            ("territory", self.territory.as_deref()),
        ];

        fields
            .into_iter()
            .filter_map(|(name, value)| {
                value
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(|v| (name, v))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.query_pairs().is_empty()
    }
}

/// Result of a hierarchy resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSetting {
    pub setting: Setting,

    /// Level the server reported as the match
    pub matched_scope: SettingsScope,
}

impl ResolvedSetting {
    pub fn value(&self) -> &Value {
        &self.setting.value
    }
}

impl From<Setting> for ResolvedSetting {
    fn from(setting: Setting) -> Self {
        let matched_scope = setting.scope;
        Self {
            setting,
            matched_scope,
        }
    }
}

/// Tag attached to every cache entry that holds a value for `key`
pub fn key_tag(key: &str) -> String {
    format!("key:{}", key)
}

/// Trimmed scope id; blank ids mean "no scope id"
pub fn normalize_scope_id(scope_id: Option<&str>) -> Option<&str> {
    scope_id.map(str::trim).filter(|id| !id.is_empty())
}

/// Cache key for a direct `(scope, scopeId, key)` lookup
pub fn setting_key(key: &str, scope: SettingsScope, scope_id: Option<&str>) -> CacheKey {
    let mut builder = CacheKeyBuilder::new(KeyKind::Setting)
        .identifier(key)
        .param("scope", scope.as_str());
    if let Some(scope_id) = normalize_scope_id(scope_id) {
        builder = builder.param("scopeId", scope_id);
    }
    builder.build()
}

/// Cache key for a hierarchy resolution
pub fn resolve_key(key: &str, context: &SettingsContext) -> CacheKey {
    context
        .query_pairs()
        .into_iter()
        .fold(
            CacheKeyBuilder::new(KeyKind::Resolve).identifier(key),
            |builder, (name, value)| builder.param(name, value),
        )
        .build()
}

/// `GET /settings?scope=&key=[&scopeId=]`
pub fn setting_request(key: &str, scope: SettingsScope, scope_id: Option<&str>) -> HttpRequest {
    let mut request = HttpRequest::get(["settings"])
        .query("scope", scope.as_str())
        .query("key", key);
    if let Some(scope_id) = normalize_scope_id(scope_id) {
        request = request.query("scopeId", scope_id);
    }
    request
}

/// `GET /settings/resolve/{key}?accountId=&contactRole=&tenantId=&territory=`
pub fn resolve_request(key: &str, context: &SettingsContext) -> HttpRequest {
    context.query_pairs().into_iter().fold(
        HttpRequest::get(["settings", "resolve", key]),
        |request, (name, value)| request.query(name, value),
    )
}

/// `GET /settings/list?scope=[&scopeId=]`
pub fn list_request(scope: SettingsScope, scope_id: Option<&str>) -> HttpRequest {
    let mut request = HttpRequest::get(["settings", "list"]).query("scope", scope.as_str());
    if let Some(scope_id) = normalize_scope_id(scope_id) {
        request = request.query("scopeId", scope_id);
    }
    request
}

/// `POST /settings` creating `key` at `(scope, scope_id)`
pub fn create_request(
    scope: SettingsScope,
    scope_id: Option<&str>,
    key: &str,
    value: Value,
    metadata: Option<Value>,
) -> HttpRequest {
    let mut body = json!({
        "scope": scope,
        "key": key,
        "value": value,
    });
    if let Some(scope_id) = normalize_scope_id(scope_id) {
        body["scopeId"] = Value::String(scope_id.to_string());
    }
    if let Some(metadata) = metadata {
        body["metadata"] = metadata;
    }
    HttpRequest::post(["settings"]).json(body)
}

/// `DELETE /settings/{id}`
pub fn delete_request(id: &Uuid) -> HttpRequest {
    HttpRequest::delete(["settings".to_string(), id.to_string()])
}
