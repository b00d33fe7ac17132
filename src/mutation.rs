//! Optimistic-concurrency mutation coordinator
//!
//! Every write carries `If-Match` with the version the caller last saw. A
//! `412 Precondition Failed` triggers a bounded recovery loop:
//!
//! ```text
//! Pending ──2xx──────────────────────────────────────▶ Committed
//!    │
//!    └─412─▶ ConflictDetected ─re-read─▶ Retried ─2xx─▶ Committed
//!                    ▲                      │
//!                    └─────────412──────────┘  (budget left)
//!                    └──── budget spent ─────▶ Unresolved
//! ```
//!
//! The budget is `max_conflict_retries` (one by default). An unresolved
//! conflict is returned as [`ClientError::PreconditionFailed`] carrying the
//! latest server state so the caller can reconcile by hand.

use crate::cache::CacheStore;
use crate::error::{ClientError, Result};
use crate::settings::{key_tag, setting_request, Setting};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};
use async_trait::async_trait;
use reqwest::header::IF_MATCH;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Version token a write is conditioned on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceVersion {
    /// Monotonic counter, sent as `If-Match: "v{n}"`
    Number(i64),

    /// Opaque ETag, sent as-is (quoted if it is not already)
    Tag(String),
}

impl ResourceVersion {
    /// Value for the `If-Match` header
    pub fn if_match(&self) -> String {
        match self {
            ResourceVersion::Number(n) => format!("\"v{}\"", n),
            ResourceVersion::Tag(tag) if tag.starts_with('"') || tag.starts_with("W/") => {
                tag.clone()
            }
            ResourceVersion::Tag(tag) => format!("\"{}\"", tag),
        }
    }

    /// Parse a header value; `"v6"` and `v6` become `Number(6)`
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let unquoted = trimmed.trim_matches('"');
        unquoted
            .strip_prefix('v')
            .and_then(|n| n.parse::<i64>().ok())
            .map(ResourceVersion::Number)
            .unwrap_or_else(|| ResourceVersion::Tag(trimmed.to_string()))
    }

    /// Read a version from a JSON field (number or string)
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(ResourceVersion::Number),
            Value::String(s) if !s.trim().is_empty() => Some(Self::parse(s)),
            _ => None,
        }
    }
}

impl From<i64> for ResourceVersion {
    fn from(n: i64) -> Self {
        ResourceVersion::Number(n)
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.if_match())
    }
}

/// Lifecycle of one logical mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationState {
    Pending,
    ConflictDetected,
    Retried,
    Committed,
    Unresolved,
}

impl MutationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MutationState::Committed | MutationState::Unresolved)
    }
}

impl fmt::Display for MutationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MutationState::Pending => "pending",
            MutationState::ConflictDetected => "conflict_detected",
            MutationState::Retried => "retried",
            MutationState::Committed => "committed",
            MutationState::Unresolved => "unresolved",
        };
        f.write_str(s)
    }
}

/// One write sent to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationAttempt {
    pub resource_id: String,
    pub expected_version: ResourceVersion,
    pub payload: Value,

    /// 1 for the initial write, 2 for the first retry
    pub attempt_number: u32,
}

/// Server-side state of a resource as seen by a re-read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedResource {
    pub id: String,
    pub version: Option<ResourceVersion>,
    pub payload: Value,
}

/// Outcome of a committed mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationReport {
    pub resource_id: String,
    pub state: MutationState,

    /// Every state the mutation passed through, starting with `Pending`
    pub transitions: Vec<MutationState>,

    pub attempts: Vec<MutationAttempt>,

    /// Version reported by the server for the committed write
    pub committed_version: Option<ResourceVersion>,

    /// Response body of the committed write
    pub response: Option<Value>,
}

impl MutationReport {
    fn new(resource_id: &str) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            state: MutationState::Pending,
            transitions: vec![MutationState::Pending],
            attempts: Vec::new(),
            committed_version: None,
            response: None,
        }
    }

    fn transition(&mut self, state: MutationState) {
        debug!("Mutation of {}: {} -> {}", self.resource_id, self.state, state);
        self.state = state;
        self.transitions.push(state);
    }

    pub fn is_committed(&self) -> bool {
        self.state == MutationState::Committed
    }

    /// Number of `412` responses that were recovered from
    pub fn conflicts(&self) -> usize {
        self.transitions
            .iter()
            .filter(|s| **s == MutationState::ConflictDetected)
            .count()
    }
}

/// Details of a conflict automatic recovery could not resolve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub resource_id: String,

    /// Writes sent before giving up
    pub attempts: u32,

    /// Version the last rejected write was conditioned on
    pub attempted_version: ResourceVersion,

    /// Human-readable detail from the last `412` body
    pub detail: Option<String>,

    /// Latest known server state, when it could be read
    pub current: Option<VersionedResource>,

    /// The payload that was not applied
    pub payload: Value,
}

/// A kind of versioned resource the coordinator can write
#[async_trait]
pub trait MutationTarget: Send + Sync {
    /// Short name used for logging and lock keys
    fn name(&self) -> &str;

    /// Conditional write for `attempt`, including the `If-Match` header
    fn write_request(&self, attempt: &MutationAttempt) -> HttpRequest;

    /// Request that reads the current state of `resource_id`
    fn read_request(&self, resource_id: &str) -> HttpRequest;

    /// Extract the resource from a successful read
    fn parse_resource(&self, resource_id: &str, response: &HttpResponse) -> Option<VersionedResource> {
        let payload = response.json_value()?;
        let version = payload
            .get("version")
            .and_then(ResourceVersion::from_json)
            .or_else(|| response.etag().map(|etag| ResourceVersion::parse(&etag)));
        Some(VersionedResource {
            id: resource_id.to_string(),
            version,
            payload,
        })
    }

    /// Version the server assigned to a committed write
    fn committed_version(&self, response: &HttpResponse) -> Option<ResourceVersion> {
        response
            .json_value()
            .and_then(|body| body.get("version").and_then(ResourceVersion::from_json))
            .or_else(|| response.etag().map(|etag| ResourceVersion::parse(&etag)))
    }

    /// Hook run once a write committed
    async fn on_committed(&self, _resource_id: &str, _response: &HttpResponse) {}
}

/// `POST /threads/{id}/reply`, re-read through `GET /threads/{id}`
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadReply;

#[async_trait]
impl MutationTarget for ThreadReply {
    fn name(&self) -> &str {
        "thread"
    }

    fn write_request(&self, attempt: &MutationAttempt) -> HttpRequest {
        HttpRequest::post(["threads", attempt.resource_id.as_str(), "reply"])
            .header(IF_MATCH.as_str(), attempt.expected_version.if_match())
            .json(attempt.payload.clone())
    }

    fn read_request(&self, resource_id: &str) -> HttpRequest {
        HttpRequest::get(["threads", resource_id])
    }
}

/// `PUT /settings/{id}` with the setting's ETag.
///
/// Re-reads go through the direct settings lookup. A committed update drops
/// every cached lookup of the setting's key from `cache`.
pub struct SettingUpdate {
    setting: Setting,
    cache: Option<CacheStore<Setting>>,
}

impl SettingUpdate {
    pub fn new(setting: Setting) -> Self {
        Self {
            setting,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: CacheStore<Setting>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Version the update starts from: the setting's ETag, else its version counter
    pub fn expected_version(&self) -> Option<ResourceVersion> {
        self.setting
            .etag
            .as_deref()
            .map(|etag| ResourceVersion::Tag(etag.to_string()))
            .or_else(|| self.setting.version.map(ResourceVersion::Number))
    }

    fn tag_of(response: &HttpResponse) -> Option<ResourceVersion> {
        response
            .etag()
            .or_else(|| {
                response
                    .json_value()
                    .and_then(|body| body.get("etag").and_then(Value::as_str).map(str::to_string))
            })
            .map(ResourceVersion::Tag)
    }
}

#[async_trait]
impl MutationTarget for SettingUpdate {
    fn name(&self) -> &str {
        "setting"
    }

    fn write_request(&self, attempt: &MutationAttempt) -> HttpRequest {
        HttpRequest::put(["settings", attempt.resource_id.as_str()])
            .header(IF_MATCH.as_str(), attempt.expected_version.if_match())
            .json(attempt.payload.clone())
    }

    fn read_request(&self, _resource_id: &str) -> HttpRequest {
        setting_request(
            &self.setting.key,
            self.setting.scope,
            self.setting.scope_id.as_deref(),
        )
    }

    fn parse_resource(&self, resource_id: &str, response: &HttpResponse) -> Option<VersionedResource> {
        let payload = response.json_value()?;
        Some(VersionedResource {
            id: resource_id.to_string(),
            version: Self::tag_of(response),
            payload,
        })
    }

    fn committed_version(&self, response: &HttpResponse) -> Option<ResourceVersion> {
        Self::tag_of(response)
    }

    async fn on_committed(&self, _resource_id: &str, _response: &HttpResponse) {
        if let Some(cache) = &self.cache {
            cache.invalidate_by_tag(&key_tag(&self.setting.key)).await;
        }
    }
}

type LockTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Holds the per-resource lock; the table entry is removed with the last holder
struct ResourceLock {
    table: LockTable,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ResourceLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let unused = table
            .get(&self.key)
            .map(|lock| Arc::strong_count(lock) == 1)
            .unwrap_or(false);
        if unused {
            table.remove(&self.key);
        }
    }
}

/// Runs conditional writes through the conflict state machine
pub struct MutationCoordinator {
    transport: Arc<dyn HttpTransport>,
    max_conflict_retries: u32,
    locks: LockTable,
}

impl MutationCoordinator {
    pub fn new(transport: Arc<dyn HttpTransport>, max_conflict_retries: u32) -> Self {
        Self {
            transport,
            max_conflict_retries,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn max_conflict_retries(&self) -> u32 {
        self.max_conflict_retries
    }

    /// Resources with a mutation in flight or waiting
    pub fn locked_resources(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn acquire(&self, key: String) -> ResourceLock {
        let lock = {
            let mut table = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(
                table
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        let mut held = ResourceLock {
            table: Arc::clone(&self.locks),
            key,
            guard: None,
        };
        held.guard = Some(lock.lock_owned().await);
        held
    }

    /// Write `payload` to `resource_id`, conditioned on `expected_version`.
    ///
    /// Mutations of the same resource through this coordinator run one at a
    /// time. Dropping the returned future abandons the mutation; it is never
    /// reported as committed.
    pub async fn submit(
        &self,
        target: &dyn MutationTarget,
        resource_id: &str,
        expected_version: ResourceVersion,
        payload: Value,
    ) -> Result<MutationReport> {
        let _lock = self
            .acquire(format!("{}:{}", target.name(), resource_id))
            .await;

        let mut report = MutationReport::new(resource_id);
        let mut version = expected_version;

        loop {
            let attempt = MutationAttempt {
                resource_id: resource_id.to_string(),
                expected_version: version.clone(),
                payload: payload.clone(),
                attempt_number: report.attempts.len() as u32 + 1,
            };
            let request = target.write_request(&attempt);
            let context = request.describe();
            debug!(
                "{} (If-Match: {}, attempt {})",
                context, attempt.expected_version, attempt.attempt_number
            );
            report.attempts.push(attempt);

            let response = self.transport.send(request).await?;
            let status = response.status();

            if status.is_success() {
                report.committed_version = target.committed_version(&response);
                report.response = response.json_value();
                target.on_committed(resource_id, &response).await;
                report.transition(MutationState::Committed);
                info!(
                    "Committed {} {} after {} attempt(s)",
                    target.name(),
                    resource_id,
                    report.attempts.len()
                );
                return Ok(report);
            }

            if status != StatusCode::PRECONDITION_FAILED {
                return Err(classify_failure(status, &response, context));
            }

            report.transition(MutationState::ConflictDetected);
            let detail = conflict_detail(&response);
            let conflicts = report.conflicts() as u32;
            warn!(
                "Version conflict on {} {} at {} ({})",
                target.name(),
                resource_id,
                version,
                detail.as_deref().unwrap_or("no detail")
            );

            if conflicts > self.max_conflict_retries {
                let current = match self.reread(target, resource_id).await {
                    Ok(current) => current,
                    Err(e) => {
                        debug!("Re-read after final conflict failed: {}", e);
                        None
                    }
                }
                .or_else(|| version_from_conflict(resource_id, &response));
                return Err(self.unresolved(&mut report, version, detail, current, payload));
            }

            let current = match self.reread(target, resource_id).await {
                Ok(current) => current,
                Err(e) => {
                    warn!(
                        "Re-read of {} {} after conflict failed: {}",
                        target.name(),
                        resource_id,
                        e
                    );
                    return Err(e);
                }
            };

            let fresh_version = current.as_ref().and_then(|c| c.version.clone());
            match fresh_version {
                Some(fresh) => {
                    debug!("Retrying {} with server version {}", resource_id, fresh);
                    version = fresh;
                    report.transition(MutationState::Retried);
                }
                None => {
                    return Err(self.unresolved(&mut report, version, detail, current, payload));
                }
            }
        }
    }

    fn unresolved(
        &self,
        report: &mut MutationReport,
        attempted_version: ResourceVersion,
        detail: Option<String>,
        current: Option<VersionedResource>,
        payload: Value,
    ) -> ClientError {
        report.transition(MutationState::Unresolved);
        warn!(
            "Giving up on {} after {} attempt(s)",
            report.resource_id,
            report.attempts.len()
        );
        ClientError::PreconditionFailed(Box::new(ConflictReport {
            resource_id: report.resource_id.clone(),
            attempts: report.attempts.len() as u32,
            attempted_version,
            detail,
            current,
            payload,
        }))
    }

    async fn reread(
        &self,
        target: &dyn MutationTarget,
        resource_id: &str,
    ) -> Result<Option<VersionedResource>> {
        let request = target.read_request(resource_id);
        let context = request.describe();
        let response = self.transport.send(request).await?;

        match response.status() {
            StatusCode::OK => target
                .parse_resource(resource_id, &response)
                .map(Some)
                .ok_or_else(|| ClientError::Transport(format!("unparseable body from {}", context))),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(ClientError::UnexpectedStatus {
                status: status.as_u16(),
                context,
            }),
        }
    }
}

/// Error for a non-success write response: 5xx is transport, other 4xx is validation
pub(crate) fn classify_failure(
    status: StatusCode,
    response: &HttpResponse,
    context: String,
) -> ClientError {
    if status.is_server_error() {
        ClientError::Transport(format!("{} failed with {}", context, status))
    } else if status.is_client_error() {
        ClientError::Validation {
            status: status.as_u16(),
            detail: conflict_detail(response).unwrap_or_else(|| context.clone()),
        }
    } else {
        ClientError::UnexpectedStatus {
            status: status.as_u16(),
            context,
        }
    }
}

/// Human-readable detail from an error body (`detail`, `message` or `error`), or the raw text
fn conflict_detail(response: &HttpResponse) -> Option<String> {
    if let Some(body) = response.json_value() {
        let field = ["detail", "message", "error"]
            .iter()
            .find_map(|name| body.get(*name).and_then(Value::as_str));
        if let Some(detail) = field {
            return Some(detail.to_string());
        }
        if let Value::String(detail) = body {
            return Some(detail);
        }
    }

    let text = String::from_utf8_lossy(response.body()).trim().to_string();
    if text.is_empty() || text.starts_with('{') {
        None
    } else {
        Some(text)
    }
}

/// Current version advertised by a `412` body, if any
fn version_from_conflict(resource_id: &str, response: &HttpResponse) -> Option<VersionedResource> {
    let body = response.json_value()?;
    let version = ["currentVersion", "version"]
        .iter()
        .find_map(|name| body.get(*name).and_then(ResourceVersion::from_json))?;
    Some(VersionedResource {
        id: resource_id.to_string(),
        version: Some(version),
        payload: body,
    })
}
