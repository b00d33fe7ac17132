//! # Settings Client (settings-client)
//!
//! Client-side data access for hierarchically scoped settings served over HTTP.
//!
//! ## Features
//!
//! - Conditional reads with `If-None-Match` / `ETag` / `304 Not Modified`
//! - Single-flight: concurrent reads of one key share one round trip
//! - Stale-on-error fallback when the network fails
//! - Scope hierarchy resolution (`CONTACT_ROLE → ACCOUNT → TERRITORY → TENANT → GLOBAL`)
//!   driven entirely by the server's answer
//! - Optimistic-concurrency writes with `If-Match`, recovering from one `412`
//!   automatically and reporting anything beyond that
//! - Read-through facade with an explicit freshness policy
//! - Create and delete drop every cached lookup of the affected key
//!
//! ## Reading Settings
//!
//! ```no_run
//! use settings_client::{ClientConfig, SettingsClient, SettingsContext, SettingsScope};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = SettingsClient::new(ClientConfig::default())?;
//!
//!     if let Some(theme) = client.fetch_setting("ui.theme", SettingsScope::Global, None).await? {
//!         println!("Theme: {}", theme.value);
//!     }
//!
//!     let context = SettingsContext::new().tenant_id("t-1").territory("CH");
//!     if let Some(tax) = client.resolve_setting("tax.config", &context).await? {
//!         println!("{} (matched at {})", tax.value(), tax.matched_scope);
//!     }
//!
//!     println!("{}", client.cache_stats().await);
//!     Ok(())
//! }
//! ```
//!
//! ## Writing with Conflict Detection
//!
//! ```no_run
//! use serde_json::json;
//! use settings_client::{ClientError, ResourceVersion, SettingsClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = SettingsClient::from_env()?;
//!
//!     match client
//!         .submit_with_concurrency_control("42", ResourceVersion::Number(5), json!({"body": "Looks good"}))
//!         .await
//!     {
//!         Ok(report) => println!("Committed as {:?}", report.committed_version),
//!         Err(ClientError::PreconditionFailed(conflict)) => {
//!             println!("Someone else edited thread {}: {:?}", conflict.resource_id, conflict.current);
//!         }
//!         Err(e) => return Err(e.into()),
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod mutation;
pub mod read_through;
pub mod resolve;
pub mod settings;
pub mod transport;

pub use cache::{CacheStats, CacheStore, Freshness, FreshnessPolicy};
pub use client::SettingsClient;
pub use config::{ClientConfig, ClientConfigBuilder};
pub use error::{ClientError, Result};
pub use fetch::ConditionalFetcher;
pub use mutation::{
    ConflictReport, MutationAttempt, MutationCoordinator, MutationReport, MutationState,
    MutationTarget, ResourceVersion, SettingUpdate, ThreadReply, VersionedResource,
};
pub use read_through::ReadThroughCache;
pub use resolve::ScopeHierarchyResolver;
pub use settings::{ResolvedSetting, Setting, SettingsContext, SettingsScope};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
