//! Store Client: typed operations over the remote key-value store (§4.1).
//!
//! All persistent state — `KeyRecord`, `Profile`, `BackupProfile`, `GlobalSettings`,
//! `ModelConfig`, `Announcement` — lives in a single remote KV store (strings holding JSON,
//! plus integer counters supporting `INCR`/`DECR`/`EXPIRE`). The core only ever writes
//! `KeyRecord.usage_today`, `KeyRecord.last_conversation_id`,
//! `KeyRecord.last_request_timestamp`, and the `concurrency:{sourceId}` counters; every other
//! entity is owned by the admin surface.
//!
//! [`Store`] is the seam: [`RedisStore`] is the production implementation, [`InMemoryStore`]
//! is a test double used by the rest of the crate's unit and property tests so P1–P10 (§8 of
//! the base spec) can be checked without a live Redis instance.

pub mod in_memory;
pub mod redis_store;

use std::collections::HashMap;
use std::future::Future;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{Error, Result};

pub use in_memory::InMemoryStore;
pub use redis_store::RedisStore;

/// System prompt injection format, see §4.5. `auto` is the default resolution when neither
/// the profile nor settings specify one explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemPromptFormat {
    Auto,
    Anthropic,
    Openai,
    Both,
    UserMessage,
    InjectFirstUser,
    Disabled,
}

impl Default for SystemPromptFormat {
    fn default() -> Self {
        Self::Auto
    }
}

/// One caller API key's daily-quota and pinned-source state.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeyRecord {
    pub expiry: NaiveDate,
    pub daily_limit: u64,
    pub usage_today: UsageToday,
    #[serde(default)]
    pub selected_model: Option<String>,
    #[serde(default)]
    pub selected_api_profile_id: Option<Uuid>,
    #[serde(default)]
    pub last_request_timestamp: Option<i64>,
    #[serde(default)]
    pub last_conversation_id: Option<String>,
}

impl KeyRecord {
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.expiry < today
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UsageToday {
    pub date: NaiveDate,
    pub count: u64,
}

/// Backend descriptor. `BackupProfile` adds a `concurrency_limit` and is stored as an
/// ordered sequence, where storage order IS fallback priority.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Profile {
    pub id: Uuid,
    pub name: String,
    pub api_key: String,
    pub api_url: String,
    #[serde(default)]
    pub model_actual: Option<String>,
    #[serde(default)]
    pub model_display: Option<String>,
    pub is_active: bool,
    #[serde(default)]
    pub disable_system_prompt_injection: Option<bool>,
    #[serde(default)]
    pub system_prompt_format: Option<SystemPromptFormat>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackupProfile {
    #[serde(flatten)]
    pub profile: Profile,
    pub concurrency_limit: u32,
}

/// Singleton default-source configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalSettings {
    pub api_url: String,
    pub api_key: String,
    pub model_display: String,
    pub model_actual: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub concurrency_limit: Option<u32>,
    #[serde(default)]
    pub system_prompt_format: Option<SystemPromptFormat>,
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    pub name: String,
    pub system_prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnouncementKind {
    Info,
    Warning,
    Error,
    Success,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Announcement {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: AnnouncementKind,
    pub priority: i32,
    pub is_active: bool,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a non-mutating quota pre-check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageCheck {
    pub allowed: bool,
    pub current: u64,
    pub limit: u64,
    pub reason: Option<UsageDenialReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageDenialReason {
    DailyLimitReached,
    InvalidKey,
}

/// Result of the deferred, dedup-aware increment in §4.3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementResult {
    pub allowed: bool,
    pub current: u64,
    pub limit: u64,
    pub should_increment: bool,
    pub reason: Option<UsageDenialReason>,
}

/// Outcome of an atomic try-acquire against a `concurrency:{sourceId}` counter (§4.2).
/// The observed count is the value immediately after the attempt: post-increment when
/// acquired, pre-rollback when denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(i64),
    Denied(i64),
}

/// Key-value store operations the dispatch engine needs. Implemented by [`RedisStore`] for
/// production and [`InMemoryStore`] for tests.
///
/// Failure semantics (§4.1): any error from `get_key`, `check_usage`, `increment_usage`,
/// `get_settings`, `get_profile`, `list_profiles`, or `list_backup_profiles` is fatal to the
/// request. `get_model_configs` and `list_announcements` degrade to an empty result on error
/// instead of failing the request. `decr_concurrency` is best-effort and never returns an
/// error to its caller.
pub trait Store: Clone + Send + Sync + 'static {
    fn get_key(&self, token: &str) -> impl Future<Output = Result<KeyRecord>> + Send;

    fn check_usage(&self, token: &str) -> impl Future<Output = Result<UsageCheck>> + Send;

    fn increment_usage(&self, token: &str, conversation_id: Option<&str>) -> impl Future<Output = Result<IncrementResult>> + Send;

    fn get_settings(&self) -> impl Future<Output = Result<GlobalSettings>> + Send;

    fn get_profile(&self, id: Uuid) -> impl Future<Output = Result<Option<Profile>>> + Send;

    fn list_profiles(&self) -> impl Future<Output = Result<Vec<Profile>>> + Send;

    fn list_backup_profiles(&self) -> impl Future<Output = Result<Vec<BackupProfile>>> + Send;

    fn get_model_configs(&self) -> impl Future<Output = HashMap<String, ModelConfig>> + Send;

    fn list_announcements(&self) -> impl Future<Output = Vec<Announcement>> + Send;

    /// Atomically increment the counter at `concurrency:{source_id}`, rolling the increment
    /// back if it would exceed `limit`, and setting `ttl_secs` on the key if this call
    /// created it. `limit == 0` means the source is disabled for acquisition: returns
    /// `AcquireOutcome::Denied` without mutating the counter (§4.2).
    fn try_acquire_concurrency(&self, source_id: &str, limit: u32, ttl_secs: u64) -> impl Future<Output = Result<AcquireOutcome>> + Send;

    /// Best-effort decrement; never propagates failure (§4.1, §7).
    fn decr_concurrency(&self, source_id: &str) -> impl Future<Output = ()> + Send;

    /// Non-mutating read of the raw counter.
    fn read_concurrency(&self, source_id: &str) -> impl Future<Output = Result<i64>> + Send;

    fn invalidate_settings(&self);
    fn invalidate_profiles(&self);
    fn invalidate_backups(&self);
    fn invalidate_model_configs(&self);

    /// Liveness check backing `/healthz`: verifies connectivity to the underlying store
    /// without touching any cache.
    fn ping(&self) -> impl Future<Output = Result<()>> + Send;
}

impl GlobalSettings {
    /// Applies the environment-level fallbacks (§6): an operator-configured primary backend
    /// key stands in for `api_key` when the stored settings leave it unset, and a default
    /// upstream base URL stands in for `api_url` the same way. The stored settings always win
    /// when they specify a value.
    pub fn with_fallbacks(mut self, primary_backend_api_key: Option<&str>, default_upstream_base_url: Option<&str>) -> Self {
        if self.api_key.is_empty() {
            if let Some(key) = primary_backend_api_key {
                self.api_key = key.to_string();
            }
        }
        if self.api_url.is_empty() {
            if let Some(url) = default_upstream_base_url {
                self.api_url = url.to_string();
            }
        }
        self
    }
}

pub(crate) fn store_error(context: &str, err: impl std::fmt::Display) -> Error {
    Error::Store(format!("{context}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(api_key: &str, api_url: &str) -> GlobalSettings {
        GlobalSettings {
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            model_display: "Display".to_string(),
            model_actual: "m-default".to_string(),
            system_prompt: None,
            concurrency_limit: None,
            system_prompt_format: None,
            models: Default::default(),
        }
    }

    #[test]
    fn fallbacks_fill_in_only_unset_fields() {
        let resolved = settings("", "").with_fallbacks(Some("sk-fallback"), Some("https://fallback"));
        assert_eq!(resolved.api_key, "sk-fallback");
        assert_eq!(resolved.api_url, "https://fallback");
    }

    #[test]
    fn stored_settings_win_over_fallbacks() {
        let resolved = settings("sk-stored", "https://stored").with_fallbacks(Some("sk-fallback"), Some("https://fallback"));
        assert_eq!(resolved.api_key, "sk-stored");
        assert_eq!(resolved.api_url, "https://stored");
    }
}
