//! Production [`Store`] backed by Redis (or any RESP-compatible KV store).
//!
//! Every entity lives at a well-known key (§6): the caller token itself for `KeyRecord`,
//! `__proxy_settings__` for `GlobalSettings`, `__api_profiles__` for the profile map,
//! `__backup_profiles__` for the ordered backup sequence, `__announcements__` for the
//! announcement list, and `concurrency:{sourceId}` for the atomic in-flight counters. Reads
//! of the read-mostly configuration entities are memoized in per-process `moka` caches keyed
//! by TTL (§4.1); admin mutations are expected to call the matching `invalidate_*` so a single
//! process never serves data past its own writes, though cross-process staleness still relies
//! on the TTL (§9).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use moka::future::Cache;
use redis::AsyncCommands;
use redis::Script;
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::metrics::DispatchMetrics;

use super::{
    AcquireOutcome, Announcement, BackupProfile, GlobalSettings, IncrementResult, KeyRecord, ModelConfig, Profile, Store, UsageCheck,
    UsageDenialReason, UsageToday, store_error,
};

const SETTINGS_KEY: &str = "__proxy_settings__";
const PROFILES_KEY: &str = "__api_profiles__";
const BACKUP_PROFILES_KEY: &str = "__backup_profiles__";
const ANNOUNCEMENTS_KEY: &str = "__announcements__";

/// Atomically INCR the concurrency counter, set a TTL if this call created it, and roll the
/// increment back if it now exceeds the limit. Returns `{allowed: 0|1, value}`.
const TRY_ACQUIRE_SCRIPT: &str = r#"
local v = redis.call('INCR', KEYS[1])
if v == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
if v > tonumber(ARGV[1]) then
    redis.call('DECR', KEYS[1])
    return {0, v - 1}
end
return {1, v}
"#;

/// Atomically DECR, clamping to 0 if the result went negative (defensive, §4.2).
const RELEASE_SCRIPT: &str = r#"
local v = redis.call('DECR', KEYS[1])
if v < 0 then
    redis.call('SET', KEYS[1], 0)
    return 0
end
return v
"#;

#[derive(Clone)]
pub struct CacheTtls {
    pub settings: Duration,
    pub profiles: Duration,
    pub backups: Duration,
    pub model_configs: Duration,
}

/// Redis-backed [`Store`]. Cheaply `Clone`: the pool and caches are all reference-counted.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    metrics: Option<Arc<DispatchMetrics>>,
    settings_cache: Cache<(), GlobalSettings>,
    profiles_cache: Cache<(), Arc<HashMap<Uuid, Profile>>>,
    backups_cache: Cache<(), Arc<Vec<BackupProfile>>>,
    model_configs_cache: Cache<(), Arc<HashMap<String, ModelConfig>>>,
    conversation_window_ms: i64,
}

impl RedisStore {
    pub fn connect(url: &str, pool_size: usize, ttls: CacheTtls, conversation_window_ms: i64) -> anyhow::Result<Self> {
        let mut cfg = PoolConfig::from_url(url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(pool_size));
        let pool = cfg.create_pool(Some(Runtime::Tokio1))?;

        Ok(Self {
            pool,
            metrics: None,
            settings_cache: Cache::builder().time_to_live(ttls.settings).max_capacity(1).build(),
            profiles_cache: Cache::builder().time_to_live(ttls.profiles).max_capacity(1).build(),
            backups_cache: Cache::builder().time_to_live(ttls.backups).max_capacity(1).build(),
            model_configs_cache: Cache::builder().time_to_live(ttls.model_configs).max_capacity(1).build(),
            conversation_window_ms,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<DispatchMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn record_cache(&self, cache: &str, hit: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_lookup(cache, hit);
        }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|e| store_error("redis pool", e))
    }

    /// Reads a key record, applying the one-shot legacy migration (§4.1): records that
    /// predate `daily_limit` get a default of 100, or `legacy_max * 50` if a numeric legacy
    /// activation/ip-limit hint is present under `legacy_max_requests`.
    fn parse_key_record(raw: &str) -> Result<KeyRecord> {
        let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| store_error("parse KeyRecord", e))?;
        if value.get("daily_limit").is_some() {
            return serde_json::from_value(value).map_err(|e| store_error("parse KeyRecord", e));
        }

        let legacy_max = value.get("legacy_max_requests").and_then(|v| v.as_u64());
        let daily_limit = legacy_max.map(|m| m * 50).unwrap_or(100);

        let mut migrated = value;
        migrated["daily_limit"] = serde_json::json!(daily_limit);
        if migrated.get("usage_today").is_none() {
            migrated["usage_today"] = serde_json::json!({"date": chrono::Utc::now().date_naive(), "count": 0});
        }
        serde_json::from_value(migrated).map_err(|e| store_error("parse migrated KeyRecord", e))
    }
}

impl Store for RedisStore {
    async fn get_key(&self, token: &str) -> Result<KeyRecord> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(token).await.map_err(|e| store_error("GET key", e))?;
        let raw = raw.ok_or(Error::InvalidApiKey)?;
        let mut record = Self::parse_key_record(&raw)?;

        let today = chrono::Utc::now().date_naive();
        if record.usage_today.date != today {
            record.usage_today = UsageToday { date: today, count: 0 };
            let serialized = serde_json::to_string(&record).map_err(|e| store_error("serialize KeyRecord", e))?;
            let _: () = conn.set(token, serialized).await.map_err(|e| store_error("SET rolled KeyRecord", e))?;
        }

        Ok(record)
    }

    async fn check_usage(&self, token: &str) -> Result<UsageCheck> {
        let record = self.get_key(token).await;
        let record = match record {
            Ok(r) => r,
            Err(Error::InvalidApiKey) => {
                return Ok(UsageCheck {
                    allowed: false,
                    current: 0,
                    limit: 0,
                    reason: Some(UsageDenialReason::InvalidKey),
                });
            }
            Err(e) => return Err(e),
        };

        let current = record.usage_today.count;
        Ok(UsageCheck {
            allowed: current < record.daily_limit,
            current,
            limit: record.daily_limit,
            reason: (current >= record.daily_limit).then_some(UsageDenialReason::DailyLimitReached),
        })
    }

    async fn increment_usage(&self, token: &str, conversation_id: Option<&str>) -> Result<IncrementResult> {
        let mut record = self.get_key(token).await?;

        if record.usage_today.count >= record.daily_limit {
            return Ok(IncrementResult {
                allowed: false,
                current: record.usage_today.count,
                limit: record.daily_limit,
                should_increment: false,
                reason: Some(UsageDenialReason::DailyLimitReached),
            });
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let should_increment = match (conversation_id, &record.last_conversation_id, record.last_request_timestamp) {
            (Some(cid), Some(last_cid), Some(last_ts)) if cid == last_cid && now_ms - last_ts < self.conversation_window_ms => false,
            _ => true,
        };

        if should_increment {
            record.usage_today.count += 1;
        }
        if let Some(cid) = conversation_id {
            record.last_conversation_id = Some(cid.to_string());
            record.last_request_timestamp = Some(now_ms);
        }

        let serialized = serde_json::to_string(&record).map_err(|e| store_error("serialize KeyRecord", e))?;
        let mut conn = self.conn().await?;
        let _: () = conn.set(token, serialized).await.map_err(|e| store_error("SET incremented KeyRecord", e))?;

        Ok(IncrementResult {
            allowed: true,
            current: record.usage_today.count,
            limit: record.daily_limit,
            should_increment,
            reason: None,
        })
    }

    async fn get_settings(&self) -> Result<GlobalSettings> {
        if let Some(cached) = self.settings_cache.get(&()).await {
            self.record_cache("settings", true);
            return Ok(cached);
        }
        self.record_cache("settings", false);

        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(SETTINGS_KEY).await.map_err(|e| store_error("GET settings", e))?;
        let raw = raw.ok_or_else(|| Error::Store("no GlobalSettings configured".to_string()))?;
        let settings: GlobalSettings = serde_json::from_str(&raw).map_err(|e| store_error("parse GlobalSettings", e))?;

        self.settings_cache.insert((), settings.clone()).await;
        Ok(settings)
    }

    async fn get_profile(&self, id: Uuid) -> Result<Option<Profile>> {
        let profiles = self.load_profiles().await?;
        Ok(profiles.get(&id).cloned())
    }

    async fn list_profiles(&self) -> Result<Vec<Profile>> {
        let profiles = self.load_profiles().await?;
        Ok(profiles.values().cloned().collect())
    }

    async fn list_backup_profiles(&self) -> Result<Vec<BackupProfile>> {
        if let Some(cached) = self.backups_cache.get(&()).await {
            self.record_cache("backups", true);
            return Ok((*cached).clone());
        }
        self.record_cache("backups", false);

        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(BACKUP_PROFILES_KEY).await.map_err(|e| store_error("GET backup profiles", e))?;
        let backups: Vec<BackupProfile> = match raw {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| store_error("parse backup profiles", e))?,
            None => Vec::new(),
        };

        self.backups_cache.insert((), Arc::new(backups.clone())).await;
        Ok(backups)
    }

    async fn get_model_configs(&self) -> HashMap<String, ModelConfig> {
        if let Some(cached) = self.model_configs_cache.get(&()).await {
            self.record_cache("model_configs", true);
            return (*cached).clone();
        }
        self.record_cache("model_configs", false);

        // model_configs live inline on GlobalSettings.models rather than a second top-level
        // key, so this piggybacks on the (itself cached) settings read.
        match self.get_settings().await {
            Ok(settings) => {
                self.model_configs_cache.insert((), Arc::new(settings.models.clone())).await;
                settings.models
            }
            Err(_) => HashMap::new(),
        }
    }

    async fn list_announcements(&self) -> Vec<Announcement> {
        let Ok(mut conn) = self.conn().await else {
            return Vec::new();
        };
        let raw: Option<String> = conn.get(ANNOUNCEMENTS_KEY).await.unwrap_or(None);
        match raw {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    async fn try_acquire_concurrency(&self, source_id: &str, limit: u32, ttl_secs: u64) -> Result<AcquireOutcome> {
        if limit == 0 {
            let current = self.read_concurrency(source_id).await?;
            return Ok(AcquireOutcome::Denied(current));
        }

        let key = format!("concurrency:{source_id}");
        let mut conn = self.conn().await?;
        let (allowed, value): (i64, i64) = Script::new(TRY_ACQUIRE_SCRIPT)
            .key(&key)
            .arg(limit)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("try_acquire_concurrency", e))?;

        Ok(if allowed == 1 { AcquireOutcome::Acquired(value) } else { AcquireOutcome::Denied(value) })
    }

    async fn decr_concurrency(&self, source_id: &str) {
        let key = format!("concurrency:{source_id}");
        let Ok(mut conn) = self.conn().await else {
            tracing::warn!(source_id, "decr_concurrency: failed to get connection");
            return;
        };
        if let Err(e) = Script::new(RELEASE_SCRIPT).key(&key).invoke_async::<i64>(&mut conn).await {
            tracing::warn!(source_id, error = %e, "decr_concurrency failed (best-effort, not propagated)");
        }
    }

    async fn read_concurrency(&self, source_id: &str) -> Result<i64> {
        let key = format!("concurrency:{source_id}");
        let mut conn = self.conn().await?;
        let value: Option<i64> = conn.get(&key).await.map_err(|e| store_error("GET concurrency counter", e))?;
        Ok(value.unwrap_or(0))
    }

    fn invalidate_settings(&self) {
        self.settings_cache.invalidate(&());
        self.model_configs_cache.invalidate(&());
    }

    fn invalidate_profiles(&self) {
        self.profiles_cache.invalidate(&());
    }

    fn invalidate_backups(&self) {
        self.backups_cache.invalidate(&());
    }

    fn invalidate_model_configs(&self) {
        self.model_configs_cache.invalidate(&());
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await.map_err(|e| store_error("PING", e))?;
        Ok(())
    }
}

impl RedisStore {
    async fn load_profiles(&self) -> Result<Arc<HashMap<Uuid, Profile>>> {
        if let Some(cached) = self.profiles_cache.get(&()).await {
            self.record_cache("profiles", true);
            return Ok(cached);
        }
        self.record_cache("profiles", false);

        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(PROFILES_KEY).await.map_err(|e| store_error("GET profiles", e))?;
        let profiles: HashMap<Uuid, Profile> = match raw {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| store_error("parse profiles", e))?,
            None => HashMap::new(),
        };

        let profiles = Arc::new(profiles);
        self.profiles_cache.insert((), profiles.clone()).await;
        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_current_schema_key_record_unchanged() {
        let raw = serde_json::json!({
            "expiry": "2099-01-01",
            "daily_limit": 50,
            "usage_today": {"date": "2026-07-28", "count": 3},
        })
        .to_string();
        let record = RedisStore::parse_key_record(&raw).unwrap();
        assert_eq!(record.daily_limit, 50);
        assert_eq!(record.usage_today.count, 3);
    }

    #[test]
    fn migrates_legacy_key_record_with_default_limit() {
        let raw = serde_json::json!({
            "expiry": "2099-01-01",
        })
        .to_string();
        let record = RedisStore::parse_key_record(&raw).unwrap();
        assert_eq!(record.daily_limit, 100);
        assert_eq!(record.usage_today.count, 0);
    }

    #[test]
    fn migrates_legacy_key_record_with_numeric_hint() {
        let raw = serde_json::json!({
            "expiry": "2099-01-01",
            "legacy_max_requests": 4,
        })
        .to_string();
        let record = RedisStore::parse_key_record(&raw).unwrap();
        assert_eq!(record.daily_limit, 200);
    }
}
