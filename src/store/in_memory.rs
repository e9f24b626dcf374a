//! In-memory [`Store`] implementation.
//!
//! Backs the crate's own unit and property tests so the dispatch pipeline's logic (quota
//! checks, the waterfall, system prompt injection, relay rewriting) can be exercised without a
//! live Redis instance. Mirrors the concurrent-`HashMap`-behind-a-lock shape used for request
//! storage elsewhere in this codebase, generalized to the handful of entities this store
//! needs: key records, profiles, backup profiles, settings, model configs, announcements, and
//! raw concurrency counters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::errors::{Error, Result};

use super::{
    AcquireOutcome, Announcement, BackupProfile, GlobalSettings, IncrementResult, KeyRecord, ModelConfig, Profile, Store, UsageCheck,
    UsageDenialReason, UsageToday,
};

struct Counter {
    value: i64,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    keys: HashMap<String, KeyRecord>,
    settings: Option<GlobalSettings>,
    profiles: Vec<Profile>,
    backups: Vec<BackupProfile>,
    model_configs: HashMap<String, ModelConfig>,
    announcements: Vec<Announcement>,
    counters: HashMap<String, Counter>,
    /// `(token, conversation_id, observed_at)` of the last counted turn, for the dedup window
    /// a real caller enforces in `increment_usage`. Kept here rather than in `KeyRecord` so
    /// tests can inspect it independently of the stored record.
    last_turn: HashMap<String, (String, Instant)>,
}

/// Test double for [`Store`]. All state lives behind a `parking_lot::RwLock` in memory and is
/// lost when the value is dropped.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
    conversation_window: Duration,
}

impl InMemoryStore {
    pub fn new(conversation_window: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            conversation_window,
        }
    }

    pub fn insert_key(&self, token: impl Into<String>, record: KeyRecord) {
        self.inner.write().keys.insert(token.into(), record);
    }

    pub fn set_settings(&self, settings: GlobalSettings) {
        self.inner.write().settings = Some(settings);
    }

    pub fn set_profiles(&self, profiles: Vec<Profile>) {
        self.inner.write().profiles = profiles;
    }

    pub fn set_backup_profiles(&self, backups: Vec<BackupProfile>) {
        self.inner.write().backups = backups;
    }

    pub fn set_model_configs(&self, configs: HashMap<String, ModelConfig>) {
        self.inner.write().model_configs = configs;
    }

    pub fn set_announcements(&self, announcements: Vec<Announcement>) {
        self.inner.write().announcements = announcements;
    }

    fn counter_value(inner: &Inner, source_id: &str) -> i64 {
        match inner.counters.get(source_id) {
            Some(c) if c.expires_at.is_none_or(|at| at > Instant::now()) => c.value,
            _ => 0,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl Store for InMemoryStore {
    async fn get_key(&self, token: &str) -> Result<KeyRecord> {
        let today = Utc::now().date_naive();
        let mut inner = self.inner.write();
        let record = inner.keys.get_mut(token).ok_or(Error::InvalidApiKey)?;
        if record.usage_today.date != today {
            record.usage_today = UsageToday { date: today, count: 0 };
        }
        Ok(record.clone())
    }

    async fn check_usage(&self, token: &str) -> Result<UsageCheck> {
        let inner = self.inner.read();
        let record = inner.keys.get(token).ok_or(Error::InvalidApiKey)?;
        let today = Utc::now().date_naive();
        let current = if record.usage_today.date == today { record.usage_today.count } else { 0 };
        if record.is_expired(today) {
            return Ok(UsageCheck {
                allowed: false,
                current,
                limit: record.daily_limit,
                reason: Some(UsageDenialReason::InvalidKey),
            });
        }
        Ok(UsageCheck {
            allowed: current < record.daily_limit,
            current,
            limit: record.daily_limit,
            reason: (current >= record.daily_limit).then_some(UsageDenialReason::DailyLimitReached),
        })
    }

    async fn increment_usage(&self, token: &str, conversation_id: Option<&str>) -> Result<IncrementResult> {
        let mut inner = self.inner.write();
        let today = Utc::now().date_naive();

        let should_increment = match conversation_id {
            None => true,
            Some(cid) => match inner.last_turn.get(token) {
                Some((last_cid, at)) if last_cid == cid && at.elapsed() < self.conversation_window => false,
                _ => true,
            },
        };

        if let Some(cid) = conversation_id {
            inner.last_turn.insert(token.to_string(), (cid.to_string(), Instant::now()));
        }

        let record = inner.keys.get_mut(token).ok_or(Error::InvalidApiKey)?;
        if record.usage_today.date != today {
            record.usage_today = UsageToday { date: today, count: 0 };
        }

        let limit = record.daily_limit;
        let allowed = record.usage_today.count < limit;
        if allowed && should_increment {
            record.usage_today.count += 1;
        }
        let current = record.usage_today.count;

        Ok(IncrementResult {
            allowed,
            current,
            limit,
            should_increment,
            reason: (!allowed).then_some(UsageDenialReason::DailyLimitReached),
        })
    }

    async fn get_settings(&self) -> Result<GlobalSettings> {
        self.inner
            .read()
            .settings
            .clone()
            .ok_or_else(|| Error::Store("no GlobalSettings configured".to_string()))
    }

    async fn get_profile(&self, id: Uuid) -> Result<Option<Profile>> {
        Ok(self.inner.read().profiles.iter().find(|p| p.id == id).cloned())
    }

    async fn list_profiles(&self) -> Result<Vec<Profile>> {
        Ok(self.inner.read().profiles.clone())
    }

    async fn list_backup_profiles(&self) -> Result<Vec<BackupProfile>> {
        Ok(self.inner.read().backups.clone())
    }

    async fn get_model_configs(&self) -> HashMap<String, ModelConfig> {
        self.inner.read().model_configs.clone()
    }

    async fn list_announcements(&self) -> Vec<Announcement> {
        self.inner.read().announcements.clone()
    }

    async fn try_acquire_concurrency(&self, source_id: &str, limit: u32, ttl_secs: u64) -> Result<AcquireOutcome> {
        if limit == 0 {
            return Ok(AcquireOutcome::Denied(Self::counter_value(&self.inner.read(), source_id)));
        }

        let mut inner = self.inner.write();
        let existing = Self::counter_value(&inner, source_id);
        let next = existing + 1;

        if next > limit as i64 {
            return Ok(AcquireOutcome::Denied(existing));
        }

        let created = !matches!(inner.counters.get(source_id), Some(c) if c.expires_at.is_none_or(|at| at > Instant::now()));
        let expires_at = if created {
            Some(Instant::now() + Duration::from_secs(ttl_secs))
        } else {
            inner.counters.get(source_id).and_then(|c| c.expires_at)
        };
        inner.counters.insert(source_id.to_string(), Counter { value: next, expires_at });
        Ok(AcquireOutcome::Acquired(next))
    }

    async fn decr_concurrency(&self, source_id: &str) {
        let mut inner = self.inner.write();
        let current = Self::counter_value(&inner, source_id);
        let next = (current - 1).max(0);
        if let Some(counter) = inner.counters.get_mut(source_id) {
            counter.value = next;
        }
    }

    async fn read_concurrency(&self, source_id: &str) -> Result<i64> {
        Ok(Self::counter_value(&self.inner.read(), source_id))
    }

    fn invalidate_settings(&self) {}
    fn invalidate_profiles(&self) {}
    fn invalidate_backups(&self) {}
    fn invalidate_model_configs(&self) {}

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn key_record(limit: u64, count: u64) -> KeyRecord {
        KeyRecord {
            expiry: Utc::now().date_naive() + ChronoDuration::days(1),
            daily_limit: limit,
            usage_today: UsageToday { date: Utc::now().date_naive(), count },
            selected_model: None,
            selected_api_profile_id: None,
            last_request_timestamp: None,
            last_conversation_id: None,
        }
    }

    #[tokio::test]
    async fn check_usage_denies_at_limit() {
        let store = InMemoryStore::default();
        store.insert_key("tok", key_record(5, 5));
        let check = store.check_usage("tok").await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.reason, Some(UsageDenialReason::DailyLimitReached));
    }

    #[tokio::test]
    async fn increment_usage_dedups_within_conversation_window() {
        let store = InMemoryStore::new(Duration::from_secs(60));
        store.insert_key("tok", key_record(10, 0));

        let first = store.increment_usage("tok", Some("conv-1")).await.unwrap();
        assert!(first.should_increment);
        assert_eq!(first.current, 1);

        let second = store.increment_usage("tok", Some("conv-1")).await.unwrap();
        assert!(!second.should_increment);
        assert_eq!(second.current, 1);

        let third = store.increment_usage("tok", Some("conv-2")).await.unwrap();
        assert!(third.should_increment);
        assert_eq!(third.current, 2);
    }

    #[tokio::test]
    async fn concurrency_counter_never_goes_negative() {
        let store = InMemoryStore::default();
        store.decr_concurrency("default").await;
        assert_eq!(store.read_concurrency("default").await.unwrap(), 0);

        store.try_acquire_concurrency("default", 5, 600).await.unwrap();
        store.try_acquire_concurrency("default", 5, 600).await.unwrap();
        store.decr_concurrency("default").await;
        store.decr_concurrency("default").await;
        store.decr_concurrency("default").await;
        assert_eq!(store.read_concurrency("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn try_acquire_with_zero_limit_denies_without_mutation() {
        let store = InMemoryStore::default();
        assert_eq!(store.try_acquire_concurrency("disabled", 0, 600).await.unwrap(), AcquireOutcome::Denied(0));
        assert_eq!(store.read_concurrency("disabled").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn get_key_rolls_stale_usage_date_forward() {
        let store = InMemoryStore::default();
        let mut record = key_record(10, 7);
        record.usage_today.date = Utc::now().date_naive() - ChronoDuration::days(1);
        store.insert_key("tok", record);

        let fetched = store.get_key("tok").await.unwrap();
        assert_eq!(fetched.usage_today.count, 0);
        assert_eq!(fetched.usage_today.date, Utc::now().date_naive());

        // roll is persisted, not just returned
        let fetched_again = store.get_key("tok").await.unwrap();
        assert_eq!(fetched_again.usage_today.count, 0);
    }

    #[tokio::test]
    async fn try_acquire_denies_and_rolls_back_at_limit() {
        let store = InMemoryStore::default();
        assert_eq!(
            store.try_acquire_concurrency("default", 1, 600).await.unwrap(),
            AcquireOutcome::Acquired(1)
        );
        assert_eq!(
            store.try_acquire_concurrency("default", 1, 600).await.unwrap(),
            AcquireOutcome::Denied(1)
        );
        assert_eq!(store.read_concurrency("default").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn get_key_unknown_token_is_invalid_api_key() {
        let store = InMemoryStore::default();
        assert!(matches!(store.get_key("missing").await, Err(Error::InvalidApiKey)));
    }
}
