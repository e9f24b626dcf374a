//! Source Selector (§4.4): the waterfall resolution of user-pinned profile → default →
//! ordered backups → queued-default overflow, with atomic concurrency accounting via the
//! [`crate::concurrency`] ledger.

use std::sync::Arc;

use crate::concurrency::{self, ConcurrencySlot};
use crate::errors::{Error, Result};
use crate::metrics::DispatchMetrics;
use crate::store::{GlobalSettings, KeyRecord, Store, SystemPromptFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Default,
    Profile,
    Backup,
}

impl SourceKind {
    /// Label used on the `source_kind` dimension of the dispatch-duration histogram.
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::Default => "default",
            SourceKind::Profile => "profile",
            SourceKind::Backup => "backup",
        }
    }
}

/// The resolved upstream for one request, paired with the concurrency slot (if any) that
/// must be released on every termination path.
pub struct ActiveSource<S: Store> {
    pub id: String,
    pub kind: SourceKind,
    pub api_url: String,
    pub api_key: String,
    pub model_actual: Option<String>,
    pub disable_system_prompt_injection: bool,
    pub system_prompt_format: SystemPromptFormat,
    pub slot: ConcurrencySlot<S>,
}

/// Runs the waterfall (§4.4 algorithm) against the given key record and current settings.
/// `default_limit`/`backup_limit` are the configured fallbacks applied when a settings/backup
/// record doesn't specify its own `concurrency_limit`. `lock_ttl_secs` is the stuck-lock TTL
/// set on a counter key the first time it's created (§4.2).
#[allow(clippy::too_many_arguments)]
pub async fn select<S: Store>(
    store: &S,
    key_record: &KeyRecord,
    settings: &GlobalSettings,
    default_limit: u32,
    backup_limit: u32,
    lock_ttl_secs: u64,
    metrics: Option<&Arc<DispatchMetrics>>,
) -> Result<ActiveSource<S>> {
    // Step 1: user-pinned profile bypasses the ledger entirely (§4.4, P5).
    if let Some(profile_id) = key_record.selected_api_profile_id {
        if let Some(profile) = store.get_profile(profile_id).await? {
            if profile.is_active {
                return Ok(ActiveSource {
                    id: profile.id.to_string(),
                    kind: SourceKind::Profile,
                    api_url: profile.api_url,
                    api_key: profile.api_key,
                    model_actual: profile.model_actual,
                    disable_system_prompt_injection: profile.disable_system_prompt_injection.unwrap_or(false),
                    system_prompt_format: profile.system_prompt_format.unwrap_or_default(),
                    slot: ConcurrencySlot::none(store.clone()),
                });
            }
        }
    }

    // Step 2a: default source.
    let has_default = !settings.api_url.is_empty();
    if has_default {
        let limit = settings.concurrency_limit.unwrap_or(default_limit);
        if let Some(slot) = concurrency::try_acquire(store, "default", limit, lock_ttl_secs, metrics).await? {
            return Ok(ActiveSource {
                id: "default".to_string(),
                kind: SourceKind::Default,
                api_url: settings.api_url.clone(),
                api_key: settings.api_key.clone(),
                model_actual: Some(settings.model_actual.clone()),
                disable_system_prompt_injection: false,
                system_prompt_format: settings.system_prompt_format.unwrap_or_default(),
                slot,
            });
        }
    }

    // Step 2b: backups, in stored order. Never reordered (tie-break rule, §4.4).
    for backup in store.list_backup_profiles().await? {
        if !backup.profile.is_active {
            continue;
        }
        let limit = if backup.concurrency_limit == 0 { backup_limit } else { backup.concurrency_limit };
        if let Some(slot) = concurrency::try_acquire(store, &backup.profile.id.to_string(), limit, lock_ttl_secs, metrics).await? {
            return Ok(ActiveSource {
                id: backup.profile.id.to_string(),
                kind: SourceKind::Backup,
                api_url: backup.profile.api_url,
                api_key: backup.profile.api_key,
                model_actual: backup.profile.model_actual,
                disable_system_prompt_injection: backup.profile.disable_system_prompt_injection.unwrap_or(false),
                system_prompt_format: backup.profile.system_prompt_format.unwrap_or_default(),
                slot,
            });
        }
    }

    // Step 2c: queued-default overflow escape hatch — forward anyway, no slot acquired.
    if has_default {
        return Ok(ActiveSource {
            id: "default".to_string(),
            kind: SourceKind::Default,
            api_url: settings.api_url.clone(),
            api_key: settings.api_key.clone(),
            model_actual: Some(settings.model_actual.clone()),
            disable_system_prompt_injection: false,
            system_prompt_format: settings.system_prompt_format.unwrap_or_default(),
            slot: ConcurrencySlot::none(store.clone()),
        });
    }

    Err(Error::NoSourceAvailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BackupProfile, InMemoryStore, Profile, UsageToday};
    use chrono::{Duration as ChronoDuration, Utc};
    use uuid::Uuid;

    fn key_record() -> KeyRecord {
        KeyRecord {
            expiry: Utc::now().date_naive() + ChronoDuration::days(1),
            daily_limit: 100,
            usage_today: UsageToday { date: Utc::now().date_naive(), count: 0 },
            selected_model: None,
            selected_api_profile_id: None,
            last_request_timestamp: None,
            last_conversation_id: None,
        }
    }

    fn settings(api_url: &str) -> GlobalSettings {
        GlobalSettings {
            api_url: api_url.to_string(),
            api_key: "sk-default".to_string(),
            model_display: "Display".to_string(),
            model_actual: "m-default".to_string(),
            system_prompt: None,
            concurrency_limit: Some(1),
            system_prompt_format: None,
            models: Default::default(),
        }
    }

    fn backup(id: Uuid, limit: u32) -> BackupProfile {
        BackupProfile {
            profile: Profile {
                id,
                name: "backup".to_string(),
                api_key: "sk-backup".to_string(),
                api_url: "https://backup".to_string(),
                model_actual: None,
                model_display: None,
                is_active: true,
                disable_system_prompt_injection: None,
                system_prompt_format: None,
                capabilities: vec![],
            },
            concurrency_limit: limit,
        }
    }

    #[tokio::test]
    async fn selects_default_when_available() {
        let store = InMemoryStore::default();
        let source = select(&store, &key_record(), &settings("https://default"), 100, 10, 600, None).await.unwrap();
        assert_eq!(source.kind, SourceKind::Default);
        assert_eq!(source.slot.owner_id(), Some("default"));
    }

    #[tokio::test]
    async fn falls_through_to_backups_in_order_when_default_saturated() {
        let store = InMemoryStore::default();
        let b1 = Uuid::new_v4();
        let b2 = Uuid::new_v4();
        store.set_backup_profiles(vec![backup(b1, 1), backup(b2, 1)]);

        let settings = settings("https://default");
        // saturate default
        let _holder = select(&store, &key_record(), &settings, 100, 10, 600, None).await.unwrap();

        let second = select(&store, &key_record(), &settings, 100, 10, 600, None).await.unwrap();
        assert_eq!(second.kind, SourceKind::Backup);
        assert_eq!(second.id, b1.to_string());
    }

    #[tokio::test]
    async fn queues_onto_default_when_all_backups_saturated() {
        let store = InMemoryStore::default();
        let settings = settings("https://default");
        let _default_holder = select(&store, &key_record(), &settings, 100, 10, 600, None).await.unwrap();

        let queued = select(&store, &key_record(), &settings, 100, 10, 600, None).await.unwrap();
        assert_eq!(queued.kind, SourceKind::Default);
        assert!(queued.slot.owner_id().is_none());
    }

    #[tokio::test]
    async fn no_source_available_without_default_or_usable_backup() {
        let store = InMemoryStore::default();
        let err = select(&store, &key_record(), &settings(""), 100, 10, 600, None).await.unwrap_err();
        assert!(matches!(err, Error::NoSourceAvailable));
    }

    #[tokio::test]
    async fn pinned_active_profile_bypasses_the_ledger_entirely() {
        let store = InMemoryStore::default();
        let profile_id = Uuid::new_v4();
        store.set_profiles(vec![Profile {
            id: profile_id,
            name: "pinned".to_string(),
            api_key: "sk-pinned".to_string(),
            api_url: "https://pinned".to_string(),
            model_actual: Some("m-x".to_string()),
            model_display: None,
            is_active: true,
            disable_system_prompt_injection: None,
            system_prompt_format: None,
            capabilities: vec![],
        }]);

        let mut key = key_record();
        key.selected_api_profile_id = Some(profile_id);

        let source = select(&store, &key, &settings("https://default"), 100, 10, 600, None).await.unwrap();
        assert_eq!(source.kind, SourceKind::Profile);
        assert!(source.slot.owner_id().is_none());
        assert_eq!(store.read_concurrency("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn falls_through_when_pinned_profile_is_inactive() {
        let store = InMemoryStore::default();
        let profile_id = Uuid::new_v4();
        store.set_profiles(vec![Profile {
            id: profile_id,
            name: "inactive".to_string(),
            api_key: "sk".to_string(),
            api_url: "https://inactive".to_string(),
            model_actual: None,
            model_display: None,
            is_active: false,
            disable_system_prompt_injection: None,
            system_prompt_format: None,
            capabilities: vec![],
        }]);

        let mut key = key_record();
        key.selected_api_profile_id = Some(profile_id);

        let source = select(&store, &key, &settings("https://default"), 100, 10, 600, None).await.unwrap();
        assert_eq!(source.kind, SourceKind::Default);
    }
}
