//! Test-only constructors for [`AppState`].

use std::time::Duration;

use crate::AppState;
use crate::config::Config;
use crate::relay::Relay;
use crate::store::RedisStore;
use crate::store::redis_store::CacheTtls;

impl AppState {
    /// Builds an `AppState` for unit tests that never exercise the store (e.g. the
    /// method-rejection path, which returns before any store call). `RedisStore::connect`
    /// doesn't dial eagerly — `deadpool_redis` pool creation is lazy — so this is safe to
    /// build without a live Redis instance as long as the test never calls a store method.
    pub fn for_tests() -> Self {
        let config = Config::default();
        let cache_ttls = CacheTtls {
            settings: Duration::from_secs(30),
            profiles: Duration::from_secs(60),
            backups: Duration::from_secs(60),
            model_configs: Duration::from_secs(120),
        };
        let store = RedisStore::connect(&config.store.url, 1, cache_ttls, config.conversation_window_ms)
            .expect("RedisStore::connect does not dial eagerly");
        let relay = Relay::new(&config.upstream, config.client_identity.clone(), config.heartbeat_interval, config.brand_rewrite.clone())
            .expect("Relay::new should not fail with default config");

        Self { store, config, relay, metrics: None }
    }
}
