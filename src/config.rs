//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The
//! configuration file path defaults to `config.yaml` but can be specified via the `-f` flag
//! or the `RELAYGATE_CONFIG` environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier
//! ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `RELAYGATE_` override YAML values
//! 3. **Raw env vars** - `REDIS_URL`, `PRIMARY_BACKEND_API_KEY`, `DEFAULT_UPSTREAM_BASE_URL`
//!    override their respective config fields without requiring the prefix, since operators
//!    are used to setting these unprefixed.
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `RELAYGATE_STORE__POOL_SIZE=32` sets `store.pool_size`.
//!
//! ## Usage
//!
//! ```no_run
//! use clap::Parser;
//! use relaygate::config::{Args, Config};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let args = Args::parse();
//! let config = Config::load(&args)?;
//! println!("Server will bind to {}:{}", config.host, config.port);
//! # Ok(())
//! # }
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::errors::Error;

/// CLI args: config file location, and a validate-only dry run.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "RELAYGATE_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    /// Useful for CI/CD pipelines to catch config errors before deployment.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// Root configuration structure loaded from YAML and environment variables. All fields
/// have sensible defaults defined in the `Default` implementation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Remote key-value store connection settings
    pub store: StoreConfig,
    /// Fallback API key for GlobalSettings.api_key when the store's settings don't set one
    pub primary_backend_api_key: Option<String>,
    /// Fallback upstream base URL when GlobalSettings.api_url isn't set
    pub default_upstream_base_url: Option<Url>,
    /// Shared HTTP client pooling/timeout behavior for upstream requests
    pub upstream: UpstreamClientConfig,
    /// Interval between SSE heartbeat comments during a silent upstream stream
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Identity headers sent with every upstream request
    pub client_identity: ClientIdentityConfig,
    /// Default per-source concurrency limits when not overridden by settings/backup
    pub concurrency: ConcurrencyDefaults,
    /// Read-through cache TTLs for the Store Client's LRU caches
    pub cache_ttls: CacheTtlConfig,
    /// TTL (seconds) set on a concurrency counter key on first increment
    pub lock_ttl_secs: u64,
    /// Window (ms) within which repeat requests from the same conversation dedup usage counting
    pub conversation_window_ms: i64,
    /// Hard cap (characters) on an injected system prompt
    pub system_prompt_char_cap: usize,
    /// Enable the Prometheus metrics endpoint at `/internal/metrics`
    pub enable_metrics: bool,
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
    /// Optional literal brand-string rewrite applied to streamed chunks, e.g. ("Claude Code", "Claude Opus")
    pub brand_rewrite: Option<(String, String)>,
}

/// Remote key-value store connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`. Overridable via `REDIS_URL`.
    pub url: String,
    /// Connection pool size
    pub pool_size: u32,
    /// Connection establishment timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 16,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared reqwest client pooling and timeout settings for upstream requests.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamClientConfig {
    /// How long an idle pooled connection to a host is kept alive
    #[serde(with = "humantime_serde")]
    pub pool_idle_timeout: Duration,
    /// Maximum idle connections kept per host
    pub pool_max_idle_per_host: usize,
    /// Maximum concurrent connections per host
    pub max_connections_per_host: usize,
    /// Per-socket read/write timeout
    #[serde(with = "humantime_serde")]
    pub socket_timeout: Duration,
    /// Hard deadline for a single upstream request (non-streaming body or streaming relay)
    #[serde(with = "humantime_serde")]
    pub request_deadline: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            pool_idle_timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 10,
            max_connections_per_host: 50,
            socket_timeout: Duration::from_secs(60),
            request_deadline: Duration::from_secs(5 * 60),
        }
    }
}

/// Identity headers sent with every upstream request; some upstreams gate endpoints on these.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientIdentityConfig {
    pub user_agent: String,
    pub anthropic_client_version: String,
}

impl Default for ClientIdentityConfig {
    fn default() -> Self {
        Self {
            user_agent: "claude-code/1.0.42".to_string(),
            anthropic_client_version: "1.0.42".to_string(),
        }
    }
}

/// Default concurrency limits applied when a source doesn't specify its own.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConcurrencyDefaults {
    pub default_limit: u32,
    pub backup_limit: u32,
}

impl Default for ConcurrencyDefaults {
    fn default() -> Self {
        Self {
            default_limit: 100,
            backup_limit: 10,
        }
    }
}

/// TTLs for the Store Client's read-through LRU caches (§4.1).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheTtlConfig {
    #[serde(with = "humantime_serde")]
    pub settings: Duration,
    #[serde(with = "humantime_serde")]
    pub profiles: Duration,
    #[serde(with = "humantime_serde")]
    pub backups: Duration,
    #[serde(with = "humantime_serde")]
    pub model_configs: Duration,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            settings: Duration::from_secs(30),
            profiles: Duration::from_secs(60),
            backups: Duration::from_secs(60),
            model_configs: Duration::from_secs(120),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            store: StoreConfig::default(),
            primary_backend_api_key: None,
            default_upstream_base_url: None,
            upstream: UpstreamClientConfig::default(),
            heartbeat_interval: Duration::from_secs(15),
            client_identity: ClientIdentityConfig::default(),
            concurrency: ConcurrencyDefaults::default(),
            cache_ttls: CacheTtlConfig::default(),
            lock_ttl_secs: 600,
            conversation_window_ms: 60_000,
            system_prompt_char_cap: 10_000,
            enable_metrics: true,
            enable_otel_export: false,
            brand_rewrite: Some(("Claude Code".to_string(), "Claude Opus".to_string())),
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for internal consistency.
    pub fn validate(&self) -> Result<(), Error> {
        if self.store.url.is_empty() {
            return Err(Error::Internal("store.url must not be empty".to_string()));
        }

        if self.concurrency.default_limit == 0 && self.concurrency.backup_limit == 0 {
            return Err(Error::Internal(
                "concurrency.default_limit and concurrency.backup_limit cannot both be 0".to_string(),
            ));
        }

        if self.system_prompt_char_cap == 0 {
            return Err(Error::Internal("system_prompt_char_cap must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("RELAYGATE_").split("__"))
            .merge(Env::raw().only(&["REDIS_URL"]).map(|_| "store.url".into()))
            .merge(Env::raw().only(&["PRIMARY_BACKEND_API_KEY"]).map(|_| "primary_backend_api_key".into()))
            .merge(Env::raw().only(&["DEFAULT_UPSTREAM_BASE_URL"]).map(|_| "default_upstream_base_url".into()))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.concurrency.default_limit, 100);
        assert_eq!(config.cache_ttls.settings, Duration::from_secs(30));
    }

    #[test]
    fn test_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
host: 0.0.0.0
port: 9000
"#,
            )?;

            jail.set_env("RELAYGATE_PORT", "8081");
            jail.set_env("REDIS_URL", "redis://cache:6379");

            let args = Args {
                config: "test.yaml".to_string(),
                validate: false,
            };

            let config = Config::load(&args)?;

            assert_eq!(config.port, 8081);
            assert_eq!(config.store.url, "redis://cache:6379");

            Ok(())
        });
    }

    #[test]
    fn test_nested_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "host: 0.0.0.0\nport: 8080\n")?;
            jail.set_env("RELAYGATE_STORE__POOL_SIZE", "32");

            let args = Args {
                config: "test.yaml".to_string(),
                validate: false,
            };

            let config = Config::load(&args)?;
            assert_eq!(config.store.pool_size, 32);

            Ok(())
        });
    }

    #[test]
    fn test_validate_rejects_empty_store_url() {
        let mut config = Config::default();
        config.store.url = String::new();
        assert!(config.validate().is_err());
    }
}
