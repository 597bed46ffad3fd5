//! Environment-shaped configuration.
//!
//! All keys are `HOMEGRAPH_*` environment variables, loaded through
//! `dotenvy` so a local `.env` file works in development. Malformed values
//! are configuration errors; the binary exits with code 2 on them.

use crate::models::EntityType;
use crate::security::{KdfParams, RateLimitConfig};
use crate::{Error, Result};
use secrecy::SecretString;
use std::path::PathBuf;
use std::time::Duration;

/// Default guest token lifetime: 24 hours.
const DEFAULT_GUEST_TTL: Duration = Duration::from_secs(24 * 3600);

/// Default admin token lifetime: 7 days.
const DEFAULT_ADMIN_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Default sync batch cap.
const DEFAULT_SYNC_BATCH_MAX: usize = 1000;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Pretty,
    /// Line-delimited JSON.
    Json,
}

/// Main configuration.
#[derive(Debug, Clone)]
pub struct HomeGraphConfig {
    /// Database path or connection string.
    pub database_url: String,
    /// Bind address for the transport layer.
    pub bind_address: String,
    /// Listen port for the transport layer.
    pub port: u16,
    /// Token signing key. Required to serve.
    pub signing_key: Option<SecretString>,
    /// Pre-provisioned admin password hash (PHC string). Required to serve.
    pub admin_password_hash: Option<SecretString>,
    /// Guest token lifetime.
    pub guest_token_ttl: Duration,
    /// Admin token lifetime.
    pub admin_token_ttl: Duration,
    /// Rate limiter settings.
    pub rate_limit: RateLimitConfig,
    /// Audit sink path (stderr when unset).
    pub audit_sink_path: Option<PathBuf>,
    /// Maximum change records per sync exchange.
    pub sync_batch_max: usize,
    /// Argon2 cost parameters.
    pub kdf: KdfParams,
    /// Entity types guests may read. `None` means every type.
    pub guest_readable_types: Option<Vec<EntityType>>,
    /// Log format.
    pub log_format: LogFormat,
    /// Log filter override (`RUST_LOG` syntax).
    pub log_filter: Option<String>,
    /// Writer id this server stamps on versions it authors.
    pub server_device_id: String,
}

impl Default for HomeGraphConfig {
    fn default() -> Self {
        Self {
            database_url: "homegraph.db".to_string(),
            bind_address: "127.0.0.1".to_string(),
            port: 8090,
            signing_key: None,
            admin_password_hash: None,
            guest_token_ttl: DEFAULT_GUEST_TTL,
            admin_token_ttl: DEFAULT_ADMIN_TTL,
            rate_limit: RateLimitConfig::default(),
            audit_sink_path: None,
            sync_batch_max: DEFAULT_SYNC_BATCH_MAX,
            kdf: KdfParams::default(),
            guest_readable_types: None,
            log_format: LogFormat::default(),
            log_filter: None,
            server_device_id: "homegraph-server".to_string(),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env_var(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| Error::InvalidArgument(format!("bad value for {key}: {e}"))),
    }
}

fn parse_secs(key: &str) -> Result<Option<Duration>> {
    Ok(parse_env::<u64>(key)?.map(Duration::from_secs))
}

impl HomeGraphConfig {
    /// Loads configuration from the environment (and `.env` if present).
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();

        if let Some(v) = env_var("HOMEGRAPH_DATABASE_URL") {
            config.database_url = v;
        }
        if let Some(v) = env_var("HOMEGRAPH_BIND_ADDRESS") {
            config.bind_address = v;
        }
        if let Some(v) = parse_env::<u16>("HOMEGRAPH_PORT")? {
            config.port = v;
        }
        config.signing_key = env_var("HOMEGRAPH_SIGNING_KEY").map(SecretString::from);
        config.admin_password_hash =
            env_var("HOMEGRAPH_ADMIN_PASSWORD_HASH").map(SecretString::from);

        if let Some(v) = parse_secs("HOMEGRAPH_GUEST_TOKEN_TTL_SECS")? {
            config.guest_token_ttl = v;
        }
        if let Some(v) = parse_secs("HOMEGRAPH_ADMIN_TOKEN_TTL_SECS")? {
            config.admin_token_ttl = v;
        }

        if let Some(v) = parse_secs("HOMEGRAPH_RATE_LIMIT_WINDOW_SECS")? {
            config.rate_limit.window = v;
        }
        if let Some(v) = parse_env::<usize>("HOMEGRAPH_RATE_LIMIT_MAX")? {
            config.rate_limit.max_attempts = v;
        }
        if let Some(v) = parse_secs("HOMEGRAPH_RATE_LIMIT_LOCKOUT_SECS")? {
            config.rate_limit.lockout = v;
        }
        if let Some(v) = parse_env::<u64>("HOMEGRAPH_RATE_LIMIT_BASE_DELAY_MS")? {
            config.rate_limit.base_delay = Duration::from_millis(v);
        }

        config.audit_sink_path = env_var("HOMEGRAPH_AUDIT_SINK_PATH").map(PathBuf::from);

        if let Some(v) = parse_env::<usize>("HOMEGRAPH_SYNC_BATCH_MAX")? {
            if v == 0 {
                return Err(Error::InvalidArgument(
                    "HOMEGRAPH_SYNC_BATCH_MAX must be positive".to_string(),
                ));
            }
            config.sync_batch_max = v;
        }

        if let Some(v) = parse_env::<u32>("HOMEGRAPH_KDF_MEMORY_KIB")? {
            config.kdf.memory_kib = v;
        }
        if let Some(v) = parse_env::<u32>("HOMEGRAPH_KDF_ITERATIONS")? {
            config.kdf.iterations = v;
        }
        if let Some(v) = parse_env::<u32>("HOMEGRAPH_KDF_PARALLELISM")? {
            config.kdf.parallelism = v;
        }

        if let Some(raw) = env_var("HOMEGRAPH_GUEST_READABLE_TYPES") {
            let types = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    EntityType::parse(s).ok_or_else(|| {
                        Error::InvalidArgument(format!(
                            "bad entity type in HOMEGRAPH_GUEST_READABLE_TYPES: {s}"
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            config.guest_readable_types = Some(types);
        }

        config.log_format = match env_var("HOMEGRAPH_LOG_FORMAT").as_deref() {
            None | Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(Error::InvalidArgument(format!(
                    "HOMEGRAPH_LOG_FORMAT must be pretty or json, got {other}"
                )));
            },
        };
        config.log_filter = env_var("HOMEGRAPH_LOG_FILTER");

        if let Some(v) = env_var("HOMEGRAPH_SERVER_DEVICE_ID") {
            config.server_device_id = v;
        }

        Ok(config)
    }

    /// Checks the keys that are fatal to omit at server startup.
    pub fn validate_for_serve(&self) -> Result<()> {
        if self.signing_key.is_none() {
            return Err(Error::InvalidArgument(
                "HOMEGRAPH_SIGNING_KEY is required to serve".to_string(),
            ));
        }
        if self.admin_password_hash.is_none() {
            return Err(Error::InvalidArgument(
                "HOMEGRAPH_ADMIN_PASSWORD_HASH is required to serve".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HomeGraphConfig::default();
        assert_eq!(config.guest_token_ttl, Duration::from_secs(86_400));
        assert_eq!(config.admin_token_ttl, Duration::from_secs(604_800));
        assert_eq!(config.sync_batch_max, 1000);
        assert_eq!(config.rate_limit.max_attempts, 5);
        assert_eq!(config.rate_limit.window, Duration::from_secs(300));
        assert_eq!(config.rate_limit.lockout, Duration::from_secs(900));
    }

    #[test]
    fn test_validate_for_serve_requires_secrets() {
        let mut config = HomeGraphConfig::default();
        assert!(config.validate_for_serve().is_err());
        config.signing_key = Some(SecretString::from("k".repeat(32)));
        assert!(config.validate_for_serve().is_err());
        config.admin_password_hash = Some(SecretString::from("$argon2id$..."));
        assert!(config.validate_for_serve().is_ok());
    }

    #[test]
    fn test_secrets_not_in_debug_output() {
        let mut config = HomeGraphConfig::default();
        config.signing_key = Some(SecretString::from("super-secret-signing-key-material"));
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret-signing-key-material"));
    }
}
