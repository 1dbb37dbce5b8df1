use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::util::env as env_util;

/// Whether row-level security applies to our calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialTier {
    ReadOnly,
    Service,
}

impl FromStr for CredentialTier {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read-only" | "readonly" | "anon" => Ok(CredentialTier::ReadOnly),
            "service" | "service-role" | "service_role" => Ok(CredentialTier::Service),
            other => Err(ConfigError::Invalid {
                key: "RECON_CREDENTIAL_TIER",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for CredentialTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CredentialTier::ReadOnly => "read-only",
            CredentialTier::Service => "service",
        })
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Rest { base_url: String, api_key: String },
    Postgres { database_url: String, max_connections: u32 },
}

// Credentials stay out of debug output.
impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendConfig::Rest { base_url, .. } => f
                .debug_struct("Rest")
                .field("base_url", base_url)
                .field("api_key", &"***")
                .finish(),
            BackendConfig::Postgres {
                database_url,
                max_connections,
            } => f
                .debug_struct("Postgres")
                .field("database_url", &env_util::redact_value("DATABASE_URL", database_url))
                .field("max_connections", max_connections)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconConfig {
    pub backend: BackendConfig,
    pub tier: CredentialTier,
    pub page_size: u64,
    pub call_timeout: Duration,
    pub read_attempts: u32,
    pub retry_backoff: Duration,
    pub advisory_threshold: f64,
}

pub const REQUIRED_HINT: &[&str] = &[
    "RECON_BACKEND",
    "RECON_CREDENTIAL_TIER",
    "SUPABASE_URL",
    "SUPABASE_ANON_KEY",
    "SUPABASE_SERVICE_ROLE_KEY",
    "SUPABASE_DB_URL",
    "DATABASE_URL",
    "RECON_PAGE_SIZE",
    "RECON_CALL_TIMEOUT_SECS",
];

impl ReconConfig {
    /// Read configuration from the process environment (after `.env` loading).
    pub fn from_env() -> Result<Self, ConfigError> {
        env_util::init_env();
        Self::from_lookup(env_util::env_opt)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let tier = match lookup("RECON_CREDENTIAL_TIER") {
            Some(raw) => raw.parse()?,
            None => CredentialTier::ReadOnly,
        };

        let backend_kind = lookup("RECON_BACKEND")
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_else(|| {
                if lookup("SUPABASE_URL").is_some() {
                    "rest".into()
                } else {
                    "postgres".into()
                }
            });

        let backend = match backend_kind.as_str() {
            "rest" | "postgrest" => {
                let base_url = lookup("SUPABASE_URL").ok_or(ConfigError::Missing("SUPABASE_URL"))?;
                let api_key = match tier {
                    CredentialTier::Service => lookup("SUPABASE_SERVICE_ROLE_KEY")
                        .ok_or(ConfigError::Missing("SUPABASE_SERVICE_ROLE_KEY"))?,
                    CredentialTier::ReadOnly => lookup("SUPABASE_ANON_KEY")
                        .ok_or(ConfigError::Missing("SUPABASE_ANON_KEY"))?,
                };
                BackendConfig::Rest { base_url, api_key }
            }
            "postgres" | "pg" => {
                let database_url = ["SUPABASE_DB_URL", "DATABASE_URL", "DB_URL"]
                    .into_iter()
                    .find_map(&lookup)
                    .ok_or(ConfigError::Missing("SUPABASE_DB_URL"))?;
                BackendConfig::Postgres {
                    database_url,
                    max_connections: parse_or(&lookup, "DB_MAX_CONNS", 2)?,
                }
            }
            other => {
                return Err(ConfigError::Invalid {
                    key: "RECON_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let page_size: u64 = parse_or(&lookup, "RECON_PAGE_SIZE", 500)?;
        if page_size == 0 {
            return Err(ConfigError::Invalid {
                key: "RECON_PAGE_SIZE",
                value: "0".into(),
            });
        }

        Ok(Self {
            backend,
            tier,
            page_size,
            call_timeout: Duration::from_secs(parse_or(&lookup, "RECON_CALL_TIMEOUT_SECS", 30)?),
            read_attempts: parse_or(&lookup, "RECON_READ_ATTEMPTS", 3)?,
            retry_backoff: Duration::from_millis(parse_or(&lookup, "RECON_RETRY_BACKOFF_MS", 500)?),
            advisory_threshold: parse_or(&lookup, "RECON_ADVISORY_THRESHOLD", 0.92)?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            value: raw.clone(),
        }),
        None => Ok(default),
    }
}
