use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use service_core::config::ServerConfig;
use service_core::error::AppError;
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::path::Path;

use crate::utils::password::check_password_hash;

#[derive(Debug, Clone)]
pub struct DischargeConfig {
    pub common: ServerConfig,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// Public base URL; visit and wait URLs are built from it.
    pub location: String,
    /// Hex key shared with relying parties for sealing caveat ids.
    pub caveat_shared_key: SecretString,
    pub database: Option<DatabaseConfig>,
    pub providers: Vec<ProviderConfig>,
    pub sessions: SessionConfig,
    pub rate_limit: RateLimitConfig,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: SecretString,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub wait_timeout_seconds: u64,
    pub session_ttl_seconds: u64,
    pub discharge_expiry_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            wait_timeout_seconds: 60,
            session_ttl_seconds: 600,
            discharge_expiry_seconds: 86_400,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub login_attempts: u32,
    pub login_window_seconds: u64,
}

/// One entry of the identity providers file.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    Static(StaticProviderConfig),
    #[serde(rename = "oauth")]
    OAuth(OAuthProviderConfig),
    Agent(AgentProviderConfig),
}

impl ProviderConfig {
    pub fn name(&self) -> &str {
        match self {
            ProviderConfig::Static(c) => &c.name,
            ProviderConfig::OAuth(c) => &c.name,
            ProviderConfig::Agent(c) => &c.name,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticProviderConfig {
    pub name: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub users: BTreeMap<String, StaticUserConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticUserConfig {
    /// Argon2 PHC string, e.g. from `utils::password::hash_password`.
    pub password_hash: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthProviderConfig {
    pub name: String,
    #[serde(default)]
    pub domain: Option<String>,
    pub upstream_url: String,
    pub consumer_key: String,
    pub consumer_secret: SecretString,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_seconds: u64,
}

fn default_upstream_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentProviderConfig {
    pub name: String,
    /// base64url Ed25519 public key of the administrative agent.
    #[serde(default)]
    pub admin_public_key: Option<String>,
}

impl DischargeConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = ServerConfig::load()?;

        let environment: Environment = env::var("ENVIRONMENT")
            .unwrap_or_else(|_| "dev".to_string())
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        let is_prod = environment == Environment::Prod;

        let database = match env::var("DATABASE_URL") {
            Ok(url) => Some(DatabaseConfig {
                url: SecretString::new(url),
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
                acquire_timeout_seconds: 30,
            }),
            Err(_) => None,
        };

        let providers_path = get_env(
            "IDENTITY_PROVIDERS_PATH",
            Some("identity-providers.example.json"),
            is_prod,
        )?;

        let config = DischargeConfig {
            common,
            environment,
            service_name: get_env("SERVICE_NAME", Some("discharge-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            location: get_env("LOCATION", Some("http://localhost:8081"), is_prod)?
                .trim_end_matches('/')
                .to_string(),
            // The dev default is public; prod must set its own.
            caveat_shared_key: SecretString::new(get_env(
                "CAVEAT_SHARED_KEY",
                Some("00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff"),
                is_prod,
            )?),
            database,
            providers: load_providers(Path::new(&providers_path))?,
            sessions: SessionConfig {
                wait_timeout_seconds: parse_env("WAIT_TIMEOUT_SECONDS", "60", is_prod)?,
                session_ttl_seconds: parse_env("SESSION_TTL_SECONDS", "600", is_prod)?,
                discharge_expiry_seconds: parse_env("DISCHARGE_EXPIRY_SECONDS", "86400", is_prod)?,
            },
            rate_limit: RateLimitConfig {
                login_attempts: parse_env("RATE_LIMIT_LOGIN_ATTEMPTS", "5", is_prod)?,
                login_window_seconds: parse_env("RATE_LIMIT_LOGIN_WINDOW_SECONDS", "900", is_prod)?,
            },
            allowed_origins: get_env("ALLOWED_ORIGINS", Some("http://localhost:3000"), is_prod)?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Decoded caveat shared key.
    pub fn shared_key(&self) -> Result<Vec<u8>, AppError> {
        let key = hex::decode(self.caveat_shared_key.expose_secret().trim())
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("CAVEAT_SHARED_KEY is not hex: {}", e)))?;
        if key.len() < 32 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "CAVEAT_SHARED_KEY must be at least 32 bytes"
            )));
        }
        Ok(key)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.sessions.wait_timeout_seconds == 0
            || self.sessions.session_ttl_seconds == 0
            || self.sessions.discharge_expiry_seconds == 0
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "session timeouts must be positive"
            )));
        }

        self.shared_key()?;
        validate_providers(&self.providers)?;

        if self.environment == Environment::Prod {
            if self.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }
            if !self.location.starts_with("https://") {
                tracing::warn!(location = %self.location, "LOCATION is not https in production");
            }
        }

        Ok(())
    }
}

/// Read the identity providers file.
pub fn load_providers(path: &Path) -> Result<Vec<ProviderConfig>, AppError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!(
            "cannot read identity providers from {}: {}",
            path.display(),
            e
        ))
    })?;
    let providers: Vec<ProviderConfig> = serde_json::from_str(&raw).map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!(
            "invalid identity providers file {}: {}",
            path.display(),
            e
        ))
    })?;
    validate_providers(&providers)?;
    Ok(providers)
}

pub fn validate_providers(providers: &[ProviderConfig]) -> Result<(), AppError> {
    if providers.is_empty() {
        return Err(AppError::ConfigError(anyhow::anyhow!(
            "at least one identity provider must be configured"
        )));
    }

    let mut seen = HashSet::new();
    for provider in providers {
        let name = provider.name();
        if name.is_empty() || name.contains('/') {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "invalid identity provider name {:?}",
                name
            )));
        }
        if !seen.insert(name) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "duplicate identity provider name {:?}",
                name
            )));
        }
        if let ProviderConfig::Static(config) = provider {
            for (username, user) in &config.users {
                check_password_hash(&user.password_hash).map_err(|e| {
                    AppError::ConfigError(anyhow::anyhow!(
                        "provider {:?}, user {:?}: {}",
                        name,
                        username,
                        e
                    ))
                })?;
            }
        }
        if let ProviderConfig::OAuth(oauth) = provider {
            if oauth.timeout_seconds == 0 {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "provider {:?}: timeout_seconds must be positive",
                    name
                )));
            }
        }
    }
    Ok(())
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
