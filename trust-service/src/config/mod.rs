use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use service_core::config::{self as core_config, get_env, optional_env, parse_env};
use service_core::error::AppError;
use std::env;
use std::net::IpAddr;

/// Hard ceiling for an impersonation grant, regardless of configuration.
pub const IMPERSONATION_HARD_CAP_MINUTES: i64 = 30;

/// Shortest grant an administrator may request.
pub const IMPERSONATION_MIN_MINUTES: i64 = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct TrustConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub allowed_origins: Vec<String>,
    /// Peers whose `x-forwarded-for` header is believed. Empty means the
    /// socket peer is always the client address.
    pub trusted_proxies: Vec<IpAddr>,
    pub database: DatabaseConfig,
    pub redis: Option<RedisConfig>,
    pub access_token: AccessTokenConfig,
    pub impersonation: ImpersonationConfig,
    pub reauth: ReauthConfig,
    pub sessions: SessionConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    /// Bound on a single storage round-trip.
    pub query_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessTokenConfig {
    /// HS256 secret shared with the upstream authentication layer.
    pub secret: Secret<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationMode {
    /// Unclassified mutating requests are denied while impersonating.
    Strict,
    /// Unclassified requests are allowed while impersonating.
    Permissive,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImpersonationConfig {
    pub token_secret: Secret<String>,
    pub default_duration_minutes: i64,
    pub max_duration_minutes: i64,
    pub sweep_interval_secs: u64,
    /// Probability in `[0, 1]` that an allowed impersonated request is audited.
    pub audit_sample_rate: f64,
    pub classification: ClassificationMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReauthConfig {
    pub window_minutes: i64,
    /// Whether sensitive actions need step-up when the org has no policy row.
    pub require_without_policy: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub new_device_lookback_days: i64,
    /// How long a revoked session id stays in the revocation cache. The
    /// store keeps the revocation itself forever.
    pub revoked_ttl_secs: i64,
}

fn parse_proxies(raw: &str) -> Result<Vec<IpAddr>, AppError> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse().map_err(|_| {
                AppError::ConfigError(anyhow::anyhow!("TRUSTED_PROXIES has an invalid address: {}", p))
            })
        })
        .collect()
}

impl TrustConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = TrustConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("trust-service"), false)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), false)?,
            log_level: get_env("LOG_LEVEL", Some("info"), false)?,
            otlp_endpoint: optional_env("OTLP_ENDPOINT"),
            allowed_origins: get_env("CORS_ALLOWED_ORIGINS", Some("http://localhost:3000"), false)?
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            trusted_proxies: parse_proxies(&get_env("TRUSTED_PROXIES", Some(""), false)?)?,
            database: DatabaseConfig {
                url: Secret::new(get_env("DATABASE_URL", None, is_prod)?),
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", Some("10"), false)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", Some("1"), false)?,
                query_timeout_secs: parse_env("DATABASE_QUERY_TIMEOUT_SECS", Some("3"), false)?,
            },
            redis: optional_env("REDIS_URL").map(|url| RedisConfig { url }),
            access_token: AccessTokenConfig {
                secret: Secret::new(get_env("ACCESS_TOKEN_SECRET", None, is_prod)?),
            },
            impersonation: ImpersonationConfig {
                token_secret: Secret::new(get_env("IMPERSONATION_TOKEN_SECRET", None, is_prod)?),
                default_duration_minutes: parse_env(
                    "IMPERSONATION_DEFAULT_MINUTES",
                    Some("10"),
                    false,
                )?,
                max_duration_minutes: parse_env("IMPERSONATION_MAX_MINUTES", Some("30"), false)?,
                sweep_interval_secs: parse_env(
                    "IMPERSONATION_SWEEP_INTERVAL_SECS",
                    Some("300"),
                    false,
                )?,
                audit_sample_rate: parse_env(
                    "IMPERSONATION_AUDIT_SAMPLE_RATE",
                    Some("0.1"),
                    false,
                )?,
                classification: get_env("IMPERSONATION_CLASSIFICATION", Some("strict"), false)?
                    .parse()
                    .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?,
            },
            reauth: ReauthConfig {
                window_minutes: parse_env("REAUTH_WINDOW_MINUTES", Some("30"), false)?,
                require_without_policy: parse_env(
                    "REAUTH_REQUIRE_WITHOUT_POLICY",
                    Some("false"),
                    false,
                )?,
            },
            sessions: SessionConfig {
                new_device_lookback_days: parse_env(
                    "SESSION_NEW_DEVICE_LOOKBACK_DAYS",
                    Some("30"),
                    false,
                )?,
                revoked_ttl_secs: parse_env("SESSION_REVOKED_TTL_SECS", Some("86400"), false)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 && self.environment == Environment::Prod {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        let imp = &self.impersonation;
        if imp.max_duration_minutes < IMPERSONATION_MIN_MINUTES
            || imp.max_duration_minutes > IMPERSONATION_HARD_CAP_MINUTES
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "IMPERSONATION_MAX_MINUTES must be between {} and {}",
                IMPERSONATION_MIN_MINUTES,
                IMPERSONATION_HARD_CAP_MINUTES
            )));
        }

        if imp.default_duration_minutes < IMPERSONATION_MIN_MINUTES
            || imp.default_duration_minutes > imp.max_duration_minutes
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "IMPERSONATION_DEFAULT_MINUTES must be between {} and IMPERSONATION_MAX_MINUTES",
                IMPERSONATION_MIN_MINUTES
            )));
        }

        if !(0.0..=1.0).contains(&imp.audit_sample_rate) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "IMPERSONATION_AUDIT_SAMPLE_RATE must be within [0, 1]"
            )));
        }

        if imp.sweep_interval_secs == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "IMPERSONATION_SWEEP_INTERVAL_SECS must be positive"
            )));
        }

        if self.reauth.window_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "REAUTH_WINDOW_MINUTES must be positive"
            )));
        }

        if self.sessions.new_device_lookback_days <= 0 || self.sessions.revoked_ttl_secs <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Session lookback and revoked TTL must be positive"
            )));
        }

        if self.database.query_timeout_secs == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_QUERY_TIMEOUT_SECS must be positive"
            )));
        }

        if imp.token_secret.expose_secret() == self.access_token.secret.expose_secret() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "IMPERSONATION_TOKEN_SECRET must differ from ACCESS_TOKEN_SECRET"
            )));
        }

        if self.environment == Environment::Prod {
            if imp.token_secret.expose_secret().len() < 32
                || self.access_token.secret.expose_secret().len() < 32
            {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Token secrets must be at least 32 bytes in production"
                )));
            }

            if self.redis.is_none() {
                tracing::warn!(
                    "REDIS_URL not set in production - revocations will not propagate across instances"
                );
            }

            if !self.reauth.require_without_policy {
                tracing::warn!(
                    "Step-up is not required for orgs without a security policy (fail-open default)"
                );
            }
        }

        Ok(())
    }
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

impl std::str::FromStr for ClassificationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(ClassificationMode::Strict),
            "permissive" => Ok(ClassificationMode::Permissive),
            _ => Err(format!("Invalid classification mode: {}", s)),
        }
    }
}
