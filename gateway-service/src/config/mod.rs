use gateway_core::config as core_config;
use gateway_core::error::AppError;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub redis: RedisConfig,
    pub security: SecurityConfig,
    pub token: TokenConfig,
    pub rate_limit: RateLimitConfig,
    pub brute_force: BruteForceConfig,
    pub reputation: ReputationConfig,
    pub csrf: CsrfConfig,
    pub audit: AuditConfig,
    pub dlp: DlpConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Absence selects the per-process in-memory backend at startup.
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub access_secret: SecretString,
    pub refresh_secret: SecretString,
    pub access_ttl_minutes: i64,
    pub refresh_ttl_days: i64,
    pub issuer: String,
    pub audience: String,
    pub clock_skew_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct RateLimitTier {
    pub max_requests: u32,
    pub window_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub global: RateLimitTier,
    pub auth: RateLimitTier,
    pub uploads: RateLimitTier,
    pub api: RateLimitTier,
    pub admin: RateLimitTier,
}

#[derive(Debug, Clone)]
pub struct BruteForceConfig {
    pub threshold: u64,
    pub base_window_seconds: u64,
    pub max_lockout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct ReputationConfig {
    pub threshold: u64,
    pub window_seconds: u64,
    pub block_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct CsrfConfig {
    pub cookie_name: String,
    pub header_name: String,
    pub ttl_seconds: u64,
    /// When true, an IP mismatch rejects the request instead of only
    /// being logged.
    pub strict_ip: bool,
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub exclude_paths: Vec<String>,
    pub exclude_methods: Vec<String>,
    pub redact_headers: Vec<String>,
    pub pii_fields: Vec<String>,
    pub max_body_bytes: usize,
    pub flush_interval_seconds: u64,
    pub buffer_capacity: usize,
    pub operator_webhook_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DlpConfig {
    pub enabled: bool,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = GatewayConfig {
            common,
            environment,
            service_name: get_env("SERVICE_NAME", Some("gateway-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            redis: RedisConfig {
                url: env::var("REDIS_URL").ok(),
            },
            security: SecurityConfig {
                allowed_origins: get_env("ALLOWED_ORIGINS", Some("http://localhost:3000"), is_prod)?
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
            },
            token: TokenConfig {
                access_secret: SecretString::new(get_env(
                    "ACCESS_TOKEN_SECRET",
                    Some("dev-access-secret-change-me"),
                    is_prod,
                )?),
                refresh_secret: SecretString::new(get_env(
                    "REFRESH_TOKEN_SECRET",
                    Some("dev-refresh-secret-change-me"),
                    is_prod,
                )?),
                access_ttl_minutes: parse_env("ACCESS_TOKEN_TTL_MINUTES", "15", is_prod)?,
                refresh_ttl_days: parse_env("REFRESH_TOKEN_TTL_DAYS", "7", is_prod)?,
                issuer: get_env("TOKEN_ISSUER", Some("storefront-gateway"), is_prod)?,
                audience: get_env("TOKEN_AUDIENCE", Some("storefront-api"), is_prod)?,
                clock_skew_seconds: parse_env("TOKEN_CLOCK_SKEW_SECONDS", "30", is_prod)?,
            },
            rate_limit: RateLimitConfig {
                global: tier_from_env("GLOBAL", "300", "60", is_prod)?,
                auth: tier_from_env("AUTH", "10", "900", is_prod)?,
                uploads: tier_from_env("UPLOADS", "20", "3600", is_prod)?,
                api: tier_from_env("API", "120", "60", is_prod)?,
                admin: tier_from_env("ADMIN", "60", "60", is_prod)?,
            },
            brute_force: BruteForceConfig {
                threshold: parse_env("BRUTE_FORCE_THRESHOLD", "5", is_prod)?,
                base_window_seconds: parse_env("BRUTE_FORCE_BASE_WINDOW_SECONDS", "900", is_prod)?,
                max_lockout_seconds: parse_env("BRUTE_FORCE_MAX_LOCKOUT_SECONDS", "86400", is_prod)?,
            },
            reputation: ReputationConfig {
                threshold: parse_env("IP_REPUTATION_THRESHOLD", "10", is_prod)?,
                window_seconds: parse_env("IP_REPUTATION_WINDOW_SECONDS", "3600", is_prod)?,
                block_seconds: parse_env("IP_REPUTATION_BLOCK_SECONDS", "3600", is_prod)?,
            },
            csrf: CsrfConfig {
                cookie_name: get_env("CSRF_COOKIE_NAME", Some("sf_csrf"), is_prod)?,
                header_name: get_env("CSRF_HEADER_NAME", Some("x-csrf-token"), is_prod)?,
                ttl_seconds: parse_env("CSRF_TTL_SECONDS", "7200", is_prod)?,
                strict_ip: parse_env("CSRF_STRICT_IP", "false", is_prod)?,
            },
            audit: AuditConfig {
                exclude_paths: csv_env("AUDIT_EXCLUDE_PATHS", "/health,/metrics", is_prod)?,
                exclude_methods: csv_env("AUDIT_EXCLUDE_METHODS", "OPTIONS", is_prod)?,
                redact_headers: csv_env(
                    "AUDIT_REDACT_HEADERS",
                    "authorization,cookie,x-api-key,x-csrf-token",
                    is_prod,
                )?,
                pii_fields: csv_env(
                    "AUDIT_PII_FIELDS",
                    "password,secret,token,api_key,card_number,cvv,ssn,email,phone,address,date_of_birth",
                    is_prod,
                )?,
                max_body_bytes: parse_env("AUDIT_MAX_BODY_BYTES", "8192", is_prod)?,
                flush_interval_seconds: parse_env("AUDIT_FLUSH_INTERVAL_SECONDS", "5", is_prod)?,
                buffer_capacity: parse_env("AUDIT_BUFFER_CAPACITY", "64", is_prod)?,
                operator_webhook_url: env::var("OPERATOR_WEBHOOK_URL").ok(),
            },
            dlp: DlpConfig {
                enabled: parse_env("DLP_ENABLED", "true", is_prod)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.token.access_ttl_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "ACCESS_TOKEN_TTL_MINUTES must be positive"
            )));
        }

        if self.token.refresh_ttl_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "REFRESH_TOKEN_TTL_DAYS must be positive"
            )));
        }

        if self.brute_force.threshold == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "BRUTE_FORCE_THRESHOLD must be at least 1"
            )));
        }

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if self.redis.url.is_none() {
                tracing::error!(
                    "REDIS_URL not set in production - revocations and lockouts will be \
                     per-process only and invisible to sibling instances"
                );
            }

            if self.token.access_secret.expose_secret().starts_with("dev-")
                || self.token.refresh_secret.expose_secret().starts_with("dev-")
            {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Development token secrets must not be used in production"
                )));
            }
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?.parse().map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("{} has an invalid value: {}", key, e))
    })
}

fn csv_env(key: &str, default: &str, is_prod: bool) -> Result<Vec<String>, AppError> {
    Ok(get_env(key, Some(default), is_prod)?
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

fn tier_from_env(
    name: &str,
    default_max: &str,
    default_window: &str,
    is_prod: bool,
) -> Result<RateLimitTier, AppError> {
    Ok(RateLimitTier {
        max_requests: parse_env(
            &format!("RATE_LIMIT_{}_MAX", name),
            default_max,
            is_prod,
        )?,
        window_seconds: parse_env(
            &format!("RATE_LIMIT_{}_WINDOW_SECONDS", name),
            default_window,
            is_prod,
        )?,
    })
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
