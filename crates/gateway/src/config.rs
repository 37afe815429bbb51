//! Runtime configuration for the perimeter.
//!
//! [`PerimeterConfig`] deserializes from any serde format (durations in
//! humantime notation, e.g. `"40s"`) or loads from `PERIMETER_*` environment
//! variables. Component configurations are derived from it through validated
//! builders, so an invalid value fails at startup rather than on first use.
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `PERIMETER_ENVIRONMENT` | `development`, `staging` or `production` | `production` |
//! | `PERIMETER_GATEWAY_SECRET` | HMAC secret shared with internal services | required |
//! | `PERIMETER_TOKEN_SECRET` | bearer token signing secret | required |
//! | `PERIMETER_DEV_SIGNATURE` | development signature bypass | unset |
//! | `PERIMETER_REQUESTS_PER_MINUTE` | actor limiter budget | 50 |
//! | `PERIMETER_MAX_REQUESTS` | shared counter budget per window | 50 |
//! | `PERIMETER_WINDOW_SEC` | shared counter window | 60 |
//! | `PERIMETER_PENALTY_SEC` | lockout for both limiters | 40 |
//! | `PERIMETER_LOG_FORMAT` | `text` or `json` | `text` |

use std::{fmt, str::FromStr, time::Duration};

use perimeter_authn::{SignatureConfig, VerifierConfig, signing};
use perimeter_ratelimit::{ActorLimiterConfig, SharedCounterConfig};
use perimeter_storage::{CircuitBreakerConfig, ConfigError, Environment, circuit_breaker};
use serde::{Deserialize, Deserializer};
use zeroize::Zeroizing;

/// A secret string, scrubbed from memory on drop and never printed.
#[derive(Clone)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    /// Wraps `value`.
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// The secret value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Invalid {
                field: "log_format",
                reason: format!("unknown format `{other}`, expected `text` or `json`"),
            }),
        }
    }
}

/// Rate limiter settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSettings {
    /// Run the per-key actor limiter.
    pub actor: bool,
    /// Run the shared counter limiter.
    pub shared_counter: bool,
    /// Actor limiter budget.
    pub requests_per_minute: u32,
    /// Shared counter budget per window.
    pub max_requests: u32,
    /// Shared counter window.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Lockout for both limiters.
    #[serde(with = "humantime_serde")]
    pub penalty: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            actor: true,
            shared_counter: true,
            requests_per_minute: perimeter_ratelimit::actor::DEFAULT_REQUESTS_PER_MINUTE,
            max_requests: perimeter_ratelimit::shared::DEFAULT_MAX_REQUESTS,
            window: perimeter_ratelimit::shared::DEFAULT_WINDOW,
            penalty: perimeter_ratelimit::shared::DEFAULT_PENALTY,
        }
    }
}

/// Signed-header verification settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SignatureSettings {
    /// Accepted clock distance for gateway timestamps.
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// Retention of seen nonces.
    #[serde(with = "humantime_serde")]
    pub nonce_ttl: Duration,
}

impl Default for SignatureSettings {
    fn default() -> Self {
        Self { max_age: signing::DEFAULT_MAX_AGE, nonce_ttl: signing::DEFAULT_NONCE_TTL }
    }
}

/// Verification cache settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    /// Lifetime of a cached verification.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Maximum cached verifications.
    pub capacity: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: perimeter_authn::DEFAULT_CACHE_TTL,
            capacity: perimeter_authn::DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Revocation-store circuit breaker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerSettings {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial call.
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: circuit_breaker::DEFAULT_FAILURE_THRESHOLD,
            retry_interval: circuit_breaker::DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Complete perimeter configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerimeterConfig {
    /// Deployment environment; namespaces store keys and gates the dev bypass.
    #[serde(default)]
    pub environment: Environment,
    /// HMAC secret shared by the gateway and internal services.
    pub gateway_secret: Secret,
    /// Bearer token signing secret.
    pub token_secret: Secret,
    /// Fixed signature accepted in development.
    #[serde(default)]
    pub dev_signature: Option<Secret>,
    /// Rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// Signed-header verification.
    #[serde(default)]
    pub signature: SignatureSettings,
    /// Verification cache.
    #[serde(default)]
    pub cache: CacheSettings,
    /// Revocation-store circuit breaker.
    #[serde(default)]
    pub breaker: BreakerSettings,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

impl PerimeterConfig {
    /// Creates a configuration with defaults around the two required secrets.
    #[must_use]
    pub fn new(gateway_secret: impl Into<String>, token_secret: impl Into<String>) -> Self {
        Self {
            environment: Environment::default(),
            gateway_secret: Secret::new(gateway_secret),
            token_secret: Secret::new(token_secret),
            dev_signature: None,
            rate_limit: RateLimitSettings::default(),
            signature: SignatureSettings::default(),
            cache: CacheSettings::default(),
            breaker: BreakerSettings::default(),
            log_format: LogFormat::default(),
        }
    }

    /// Loads from `PERIMETER_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or any value
    /// is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads from variables resolved by `lookup`.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &'static str| {
            lookup(name).filter(|v| !v.is_empty()).ok_or(ConfigError::Missing { field: name })
        };

        let mut config = Self::new(
            required("PERIMETER_GATEWAY_SECRET")?,
            required("PERIMETER_TOKEN_SECRET")?,
        );

        if let Some(env) = parse(&lookup, "PERIMETER_ENVIRONMENT")? {
            config.environment = env;
        }
        config.dev_signature =
            lookup("PERIMETER_DEV_SIGNATURE").filter(|v| !v.is_empty()).map(Secret::new);
        if let Some(rpm) = parse(&lookup, "PERIMETER_REQUESTS_PER_MINUTE")? {
            config.rate_limit.requests_per_minute = rpm;
        }
        if let Some(max) = parse(&lookup, "PERIMETER_MAX_REQUESTS")? {
            config.rate_limit.max_requests = max;
        }
        if let Some(secs) = parse(&lookup, "PERIMETER_WINDOW_SEC")? {
            config.rate_limit.window = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "PERIMETER_PENALTY_SEC")? {
            config.rate_limit.penalty = Duration::from_secs(secs);
        }
        if let Some(format) = parse(&lookup, "PERIMETER_LOG_FORMAT")? {
            config.log_format = format;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks every derived component configuration.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let secrets =
            [("gateway_secret", &self.gateway_secret), ("token_secret", &self.token_secret)];
        for (field, secret) in secrets {
            if secret.expose().is_empty() {
                return Err(ConfigError::Missing { field });
            }
        }
        self.breaker_config()?;
        self.verifier_config()?;
        self.signature_config()?;
        self.actor_config()?;
        self.shared_counter_config()?;
        Ok(())
    }

    /// Circuit breaker configuration for revocation reads.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for out-of-range values.
    pub fn breaker_config(&self) -> Result<CircuitBreakerConfig, ConfigError> {
        CircuitBreakerConfig::builder()
            .failure_threshold(self.breaker.failure_threshold)
            .retry_interval(self.breaker.retry_interval)
            .build()
    }

    /// Verification cache configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for out-of-range values.
    pub fn verifier_config(&self) -> Result<VerifierConfig, ConfigError> {
        VerifierConfig::builder()
            .cache_ttl(self.cache.ttl)
            .cache_capacity(self.cache.capacity)
            .build()
    }

    /// Signed-header verification policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for out-of-range values.
    pub fn signature_config(&self) -> Result<SignatureConfig, ConfigError> {
        SignatureConfig::builder()
            .max_age(self.signature.max_age)
            .nonce_ttl(self.signature.nonce_ttl)
            .environment(self.environment)
            .maybe_dev_signature(self.dev_signature.as_ref().map(|s| s.expose().to_owned()))
            .build()
    }

    /// Actor limiter configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for out-of-range values.
    pub fn actor_config(&self) -> Result<ActorLimiterConfig, ConfigError> {
        ActorLimiterConfig::builder()
            .requests_per_minute(self.rate_limit.requests_per_minute)
            .penalty(self.rate_limit.penalty)
            .environment(self.environment)
            .build()
    }

    /// Shared counter limiter configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for out-of-range values.
    pub fn shared_counter_config(&self) -> Result<SharedCounterConfig, ConfigError> {
        SharedCounterConfig::builder()
            .max_requests(self.rate_limit.max_requests)
            .window(self.rate_limit.window)
            .penalty(self.rate_limit.penalty)
            .environment(self.environment)
            .build()
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
                field: name,
                reason: err.to_string(),
            })
        })
        .transpose()
}
