//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Reply substituted whenever processing fails or yields nothing usable.
pub const DEFAULT_FALLBACK_REPLY: &str =
    "Sorry, I couldn't process your message right now. Please try again in a moment.";

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum number of conversations processed at the same time.
    pub max_concurrent_contacts: usize,
    /// Maximum queued messages per conversation (oldest evicted when full).
    pub max_queue_size: usize,
    /// Budget for one processing attempt; also the lock staleness threshold.
    pub processing_timeout: Duration,
    /// Deadlock sweep interval. Must be longer than `processing_timeout`.
    pub deadlock_check_interval: Duration,
    /// Delay before a queued message is submitted after a release.
    pub queue_advance_delay: Duration,
    /// How many times a queued message may hit the concurrency ceiling
    /// before it is dropped.
    pub max_queue_attempts: u32,
    /// Reply used for fallback outcomes.
    pub fallback_reply: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_contacts: 50,
            max_queue_size: 10,
            processing_timeout: Duration::from_secs(30),
            deadlock_check_interval: Duration::from_secs(60),
            queue_advance_delay: Duration::from_millis(100),
            max_queue_attempts: 3,
            fallback_reply: DEFAULT_FALLBACK_REPLY.to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from `CONVO_GUARD_*` environment variables, defaulting absent values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            max_concurrent_contacts: env_parse(
                "CONVO_GUARD_MAX_CONCURRENT",
                defaults.max_concurrent_contacts,
            )?,
            max_queue_size: env_parse("CONVO_GUARD_MAX_QUEUE_SIZE", defaults.max_queue_size)?,
            processing_timeout: env_millis(
                "CONVO_GUARD_PROCESSING_TIMEOUT_MS",
                defaults.processing_timeout,
            )?,
            deadlock_check_interval: env_millis(
                "CONVO_GUARD_DEADLOCK_CHECK_MS",
                defaults.deadlock_check_interval,
            )?,
            queue_advance_delay: env_millis(
                "CONVO_GUARD_QUEUE_ADVANCE_DELAY_MS",
                defaults.queue_advance_delay,
            )?,
            max_queue_attempts: env_parse(
                "CONVO_GUARD_MAX_QUEUE_ATTEMPTS",
                defaults.max_queue_attempts,
            )?,
            fallback_reply: std::env::var("CONVO_GUARD_FALLBACK_REPLY")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.fallback_reply),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the orchestrator cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_contacts == 0 {
            return Err(invalid("max_concurrent_contacts", "must be at least 1"));
        }
        if self.max_queue_size == 0 {
            return Err(invalid("max_queue_size", "must be at least 1"));
        }
        if self.processing_timeout.is_zero() {
            return Err(invalid("processing_timeout", "must be non-zero"));
        }
        if self.deadlock_check_interval <= self.processing_timeout {
            return Err(invalid(
                "deadlock_check_interval",
                "must be longer than processing_timeout",
            ));
        }
        if self.fallback_reply.trim().is_empty() {
            return Err(invalid("fallback_reply", "must not be blank"));
        }
        Ok(())
    }
}

/// How the deduplicator keys events that carry no native message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyntheticKeyStrategy {
    /// `(sender, timestamp)` plus a random suffix. Never collides, never
    /// detects a duplicate.
    #[default]
    Random,
    /// SHA-256 over channel, sender, timestamp and body.
    ContentHash,
}

impl FromStr for SyntheticKeyStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "content_hash" | "content-hash" | "hash" => Ok(Self::ContentHash),
            other => Err(invalid(
                "synthetic_keys",
                &format!("unknown strategy '{other}'"),
            )),
        }
    }
}

/// Deduplicator configuration.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How long an admitted event key blocks re-admission.
    pub message_expiry: Duration,
    /// How often expired records are purged in the background.
    pub cleanup_interval: Duration,
    /// Upper bound on tracked records; the oldest is evicted beyond it.
    pub max_tracked_events: usize,
    /// Sender identities that belong to this system (echo filter).
    pub self_identities: Vec<String>,
    /// Key strategy for events without a native id.
    pub synthetic_keys: SyntheticKeyStrategy,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            message_expiry: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(30),
            max_tracked_events: 10_000,
            self_identities: Vec::new(),
            synthetic_keys: SyntheticKeyStrategy::Random,
        }
    }
}

impl DedupConfig {
    /// Load from `CONVO_GUARD_*` environment variables, defaulting absent values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let self_identities: Vec<String> = std::env::var("CONVO_GUARD_SELF_IDENTITIES")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let synthetic_keys = match std::env::var("CONVO_GUARD_SYNTHETIC_KEYS") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.synthetic_keys,
        };

        Ok(Self {
            message_expiry: env_millis("CONVO_GUARD_MESSAGE_EXPIRY_MS", defaults.message_expiry)?,
            cleanup_interval: env_millis(
                "CONVO_GUARD_DEDUP_CLEANUP_MS",
                defaults.cleanup_interval,
            )?,
            max_tracked_events: env_parse(
                "CONVO_GUARD_MAX_TRACKED_EVENTS",
                defaults.max_tracked_events,
            )?
            .max(1),
            self_identities,
            synthetic_keys,
        })
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerOptions {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// How long the circuit stays open before a probe is let through.
    pub reset_timeout: Duration,
    /// Optional per-call budget; an elapsed call counts as a failure.
    pub call_timeout: Option<Duration>,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            call_timeout: None,
        }
    }
}

impl BreakerOptions {
    /// Load from `CONVO_GUARD_BREAKER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let call_timeout = match std::env::var("CONVO_GUARD_BREAKER_CALL_TIMEOUT_MS") {
            Ok(raw) => Some(Duration::from_millis(parse_value(
                "CONVO_GUARD_BREAKER_CALL_TIMEOUT_MS",
                &raw,
            )?)),
            Err(_) => defaults.call_timeout,
        };
        Ok(Self {
            failure_threshold: env_parse(
                "CONVO_GUARD_BREAKER_FAILURE_THRESHOLD",
                defaults.failure_threshold,
            )?
            .max(1),
            success_threshold: env_parse(
                "CONVO_GUARD_BREAKER_SUCCESS_THRESHOLD",
                defaults.success_threshold,
            )?
            .max(1),
            reset_timeout: env_millis(
                "CONVO_GUARD_BREAKER_RESET_TIMEOUT_MS",
                defaults.reset_timeout,
            )?,
            call_timeout,
        })
    }
}

/// Everything the runtime needs.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub orchestrator: OrchestratorConfig,
    pub dedup: DedupConfig,
    pub breaker: BreakerOptions,
}

impl CoreConfig {
    /// Load every section from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            orchestrator: OrchestratorConfig::from_env()?,
            dedup: DedupConfig::from_env()?,
            breaker: BreakerOptions::from_env()?,
        })
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(key, &format!("cannot parse '{raw}'")))
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw).map(Duration::from_millis),
        Err(_) => Ok(default),
    }
}
