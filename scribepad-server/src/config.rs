//! Engine configuration, parsed from environment variables.

use std::time::Duration;

use anyhow::anyhow;

use crate::Identifier;

/// Tunable knobs of the collaboration engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Coalescing window between a buffered change and its durable write.
    pub flush_interval: Duration,
    /// Lifetime of a cached document record.
    pub cache_ttl: Duration,
    /// Number of accepted operation sets retained per document.
    pub history_max_ops: usize,
    /// Per-connection budget for document-scoped events.
    pub document_events_per_second: u32,
    /// Per-connection budget for all other events.
    pub general_events_per_second: u32,
    /// Per-source-address budget for new connections.
    pub connections_per_minute: u32,
    /// Deadline for the handshake and the document load reply.
    pub load_timeout: Duration,
    /// Reserved identity with unconditional owner capability, for recovery.
    pub admin_user: Identifier,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(2000),
            cache_ttl: Duration::from_secs(3600),
            history_max_ops: 1000,
            document_events_per_second: 30,
            general_events_per_second: 50,
            connections_per_minute: 10,
            load_timeout: Duration::from_secs(10),
            admin_user: "admin".parse().expect("valid default admin identity"),
        }
    }
}

impl EngineConfig {
    /// Load the configuration from environment variables, falling back to
    /// the defaults for anything unset.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            flush_interval: Duration::from_millis(
                var_or("FLUSH_INTERVAL_MS", defaults.flush_interval.as_millis() as u64)?,
            ),
            cache_ttl: Duration::from_secs(var_or(
                "CACHE_TTL_SECONDS",
                defaults.cache_ttl.as_secs(),
            )?),
            history_max_ops: var_or("HISTORY_MAX_OPS", defaults.history_max_ops)?,
            document_events_per_second: var_or(
                "DOCUMENT_EVENTS_PER_SECOND",
                defaults.document_events_per_second,
            )?,
            general_events_per_second: var_or(
                "GENERAL_EVENTS_PER_SECOND",
                defaults.general_events_per_second,
            )?,
            connections_per_minute: var_or(
                "CONNECTIONS_PER_MINUTE",
                defaults.connections_per_minute,
            )?,
            load_timeout: Duration::from_secs(var_or(
                "LOAD_TIMEOUT_SECONDS",
                defaults.load_timeout.as_secs(),
            )?),
            admin_user: var_or("ADMIN_USER", defaults.admin_user)?,
        })
    }
}

fn var_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|e| anyhow!("Unable to parse {name}: {e}")),
        Err(_) => Ok(default),
    }
}
