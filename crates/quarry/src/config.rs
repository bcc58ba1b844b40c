//! Database handle configuration.

use crate::compiler::dialect::{Dialect, Postgres};
use crate::error::{BuildError, OrmResult};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

/// Configuration for a [`Database`](crate::Database).
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// SQL dialect statements are compiled for.
    pub dialect: Arc<dyn Dialect>,
    /// Savepoints are named `{prefix}_{depth}`.
    pub savepoint_prefix: String,
    /// Per-statement timeout.
    pub statement_timeout: Option<Duration>,
    /// Statements slower than this are logged at WARN.
    pub slow_query_threshold: Option<Duration>,
    /// Level of the per-statement tracing event. `None` disables it.
    pub log_level: Option<Level>,
    /// Truncate logged SQL (in bytes). `None` means no truncation.
    pub max_logged_sql_length: Option<usize>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dialect: Arc::new(Postgres),
            savepoint_prefix: "sp".to_string(),
            statement_timeout: None,
            slow_query_threshold: None,
            log_level: Some(Level::DEBUG),
            max_logged_sql_length: Some(200),
        }
    }
}

impl DatabaseConfig {
    /// Create a new configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by the environment:
    ///
    /// - `QUARRY_STATEMENT_TIMEOUT_MS`: statement timeout in milliseconds
    /// - `QUARRY_SLOW_QUERY_MS`: slow statement threshold in milliseconds
    /// - `QUARRY_LOG_SQL`: a tracing level (`debug`, `info`, ...) or `off`
    pub fn from_env() -> OrmResult<Self> {
        let mut config = Self::default();
        if let Some(timeout) = env_millis("QUARRY_STATEMENT_TIMEOUT_MS")? {
            config.statement_timeout = Some(timeout);
        }
        if let Some(threshold) = env_millis("QUARRY_SLOW_QUERY_MS")? {
            config.slow_query_threshold = Some(threshold);
        }
        if let Ok(raw) = std::env::var("QUARRY_LOG_SQL") {
            config.log_level = parse_log_level(&raw)?;
        }
        Ok(config)
    }

    pub fn dialect(mut self, dialect: impl Dialect + 'static) -> Self {
        self.dialect = Arc::new(dialect);
        self
    }

    pub fn savepoint_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.savepoint_prefix = prefix.into();
        self
    }

    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    pub fn slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = Some(threshold);
        self
    }

    /// Override the tracing event level.
    pub fn log_level(mut self, level: Level) -> Self {
        self.log_level = Some(level);
        self
    }

    /// Stop emitting per-statement events. Slow statements are still reported.
    pub fn no_sql_logging(mut self) -> Self {
        self.log_level = None;
        self
    }

    /// Set maximum SQL length to display.
    pub fn max_logged_sql_length(mut self, len: usize) -> Self {
        self.max_logged_sql_length = Some(len);
        self
    }

    /// Disable SQL truncation.
    pub fn no_truncate(mut self) -> Self {
        self.max_logged_sql_length = None;
        self
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>, BuildError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| BuildError::invalid_argument(format!("{name} must be milliseconds, got '{raw}'"))),
        Err(_) => Ok(None),
    }
}

fn parse_log_level(raw: &str) -> Result<Option<Level>, BuildError> {
    let raw = raw.trim();
    if ["off", "false", "0", ""].iter().any(|v| raw.eq_ignore_ascii_case(v)) {
        return Ok(None);
    }
    Level::from_str(raw)
        .map(Some)
        .map_err(|_| BuildError::invalid_argument(format!("QUARRY_LOG_SQL: unknown level '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(parse_log_level("off").unwrap(), None);
        assert_eq!(parse_log_level("INFO").unwrap(), Some(Level::INFO));
        assert_eq!(parse_log_level(" debug ").unwrap(), Some(Level::DEBUG));
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_builder() {
        let config = DatabaseConfig::new()
            .dialect(crate::compiler::dialect::Sqlite)
            .statement_timeout(Duration::from_secs(5))
            .savepoint_prefix("nested")
            .no_truncate();
        assert_eq!(config.dialect.name(), "sqlite");
        assert_eq!(config.statement_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.savepoint_prefix, "nested");
        assert_eq!(config.max_logged_sql_length, None);
    }
}
