//! `tracing` events for executed statements and transaction scopes.
//!
//! Statements are reported under the `quarry.sql` target at the configured level,
//! slow ones at WARN. Scope changes use the `quarry.tx` target at DEBUG.

use crate::compiler::CompiledQuery;
use crate::config::DatabaseConfig;
use crate::error::OrmError;
use std::borrow::Cow;
use std::time::Duration;
use tracing::Level;

/// Dispatch a tracing event at a runtime-determined level.
macro_rules! emit_at_level {
    ($level:expr, $($field:tt)*) => {
        match $level {
            Level::ERROR => tracing::error!($($field)*),
            Level::WARN  => tracing::warn!($($field)*),
            Level::INFO  => tracing::info!($($field)*),
            Level::DEBUG => tracing::debug!($($field)*),
            Level::TRACE => tracing::trace!($($field)*),
        }
    };
}

#[derive(Debug, Clone)]
pub(crate) struct SqlTracer {
    level: Option<Level>,
    max_sql_length: Option<usize>,
    slow_threshold: Option<Duration>,
}

impl SqlTracer {
    pub(crate) fn from_config(config: &DatabaseConfig) -> Self {
        Self {
            level: config.log_level,
            max_sql_length: config.max_logged_sql_length,
            slow_threshold: config.slow_query_threshold,
        }
    }

    fn truncate_sql<'s>(&self, sql: &'s str) -> Cow<'s, str> {
        match self.max_sql_length {
            Some(max) if sql.len() > max => Cow::Owned(format!("{}...", truncate_sql_bytes(sql, max))),
            _ => Cow::Borrowed(sql),
        }
    }

    /// Report a finished statement; `outcome` carries the row count or the error.
    pub(crate) fn statement(
        &self,
        stmt: &CompiledQuery,
        elapsed: Duration,
        outcome: Result<u64, &OrmError>,
    ) {
        let slow = self.slow_threshold.is_some_and(|t| elapsed >= t);
        let level = if slow { Some(Level::WARN) } else { self.level };
        let Some(level) = level else {
            return;
        };
        let sql = self.truncate_sql(stmt.sql());
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        match outcome {
            Ok(rows) => emit_at_level!(
                level,
                target: "quarry.sql",
                kind = stmt.kind().as_str(),
                param_count = stmt.params().len(),
                elapsed_ms,
                rows,
                slow,
                sql = %sql,
            ),
            Err(err) => emit_at_level!(
                level,
                target: "quarry.sql",
                kind = stmt.kind().as_str(),
                param_count = stmt.params().len(),
                elapsed_ms,
                slow,
                error = %err,
                sql = %sql,
            ),
        }
    }

    pub(crate) fn scope(&self, action: &'static str, depth: usize) {
        tracing::debug!(target: "quarry.tx", action, depth);
    }
}

pub(crate) fn truncate_sql_bytes(sql: &str, max_bytes: usize) -> &str {
    if sql.len() <= max_bytes {
        return sql;
    }
    let mut end = max_bytes;
    while end > 0 && !sql.is_char_boundary(end) {
        end -= 1;
    }
    &sql[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncation_respects_char_boundaries() {
        assert_eq!(truncate_sql_bytes("SELECT 1", 100), "SELECT 1");
        assert_eq!(truncate_sql_bytes("SELECT 1", 6), "SELECT");
        // 'é' is two bytes; cutting inside it backs off to the boundary
        assert_eq!(truncate_sql_bytes("café", 4), "caf");
    }

    #[test]
    fn test_truncate_adds_ellipsis() {
        let tracer = SqlTracer::from_config(&DatabaseConfig::new().max_logged_sql_length(6));
        assert_eq!(tracer.truncate_sql("SELECT id FROM users"), "SELECT...");
        assert_eq!(tracer.truncate_sql("SELECT"), "SELECT");
    }
}
