//! SQL dialects.
//!
//! The compiler only asks a dialect for the pieces that differ between databases:
//! placeholder syntax, LIMIT/OFFSET rendering, RETURNING and conflict handling.

use crate::error::BuildError;
use std::fmt;

pub trait Dialect: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Append the placeholder for the 1-based parameter `index`.
    fn write_placeholder(&self, index: usize, out: &mut String);

    fn supports_returning(&self) -> bool {
        false
    }

    /// Whether `DEFAULT` may appear inside a multi-row VALUES list.
    fn supports_default_in_values(&self) -> bool {
        true
    }

    fn write_limit_offset(&self, limit: Option<u64>, offset: Option<u64>, out: &mut String) {
        if let Some(limit) = limit {
            out.push_str(" LIMIT ");
            out.push_str(&limit.to_string());
        }
        if let Some(offset) = offset {
            out.push_str(" OFFSET ");
            out.push_str(&offset.to_string());
        }
    }

    fn write_on_conflict_do_nothing(&self, out: &mut String) -> Result<(), BuildError> {
        let _ = out;
        Err(BuildError::invalid_argument(format!(
            "the {} dialect has no ON CONFLICT clause",
            self.name()
        )))
    }
}

/// PostgreSQL: `$1, $2, ...`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

impl Dialect for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn write_placeholder(&self, index: usize, out: &mut String) {
        out.push('$');
        out.push_str(&index.to_string());
    }

    fn supports_returning(&self) -> bool {
        true
    }

    fn write_on_conflict_do_nothing(&self, out: &mut String) -> Result<(), BuildError> {
        out.push_str(" ON CONFLICT DO NOTHING");
        Ok(())
    }
}

/// SQLite: `?1, ?2, ...`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sqlite;

impl Dialect for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn write_placeholder(&self, index: usize, out: &mut String) {
        out.push('?');
        out.push_str(&index.to_string());
    }

    fn supports_returning(&self) -> bool {
        true
    }

    fn supports_default_in_values(&self) -> bool {
        false
    }

    fn write_limit_offset(&self, limit: Option<u64>, offset: Option<u64>, out: &mut String) {
        match (limit, offset) {
            (None, Some(offset)) => {
                out.push_str(" LIMIT -1 OFFSET ");
                out.push_str(&offset.to_string());
            }
            _ => Postgres.write_limit_offset(limit, offset, out),
        }
    }

    fn write_on_conflict_do_nothing(&self, out: &mut String) -> Result<(), BuildError> {
        out.push_str(" ON CONFLICT DO NOTHING");
        Ok(())
    }
}

/// Plain standard SQL: anonymous `?` placeholders and `OFFSET .. FETCH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Generic;

impl Dialect for Generic {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn write_placeholder(&self, _index: usize, out: &mut String) {
        out.push('?');
    }

    fn write_limit_offset(&self, limit: Option<u64>, offset: Option<u64>, out: &mut String) {
        if let Some(offset) = offset {
            out.push_str(" OFFSET ");
            out.push_str(&offset.to_string());
            out.push_str(" ROWS");
        }
        if let Some(limit) = limit {
            out.push_str(if offset.is_some() {
                " FETCH NEXT "
            } else {
                " FETCH FIRST "
            });
            out.push_str(&limit.to_string());
            out.push_str(" ROWS ONLY");
        }
    }
}
