//! INSERT query builder.

use crate::client::GenericClient;
use crate::compiler::dialect::{Dialect, Postgres};
use crate::compiler::{CompiledQuery, Compiler};
use crate::error::{BuildError, OrmResult};
use crate::qb::select::SelectQuery;
use crate::qb::traits::Mutation;
use crate::record::Record;
use crate::schema::RecordType;
use crate::value::Value;
use std::sync::Arc;

/// Field name to value mapping for one row, in the order given.
pub type Fields = Vec<(String, Value)>;

/// Build a [`Fields`] mapping.
///
/// ```ignore
/// let row = fields!["username" => "alice", "age" => 31];
/// ```
#[macro_export]
macro_rules! fields {
    () => {
        $crate::Fields::new()
    };
    ($($name:expr => $value:expr),+ $(,)?) => {
        vec![$((::std::string::String::from($name), $crate::Value::from($value))),+]
    };
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertSource {
    Rows(Vec<Fields>),
    Select {
        fields: Vec<String>,
        query: Arc<SelectQuery>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertQuery {
    pub(crate) target: &'static RecordType,
    pub(crate) source: InsertSource,
    pub(crate) chunk_size: Option<usize>,
    pub(crate) returning: bool,
    pub(crate) on_conflict_ignore: bool,
    pub(crate) error: Option<BuildError>,
}

impl InsertQuery {
    /// Insert a single row.
    pub fn new(target: &'static RecordType, fields: Fields) -> Self {
        Self::rows(target, vec![fields])
    }

    /// Insert several rows. Keys missing from a row get the column default.
    pub fn rows(target: &'static RecordType, rows: Vec<Fields>) -> Self {
        Self::with_source(target, InsertSource::Rows(rows))
    }

    /// `INSERT INTO target (fields) SELECT ...`
    pub fn from_select<S: Into<String>>(
        target: &'static RecordType,
        fields: impl IntoIterator<Item = S>,
        query: &SelectQuery,
    ) -> Self {
        Self::with_source(
            target,
            InsertSource::Select {
                fields: fields.into_iter().map(Into::into).collect(),
                query: Arc::new(query.clone()),
            },
        )
    }

    fn with_source(target: &'static RecordType, source: InsertSource) -> Self {
        Self {
            target,
            source,
            chunk_size: None,
            returning: false,
            on_conflict_ignore: false,
            error: None,
        }
    }

    /// Split the rows into statements of at most `n` rows each.
    pub fn chunk_size(&self, n: usize) -> Self {
        let mut next = self.clone();
        if n == 0 {
            next.error
                .get_or_insert(BuildError::invalid_argument("chunk size must be at least 1"));
        } else {
            next.chunk_size = Some(n);
        }
        next
    }

    /// Ask for the inserted rows back, where the dialect supports RETURNING.
    pub fn returning(&self) -> Self {
        let mut next = self.clone();
        next.returning = true;
        next
    }

    /// Skip rows that violate a constraint instead of failing.
    pub fn on_conflict_ignore(&self) -> Self {
        let mut next = self.clone();
        next.on_conflict_ignore = true;
        next
    }

    pub fn target(&self) -> &'static RecordType {
        self.target
    }

    pub fn source(&self) -> &InsertSource {
        &self.source
    }

    /// Compile as a single PostgreSQL statement, ignoring the chunk size.
    pub fn compile(&self) -> Result<CompiledQuery, BuildError> {
        self.compile_with(&Postgres)
    }

    pub fn compile_with(&self, dialect: &dyn Dialect) -> Result<CompiledQuery, BuildError> {
        Compiler::new(dialect).compile_insert(self)
    }

    /// Execute and return the inserted rows as persisted records.
    ///
    /// When the dialect has no RETURNING the records are rebuilt from the input
    /// mappings; their primary key is only known if it was part of the input.
    pub async fn execute_returning(&self, db: &impl GenericClient) -> OrmResult<Vec<Record>> {
        let statements = self.returning().statements(db.dialect())?;
        let mut created = Vec::new();
        let mut rebuild = false;
        for stmt in &statements {
            if stmt.is_returning() {
                created.extend(db.fetch_all(stmt).await?);
            } else {
                db.execute(stmt).await?;
                rebuild = true;
            }
        }
        if rebuild {
            if let InsertSource::Rows(rows) = &self.source {
                for row in rows {
                    created.push(Record::from_inserted(self.target, row)?);
                }
            }
        }
        Ok(created)
    }
}

impl Mutation for InsertQuery {
    fn statements(&self, dialect: &dyn Dialect) -> Result<Vec<CompiledQuery>, BuildError> {
        Compiler::new(dialect).compile_batches(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::USER;

    #[test]
    fn test_simple_insert() {
        let q = InsertQuery::new(&USER, fields!["username" => "alice", "age" => 31]);
        let stmt = q.compile().unwrap();
        assert_eq!(stmt.sql(), "INSERT INTO users (username, age) VALUES ($1, $2)");
        assert_eq!(stmt.params(), &[Value::from("alice"), Value::Int(31)]);
    }

    #[test]
    fn test_insert_columns_follow_declaration_order() {
        let q = InsertQuery::new(&USER, fields!["age" => 31, "username" => "alice"]);
        let stmt = q.compile().unwrap();
        assert_eq!(stmt.sql(), "INSERT INTO users (username, age) VALUES ($1, $2)");
        assert_eq!(stmt.params(), &[Value::from("alice"), Value::Int(31)]);
    }

    #[test]
    fn test_insert_with_returning() {
        let stmt = InsertQuery::new(&USER, fields!["username" => "alice"])
            .returning()
            .compile()
            .unwrap();
        assert_eq!(
            stmt.sql(),
            "INSERT INTO users (username) VALUES ($1) RETURNING id, username, age, active"
        );
        assert!(stmt.is_returning());
    }

    #[test]
    fn test_insert_on_conflict_do_nothing() {
        let stmt = InsertQuery::new(&USER, fields!["username" => "alice"])
            .on_conflict_ignore()
            .compile()
            .unwrap();
        assert_eq!(
            stmt.sql(),
            "INSERT INTO users (username) VALUES ($1) ON CONFLICT DO NOTHING"
        );
    }

    #[test]
    fn test_insert_default_values() {
        let stmt = InsertQuery::new(&USER, Fields::new()).compile().unwrap();
        assert_eq!(stmt.sql(), "INSERT INTO users DEFAULT VALUES");
    }

    #[test]
    fn test_zero_chunk_size_is_rejected() {
        let err = InsertQuery::new(&USER, fields!["username" => "alice"])
            .chunk_size(0)
            .compile()
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidArgument(_)));
    }

    #[test]
    fn test_type_mismatch_is_rejected() {
        let err = InsertQuery::new(&USER, fields!["age" => "old"])
            .compile()
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidArgument(_)));
    }
}
