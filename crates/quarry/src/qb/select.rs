//! SELECT query builder.

use crate::client::GenericClient;
use crate::compiler::dialect::{Dialect, Postgres};
use crate::compiler::{CompiledQuery, Compiler};
use crate::error::{BuildError, OrmError, OrmResult};
use crate::qb::expr::{Expr, OrderBy, func};
use crate::record::Record;
use crate::row::FromRow;
use crate::schema::RecordType;
use crate::value::{FromValue, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    LeftOuter,
}

impl JoinKind {
    pub fn as_sql(self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::LeftOuter => "LEFT OUTER JOIN",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub(crate) kind: JoinKind,
    pub(crate) target: &'static RecordType,
    pub(crate) on: Expr,
}

impl Join {
    pub fn kind(&self) -> JoinKind {
        self.kind
    }

    pub fn target(&self) -> &'static RecordType {
        self.target
    }

    pub fn on(&self) -> &Expr {
        &self.on
    }
}

/// SELECT query over a primary record type.
///
/// Every builder method leaves `self` untouched and returns a new query, so a base
/// query can be shared and refined in several directions. Errors found while
/// chaining are kept and reported when the query is compiled.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub(crate) from: &'static RecordType,
    pub(crate) columns: Vec<Expr>,
    pub(crate) distinct: bool,
    pub(crate) joins: Vec<Join>,
    /// Record type that `join` resolves relations against.
    pub(crate) context: &'static RecordType,
    pub(crate) predicate: Option<Expr>,
    pub(crate) group_by: Vec<Expr>,
    pub(crate) having: Option<Expr>,
    pub(crate) order_by: Vec<OrderBy>,
    pub(crate) limit: Option<u64>,
    pub(crate) offset: Option<u64>,
    pub(crate) error: Option<BuildError>,
}

impl SelectQuery {
    /// Select every declared field of `record`.
    pub fn new(record: &'static RecordType) -> Self {
        Self {
            from: record,
            columns: Vec::new(),
            distinct: false,
            joins: Vec::new(),
            context: record,
            predicate: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            error: None,
        }
    }

    fn with(&self, f: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        f(&mut next);
        next
    }

    fn fail(&self, err: BuildError) -> Self {
        self.with(|q| {
            q.error.get_or_insert(err);
        })
    }

    /// Replace the select list. An empty list means every field of the primary type.
    pub fn columns(&self, columns: impl IntoIterator<Item = Expr>) -> Self {
        let columns: Vec<Expr> = columns.into_iter().collect();
        self.with(|q| q.columns = columns)
    }

    /// Append one expression to the select list.
    pub fn add_column(&self, column: Expr) -> Self {
        self.with(|q| {
            if q.columns.is_empty() {
                q.columns = q.from.columns();
            }
            q.columns.push(column);
        })
    }

    pub fn distinct(&self) -> Self {
        self.with(|q| q.distinct = true)
    }

    /// Join `other`, deriving the ON condition from the relation between it and the
    /// current join context, in whichever direction it is declared.
    pub fn join(&self, other: &'static RecordType, kind: JoinKind) -> Self {
        let context = self.context;
        let on = if let Some(rel) = other.relation_to(context) {
            other.col(rel.field()).eq(context.pk())
        } else if let Some(rel) = context.relation_to(other) {
            context.col(rel.field()).eq(other.pk())
        } else {
            return self.fail(BuildError::UnresolvedRelation {
                from: context.table().to_string(),
                to: other.table().to_string(),
            });
        };
        self.join_on(other, kind, on)
    }

    /// Join `other` with an explicit ON condition.
    pub fn join_on(&self, other: &'static RecordType, kind: JoinKind, on: Expr) -> Self {
        if self.in_scope(other) {
            return self.fail(BuildError::invalid_argument(format!(
                "'{}' is already part of the query",
                other.table()
            )));
        }
        self.with(|q| {
            q.joins.push(Join {
                kind,
                target: other,
                on,
            });
            q.context = other;
        })
    }

    /// Make `record` the context for the next `join`.
    pub fn switch(&self, record: &'static RecordType) -> Self {
        if !self.in_scope(record) {
            return self.fail(BuildError::invalid_argument(format!(
                "cannot switch to '{}', it is not part of the query",
                record.table()
            )));
        }
        self.with(|q| q.context = record)
    }

    /// Add a WHERE predicate. Repeated calls are AND-ed together.
    #[doc(alias = "where")]
    pub fn filter(&self, predicate: Expr) -> Self {
        self.with(|q| {
            q.predicate = Some(match q.predicate.take() {
                Some(existing) => existing.and(predicate),
                None => predicate,
            });
        })
    }

    pub fn group_by(&self, exprs: impl IntoIterator<Item = Expr>) -> Self {
        let exprs: Vec<Expr> = exprs.into_iter().collect();
        self.with(|q| q.group_by.extend(exprs))
    }

    /// Add a HAVING predicate. Repeated calls are AND-ed together.
    pub fn having(&self, predicate: Expr) -> Self {
        self.with(|q| {
            q.having = Some(match q.having.take() {
                Some(existing) => existing.and(predicate),
                None => predicate,
            });
        })
    }

    pub fn order_by<I, O>(&self, terms: I) -> Self
    where
        I: IntoIterator<Item = O>,
        O: Into<OrderBy>,
    {
        let terms: Vec<OrderBy> = terms.into_iter().map(Into::into).collect();
        self.with(|q| q.order_by.extend(terms))
    }

    pub fn limit(&self, limit: u64) -> Self {
        self.with(|q| q.limit = Some(limit))
    }

    pub fn offset(&self, offset: u64) -> Self {
        self.with(|q| q.offset = Some(offset))
    }

    /// 1-based page of `page_size` rows.
    pub fn paginate(&self, page: u64, page_size: u64) -> Self {
        if page < 1 || page_size < 1 {
            return self.fail(BuildError::invalid_argument(format!(
                "paginate needs page >= 1 and page_size >= 1, got page={page} page_size={page_size}"
            )));
        }
        match (page - 1).checked_mul(page_size) {
            Some(offset) => self.limit(page_size).offset(offset),
            None => self.fail(BuildError::invalid_argument("page offset overflows u64")),
        }
    }

    /// Count related `other` rows per row of the primary type as `count`.
    pub fn annotate(&self, other: &'static RecordType) -> Self {
        self.annotate_with(other, func::count(other.pk()).alias("count"))
    }

    /// Join `other` if needed, append `annotation` and group by every
    /// non-aggregate column already selected.
    pub fn annotate_with(&self, other: &'static RecordType, annotation: Expr) -> Self {
        let base = if self.in_scope(other) {
            self.clone()
        } else {
            self.join(other, JoinKind::Inner)
        };
        base.with(|q| {
            if q.columns.is_empty() {
                q.columns = q.from.columns();
            }
            if q.group_by.is_empty() {
                q.group_by = q
                    .columns
                    .iter()
                    .filter(|c| !c.is_aggregate())
                    .map(|c| c.unaliased().clone())
                    .collect();
            }
            q.columns.push(annotation);
        })
    }

    pub fn record(&self) -> &'static RecordType {
        self.from
    }

    pub fn predicate(&self) -> Option<&Expr> {
        self.predicate.as_ref()
    }

    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    /// Number of columns the query yields.
    pub fn column_count(&self) -> usize {
        if self.columns.is_empty() {
            self.from.fields().len()
        } else {
            self.columns.len()
        }
    }

    /// Whether `record` is the FROM table or one of the joined tables.
    pub fn in_scope(&self, record: &RecordType) -> bool {
        self.from == record || self.joins.iter().any(|j| j.target == record)
    }

    /// Compile for PostgreSQL.
    pub fn compile(&self) -> Result<CompiledQuery, BuildError> {
        self.compile_with(&Postgres)
    }

    pub fn compile_with(&self, dialect: &dyn Dialect) -> Result<CompiledQuery, BuildError> {
        Compiler::new(dialect).compile_select(self)
    }

    /// Every matching row as a record of the primary type.
    pub async fn fetch_all(&self, db: &impl GenericClient) -> OrmResult<Vec<Record>> {
        let stmt = self.compile_with(db.dialect())?;
        db.fetch_all(&stmt).await
    }

    /// First matching row; `NotFound` when there is none.
    pub async fn get(&self, db: &impl GenericClient) -> OrmResult<Record> {
        self.first(db).await?.ok_or_else(|| {
            OrmError::not_found(format!("no matching '{}' row", self.from.table()))
        })
    }

    pub async fn first(&self, db: &impl GenericClient) -> OrmResult<Option<Record>> {
        let stmt = self.limit(1).compile_with(db.dialect())?;
        db.fetch_optional(&stmt).await
    }

    pub async fn fetch_all_as<T: FromRow>(&self, db: &impl GenericClient) -> OrmResult<Vec<T>> {
        let stmt = self.compile_with(db.dialect())?;
        db.fetch_all_as(&stmt).await
    }

    /// Number of rows the query would return.
    pub async fn count(&self, db: &impl GenericClient) -> OrmResult<u64> {
        let stmt = Compiler::new(db.dialect()).compile_count(self)?;
        let value = db.scalar(&stmt).await?;
        value
            .as_i64()
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| OrmError::decode("count", format!("expected a count, got {value:?}")))
    }

    pub async fn exists(&self, db: &impl GenericClient) -> OrmResult<bool> {
        let stmt = self.limit(1).compile_with(db.dialect())?;
        Ok(!db.fetch_rows(&stmt).await?.is_empty())
    }

    /// First column of the first row.
    pub async fn scalar(&self, db: &impl GenericClient) -> OrmResult<Value> {
        let stmt = self.compile_with(db.dialect())?;
        db.scalar(&stmt).await
    }

    /// Every column of the first row.
    pub async fn scalar_tuple(&self, db: &impl GenericClient) -> OrmResult<Vec<Value>> {
        let stmt = self.compile_with(db.dialect())?;
        db.scalar_tuple(&stmt).await
    }

    pub async fn scalar_as<T: FromValue>(&self, db: &impl GenericClient) -> OrmResult<T> {
        let value = self.scalar(db).await?;
        T::from_value(value).map_err(|message| OrmError::decode("scalar", message))
    }
}
