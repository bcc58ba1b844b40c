//! Renders query ASTs into parameterized SQL.
//!
//! Every literal becomes a placeholder and its value is appended to the parameter
//! list; nothing from a [`Value`] is ever written into the SQL text. Compilation is
//! deterministic, so equal ASTs give byte-identical SQL and parameter order.
//!
//! Column references are resolved against the tables in scope: the FROM table and
//! every joined table, plus the scopes of enclosing queries for subqueries. A column
//! is written as `table.column` when its scope holds more than one table or when it
//! belongs to an enclosing query, and as a bare `column` otherwise.

pub mod dialect;

use crate::error::BuildError;
use crate::ident::check_ident;
use crate::qb::delete::DeleteQuery;
use crate::qb::expr::{BinaryOp, ColumnRef, Direction, Expr, UnaryOp, func};
use crate::qb::insert::{Fields, InsertQuery, InsertSource};
use crate::qb::select::SelectQuery;
use crate::qb::update::UpdateQuery;
use crate::schema::RecordType;
use crate::value::Value;
use dialect::Dialect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
}

impl StatementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
        }
    }
}

/// SQL text plus its ordered parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    sql: String,
    params: Vec<Value>,
    kind: StatementKind,
    record: Option<&'static RecordType>,
    returning: bool,
}

impl CompiledQuery {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    /// The record type rows of this statement map onto, if any.
    pub fn record(&self) -> Option<&'static RecordType> {
        self.record
    }

    /// Whether the statement returns the written rows.
    pub fn is_returning(&self) -> bool {
        self.returning
    }
}

/// Any statement AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Select(SelectQuery),
    Insert(InsertQuery),
    Update(UpdateQuery),
    Delete(DeleteQuery),
}

impl From<SelectQuery> for Query {
    fn from(q: SelectQuery) -> Self {
        Query::Select(q)
    }
}

impl From<InsertQuery> for Query {
    fn from(q: InsertQuery) -> Self {
        Query::Insert(q)
    }
}

impl From<UpdateQuery> for Query {
    fn from(q: UpdateQuery) -> Self {
        Query::Update(q)
    }
}

impl From<DeleteQuery> for Query {
    fn from(q: DeleteQuery) -> Self {
        Query::Delete(q)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Compiler<'d> {
    dialect: &'d dyn Dialect,
}

impl<'d> Compiler<'d> {
    pub fn new(dialect: &'d dyn Dialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> &'d dyn Dialect {
        self.dialect
    }

    /// Compile any statement. Multi-row inserts become a single statement here;
    /// use [`Compiler::compile_batches`] to honor a chunk size.
    pub fn compile(&self, query: &Query) -> Result<CompiledQuery, BuildError> {
        match query {
            Query::Select(q) => self.compile_select(q),
            Query::Insert(q) => self.compile_insert(q),
            Query::Update(q) => self.compile_update(q),
            Query::Delete(q) => self.compile_delete(q),
        }
    }

    pub fn compile_select(&self, query: &SelectQuery) -> Result<CompiledQuery, BuildError> {
        let mut w = Writer::new(self.dialect);
        w.select(query)?;
        Ok(w.finish(StatementKind::Select, Some(query.from), false))
    }

    /// `SELECT COUNT(*)` over the rows the query would return.
    pub fn compile_count(&self, query: &SelectQuery) -> Result<CompiledQuery, BuildError> {
        let mut w = Writer::new(self.dialect);
        let needs_subquery = query.distinct
            || !query.group_by.is_empty()
            || query.having.is_some()
            || query.limit.is_some()
            || query.offset.is_some();
        if needs_subquery {
            w.push("SELECT COUNT(*) FROM (");
            w.select(query)?;
            w.push(") AS t");
        } else {
            let mut counted = query.clone();
            counted.columns = vec![func::count_all()];
            counted.order_by.clear();
            w.select(&counted)?;
        }
        Ok(w.finish(StatementKind::Select, None, false))
    }

    pub fn compile_insert(&self, query: &InsertQuery) -> Result<CompiledQuery, BuildError> {
        if let Some(err) = &query.error {
            return Err(err.clone());
        }
        match &query.source {
            InsertSource::Rows(rows) => {
                if rows.is_empty() {
                    return Err(BuildError::invalid_argument(format!(
                        "INSERT into '{}' has no rows",
                        query.target.table()
                    )));
                }
                let columns = insert_columns(query.target, rows)?;
                self.insert_rows(query, rows, &columns)
            }
            InsertSource::Select { fields, query: source } => {
                let mut w = Writer::new(self.dialect);
                w.insert_from(query, fields, source)?;
                Ok(w.finish(StatementKind::Insert, Some(query.target), false))
            }
        }
    }

    /// One statement per chunk of rows. An insert without rows yields no statements.
    pub fn compile_batches(&self, query: &InsertQuery) -> Result<Vec<CompiledQuery>, BuildError> {
        if let Some(err) = &query.error {
            return Err(err.clone());
        }
        let InsertSource::Rows(rows) = &query.source else {
            return Ok(vec![self.compile_insert(query)?]);
        };
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let columns = insert_columns(query.target, rows)?;
        let chunk_size = query.chunk_size.unwrap_or(rows.len());
        rows.chunks(chunk_size)
            .map(|chunk| self.insert_rows(query, chunk, &columns))
            .collect()
    }

    fn insert_rows(
        &self,
        query: &InsertQuery,
        rows: &[Fields],
        columns: &[&'static str],
    ) -> Result<CompiledQuery, BuildError> {
        let mut w = Writer::new(self.dialect);
        w.insert_rows(query, rows, columns)?;
        let returning = w.returning(query)?;
        Ok(w.finish(StatementKind::Insert, Some(query.target), returning))
    }

    pub fn compile_update(&self, query: &UpdateQuery) -> Result<CompiledQuery, BuildError> {
        let mut w = Writer::new(self.dialect);
        w.update(query)?;
        Ok(w.finish(StatementKind::Update, Some(query.target), false))
    }

    pub fn compile_delete(&self, query: &DeleteQuery) -> Result<CompiledQuery, BuildError> {
        let mut w = Writer::new(self.dialect);
        w.delete(query)?;
        Ok(w.finish(StatementKind::Delete, Some(query.target), false))
    }
}

/// Validate every mapping and collect the union of their keys, in declaration order.
fn insert_columns(target: &RecordType, rows: &[Fields]) -> Result<Vec<&'static str>, BuildError> {
    let mut columns: Vec<&'static str> = Vec::new();
    for row in rows {
        for (i, (key, value)) in row.iter().enumerate() {
            let field = target
                .field(key)
                .ok_or_else(|| BuildError::unknown_field(target.table(), key.as_str()))?;
            if row[..i].iter().any(|(k, _)| k == key) {
                return Err(BuildError::invalid_argument(format!(
                    "field '{key}' appears twice in one row"
                )));
            }
            field.check_value(target, value)?;
            if !columns.contains(&field.name()) {
                columns.push(field.name());
            }
        }
    }
    columns.sort_by_key(|name| target.field_index(name));
    Ok(columns)
}

struct Writer<'d> {
    dialect: &'d dyn Dialect,
    sql: String,
    params: Vec<Value>,
    scopes: Vec<Vec<&'static RecordType>>,
}

impl<'d> Writer<'d> {
    fn new(dialect: &'d dyn Dialect) -> Self {
        Self {
            dialect,
            sql: String::with_capacity(128),
            params: Vec::new(),
            scopes: Vec::new(),
        }
    }

    fn finish(
        self,
        kind: StatementKind,
        record: Option<&'static RecordType>,
        returning: bool,
    ) -> CompiledQuery {
        CompiledQuery {
            sql: self.sql,
            params: self.params,
            kind,
            record,
            returning,
        }
    }

    fn push(&mut self, s: &str) {
        self.sql.push_str(s);
    }

    fn ident(&mut self, kind: &str, s: &str) -> Result<(), BuildError> {
        check_ident(kind, s)?;
        self.push(s);
        Ok(())
    }

    fn bind(&mut self, value: Value) {
        self.params.push(value);
        self.dialect.write_placeholder(self.params.len(), &mut self.sql);
    }

    fn column(&mut self, column: &ColumnRef) -> Result<(), BuildError> {
        let record = column.record();
        if record.field(column.name()).is_none() {
            return Err(BuildError::unknown_field(record.table(), column.name()));
        }
        let Some(depth) = self.scopes.iter().rposition(|s| s.contains(&record)) else {
            return Err(BuildError::UnresolvedColumn {
                table: record.table().to_string(),
                column: column.name().to_string(),
            });
        };
        if depth + 1 != self.scopes.len() || self.scopes[depth].len() > 1 {
            self.ident("table name", record.table())?;
            self.push(".");
        }
        self.ident("column name", column.name())
    }

    fn list<T>(
        &mut self,
        items: &[T],
        mut each: impl FnMut(&mut Self, &T) -> Result<(), BuildError>,
    ) -> Result<(), BuildError> {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            each(self, item)?;
        }
        Ok(())
    }

    fn expr(&mut self, expr: &Expr) -> Result<(), BuildError> {
        match expr {
            Expr::Column(c) => self.column(c),
            Expr::Literal(Value::List(_)) => Err(BuildError::invalid_expression(
                "a list literal is only valid on the right-hand side of IN",
            )),
            Expr::Literal(v) => {
                self.bind(v.clone());
                Ok(())
            }
            Expr::Binary { op, left, right } if op.is_membership() => {
                self.membership(*op, left, right)
            }
            Expr::Binary { op, left, right } => {
                self.operand(left, *op, false)?;
                self.push(" ");
                self.push(op.as_sql());
                self.push(" ");
                self.operand(right, *op, true)
            }
            Expr::Unary { op, operand } => self.unary(*op, operand),
            Expr::Function { name, args } => {
                self.ident("function name", name)?;
                self.push("(");
                self.list(args, |w, a| w.expr(a))?;
                self.push(")");
                Ok(())
            }
            Expr::Subquery(q) => self.subquery(q),
            Expr::Aliased { expr, .. } => self.expr(expr),
            Expr::AliasRef(name) => self.ident("alias", name),
            Expr::Wildcard => {
                self.push("*");
                Ok(())
            }
        }
    }

    /// Render a binary operand, parenthesizing it when SQL precedence would
    /// otherwise regroup it.
    fn operand(&mut self, expr: &Expr, parent: BinaryOp, right: bool) -> Result<(), BuildError> {
        let wrap = match expr {
            Expr::Binary { op, .. } => {
                let (child, outer) = (op.precedence(), parent.precedence());
                if parent == BinaryOp::Or && *op == BinaryOp::And {
                    true
                } else if child != outer {
                    child < outer
                } else {
                    match parent {
                        BinaryOp::And | BinaryOp::Or => false,
                        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => right,
                        _ => true,
                    }
                }
            }
            Expr::Unary { op: UnaryOp::Not, .. } => parent.precedence() > 2,
            Expr::Unary {
                op: UnaryOp::IsNull | UnaryOp::IsNotNull,
                ..
            } => parent.precedence() >= 4,
            _ => false,
        };
        self.wrapped(expr, wrap)
    }

    fn wrapped(&mut self, expr: &Expr, wrap: bool) -> Result<(), BuildError> {
        if wrap {
            self.push("(");
            self.expr(expr)?;
            self.push(")");
            Ok(())
        } else {
            self.expr(expr)
        }
    }

    fn unary(&mut self, op: UnaryOp, operand: &Expr) -> Result<(), BuildError> {
        match op {
            UnaryOp::Not => self.wrapped_prefix("NOT ", operand),
            UnaryOp::IsNull | UnaryOp::IsNotNull => {
                let wrap = matches!(operand, Expr::Binary { .. } | Expr::Unary { .. });
                self.wrapped(operand, wrap)?;
                self.push(if op == UnaryOp::IsNull {
                    " IS NULL"
                } else {
                    " IS NOT NULL"
                });
                Ok(())
            }
            UnaryOp::Distinct => {
                self.push("DISTINCT ");
                let wrap = matches!(operand, Expr::Binary { .. } | Expr::Unary { .. });
                self.wrapped(operand, wrap)
            }
            UnaryOp::Exists => match operand {
                Expr::Subquery(q) => {
                    self.push("EXISTS ");
                    self.subquery(q)
                }
                _ => Err(BuildError::invalid_expression("EXISTS requires a subquery")),
            },
        }
    }

    fn wrapped_prefix(&mut self, prefix: &str, operand: &Expr) -> Result<(), BuildError> {
        self.push(prefix);
        self.push("(");
        self.expr(operand)?;
        self.push(")");
        Ok(())
    }

    fn membership(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<(), BuildError> {
        match right {
            Expr::Literal(Value::List(items)) => {
                if items.is_empty() {
                    // Nothing is IN an empty set.
                    self.push(if op == BinaryOp::In { "1=0" } else { "1=1" });
                    return Ok(());
                }
                self.operand(left, op, false)?;
                self.push(" ");
                self.push(op.as_sql());
                self.push(" (");
                self.list(items, |w, item| {
                    if let Value::List(_) = item {
                        return Err(BuildError::invalid_expression("nested list literal"));
                    }
                    w.bind(item.clone());
                    Ok(())
                })?;
                self.push(")");
                Ok(())
            }
            Expr::Subquery(q) => {
                if q.column_count() != 1 {
                    return Err(BuildError::invalid_expression(format!(
                        "{} subquery must select exactly one column, got {}",
                        op.as_sql(),
                        q.column_count()
                    )));
                }
                self.operand(left, op, false)?;
                self.push(" ");
                self.push(op.as_sql());
                self.push(" ");
                self.subquery(q)
            }
            other => Err(BuildError::invalid_expression(format!(
                "{} needs a list literal or a subquery on the right, got {}",
                op.as_sql(),
                describe(other)
            ))),
        }
    }

    fn subquery(&mut self, query: &SelectQuery) -> Result<(), BuildError> {
        self.push("(");
        self.select(query)?;
        self.push(")");
        Ok(())
    }

    fn select_item(&mut self, expr: &Expr) -> Result<(), BuildError> {
        match expr {
            Expr::Aliased { expr, alias } => {
                self.expr(expr)?;
                self.push(" AS ");
                self.ident("alias", alias)
            }
            other => self.expr(other),
        }
    }

    fn select(&mut self, q: &SelectQuery) -> Result<(), BuildError> {
        if let Some(err) = &q.error {
            return Err(err.clone());
        }
        let mut scope = vec![q.from];
        scope.extend(q.joins.iter().map(|j| j.target));
        self.scopes.push(scope);
        let result = self.select_body(q);
        self.scopes.pop();
        result
    }

    fn select_body(&mut self, q: &SelectQuery) -> Result<(), BuildError> {
        self.push("SELECT ");
        if q.distinct {
            self.push("DISTINCT ");
        }
        if q.columns.is_empty() {
            let columns = q.from.columns();
            self.list(&columns, |w, c| w.expr(c))?;
        } else {
            self.list(&q.columns, |w, c| w.select_item(c))?;
        }

        self.push(" FROM ");
        self.ident("table name", q.from.table())?;

        for join in &q.joins {
            self.push(" ");
            self.push(join.kind.as_sql());
            self.push(" ");
            self.ident("table name", join.target.table())?;
            self.push(" ON ");
            self.expr(&join.on)?;
        }

        if let Some(predicate) = &q.predicate {
            self.push(" WHERE ");
            self.expr(predicate)?;
        }

        if !q.group_by.is_empty() {
            self.push(" GROUP BY ");
            self.list(&q.group_by, |w, e| w.expr(e))?;
        }

        if let Some(having) = &q.having {
            self.push(" HAVING ");
            self.expr(having)?;
        }

        if !q.order_by.is_empty() {
            self.push(" ORDER BY ");
            self.list(&q.order_by, |w, o| {
                w.expr(&o.expr)?;
                if o.direction == Direction::Desc {
                    w.push(" DESC");
                }
                Ok(())
            })?;
        }

        self.dialect
            .write_limit_offset(q.limit, q.offset, &mut self.sql);
        Ok(())
    }

    fn insert_head(&mut self, q: &InsertQuery, columns: &[&str]) -> Result<(), BuildError> {
        self.push("INSERT INTO ");
        self.ident("table name", q.target.table())?;
        if !columns.is_empty() {
            self.push(" (");
            self.list(columns, |w, column| w.ident("column name", column))?;
            self.push(")");
        }
        Ok(())
    }

    fn insert_rows(
        &mut self,
        q: &InsertQuery,
        rows: &[Fields],
        columns: &[&'static str],
    ) -> Result<(), BuildError> {
        self.insert_head(q, columns)?;
        if columns.is_empty() {
            if rows.len() > 1 {
                return Err(BuildError::invalid_argument(
                    "cannot insert several rows without any column values",
                ));
            }
            self.push(" DEFAULT VALUES");
        } else {
            self.push(" VALUES ");
            for (i, row) in rows.iter().enumerate() {
                if i > 0 {
                    self.push(", ");
                }
                self.push("(");
                for (j, column) in columns.iter().enumerate() {
                    if j > 0 {
                        self.push(", ");
                    }
                    match row.iter().find(|(k, _)| k == column) {
                        Some((_, value)) => self.bind(value.clone()),
                        None if self.dialect.supports_default_in_values() => self.push("DEFAULT"),
                        None => self.bind(Value::Null),
                    }
                }
                self.push(")");
            }
        }
        if q.on_conflict_ignore {
            self.dialect.write_on_conflict_do_nothing(&mut self.sql)?;
        }
        Ok(())
    }

    /// Append RETURNING when requested and supported; reports whether it did.
    fn returning(&mut self, q: &InsertQuery) -> Result<bool, BuildError> {
        if !q.returning || !self.dialect.supports_returning() {
            return Ok(false);
        }
        self.push(" RETURNING ");
        self.list(q.target.fields(), |w, field| w.ident("column name", field.name()))?;
        Ok(true)
    }

    fn insert_from(
        &mut self,
        q: &InsertQuery,
        fields: &[String],
        source: &SelectQuery,
    ) -> Result<(), BuildError> {
        let mut columns = Vec::with_capacity(fields.len());
        for name in fields {
            let field = q
                .target
                .field(name)
                .ok_or_else(|| BuildError::unknown_field(q.target.table(), name.as_str()))?;
            columns.push(field.name());
        }
        let selected = source.column_count();
        if selected != columns.len() {
            return Err(BuildError::ArityMismatch {
                expected: columns.len(),
                got: selected,
            });
        }
        self.insert_head(q, &columns)?;
        self.push(" ");
        self.select(source)?;
        if q.on_conflict_ignore {
            self.dialect.write_on_conflict_do_nothing(&mut self.sql)?;
        }
        Ok(())
    }

    fn update(&mut self, q: &UpdateQuery) -> Result<(), BuildError> {
        if let Some(err) = &q.error {
            return Err(err.clone());
        }
        let table = q.target.table();
        if q.assignments.is_empty() {
            return Err(BuildError::invalid_argument(format!(
                "UPDATE on '{table}' has no assignments"
            )));
        }
        if q.predicate.is_none() && !q.allow_unfiltered {
            return Err(BuildError::UnfilteredMutation {
                statement: "UPDATE",
                table: table.to_string(),
            });
        }
        self.scopes.push(vec![q.target]);
        self.push("UPDATE ");
        self.ident("table name", table)?;
        self.push(" SET ");
        self.list(&q.assignments, |w, (name, value)| {
            let field = q
                .target
                .field(name)
                .ok_or_else(|| BuildError::unknown_field(table, name.as_str()))?;
            if let Expr::Literal(v) = value {
                field.check_value(q.target, v)?;
            }
            w.ident("column name", field.name())?;
            w.push(" = ");
            w.expr(value)
        })?;
        if let Some(predicate) = &q.predicate {
            self.push(" WHERE ");
            self.expr(predicate)?;
        }
        self.scopes.pop();
        Ok(())
    }

    fn delete(&mut self, q: &DeleteQuery) -> Result<(), BuildError> {
        if let Some(err) = &q.error {
            return Err(err.clone());
        }
        let table = q.target.table();
        if q.predicate.is_none() && !q.allow_unfiltered {
            return Err(BuildError::UnfilteredMutation {
                statement: "DELETE",
                table: table.to_string(),
            });
        }
        self.scopes.push(vec![q.target]);
        self.push("DELETE FROM ");
        self.ident("table name", table)?;
        if let Some(predicate) = &q.predicate {
            self.push(" WHERE ");
            self.expr(predicate)?;
        }
        self.scopes.pop();
        Ok(())
    }
}

fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Literal(v) => format!("a {} literal", v.type_name()),
        Expr::Column(c) => format!("column {c:?}"),
        Expr::Function { name, .. } => format!("function {name}"),
        _ => "an expression".to_string(),
    }
}
