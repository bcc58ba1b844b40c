//! Connection and client traits.
//!
//! [`Connection`] is the raw seam to a database driver: SQL text plus bound values
//! in, affected counts or rows out. [`GenericClient`] is what queries run against;
//! it is implemented by [`Database`] and by every open [`Atomic`] scope, so the same
//! code works inside and outside a transaction.

use crate::compiler::dialect::Dialect;
use crate::compiler::CompiledQuery;
use crate::database::Database;
use crate::error::{BuildError, OrmError, OrmResult};
use crate::qb::expr::Expr;
use crate::qb::insert::{Fields, InsertQuery};
use crate::qb::select::SelectQuery;
use crate::record::Record;
use crate::row::{FromRow, RawRow};
use crate::schema::RecordType;
use crate::transaction::{Atomic, rollback_with};
use crate::value::Value;
use std::future::Future;
use tokio_postgres::NoTls;
use tokio_postgres::types::ToSql;

/// A single database connection.
///
/// Statements on one connection run in issue order. Transaction control defaults
/// to plain SQL through [`Connection::batch_execute`].
pub trait Connection: Send + Sync + 'static {
    fn execute(&self, sql: &str, params: &[Value]) -> impl Future<Output = OrmResult<u64>> + Send;

    fn query(
        &self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = OrmResult<Vec<RawRow>>> + Send;

    /// Run one or more statements without parameters.
    fn batch_execute(&self, sql: &str) -> impl Future<Output = OrmResult<()>> + Send;

    fn begin(&self) -> impl Future<Output = OrmResult<()>> + Send {
        self.batch_execute("BEGIN")
    }

    fn commit(&self) -> impl Future<Output = OrmResult<()>> + Send {
        self.batch_execute("COMMIT")
    }

    fn rollback(&self) -> impl Future<Output = OrmResult<()>> + Send {
        self.batch_execute("ROLLBACK")
    }

    fn savepoint(&self, name: &str) -> impl Future<Output = OrmResult<()>> + Send {
        async move { self.batch_execute(&format!("SAVEPOINT {name}")).await }
    }

    fn release_savepoint(&self, name: &str) -> impl Future<Output = OrmResult<()>> + Send {
        async move { self.batch_execute(&format!("RELEASE SAVEPOINT {name}")).await }
    }

    fn rollback_to_savepoint(&self, name: &str) -> impl Future<Output = OrmResult<()>> + Send {
        async move {
            self.batch_execute(&format!("ROLLBACK TO SAVEPOINT {name}"))
                .await
        }
    }
}

fn sql_params(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

impl Connection for tokio_postgres::Client {
    async fn execute(&self, sql: &str, params: &[Value]) -> OrmResult<u64> {
        tokio_postgres::Client::execute(self, sql, &sql_params(params))
            .await
            .map_err(OrmError::from_db_error)
    }

    async fn query(&self, sql: &str, params: &[Value]) -> OrmResult<Vec<RawRow>> {
        let rows = tokio_postgres::Client::query(self, sql, &sql_params(params))
            .await
            .map_err(OrmError::from_db_error)?;
        RawRow::from_pg_rows(&rows)
    }

    async fn batch_execute(&self, sql: &str) -> OrmResult<()> {
        tokio_postgres::Client::batch_execute(self, sql)
            .await
            .map_err(OrmError::from_db_error)
    }
}

// ===== deadpool-postgres support =====

#[cfg(feature = "pool")]
impl Connection for deadpool_postgres::Client {
    async fn execute(&self, sql: &str, params: &[Value]) -> OrmResult<u64> {
        let stmt = self
            .prepare_cached(sql)
            .await
            .map_err(OrmError::from_db_error)?;
        tokio_postgres::Client::execute(self, &stmt, &sql_params(params))
            .await
            .map_err(OrmError::from_db_error)
    }

    async fn query(&self, sql: &str, params: &[Value]) -> OrmResult<Vec<RawRow>> {
        let stmt = self
            .prepare_cached(sql)
            .await
            .map_err(OrmError::from_db_error)?;
        let rows = tokio_postgres::Client::query(self, &stmt, &sql_params(params))
            .await
            .map_err(OrmError::from_db_error)?;
        RawRow::from_pg_rows(&rows)
    }

    async fn batch_execute(&self, sql: &str) -> OrmResult<()> {
        tokio_postgres::Client::batch_execute(self, sql)
            .await
            .map_err(OrmError::from_db_error)
    }
}

/// Open a connection and drive it on a background task.
pub async fn connect(url: &str) -> OrmResult<Database<tokio_postgres::Client>> {
    let (client, connection) = tokio_postgres::connect(url, NoTls)
        .await
        .map_err(|e| OrmError::Connection(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::error!(target: "quarry", error = %err, "connection closed with an error");
        }
    });
    Ok(Database::new(client))
}

fn mapped_record(stmt: &CompiledQuery) -> Result<&'static RecordType, BuildError> {
    stmt.record().ok_or_else(|| {
        BuildError::invalid_argument("statement result does not map onto a record type")
    })
}

/// A database handle that queries can run against.
///
/// Implemented by [`Database`] (depth 0) and [`Atomic`] (depth 1 and deeper).
pub trait GenericClient: Send + Sync {
    type Conn: Connection;

    fn database(&self) -> &Database<Self::Conn>;

    /// Transaction nesting depth, 0 outside any scope.
    fn depth(&self) -> usize;

    /// Open a nested scope: `BEGIN` at depth 1, a savepoint below that.
    fn atomic(&mut self) -> impl Future<Output = OrmResult<Atomic<'_, Self::Conn>>> + Send;

    fn dialect(&self) -> &dyn Dialect {
        self.database().dialect()
    }

    /// Run a statement and return the number of affected rows.
    fn execute(&self, stmt: &CompiledQuery) -> impl Future<Output = OrmResult<u64>> + Send {
        self.database().run_execute(stmt)
    }

    fn fetch_rows(
        &self,
        stmt: &CompiledQuery,
    ) -> impl Future<Output = OrmResult<Vec<RawRow>>> + Send {
        self.database().run_query(stmt)
    }

    fn fetch_all(
        &self,
        stmt: &CompiledQuery,
    ) -> impl Future<Output = OrmResult<Vec<Record>>> + Send {
        async move {
            let record = mapped_record(stmt)?;
            let rows = self.fetch_rows(stmt).await?;
            Ok(rows.iter().map(|row| Record::from_row(record, row)).collect())
        }
    }

    /// Exactly one record: `NotFound` on zero rows, `MultipleResults` on more.
    fn fetch_one(&self, stmt: &CompiledQuery) -> impl Future<Output = OrmResult<Record>> + Send {
        async move {
            let mut records = self.fetch_all(stmt).await?;
            match records.len() {
                0 => Err(OrmError::not_found("Expected one row, got none")),
                1 => Ok(records.remove(0)),
                n => Err(OrmError::MultipleResults(n)),
            }
        }
    }

    /// The first record, if any.
    fn fetch_optional(
        &self,
        stmt: &CompiledQuery,
    ) -> impl Future<Output = OrmResult<Option<Record>>> + Send {
        async move { Ok(self.fetch_all(stmt).await?.into_iter().next()) }
    }

    fn fetch_all_as<T: FromRow>(
        &self,
        stmt: &CompiledQuery,
    ) -> impl Future<Output = OrmResult<Vec<T>>> + Send {
        async move {
            let rows = self.fetch_rows(stmt).await?;
            rows.iter().map(T::from_row).collect()
        }
    }

    /// First column of the first row.
    fn scalar(&self, stmt: &CompiledQuery) -> impl Future<Output = OrmResult<Value>> + Send {
        async move {
            self.scalar_tuple(stmt)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| OrmError::decode("scalar", "result has no columns"))
        }
    }

    /// Every column of the first row.
    fn scalar_tuple(
        &self,
        stmt: &CompiledQuery,
    ) -> impl Future<Output = OrmResult<Vec<Value>>> + Send {
        async move {
            let rows = self.fetch_rows(stmt).await?;
            rows.into_iter()
                .next()
                .map(RawRow::into_values)
                .ok_or_else(|| OrmError::not_found("Expected one row, got none"))
        }
    }

    /// Fetch the record matching `predicate`, creating it when there is none.
    ///
    /// The insert uses the column equalities of `predicate` merged with `defaults`
    /// and runs in its own scope. Another client can insert the same row between
    /// the failed fetch and the insert; the unique constraint then rejects this
    /// insert and the winner's row is fetched and returned instead. Without a
    /// unique constraint covering the predicate both inserts succeed.
    ///
    /// Returns the record and whether it was created.
    fn get_or_create(
        &mut self,
        record: &'static RecordType,
        predicate: Expr,
        defaults: Fields,
    ) -> impl Future<Output = OrmResult<(Record, bool)>> + Send
    where
        Self: Sized,
    {
        async move {
            let query = SelectQuery::new(record).filter(predicate.clone());
            match query.get(&*self).await {
                Ok(found) => return Ok((found, false)),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }

            let mut fields: Fields = predicate
                .equalities()
                .into_iter()
                .filter(|(column, _)| column.record() == record)
                .map(|(column, value)| (column.name().to_string(), value.clone()))
                .collect();
            for (name, value) in defaults {
                match fields.iter_mut().find(|(n, _)| *n == name) {
                    Some(slot) => slot.1 = value,
                    None => fields.push((name, value)),
                }
            }

            match create_in_scope(self, &InsertQuery::new(record, fields)).await {
                Ok(created) => Ok((created, true)),
                Err(err) if err.is_unique_violation() => {
                    tracing::debug!(
                        target: "quarry.tx",
                        table = record.table(),
                        error = %err,
                        "get_or_create lost an insert race, fetching the existing row"
                    );
                    Ok((query.get(&*self).await?, false))
                }
                Err(err) => Err(err),
            }
        }
    }

    /// Insert `fields`, or fetch the row they collide with.
    ///
    /// The fetch after a `UniqueViolation` matches on every given field, so the
    /// mapping should only hold the identifying fields.
    fn create_or_get(
        &mut self,
        record: &'static RecordType,
        fields: Fields,
    ) -> impl Future<Output = OrmResult<(Record, bool)>> + Send
    where
        Self: Sized,
    {
        async move {
            match create_in_scope(self, &InsertQuery::new(record, fields.clone())).await {
                Ok(created) => Ok((created, true)),
                Err(err) if err.is_unique_violation() => {
                    tracing::debug!(
                        target: "quarry.tx",
                        table = record.table(),
                        "create_or_get hit an existing row"
                    );
                    let predicate = Expr::all(
                        fields
                            .into_iter()
                            .map(|(name, value)| record.col(&name).eq(value)),
                    );
                    let query = match predicate {
                        Some(p) => SelectQuery::new(record).filter(p),
                        None => return Err(err),
                    };
                    Ok((query.get(&*self).await?, false))
                }
                Err(err) => Err(err),
            }
        }
    }
}

/// Insert one row inside a fresh scope so a constraint failure leaves the
/// enclosing transaction usable.
async fn create_in_scope<G: GenericClient>(client: &mut G, insert: &InsertQuery) -> OrmResult<Record> {
    let scope = client.atomic().await?;
    match insert.execute_returning(&scope).await {
        Ok(mut created) => {
            scope.commit().await?;
            created
                .pop()
                .ok_or_else(|| OrmError::not_found("INSERT returned no row"))
        }
        Err(err) => Err(rollback_with(scope, err).await),
    }
}
