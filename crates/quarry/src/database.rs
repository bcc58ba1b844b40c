//! The database handle: one connection plus the state of its open scopes.

use crate::client::{Connection, GenericClient};
use crate::compiler::CompiledQuery;
use crate::compiler::dialect::Dialect;
use crate::config::DatabaseConfig;
use crate::error::{OrmError, OrmResult};
use crate::ident::check_ident;
use crate::row::RawRow;
use crate::trace::SqlTracer;
use crate::transaction::Atomic;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Owns a connection and runs compiled statements on it.
///
/// Scopes opened with [`Database::atomic`] borrow the handle, so statements always
/// go through the innermost open scope. A scope dropped without commit or rollback
/// is remembered here and rolled back before the next statement.
pub struct Database<C: Connection> {
    conn: Option<C>,
    config: DatabaseConfig,
    tracer: SqlTracer,
    /// Shallowest depth whose scope was dropped without finishing.
    abandoned: Mutex<Option<usize>>,
}

impl<C: Connection> Database<C> {
    pub fn new(conn: C) -> Self {
        Self::with_config(conn, DatabaseConfig::default())
    }

    pub fn with_config(conn: C, config: DatabaseConfig) -> Self {
        Self {
            conn: Some(conn),
            tracer: SqlTracer::from_config(&config),
            config,
            abandoned: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.config.dialect.as_ref()
    }

    /// The underlying connection.
    pub fn connection(&self) -> OrmResult<&C> {
        self.conn
            .as_ref()
            .ok_or_else(|| OrmError::Connection("connection already released".to_string()))
    }

    /// Open a transaction.
    pub async fn atomic(&mut self) -> OrmResult<Atomic<'_, C>> {
        Atomic::begin(self, 1).await
    }

    /// Release the connection, rolling back any abandoned scope first.
    pub async fn into_inner(mut self) -> OrmResult<C> {
        self.recover().await?;
        self.conn
            .take()
            .ok_or_else(|| OrmError::Connection("connection already released".to_string()))
    }

    fn pending(&self) -> MutexGuard<'_, Option<usize>> {
        self.abandoned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that the scope at `depth` ended without commit or rollback.
    pub(crate) fn abandon(&self, depth: usize) {
        let mut pending = self.pending();
        *pending = Some(pending.map_or(depth, |d| d.min(depth)));
    }

    /// Roll back whatever an abandoned scope left open.
    async fn recover(&self) -> OrmResult<()> {
        let Some(depth) = self.pending().take() else {
            return Ok(());
        };
        tracing::warn!(target: "quarry.tx", depth, "rolling back abandoned atomic scope");
        let result = self.rollback_raw(depth).await;
        if result.is_err() {
            self.abandon(depth);
        }
        result
    }

    fn savepoint_name(&self, depth: usize) -> OrmResult<String> {
        let name = format!("{}_{depth}", self.config.savepoint_prefix);
        check_ident("savepoint name", &name)?;
        Ok(name)
    }

    /// Forget an abandonment recorded for exactly `depth`.
    fn settle(&self, depth: usize) {
        let mut pending = self.pending();
        if *pending == Some(depth) {
            *pending = None;
        }
    }

    pub(crate) async fn begin_scope(&self, depth: usize) -> OrmResult<()> {
        self.recover().await?;
        let conn = self.connection()?;
        let savepoint = match depth {
            1 => None,
            _ => Some(self.savepoint_name(depth)?),
        };
        // Marked abandoned while in flight: a caller cancelled mid-command
        // leaves no guard behind to record it.
        self.abandon(depth);
        let result = match &savepoint {
            None => conn.begin().await,
            Some(name) => conn.savepoint(name).await,
        };
        self.settle(depth);
        result?;
        self.tracer.scope("begin", depth);
        Ok(())
    }

    pub(crate) async fn commit_scope(&self, depth: usize) -> OrmResult<()> {
        self.recover().await?;
        let conn = self.connection()?;
        if depth == 1 {
            conn.commit().await?;
        } else {
            conn.release_savepoint(&self.savepoint_name(depth)?).await?;
        }
        self.tracer.scope("commit", depth);
        Ok(())
    }

    pub(crate) async fn rollback_scope(&self, depth: usize) -> OrmResult<()> {
        self.recover().await?;
        self.rollback_raw(depth).await
    }

    async fn rollback_raw(&self, depth: usize) -> OrmResult<()> {
        let conn = self.connection()?;
        if depth == 1 {
            conn.rollback().await?;
        } else {
            let name = self.savepoint_name(depth)?;
            conn.rollback_to_savepoint(&name).await?;
            conn.release_savepoint(&name).await?;
        }
        self.tracer.scope("rollback", depth);
        Ok(())
    }

    async fn with_timeout<T>(&self, fut: impl Future<Output = OrmResult<T>>) -> OrmResult<T> {
        match self.config.statement_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| OrmError::Timeout(limit))?,
            None => fut.await,
        }
    }

    pub(crate) async fn run_execute(&self, stmt: &CompiledQuery) -> OrmResult<u64> {
        self.recover().await?;
        let conn = self.connection()?;
        let start = Instant::now();
        let result = self
            .with_timeout(conn.execute(stmt.sql(), stmt.params()))
            .await;
        self.tracer
            .statement(stmt, start.elapsed(), result.as_ref().map(|n| *n));
        result
    }

    pub(crate) async fn run_query(&self, stmt: &CompiledQuery) -> OrmResult<Vec<RawRow>> {
        self.recover().await?;
        let conn = self.connection()?;
        let start = Instant::now();
        let result = self
            .with_timeout(conn.query(stmt.sql(), stmt.params()))
            .await;
        self.tracer.statement(
            stmt,
            start.elapsed(),
            result.as_ref().map(|rows| rows.len() as u64),
        );
        result
    }
}

impl<C: Connection> GenericClient for Database<C> {
    type Conn = C;

    fn database(&self) -> &Database<C> {
        self
    }

    fn depth(&self) -> usize {
        0
    }

    fn atomic(&mut self) -> impl Future<Output = OrmResult<Atomic<'_, C>>> + Send {
        Database::atomic(self)
    }
}

impl<C: Connection> Drop for Database<C> {
    fn drop(&mut self) {
        let Some(depth) = self.pending().take() else {
            return;
        };
        let Some(conn) = self.conn.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(
                    target: "quarry.tx",
                    depth,
                    "database dropped inside an abandoned scope; rolling back in the background"
                );
                handle.spawn(async move {
                    if let Err(err) = conn.rollback().await {
                        tracing::error!(target: "quarry.tx", error = %err, "background rollback failed");
                    }
                });
            }
            Err(_) => {
                tracing::error!(
                    target: "quarry.tx",
                    depth,
                    "database dropped inside an abandoned scope outside a runtime; \
                     the connection is closed without rollback"
                );
            }
        }
    }
}

impl<C: Connection> std::fmt::Debug for Database<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("dialect", &self.dialect().name())
            .field("abandoned", &*self.pending())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::dialect::Sqlite;
    use crate::testing::{MockConnection, Reply, USER};
    use crate::value::Value;
    use std::time::Duration;

    #[tokio::test]
    async fn test_statements_reach_the_connection() {
        let db = Database::new(MockConnection::new());
        let stmt = USER
            .select()
            .filter(USER.col("username").eq("alice"))
            .compile()
            .unwrap();
        db.fetch_rows(&stmt).await.unwrap();

        let conn = db.connection().unwrap();
        assert_eq!(
            conn.log(),
            ["SELECT id, username, age, active FROM users WHERE username = $1"]
        );
        assert_eq!(conn.params(), [vec![Value::from("alice")]]);
    }

    #[tokio::test]
    async fn test_configured_dialect_is_used() {
        let config = DatabaseConfig::new().dialect(Sqlite);
        let db = Database::with_config(MockConnection::new(), config);
        USER.select()
            .filter(USER.pk().eq(1))
            .fetch_all(&db)
            .await
            .unwrap();
        assert_eq!(
            db.connection().unwrap().log(),
            ["SELECT id, username, age, active FROM users WHERE id = ?1"]
        );
    }

    #[tokio::test]
    async fn test_savepoint_prefix() {
        let config = DatabaseConfig::new().savepoint_prefix("nested");
        let mut db = Database::with_config(MockConnection::new(), config);
        let mut tx = db.atomic().await.unwrap();
        let sp = tx.atomic().await.unwrap();
        sp.commit().await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(
            db.connection().unwrap().log(),
            ["BEGIN", "SAVEPOINT nested_2", "RELEASE SAVEPOINT nested_2", "COMMIT"]
        );
    }

    #[tokio::test]
    async fn test_invalid_savepoint_prefix_fails_before_io() {
        let config = DatabaseConfig::new().savepoint_prefix("bad name");
        let mut db = Database::with_config(MockConnection::new(), config);
        let mut tx = db.atomic().await.unwrap();
        let err = tx.atomic().await.unwrap_err();
        assert!(err.is_build_error());
        tx.rollback().await.unwrap();
        assert_eq!(db.connection().unwrap().log(), ["BEGIN", "ROLLBACK"]);
    }

    #[tokio::test]
    async fn test_statement_timeout() {
        let conn = MockConnection::new();
        conn.reply(Reply::Delay(Duration::from_secs(5)));
        let config = DatabaseConfig::new().statement_timeout(Duration::from_millis(20));
        let db = Database::with_config(conn, config);
        let err = USER
            .select()
            .fetch_all(&db)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_into_inner_recovers_abandoned_scope() {
        let mut db = Database::new(MockConnection::new());
        drop(db.atomic().await.unwrap());
        let conn = db.into_inner().await.unwrap();
        assert_eq!(conn.log(), ["BEGIN", "ROLLBACK"]);
    }

    #[tokio::test]
    async fn test_fetch_one_row_count_checks() {
        let conn = MockConnection::new();
        conn.reply(Reply::rows(&["id"], vec![]));
        conn.reply(Reply::rows(&["id"], vec![vec![Value::Int(1)], vec![Value::Int(2)]]));
        let db = Database::new(conn);
        let stmt = USER.select().columns([USER.pk()]).compile().unwrap();

        assert!(db.fetch_one(&stmt).await.unwrap_err().is_not_found());
        assert!(matches!(
            db.fetch_one(&stmt).await.unwrap_err(),
            OrmError::MultipleResults(2)
        ));
    }
}
