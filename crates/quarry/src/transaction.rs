//! Atomic scopes: transactions and nested savepoints.
//!
//! `db.atomic()` opens depth 1 with `BEGIN`; calling `atomic()` on an open scope
//! opens the next depth with a savepoint. Each scope borrows its parent mutably,
//! so only the innermost scope is usable until it ends.
//!
//! A scope that is dropped without `commit()` or `rollback()` (early return, panic
//! unwind, a cancelled future) cannot roll back in `Drop`. It is recorded on the
//! [`Database`] and rolled back before the next statement on that connection.
//!
//! For ergonomic commit/rollback handling, use the [`atomic!`](crate::atomic) macro.
//!
//! # Example
//!
//! ```ignore
//! use quarry::prelude::*;
//!
//! # async fn demo(db: &mut Database<tokio_postgres::Client>) -> OrmResult<()> {
//! quarry::atomic!(db, tx, {
//!     USER.insert(fields!["username" => "alice"]).execute(&tx).await?;
//!
//!     // Inner scope: a failure here only undoes the inner work.
//!     let nested = quarry::atomic!(tx, inner, {
//!         TWEET.insert(fields!["user_id" => 1, "message" => "hi"]).execute(&inner).await?;
//!         Ok(())
//!     });
//!     if let Err(e) = nested {
//!         tracing::warn!("tweet not stored: {e}");
//!     }
//!     Ok::<(), OrmError>(())
//! })?;
//! # Ok(()) }
//! ```

use crate::client::{Connection, GenericClient};
use crate::database::Database;
use crate::error::{OrmError, OrmResult};
use std::future::Future;

/// Runs the given block inside an atomic scope.
///
/// - Opens a scope via `$db.atomic().await` (a transaction, or a savepoint when
///   `$db` is itself a scope).
/// - Commits on `Ok(_)`.
/// - Rolls back on `Err(_)` and returns the error.
///
/// The block must evaluate to `quarry::OrmResult<T>`.
#[macro_export]
macro_rules! atomic {
    ($db:expr, $tx:ident, $body:block) => {{
        #[allow(unused_mut)]
        let mut $tx = ($db).atomic().await?;

        let __quarry_atomic_result = async { $body }.await;
        match __quarry_atomic_result {
            Ok(value) => {
                $tx.commit().await?;
                Ok(value)
            }
            Err(error) => match $tx.rollback().await {
                Ok(()) => Err(error),
                Err(rollback_err) => Err($crate::OrmError::Other(format!(
                    "{error} (rollback failed: {rollback_err})"
                ))),
            },
        }
    }};
}

/// An open transaction (depth 1) or savepoint (depth 2 and deeper).
#[must_use = "a scope dropped without commit() is rolled back"]
pub struct Atomic<'a, C: Connection> {
    db: &'a Database<C>,
    depth: usize,
    finished: bool,
}

impl<'a, C: Connection> Atomic<'a, C> {
    pub(crate) async fn begin(db: &'a Database<C>, depth: usize) -> OrmResult<Self> {
        db.begin_scope(depth).await?;
        Ok(Self {
            db,
            depth,
            finished: false,
        })
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Open a nested scope backed by a savepoint.
    pub async fn atomic(&mut self) -> OrmResult<Atomic<'_, C>> {
        Atomic::begin(self.db, self.depth + 1).await
    }

    /// `COMMIT` at depth 1, `RELEASE SAVEPOINT` deeper.
    pub async fn commit(mut self) -> OrmResult<()> {
        self.db.commit_scope(self.depth).await?;
        self.finished = true;
        Ok(())
    }

    /// `ROLLBACK` at depth 1; deeper, roll back to the savepoint and release it.
    pub async fn rollback(mut self) -> OrmResult<()> {
        self.db.rollback_scope(self.depth).await?;
        self.finished = true;
        Ok(())
    }
}

impl<C: Connection> Drop for Atomic<'_, C> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                target: "quarry.tx",
                depth = self.depth,
                "atomic scope dropped without commit or rollback; it will be rolled back"
            );
            self.db.abandon(self.depth);
        }
    }
}

impl<C: Connection> std::fmt::Debug for Atomic<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Atomic")
            .field("depth", &self.depth)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<C: Connection> GenericClient for Atomic<'_, C> {
    type Conn = C;

    fn database(&self) -> &Database<C> {
        self.db
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn atomic(&mut self) -> impl Future<Output = OrmResult<Atomic<'_, C>>> + Send {
        Atomic::atomic(self)
    }
}

/// Roll `scope` back after `err` and return the error to report.
pub(crate) async fn rollback_with<C: Connection>(scope: Atomic<'_, C>, err: OrmError) -> OrmError {
    match scope.rollback().await {
        Ok(()) => err,
        Err(rollback_err) => OrmError::Other(format!("{err} (rollback failed: {rollback_err})")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnection, Reply, USER};
    use crate::{Fields, InsertQuery, Mutation, fields};
    use std::time::Duration;

    fn insert(name: &str) -> InsertQuery {
        USER.insert(fields!["username" => name])
    }

    #[tokio::test]
    async fn test_commit_and_rollback_commands() {
        let mut db = Database::new(MockConnection::new());
        let tx = db.atomic().await.unwrap();
        insert("alice").execute(&tx).await.unwrap();
        tx.commit().await.unwrap();

        let tx = db.atomic().await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(
            db.connection().unwrap().log(),
            [
                "BEGIN",
                "INSERT INTO users (username) VALUES ($1)",
                "COMMIT",
                "BEGIN",
                "ROLLBACK",
            ]
        );
    }

    #[tokio::test]
    async fn test_inner_failure_only_undoes_inner_work() -> OrmResult<()> {
        let conn = MockConnection::new();
        conn.reply(Reply::Affected(1));
        conn.reply(Reply::Fail(OrmError::UniqueViolation(
            "users_username_key".into(),
        )));
        conn.reply(Reply::Affected(1));
        let mut db = Database::new(conn);

        crate::atomic!(db, tx, {
            insert("alice").execute(&tx).await?;
            let inner: OrmResult<u64> = crate::atomic!(tx, sp, {
                assert_eq!(sp.depth(), 2);
                insert("bob").execute(&sp).await
            });
            assert!(inner.unwrap_err().is_unique_violation());
            insert("carol").execute(&tx).await?;
            Ok::<(), OrmError>(())
        })?;

        assert_eq!(
            db.connection()?.log(),
            [
                "BEGIN",
                "INSERT INTO users (username) VALUES ($1)",
                "SAVEPOINT sp_2",
                "INSERT INTO users (username) VALUES ($1)",
                "ROLLBACK TO SAVEPOINT sp_2",
                "RELEASE SAVEPOINT sp_2",
                "INSERT INTO users (username) VALUES ($1)",
                "COMMIT",
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_outer_error_rolls_back_everything() -> OrmResult<()> {
        let mut db = Database::new(MockConnection::new());
        let result: OrmResult<()> = crate::atomic!(db, tx, {
            insert("alice").execute(&tx).await?;
            Err(OrmError::Other("boom".into()))
        });
        assert_eq!(result.unwrap_err().to_string(), "boom");
        assert_eq!(db.connection()?.log().last().map(String::as_str), Some("ROLLBACK"));
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_scope_is_rolled_back_before_next_statement() {
        let mut db = Database::new(MockConnection::new());
        {
            let mut tx = db.atomic().await.unwrap();
            let sp = tx.atomic().await.unwrap();
            insert("alice").execute(&sp).await.unwrap();
        }
        insert("bob").execute(&db).await.unwrap();

        assert_eq!(
            db.connection().unwrap().log(),
            [
                "BEGIN",
                "SAVEPOINT sp_2",
                "INSERT INTO users (username) VALUES ($1)",
                "ROLLBACK",
                "INSERT INTO users (username) VALUES ($1)",
            ]
        );
    }

    #[tokio::test]
    async fn test_dropped_inner_scope_keeps_outer_transaction() {
        let mut db = Database::new(MockConnection::new());
        let mut tx = db.atomic().await.unwrap();
        {
            let sp = tx.atomic().await.unwrap();
            insert("alice").execute(&sp).await.unwrap();
        }
        insert("bob").execute(&tx).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            db.connection().unwrap().log(),
            [
                "BEGIN",
                "SAVEPOINT sp_2",
                "INSERT INTO users (username) VALUES ($1)",
                "ROLLBACK TO SAVEPOINT sp_2",
                "RELEASE SAVEPOINT sp_2",
                "INSERT INTO users (username) VALUES ($1)",
                "COMMIT",
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_begin_is_rolled_back() -> OrmResult<()> {
        let conn = MockConnection::new();
        conn.batch_reply(Reply::Delay(Duration::from_millis(200)));
        let mut db = Database::new(conn);

        let opened = tokio::time::timeout(Duration::from_millis(10), db.atomic()).await;
        assert!(opened.is_err());
        drop(opened);

        let conn = db.into_inner().await?;
        assert_eq!(conn.log(), ["BEGIN", "ROLLBACK"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_savepoint_keeps_outer_transaction() -> OrmResult<()> {
        let mut db = Database::new(MockConnection::new());
        let mut tx = db.atomic().await?;
        tx.database()
            .connection()?
            .batch_reply(Reply::Delay(Duration::from_millis(200)));

        let opened = tokio::time::timeout(Duration::from_millis(10), tx.atomic()).await;
        assert!(opened.is_err());
        drop(opened);
        tx.commit().await?;

        assert_eq!(
            db.connection()?.log(),
            [
                "BEGIN",
                "SAVEPOINT sp_2",
                "ROLLBACK TO SAVEPOINT sp_2",
                "RELEASE SAVEPOINT sp_2",
                "COMMIT",
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_begin_leaves_nothing_to_roll_back() -> OrmResult<()> {
        let conn = MockConnection::new();
        conn.batch_reply(Reply::Fail(OrmError::Connection("reset".into())));
        let mut db = Database::new(conn);

        assert!(db.atomic().await.is_err());
        let conn = db.into_inner().await?;
        assert_eq!(conn.log(), ["BEGIN"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_chunked_insert_inside_one_scope() -> OrmResult<()> {
        let conn = MockConnection::new();
        for n in [100, 100, 50] {
            conn.reply(Reply::Affected(n));
        }
        let mut db = Database::new(conn);
        let rows: Vec<Fields> = (0..250)
            .map(|i| fields!["username" => format!("user{i}")])
            .collect();
        let query = USER.insert_many(rows).chunk_size(100);

        let affected = crate::atomic!(db, tx, { query.execute(&tx).await })?;
        assert_eq!(affected, 250);

        let conn = db.connection()?;
        let log = conn.log();
        assert_eq!(log.iter().filter(|s| s.starts_with("INSERT")).count(), 3);
        assert_eq!(log.first().map(String::as_str), Some("BEGIN"));
        assert_eq!(log.last().map(String::as_str), Some("COMMIT"));
        let sizes: Vec<usize> = conn.params().iter().map(Vec::len).collect();
        assert_eq!(sizes, [100, 100, 50]);
        Ok(())
    }
}
