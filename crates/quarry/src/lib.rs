//! # quarry
//!
//! A fluent query builder and execution engine over declared record types.
//!
//! ## Features
//!
//! - **Composable queries**: builders are immutable, every call returns a new query
//! - **Parameterized SQL**: literals are always bound, never inlined
//! - **Relations**: joins resolve foreign keys declared on the record types
//! - **Nested scopes**: `atomic()` nests as savepoints; dropped scopes roll back
//! - **Dialects**: Postgres, SQLite and generic placeholder/paging rules
//!
//! ## Example
//!
//! ```ignore
//! use quarry::prelude::*;
//!
//! static USER: RecordType = RecordType::new(
//!     "users",
//!     &[
//!         FieldDescriptor::new("id", SqlType::BigInt).primary_key(),
//!         FieldDescriptor::new("username", SqlType::Text).unique(),
//!     ],
//! );
//!
//! let mut db = quarry::connect("postgres://localhost/app").await?;
//! let alice = USER.select().filter(USER.col("username").eq("alice")).get(&db).await?;
//!
//! quarry::atomic!(db, tx, {
//!     USER.update().set("username", "alicia").filter(USER.pk().eq(Value::from(&alice))).execute(&tx).await?;
//!     Ok::<(), OrmError>(())
//! })?;
//! ```

pub mod client;
pub mod compiler;
pub mod config;
pub mod database;
pub mod error;
pub mod ident;
pub mod qb;
pub mod record;
pub mod row;
pub mod schema;
pub mod transaction;
pub mod value;

mod trace;

#[cfg(feature = "pool")]
pub mod pool;

pub mod prelude;

#[cfg(test)]
mod testing;

pub use client::{Connection, GenericClient, connect};
pub use compiler::dialect::{Dialect, Generic, Postgres, Sqlite};
pub use compiler::{CompiledQuery, StatementKind};
pub use config::DatabaseConfig;
pub use database::Database;
pub use error::{BuildError, OrmError, OrmResult};
pub use qb::{
    DeleteQuery, Direction, Expr, Fields, InsertQuery, JoinKind, Mutation, OrderBy, SelectQuery,
    UpdateQuery, delete, func, insert, insert_from, insert_many, select, update,
};
pub use record::Record;
pub use row::{FromRow, RawRow};
pub use schema::{FieldDescriptor, RecordType, Relation, Schema, SqlType};
pub use transaction::Atomic;
pub use value::{FromValue, Value};

#[cfg(feature = "pool")]
pub use pool::{create_pool, create_pool_with_config};

// Used by `register_record!`
pub use inventory;
