//! Query builders for record types.
//!
//! Queries are plain values built from a [`RecordType`] and [`Expr`] trees. They do
//! nothing until compiled or executed, and every builder method returns a new
//! query, so partial queries can be kept and reused.
//!
//! # Usage
//!
//! ```ignore
//! use quarry::prelude::*;
//!
//! // SELECT
//! let adults = USER
//!     .select()
//!     .filter(USER.col("age").ge(18))
//!     .order_by([USER.col("username").asc()])
//!     .paginate(1, 20)
//!     .fetch_all(&db)
//!     .await?;
//!
//! // INSERT
//! USER.insert(fields!["username" => "alice", "age" => 31])
//!     .execute(&db)
//!     .await?;
//!
//! // UPDATE
//! USER.update()
//!     .set("active", false)
//!     .filter(USER.pk().eq(user_id))
//!     .execute(&db)
//!     .await?;
//!
//! // DELETE
//! USER.delete().filter(USER.pk().eq(user_id)).execute(&db).await?;
//! ```

pub(crate) mod delete;
pub(crate) mod expr;
pub(crate) mod insert;
pub(crate) mod select;
pub(crate) mod traits;
pub(crate) mod update;

pub use delete::DeleteQuery;
pub use expr::{BinaryOp, ColumnRef, Direction, Expr, OrderBy, UnaryOp, func};
pub use insert::{Fields, InsertQuery, InsertSource};
pub use select::{Join, JoinKind, SelectQuery};
pub use traits::Mutation;
pub use update::UpdateQuery;

use crate::schema::RecordType;

/// Create a SELECT over every field of `record`.
pub fn select(record: &'static RecordType) -> SelectQuery {
    SelectQuery::new(record)
}

/// Create a single-row INSERT.
pub fn insert(record: &'static RecordType, fields: Fields) -> InsertQuery {
    InsertQuery::new(record, fields)
}

/// Create a multi-row INSERT.
pub fn insert_many(record: &'static RecordType, rows: Vec<Fields>) -> InsertQuery {
    InsertQuery::rows(record, rows)
}

/// Create an `INSERT INTO record (fields) SELECT ...`.
pub fn insert_from<S: Into<String>>(
    record: &'static RecordType,
    fields: impl IntoIterator<Item = S>,
    query: &SelectQuery,
) -> InsertQuery {
    InsertQuery::from_select(record, fields, query)
}

pub fn update(record: &'static RecordType) -> UpdateQuery {
    UpdateQuery::new(record)
}

/// Create a DELETE. Compiling it without a filter fails unless
/// `allow_unfiltered()` is called.
pub fn delete(record: &'static RecordType) -> DeleteQuery {
    DeleteQuery::new(record)
}

impl RecordType {
    pub fn select(&'static self) -> SelectQuery {
        select(self)
    }

    pub fn insert(&'static self, fields: Fields) -> InsertQuery {
        insert(self, fields)
    }

    pub fn insert_many(&'static self, rows: Vec<Fields>) -> InsertQuery {
        insert_many(self, rows)
    }

    pub fn update(&'static self) -> UpdateQuery {
        update(self)
    }

    pub fn delete(&'static self) -> DeleteQuery {
        delete(self)
    }
}
