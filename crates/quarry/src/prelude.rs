//! Common imports:
//!
//! ```ignore
//! use quarry::prelude::*;
//! ```

pub use crate::{
    Database, Expr, FieldDescriptor, Fields, GenericClient, Mutation, OrmError, OrmResult,
    Record, RecordType, Relation, Schema, SelectQuery, SqlType, Value, fields, func,
};

#[cfg(feature = "pool")]
pub use crate::create_pool;
