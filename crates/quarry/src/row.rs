//! Row mapping traits and utilities

use crate::error::{OrmError, OrmResult};
use crate::value::{FromValue, Value};
use std::sync::Arc;

/// A result row: column names plus decoded values, in select-list order.
///
/// Rows of one result set share their column list.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl RawRow {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Value of the first column called `name`.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == name)
            .and_then(|i| self.values.get(i))
    }

    /// Typed value of the column called `name`.
    pub fn try_get<T: FromValue>(&self, name: &str) -> OrmResult<T> {
        let value = self
            .get_by_name(name)
            .ok_or_else(|| OrmError::decode(name, "no such column in the result"))?;
        T::from_value(value.clone()).map_err(|message| OrmError::decode(name, message))
    }

    /// Typed value of the column at `idx`.
    pub fn try_get_at<T: FromValue>(&self, idx: usize) -> OrmResult<T> {
        let column = self
            .columns
            .get(idx)
            .map_or_else(|| format!("#{idx}"), Clone::clone);
        let value = self
            .values
            .get(idx)
            .ok_or_else(|| OrmError::decode(column.as_str(), "column index out of range"))?;
        T::from_value(value.clone()).map_err(|message| OrmError::decode(column, message))
    }

    /// (column, value) pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Decode every row of a tokio-postgres result set.
    pub(crate) fn from_pg_rows(rows: &[tokio_postgres::Row]) -> OrmResult<Vec<Self>> {
        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let columns: Arc<[String]> = first
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        rows.iter()
            .map(|row| {
                let values = (0..columns.len())
                    .map(|i| {
                        row.try_get::<_, Value>(i)
                            .map_err(|e| OrmError::decode(columns[i].as_str(), e.to_string()))
                    })
                    .collect::<OrmResult<Vec<_>>>()?;
                Ok(RawRow::new(Arc::clone(&columns), values))
            })
            .collect()
    }
}

/// Trait for types that can be constructed from a result row.
pub trait FromRow: Sized {
    fn from_row(row: &RawRow) -> OrmResult<Self>;
}

impl FromRow for RawRow {
    fn from_row(row: &RawRow) -> OrmResult<Self> {
        Ok(row.clone())
    }
}

macro_rules! impl_from_row_tuple {
    ($($idx:tt => $ty:ident),+) => {
        impl<$($ty: FromValue),+> FromRow for ($($ty,)+) {
            fn from_row(row: &RawRow) -> OrmResult<Self> {
                Ok(($(row.try_get_at::<$ty>($idx)?,)+))
            }
        }
    };
}

impl_from_row_tuple!(0 => A);
impl_from_row_tuple!(0 => A, 1 => B);
impl_from_row_tuple!(0 => A, 1 => B, 2 => C);
impl_from_row_tuple!(0 => A, 1 => B, 2 => C, 3 => D);
