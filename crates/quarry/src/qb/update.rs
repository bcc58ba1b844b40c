//! UPDATE query builder.

use crate::compiler::dialect::{Dialect, Postgres};
use crate::compiler::{CompiledQuery, Compiler};
use crate::error::BuildError;
use crate::qb::expr::Expr;
use crate::qb::insert::Fields;
use crate::qb::traits::Mutation;
use crate::schema::RecordType;

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateQuery {
    pub(crate) target: &'static RecordType,
    /// SET clauses, in call order
    pub(crate) assignments: Vec<(String, Expr)>,
    pub(crate) predicate: Option<Expr>,
    pub(crate) allow_unfiltered: bool,
    pub(crate) error: Option<BuildError>,
}

impl UpdateQuery {
    pub fn new(target: &'static RecordType) -> Self {
        Self {
            target,
            assignments: Vec::new(),
            predicate: None,
            allow_unfiltered: false,
            error: None,
        }
    }

    /// Assign a literal or an expression such as `USER.col("age") + 1`.
    ///
    /// Setting the same field twice keeps the last value.
    pub fn set(&self, field: &str, value: impl Into<Expr>) -> Self {
        let mut next = self.clone();
        let value = value.into();
        match next.assignments.iter_mut().find(|(name, _)| name == field) {
            Some(slot) => slot.1 = value,
            None => next.assignments.push((field.to_string(), value)),
        }
        next
    }

    pub fn set_fields(&self, fields: Fields) -> Self {
        fields
            .into_iter()
            .fold(self.clone(), |q, (name, value)| q.set(&name, value))
    }

    /// Add a WHERE predicate. Repeated calls are AND-ed together.
    #[doc(alias = "where")]
    pub fn filter(&self, predicate: Expr) -> Self {
        let mut next = self.clone();
        next.predicate = Some(match next.predicate.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        next
    }

    /// Permit an UPDATE without WHERE, touching every row.
    pub fn allow_unfiltered(&self) -> Self {
        let mut next = self.clone();
        next.allow_unfiltered = true;
        next
    }

    pub fn target(&self) -> &'static RecordType {
        self.target
    }

    pub fn compile(&self) -> Result<CompiledQuery, BuildError> {
        self.compile_with(&Postgres)
    }

    pub fn compile_with(&self, dialect: &dyn Dialect) -> Result<CompiledQuery, BuildError> {
        Compiler::new(dialect).compile_update(self)
    }
}

impl Mutation for UpdateQuery {
    fn statements(&self, dialect: &dyn Dialect) -> Result<Vec<CompiledQuery>, BuildError> {
        Ok(vec![self.compile_with(dialect)?])
    }
}
