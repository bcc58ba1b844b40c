//! DELETE query builder.

use crate::compiler::dialect::{Dialect, Postgres};
use crate::compiler::{CompiledQuery, Compiler};
use crate::error::BuildError;
use crate::qb::expr::Expr;
use crate::qb::traits::Mutation;
use crate::schema::RecordType;

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteQuery {
    pub(crate) target: &'static RecordType,
    pub(crate) predicate: Option<Expr>,
    pub(crate) allow_unfiltered: bool,
    pub(crate) error: Option<BuildError>,
}

impl DeleteQuery {
    pub fn new(target: &'static RecordType) -> Self {
        Self {
            target,
            predicate: None,
            allow_unfiltered: false,
            error: None,
        }
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

    /// Permit a DELETE without WHERE (dangerous!).
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
        Compiler::new(dialect).compile_delete(self)
    }
}

impl Mutation for DeleteQuery {
    fn statements(&self, dialect: &dyn Dialect) -> Result<Vec<CompiledQuery>, BuildError> {
        Ok(vec![self.compile_with(dialect)?])
    }
}
