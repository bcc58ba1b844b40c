//! Trait definitions for query builders.

use crate::client::GenericClient;
use crate::compiler::CompiledQuery;
use crate::compiler::dialect::Dialect;
use crate::error::{BuildError, OrmResult};

/// Statements that write rows: INSERT, UPDATE and DELETE.
pub trait Mutation: Sync {
    /// Compile to the statements to run, in order. Chunked inserts yield one
    /// statement per chunk.
    fn statements(&self, dialect: &dyn Dialect) -> Result<Vec<CompiledQuery>, BuildError>;

    /// Run every statement and return the total number of affected rows.
    ///
    /// Statements run one after another on `db`; wrap the call in `atomic()` when
    /// they must succeed or fail together.
    fn execute(
        &self,
        db: &impl GenericClient,
    ) -> impl std::future::Future<Output = OrmResult<u64>> + Send {
        async move {
            let statements = self.statements(db.dialect())?;
            let mut affected = 0;
            for stmt in &statements {
                affected += db.execute(stmt).await?;
            }
            Ok(affected)
        }
    }
}
