//! SQL identifier validation.
//!
//! Table, column, alias, savepoint and function names are written into SQL text
//! verbatim, so every one of them must match `[A-Za-z_][A-Za-z0-9_$]*`.

use crate::error::BuildError;

/// Returns true when `s` is a plain unquoted SQL identifier.
pub fn is_valid_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Validate an identifier, naming what it is in the error message.
pub(crate) fn check_ident(kind: &str, s: &str) -> Result<(), BuildError> {
    if is_valid_ident(s) {
        Ok(())
    } else {
        Err(BuildError::InvalidArgument(format!(
            "{kind} '{s}' is not a valid SQL identifier"
        )))
    }
}
