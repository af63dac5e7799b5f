//! Identifier validation, quoting and literal escaping for generated SQL.
//!
//! SQL identifiers cannot be bound as statement parameters, so table, schema
//! and column names are validated and quoted here before being spliced into
//! COPY, INSERT and UPDATE statements.

use crate::error::{Result, SliceError};

/// Maximum PostgreSQL identifier length in bytes.
const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Validate an identifier.
///
/// Rejects empty identifiers, identifiers containing null bytes and
/// identifiers longer than PostgreSQL allows.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SliceError::Config("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(SliceError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(SliceError::Config(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier, doubling embedded double quotes.
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Qualify a PostgreSQL table name with schema.
pub fn qualify_pg(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(table)?))
}

/// Quote a text value as a SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Validate a raw WHERE predicate handed over by the host ORM.
///
/// The predicate is spliced into a COPY subquery, so statement separators and
/// comment markers are rejected.
pub fn validate_raw_predicate(predicate: &str) -> Result<()> {
    if predicate.trim().is_empty() {
        return Err(SliceError::Config("Predicate cannot be empty".to_string()));
    }

    if predicate.contains(';') {
        return Err(SliceError::Config(format!(
            "SECURITY: Predicate contains semicolon (possible injection): {:?}",
            predicate
        )));
    }

    if predicate.contains("--") || predicate.contains("/*") || predicate.contains("*/") {
        return Err(SliceError::Config(format!(
            "SECURITY: Predicate contains SQL comment markers (possible injection): {:?}",
            predicate
        )));
    }

    Ok(())
}
