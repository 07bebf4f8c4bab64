//! Mapping from sqlx errors to port errors.

use clinic_concierge_conversation::StoreError;

/// Classifies a sqlx error that has no operation-specific meaning.
///
/// Decode failures mean a row is not what the schema promises; everything
/// else is treated as the store being unreachable or unhealthy.
pub(crate) fn classify(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Decode(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::TypeNotFound { .. } => StoreError::Corrupt {
            reason: err.to_string(),
        },
        other => StoreError::Unavailable {
            reason: other.to_string(),
        },
    }
}

/// Returns true for a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

/// Returns true for a foreign key violation.
pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_foreign_key_violation())
}

/// Builds the error for a persisted value that failed to parse.
pub(crate) fn corrupt(what: &str, value: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        reason: format!("invalid {what} '{value}': {err}"),
    }
}
