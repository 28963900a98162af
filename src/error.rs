use std::fmt;

use crate::core::PostId;

/// Mutation steps of comment creation, reported when one of them fails so the
/// caller can tell integrity problems from transient ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStep {
    InsertComment,
    InsertClosureEdges,
    InsertSelfLike,
    UpdatePostCounter,
}

impl fmt::Display for MutationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationStep::InsertComment => "insert comment",
            MutationStep::InsertClosureEdges => "insert comment path",
            MutationStep::InsertSelfLike => "insert comment like",
            MutationStep::UpdatePostCounter => "increment number of comments on post",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    NoCommentsForPost(PostId),
    ConstraintViolation(String),
    TransactionFailure(String),
    Timeout(String),
    InconsistentData(String),
    Validation(String),
    Configuration(String),
    StepFailed {
        step: MutationStep,
        source: Box<AppError>,
    },
    Unknown(String),
}

impl AppError {
    /// Classify a sqlx error, prefixing it with what the store was doing.
    pub fn from_sqlx(context: impl fmt::Display, err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound(format!("{}: no record found", context)),
            sqlx::Error::PoolTimedOut => {
                AppError::Timeout(format!("{}: timed out waiting for a connection", context))
            }
            sqlx::Error::Database(db_err) => {
                use sqlx::error::ErrorKind;
                match db_err.kind() {
                    ErrorKind::UniqueViolation
                    | ErrorKind::ForeignKeyViolation
                    | ErrorKind::NotNullViolation
                    | ErrorKind::CheckViolation => {
                        AppError::ConstraintViolation(format!("{}: {}", context, db_err))
                    }
                    _ if is_busy_code(db_err.code().as_deref()) => {
                        AppError::Timeout(format!("{}: {}", context, db_err))
                    }
                    _ => AppError::Unknown(format!("{}: {}", context, db_err)),
                }
            }
            other => AppError::Unknown(format!("{}: {}", context, other)),
        }
    }

    /// Errors raised while opening or finishing a transaction.
    pub fn transaction(context: impl fmt::Display, err: sqlx::Error) -> Self {
        match AppError::from_sqlx(&context, err) {
            AppError::Unknown(msg) => AppError::TransactionFailure(msg),
            classified => classified,
        }
    }

    /// Whether the user may simply try the same request again.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::ConstraintViolation(_)
            | AppError::Timeout(_)
            | AppError::TransactionFailure(_) => true,
            AppError::StepFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Status code hint for the rendering layer.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::NotFound(_) | AppError::NoCommentsForPost(_) => 404,
            AppError::Validation(_) => 400,
            AppError::ConstraintViolation(_) => 409,
            AppError::Timeout(_) | AppError::TransactionFailure(_) => 503,
            AppError::StepFailed { source, .. } => source.http_status(),
            AppError::InconsistentData(_) | AppError::Configuration(_) | AppError::Unknown(_) => {
                500
            }
        }
    }
}

// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes.
fn is_busy_code(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .map(|c| matches!(c & 0xff, 5 | 6))
        .unwrap_or(false)
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::NoCommentsForPost(post_id) => {
                write!(f, "No comments found for post {}", post_id)
            }
            AppError::ConstraintViolation(msg) => write!(f, "Constraint violation: {}", msg),
            AppError::TransactionFailure(msg) => write!(f, "Transaction failure: {}", msg),
            AppError::Timeout(msg) => write!(f, "Timeout error: {}", msg),
            AppError::InconsistentData(msg) => write!(f, "Inconsistent data: {}", msg),
            AppError::Validation(msg) => write!(f, "Validation error: {}", msg),
            AppError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            AppError::StepFailed { step, source } => {
                write!(f, "Failed to {}: {}", step, source)
            }
            AppError::Unknown(msg) => write!(f, "Database error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::StepFailed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::from_sqlx("database operation", err)
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err = AppError::from_sqlx("get comment 7", sqlx::Error::RowNotFound);
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(err.http_status(), 404);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_pool_timeout_is_retryable() {
        let err = AppError::from_sqlx("begin", sqlx::Error::PoolTimedOut);
        assert!(matches!(err, AppError::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_step_failure_delegates_to_source() {
        let err = AppError::StepFailed {
            step: MutationStep::InsertSelfLike,
            source: Box::new(AppError::ConstraintViolation("duplicate".into())),
        };
        assert!(err.is_retryable());
        assert_eq!(err.http_status(), 409);
        assert!(err.to_string().starts_with("Failed to insert comment like"));
    }

    #[test]
    fn test_busy_codes() {
        assert!(is_busy_code(Some("5")));
        assert!(is_busy_code(Some("517")));
        assert!(is_busy_code(Some("6")));
        assert!(!is_busy_code(Some("19")));
        assert!(!is_busy_code(None));
    }
}
