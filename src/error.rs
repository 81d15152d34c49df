use sqlx::Error as SqlxError;
use sqlx::error::ErrorKind;
use thiserror::Error as ThisError;

/// SQLite primary result codes that signal lock contention rather than a
/// real failure. Extended codes (e.g. `SQLITE_BUSY_SNAPSHOT` = 517) share
/// the low byte with their primary code.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

#[derive(Debug, ThisError)]
pub enum VaultError {
    #[error("username '{0}' is already taken")]
    UsernameTaken(String),

    #[error("owner '{0}' not found")]
    OwnerNotFound(String),

    #[error("account {0} not found")]
    AccountNotFound(i64),

    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("credential store is closed")]
    Closed,

    #[error("credential store is busy; try again later")]
    Busy,

    #[error("password hashing error: {0}")]
    PasswordHash(String),

    #[error("Database error: {0}")]
    Database(#[source] SqlxError),

    #[error("background task failed: {0}")]
    Task(String),
}

impl VaultError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::OwnerNotFound(_) | Self::AccountNotFound(_))
    }

    /// Translate a raw sqlx error. `username` names the owner the failing
    /// statement was about, so constraint violations can carry it.
    pub fn classify(err: SqlxError, username: &str) -> Self {
        match &err {
            SqlxError::PoolClosed => return Self::Closed,
            SqlxError::PoolTimedOut => return Self::Busy,
            SqlxError::Database(db_err) => match db_err.kind() {
                ErrorKind::UniqueViolation => return Self::UsernameTaken(username.to_string()),
                ErrorKind::ForeignKeyViolation => {
                    return Self::OwnerNotFound(username.to_string());
                }
                _ => {
                    if is_contention_code(db_err.code().as_deref()) {
                        return Self::Busy;
                    }
                }
            },
            _ => {}
        }
        Self::Database(err)
    }
}

impl From<SqlxError> for VaultError {
    fn from(err: SqlxError) -> Self {
        Self::classify(err, "")
    }
}

impl From<argon2::password_hash::Error> for VaultError {
    fn from(err: argon2::password_hash::Error) -> Self {
        Self::PasswordHash(err.to_string())
    }
}

impl From<tokio::task::JoinError> for VaultError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

fn is_contention_code(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .map(|c| matches!(c & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
        == Some(true)
}

/// Marks errors that a bounded backoff loop may retry.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for VaultError {
    fn is_retryable(&self) -> bool {
        matches!(self, VaultError::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_codes_include_extended_variants() {
        assert!(is_contention_code(Some("5")));
        assert!(is_contention_code(Some("6")));
        assert!(is_contention_code(Some("517")));
        assert!(is_contention_code(Some("261")));
        assert!(!is_contention_code(Some("19")));
        assert!(!is_contention_code(Some("2067")));
        assert!(!is_contention_code(Some("not-a-code")));
        assert!(!is_contention_code(None));
    }

    #[test]
    fn pool_errors_map_to_lifecycle_variants() {
        assert!(matches!(
            VaultError::classify(SqlxError::PoolClosed, "alice"),
            VaultError::Closed
        ));
        assert!(matches!(
            VaultError::classify(SqlxError::PoolTimedOut, "alice"),
            VaultError::Busy
        ));
        assert!(matches!(
            VaultError::classify(SqlxError::RowNotFound, "alice"),
            VaultError::Database(SqlxError::RowNotFound)
        ));
    }

    #[test]
    fn database_error_keeps_its_cause() {
        use std::error::Error;

        let err = VaultError::classify(SqlxError::RowNotFound, "alice");
        let source = err.source().expect("sqlx cause");
        assert!(matches!(
            source.downcast_ref::<SqlxError>(),
            Some(SqlxError::RowNotFound)
        ));
        assert!(VaultError::Busy.source().is_none());
    }

    #[test]
    fn only_busy_is_retryable() {
        assert!(VaultError::Busy.is_retryable());
        assert!(!VaultError::Closed.is_retryable());
        assert!(!VaultError::UsernameTaken("a".into()).is_retryable());
        assert!(!VaultError::OwnerNotFound("a".into()).is_retryable());
        assert!(VaultError::AccountNotFound(3).is_not_found());
    }
}
