use deltasync_core::RetryDisposition;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// SQLSTATE codes the writer treats as contention: serialization failure,
/// deadlock, lock not available.
const CONTENTION_CODES: [&str; 3] = ["40001", "40P01", "55P03"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient contention: {0}")]
    Transient(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("malformed row: {0}")]
    Malformed(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn retry_disposition(&self) -> RetryDisposition {
        if self.is_transient() {
            RetryDisposition::Retryable
        } else {
            RetryDisposition::NonRetryable
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            let detail = format!("{code}: {}", db_err.message());
            if CONTENTION_CODES.contains(&code.as_str()) {
                return Self::Transient(detail);
            }
            if code.starts_with("23") {
                return Self::Constraint(detail);
            }
            if code.starts_with("22") {
                return Self::Malformed(detail);
            }
        }

        let transient = matches!(err, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_));
        let malformed = matches!(
            err,
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)
        );
        if transient {
            Self::Transient(err.to_string())
        } else if malformed {
            Self::Malformed(err.to_string())
        } else {
            Self::Database(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_and_io_resets_are_transient() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_transient());
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(StoreError::from(sqlx::Error::Io(reset)).is_transient());
    }

    #[test]
    fn row_not_found_is_not_transient() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert_eq!(err.retry_disposition(), RetryDisposition::NonRetryable);
    }
}
