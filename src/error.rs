use thiserror::Error;

/// Postgres unique-violation SQLSTATE, reported by the REST backend for duplicate rows.
const UNIQUE_VIOLATION: &str = "23505";

/// Failures reported by a [`crate::gateway::Gateway`].
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Credentials were rejected or the account could not be created.
    #[error("{0}")]
    Auth(String),

    #[error("Not signed in")]
    Unauthenticated,

    /// The row already exists (membership, like, account).
    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Credential hashing failed: {0}")]
    Credentials(String),

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Decode(#[from] serde_json::Error),
}

impl GatewayError {
    /// Idempotency conflicts are successes for membership and like writes.
    pub fn is_duplicate(&self) -> bool {
        match self {
            GatewayError::Duplicate(_) => true,
            GatewayError::Rejected { status, message } => *status == 409 || message.contains(UNIQUE_VIOLATION),
            GatewayError::Database(err) => err
                .as_database_error()
                .map(|db| db.is_unique_violation())
                .unwrap_or(false),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_are_duplicates() {
        assert!(GatewayError::Duplicate("member".into()).is_duplicate());
        assert!(GatewayError::Rejected {
            status: 409,
            message: "conflict".into()
        }
        .is_duplicate());
        assert!(GatewayError::Rejected {
            status: 400,
            message: "23505: duplicate key value".into()
        }
        .is_duplicate());
    }

    #[test]
    fn other_failures_are_not_duplicates() {
        assert!(!GatewayError::Unauthenticated.is_duplicate());
        assert!(!GatewayError::Rejected {
            status: 500,
            message: "boom".into()
        }
        .is_duplicate());
        assert!(!GatewayError::Database(sqlx::Error::RowNotFound).is_duplicate());
    }
}
