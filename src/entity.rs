use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Display name used when a session is restored but the profile row is missing.
pub const FALLBACK_DISPLAY_NAME: &str = "User";

/// The authenticated identity of the local user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub email: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        user_id: impl Into<String>,
        email: impl Into<String>,
        display_name: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            display_name: display_name.into(),
            created_at,
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.email)
    }
}

/// Profile row kept next to the authentication record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub display_name: String,
}
