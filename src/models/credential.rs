//! Upstream access credential model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OAuth access token a user granted for upstream calls
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub id: i64,
    pub user_id: i64,
    pub access_token: String,
    pub created_at: DateTime<Utc>,
}

// Keep the secret out of logs
impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("access_token", &"***")
            .field("created_at", &self.created_at)
            .finish()
    }
}
