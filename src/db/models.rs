use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Row of the `accounts` table: one third-party credential owned by a vault owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct StoredAccount {
    pub id: i64,
    pub owner_username: String,
    pub account_name: String,
    pub secret: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<StoredAccount> for (String, String) {
    fn from(a: StoredAccount) -> Self {
        (a.account_name, a.secret)
    }
}
