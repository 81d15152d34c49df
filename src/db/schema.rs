//! SQL DDL for initializing the vault storage.

/// SQLite schema with:
/// - `owners.username` as PRIMARY KEY (uniqueness enforced by the engine)
/// - `accounts.id` INTEGER PRIMARY KEY AUTOINCREMENT (ids are never reused)
/// - `accounts.owner_username` referencing `owners`, cascading on rename and delete
/// - timestamps as RFC3339 TEXT
pub const SQLITE_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS owners (
    username TEXT PRIMARY KEY NOT NULL,
    password_hash TEXT NOT NULL, -- PHC string, or legacy SHA-512 hex awaiting upgrade
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_username TEXT NOT NULL,
    account_name TEXT NOT NULL,
    secret TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (owner_username) REFERENCES owners(username)
        ON UPDATE CASCADE ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_accounts_owner_name ON accounts(owner_username, account_name);
"#;
