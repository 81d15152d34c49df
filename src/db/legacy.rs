//! Import of databases written by the previous password manager.
//!
//! That program kept owners in `auth(username, password_hash)` with unsalted
//! SHA-512 hex digests, and accounts in `accounts(id, username, account_name,
//! password)`. Its `accounts` clashes with ours by name, so the old tables are
//! renamed to `legacy_*` before our schema is created, then copied over.
//! Imported hashes stay as they are until the owner's next successful login
//! rewrites them as Argon2id.

use chrono::Utc;
use sqlx::SqliteConnection;
use tracing::info;

use crate::error::VaultError;

/// Which old tables were found and renamed.
#[derive(Debug, Clone, Copy)]
pub struct LegacyTables {
    accounts: bool,
}

/// Outcome of a legacy import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LegacyImport {
    pub owners: u64,
    pub accounts: u64,
    /// Old account rows whose owner did not exist (orphans) and were dropped.
    pub skipped_accounts: u64,
}

/// Rename the old tables out of the way. Returns `None` when the database
/// holds no legacy data.
pub async fn stage(conn: &mut SqliteConnection) -> Result<Option<LegacyTables>, VaultError> {
    if !table_exists(conn, "auth").await? {
        return Ok(None);
    }

    let accounts = has_column(conn, "accounts", "username").await?
        && !has_column(conn, "accounts", "owner_username").await?;

    sqlx::query("ALTER TABLE auth RENAME TO legacy_auth")
        .execute(&mut *conn)
        .await?;
    if accounts {
        sqlx::query("ALTER TABLE accounts RENAME TO legacy_accounts")
            .execute(&mut *conn)
            .await?;
    }

    Ok(Some(LegacyTables { accounts }))
}

/// Copy staged legacy rows into the current schema. Account ids are kept.
pub async fn import(
    conn: &mut SqliteConnection,
    tables: LegacyTables,
) -> Result<LegacyImport, VaultError> {
    let now = Utc::now();

    let owners = sqlx::query(
        r#"INSERT OR IGNORE INTO owners (username, password_hash, created_at, updated_at)
           SELECT username, password_hash, ?, ? FROM legacy_auth
           WHERE username IS NOT NULL AND username <> '' AND password_hash IS NOT NULL"#,
    )
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    let mut report = LegacyImport {
        owners,
        ..LegacyImport::default()
    };

    if tables.accounts {
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM legacy_accounts")
            .fetch_one(&mut *conn)
            .await?;

        report.accounts = sqlx::query(
            r#"INSERT INTO accounts (id, owner_username, account_name, secret, created_at, updated_at)
               SELECT la.id, la.username, COALESCE(la.account_name, ''), COALESCE(la.password, ''), ?, ?
               FROM legacy_accounts la
               JOIN owners o ON o.username = la.username
               ORDER BY la.id"#,
        )
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        report.skipped_accounts = (total as u64).saturating_sub(report.accounts);
    }

    info!(
        owners = report.owners,
        accounts = report.accounts,
        skipped = report.skipped_accounts,
        "imported legacy password manager data"
    );
    Ok(report)
}

async fn table_exists(conn: &mut SqliteConnection, name: &str) -> Result<bool, VaultError> {
    let (n,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_one(&mut *conn)
            .await?;
    Ok(n > 0)
}

async fn has_column(conn: &mut SqliteConnection, table: &str, column: &str) -> Result<bool, VaultError> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
        .bind(table)
        .bind(column)
        .fetch_one(&mut *conn)
        .await?;
    Ok(n > 0)
}
