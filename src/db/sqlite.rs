use crate::db::legacy::{self, LegacyImport};
use crate::db::models::StoredAccount;
use crate::db::schema::SQLITE_INIT;
use crate::error::VaultError;
use chrono::Utc;
use sqlx::{Pool, Sqlite, SqliteConnection};

pub type SqlitePool = Pool<Sqlite>;

/// SQL layer of the vault. Every method is a single statement or a single
/// transaction; a dropped transaction rolls back, so early returns never
/// leave partial writes behind.
#[derive(Clone)]
pub(crate) struct VaultStorage {
    pool: SqlitePool,
}

impl VaultStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create tables if missing. A database left behind by the previous
    /// password manager is imported in the same transaction.
    pub async fn init_schema(&self) -> Result<Option<LegacyImport>, VaultError> {
        let mut tx = self.pool.begin().await?;

        let staged = legacy::stage(&mut *tx).await?;

        // execute multiple statements one by one (sqlx::query runs a single statement)
        for stmt in SQLITE_INIT.split(';') {
            let s = stmt.trim();
            if s.is_empty() {
                continue;
            }
            sqlx::query(s).execute(&mut *tx).await?;
        }

        let report = match staged {
            Some(tables) => Some(legacy::import(&mut *tx, tables).await?),
            None => None,
        };

        tx.commit().await?;
        Ok(report)
    }

    /// Insert a new owner. The primary key rejects duplicates atomically.
    pub async fn insert_owner(&self, username: &str, password_hash: &str) -> Result<(), VaultError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO owners (username, password_hash, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(username)
        .bind(password_hash)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| VaultError::classify(e, username))?;
        Ok(())
    }

    pub async fn password_hash(&self, username: &str) -> Result<Option<String>, VaultError> {
        let hash: Option<String> = sqlx::query_scalar("SELECT password_hash FROM owners WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(hash)
    }

    pub async fn owner_exists(&self, username: &str) -> Result<bool, VaultError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM owners WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Swap the password hash only if it still equals `expected`. Returns
    /// false when another writer changed it first.
    pub async fn replace_password_hash(
        &self,
        username: &str,
        expected: &str,
        password_hash: &str,
    ) -> Result<bool, VaultError> {
        let res = sqlx::query(
            "UPDATE owners SET password_hash = ?, updated_at = ? WHERE username = ? AND password_hash = ?",
        )
        .bind(password_hash)
        .bind(Utc::now())
        .bind(username)
        .bind(expected)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Rename an owner (accounts follow through `ON UPDATE CASCADE`) and
    /// replace its password hash. Returns the number of accounts now held
    /// under `new_username`.
    pub async fn rename_owner(
        &self,
        old_username: &str,
        new_username: &str,
        password_hash: &str,
    ) -> Result<u64, VaultError> {
        let mut tx = self.pool.begin().await?;

        let res = sqlx::query(
            "UPDATE owners SET username = ?, password_hash = ?, updated_at = ? WHERE username = ?",
        )
        .bind(new_username)
        .bind(password_hash)
        .bind(Utc::now())
        .bind(old_username)
        .execute(&mut *tx)
        .await
        .map_err(|e| VaultError::classify(e, new_username))?;

        if res.rows_affected() == 0 {
            return Err(VaultError::OwnerNotFound(old_username.to_string()));
        }

        // No-op when the cascade already ran; covers pools opened without
        // foreign key enforcement.
        if old_username != new_username {
            sqlx::query("UPDATE accounts SET owner_username = ? WHERE owner_username = ?")
                .bind(new_username)
                .bind(old_username)
                .execute(&mut *tx)
                .await?;
        }

        let moved = count_accounts(&mut *tx, new_username).await?;
        tx.commit().await?;
        Ok(moved)
    }

    /// Delete an owner together with all of its accounts. Returns the number
    /// of accounts removed.
    pub async fn delete_owner(&self, username: &str) -> Result<u64, VaultError> {
        let mut tx = self.pool.begin().await?;

        let accounts = sqlx::query("DELETE FROM accounts WHERE owner_username = ?")
            .bind(username)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let owners = sqlx::query("DELETE FROM owners WHERE username = ?")
            .bind(username)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if owners == 0 {
            return Err(VaultError::OwnerNotFound(username.to_string()));
        }

        tx.commit().await?;
        Ok(accounts)
    }

    /// Insert an account after checking, in the same transaction, that the
    /// owner exists. Returns the new row id.
    pub async fn insert_account(
        &self,
        username: &str,
        account_name: &str,
        secret: &str,
    ) -> Result<i64, VaultError> {
        let mut tx = self.pool.begin().await?;

        let owner: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM owners WHERE username = ?")
            .bind(username)
            .fetch_optional(&mut *tx)
            .await?;
        if owner.is_none() {
            return Err(VaultError::OwnerNotFound(username.to_string()));
        }

        let now = Utc::now();
        let id = sqlx::query(
            r#"INSERT INTO accounts (owner_username, account_name, secret, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(username)
        .bind(account_name)
        .bind(secret)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| VaultError::classify(e, username))?
        .last_insert_rowid();

        tx.commit().await?;
        Ok(id)
    }

    pub async fn list_accounts(&self, username: &str) -> Result<Vec<StoredAccount>, VaultError> {
        let rows = sqlx::query_as::<_, StoredAccount>(
            r#"SELECT id, owner_username, account_name, secret, created_at, updated_at
               FROM accounts WHERE owner_username = ? ORDER BY id"#,
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn update_secret(
        &self,
        username: &str,
        account_name: &str,
        secret: &str,
    ) -> Result<u64, VaultError> {
        let res = sqlx::query(
            "UPDATE accounts SET secret = ?, updated_at = ? WHERE owner_username = ? AND account_name = ?",
        )
        .bind(secret)
        .bind(Utc::now())
        .bind(username)
        .bind(account_name)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    pub async fn update_secret_by_id(
        &self,
        username: &str,
        id: i64,
        secret: &str,
    ) -> Result<u64, VaultError> {
        let res = sqlx::query(
            "UPDATE accounts SET secret = ?, updated_at = ? WHERE owner_username = ? AND id = ?",
        )
        .bind(secret)
        .bind(Utc::now())
        .bind(username)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    pub async fn delete_accounts(&self, username: &str, account_name: &str) -> Result<u64, VaultError> {
        let res = sqlx::query("DELETE FROM accounts WHERE owner_username = ? AND account_name = ?")
            .bind(username)
            .bind(account_name)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    pub async fn delete_account_by_id(&self, username: &str, id: i64) -> Result<u64, VaultError> {
        let res = sqlx::query("DELETE FROM accounts WHERE owner_username = ? AND id = ?")
            .bind(username)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// Close the pool. Waits for checked-out connections to be returned;
    /// calling it again is a no-op.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

async fn count_accounts(conn: &mut SqliteConnection, username: &str) -> Result<u64, VaultError> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM accounts WHERE owner_username = ?")
        .bind(username)
        .fetch_one(conn)
        .await?;
    Ok(n as u64)
}
