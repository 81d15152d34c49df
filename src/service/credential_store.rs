use crate::config::{Config, RetryConfig};
use crate::db::legacy::LegacyImport;
use crate::db::models::StoredAccount;
use crate::db::sqlite::VaultStorage;
use crate::error::{IsRetryable, VaultError};
use crate::service::password::{Hasher, Verification};

use backon::{ExponentialBuilder, Retryable};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Owner authentication and per-owner account storage on top of SQLite.
///
/// Reads go to the pool directly. Writes are serialised through an
/// in-process gate, each runs as one statement or one transaction, and
/// transient lock contention is retried with bounded backoff before
/// surfacing [`VaultError::Busy`]. After [`close`](Self::close) every
/// operation fails with [`VaultError::Closed`].
///
/// Owners and accounts change only through these methods; the SQL layer
/// underneath is private to the crate:
///
/// ```compile_fail
/// # async fn bypass(store: &credvault::CredentialStore) {
/// store.storage().insert_owner("", "plaintext").await;
/// # }
/// ```
pub struct CredentialStore {
    storage: VaultStorage,
    hasher: Arc<Hasher>,
    write_gate: Mutex<()>,
    write_lock_timeout: Duration,
    retry: RetryConfig,
    legacy_import: Option<LegacyImport>,
}

impl CredentialStore {
    /// Connect to `cfg.database.url`, creating the file and schema if needed.
    pub async fn open(cfg: &Config) -> Result<Self, VaultError> {
        let connect_opts = SqliteConnectOptions::from_str(cfg.database.url.as_str())?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(cfg.database.busy_timeout());
        let pool = SqlitePoolOptions::new()
            .max_connections(cfg.database.max_connections.max(1))
            .acquire_timeout(cfg.database.acquire_timeout())
            .connect_with(connect_opts)
            .await?;
        Self::with_pool(pool, cfg).await
    }

    /// Build a store over an existing pool. The pool must have foreign keys
    /// enabled (the sqlx default for SQLite).
    pub async fn with_pool(pool: SqlitePool, cfg: &Config) -> Result<Self, VaultError> {
        let storage = VaultStorage::new(pool);
        let legacy_import = storage.init_schema().await?;

        let hashing = cfg.hashing;
        let hasher = tokio::task::spawn_blocking(move || Hasher::new(&hashing)).await??;

        info!(
            m_cost = hashing.m_cost,
            t_cost = hashing.t_cost,
            p_cost = hashing.p_cost,
            legacy_import = legacy_import.is_some(),
            "credential store opened"
        );

        Ok(Self {
            storage,
            hasher: Arc::new(hasher),
            write_gate: Mutex::new(()),
            write_lock_timeout: cfg.database.write_lock_timeout(),
            retry: cfg.retry,
            legacy_import,
        })
    }

    /// What was imported from a legacy database while opening, if anything.
    pub fn legacy_import(&self) -> Option<LegacyImport> {
        self.legacy_import
    }

    // ── Owners ───────────────────────────────────────────────────────────

    /// Register a new owner. Fails with `UsernameTaken` if the name exists.
    pub async fn register(&self, username: &str, password: &str) -> Result<(), VaultError> {
        self.ensure_open()?;
        require(username, "username must not be empty")?;
        require(password, "password must not be empty")?;

        let hash = self.hash_password(password).await?;
        let hash = hash.as_str();
        self.write(|| self.storage.insert_owner(username, hash))
            .await?;

        debug!(username = %username, "owner registered");
        Ok(())
    }

    /// Check a username/password pair. Unknown usernames and wrong
    /// passwords both return `Ok(false)` after the same amount of hashing.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<bool, VaultError> {
        self.ensure_open()?;

        let stored = if username.is_empty() {
            None
        } else {
            self.read(|| self.storage.password_hash(username)).await?
        };

        let hasher = Arc::clone(&self.hasher);
        let candidate = password.to_owned();
        let lookup = stored.clone();
        let verdict = tokio::task::spawn_blocking(move || {
            hasher.verify(&candidate, lookup.as_deref())
        })
        .await?;

        let verdict = match verdict {
            Ok(v) => v,
            Err(e) => {
                warn!(username = %username, error = %e, "stored password hash is unreadable");
                Verification {
                    matched: false,
                    needs_rehash: false,
                }
            }
        };

        if let Some(old_hash) = stored
            && verdict.needs_rehash
        {
            self.upgrade_hash(username, &old_hash, password).await;
        }

        debug!(username = %username, ok = verdict.matched, "authentication attempt");
        Ok(verdict.matched)
    }

    /// Rewrite an outdated hash after a successful login. Failure leaves the
    /// old (still valid) hash in place.
    async fn upgrade_hash(&self, username: &str, old_hash: &str, password: &str) {
        let result: Result<bool, VaultError> = async {
            let new_hash = self.hash_password(password).await?;
            let new_hash = new_hash.as_str();
            self.write(|| self.storage.replace_password_hash(username, old_hash, new_hash))
                .await
        }
        .await;

        match result {
            Ok(true) => info!(username = %username, "password hash upgraded"),
            Ok(false) => debug!(username = %username, "password hash changed concurrently; upgrade skipped"),
            Err(e) => warn!(username = %username, error = %e, "password hash upgrade failed"),
        }
    }

    /// Atomically rename `old_username` to `new_username` (accounts follow)
    /// and set a new password. Nothing changes if `new_username` belongs to
    /// another owner.
    pub async fn rename_and_rehash(
        &self,
        old_username: &str,
        new_username: &str,
        new_password: &str,
    ) -> Result<(), VaultError> {
        self.ensure_open()?;
        require(old_username, "username must not be empty")?;
        require(new_username, "new username must not be empty")?;
        require(new_password, "new password must not be empty")?;

        let hash = self.hash_password(new_password).await?;
        let hash = hash.as_str();
        let moved = self
            .write(|| self.storage.rename_owner(old_username, new_username, hash))
            .await?;

        debug!(
            old_username = %old_username,
            new_username = %new_username,
            accounts = moved,
            "owner renamed and rehashed"
        );
        Ok(())
    }

    /// Delete an owner and all of its accounts. Returns how many accounts
    /// went with it. Deleting an unknown owner is `OwnerNotFound`.
    pub async fn delete_owner(&self, username: &str) -> Result<u64, VaultError> {
        self.ensure_open()?;
        let removed = self.write(|| self.storage.delete_owner(username)).await?;
        debug!(username = %username, accounts = removed, "owner deleted");
        Ok(removed)
    }

    pub async fn owner_exists(&self, username: &str) -> Result<bool, VaultError> {
        self.ensure_open()?;
        self.read(|| self.storage.owner_exists(username)).await
    }

    // ── Accounts ─────────────────────────────────────────────────────────

    /// Store a credential for `username`. Returns the new account id.
    pub async fn add_account(
        &self,
        username: &str,
        account_name: &str,
        secret: &str,
    ) -> Result<i64, VaultError> {
        self.ensure_open()?;
        require(username, "username must not be empty")?;

        let id = self
            .write(|| self.storage.insert_account(username, account_name, secret))
            .await?;
        debug!(username = %username, account = %account_name, id, "account added");
        Ok(id)
    }

    /// `(account_name, secret)` pairs in insertion order. Empty for owners
    /// without accounts and for unknown owners.
    pub async fn list_accounts(&self, username: &str) -> Result<Vec<(String, String)>, VaultError> {
        Ok(self
            .list_account_entries(username)
            .await?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    /// Full account rows, including ids, in insertion order.
    pub async fn list_account_entries(&self, username: &str) -> Result<Vec<StoredAccount>, VaultError> {
        self.ensure_open()?;
        self.read(|| self.storage.list_accounts(username)).await
    }

    /// Set a new secret on every account of `username` named `account_name`.
    /// Returns the number of rows changed, possibly zero.
    pub async fn update_account(
        &self,
        username: &str,
        account_name: &str,
        new_secret: &str,
    ) -> Result<u64, VaultError> {
        self.ensure_open()?;
        let n = self
            .write(|| self.storage.update_secret(username, account_name, new_secret))
            .await?;
        debug!(username = %username, account = %account_name, updated = n, "accounts updated");
        Ok(n)
    }

    /// Set a new secret on one account, identified by id within `username`.
    pub async fn update_account_by_id(
        &self,
        username: &str,
        id: i64,
        new_secret: &str,
    ) -> Result<(), VaultError> {
        self.ensure_open()?;
        let n = self
            .write(|| self.storage.update_secret_by_id(username, id, new_secret))
            .await?;
        if n == 0 {
            return Err(VaultError::AccountNotFound(id));
        }
        debug!(username = %username, id, "account updated");
        Ok(())
    }

    /// Delete every account of `username` named `account_name`. Returns the
    /// number of rows removed, possibly zero.
    pub async fn delete_account(&self, username: &str, account_name: &str) -> Result<u64, VaultError> {
        self.ensure_open()?;
        let n = self
            .write(|| self.storage.delete_accounts(username, account_name))
            .await?;
        debug!(username = %username, account = %account_name, deleted = n, "accounts deleted");
        Ok(n)
    }

    pub async fn delete_account_by_id(&self, username: &str, id: i64) -> Result<(), VaultError> {
        self.ensure_open()?;
        let n = self
            .write(|| self.storage.delete_account_by_id(username, id))
            .await?;
        if n == 0 {
            return Err(VaultError::AccountNotFound(id));
        }
        debug!(username = %username, id, "account deleted");
        Ok(())
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Release the storage handle. Later calls fail with `Closed`; closing
    /// twice is harmless.
    pub async fn close(&self) {
        if !self.storage.is_closed() {
            self.storage.close().await;
            info!("credential store closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.storage.is_closed()
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn ensure_open(&self) -> Result<(), VaultError> {
        if self.storage.is_closed() {
            return Err(VaultError::Closed);
        }
        Ok(())
    }

    fn retry_policy(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.retry.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .with_max_times(self.retry.max_times)
            .with_jitter()
    }

    async fn write_permit(&self) -> Result<MutexGuard<'_, ()>, VaultError> {
        tokio::time::timeout(self.write_lock_timeout, self.write_gate.lock())
            .await
            .map_err(|_| {
                warn!(
                    timeout_ms = self.write_lock_timeout.as_millis() as u64,
                    "timed out waiting for the write gate"
                );
                VaultError::Busy
            })
    }

    /// Run a mutation under the write gate, retrying on contention.
    async fn write<T, F, Fut>(&self, op: F) -> Result<T, VaultError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VaultError>>,
    {
        let _permit = self.write_permit().await?;
        self.read(op).await
    }

    /// Run a statement, retrying on contention.
    async fn read<T, F, Fut>(&self, op: F) -> Result<T, VaultError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VaultError>>,
    {
        op.retry(self.retry_policy())
            .when(|e: &VaultError| e.is_retryable())
            .notify(|e: &VaultError, dur: Duration| {
                debug!(error = %e, delay_ms = dur.as_millis() as u64, "storage busy; retrying");
            })
            .await
    }

    async fn hash_password(&self, password: &str) -> Result<String, VaultError> {
        let hasher = Arc::clone(&self.hasher);
        let password = password.to_owned();
        tokio::task::spawn_blocking(move || hasher.hash(&password)).await?
    }
}

fn require(value: &str, what: &'static str) -> Result<(), VaultError> {
    if value.is_empty() {
        return Err(VaultError::InvalidInput(what));
    }
    Ok(())
}
