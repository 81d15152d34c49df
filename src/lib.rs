pub mod config;
pub(crate) mod db;
pub mod error;
pub mod service;

pub use config::Config;
pub use db::{LegacyImport, StoredAccount};
pub use error::VaultError;
pub use service::credential_store::CredentialStore;
