//! Database module: models and schema for persistent storage.
//!
//! Layout:
//! - `models.rs`: Rust structs mirroring DB rows
//! - `schema.rs`: SQL DDL for initializing the database (SQLite)
//! - `sqlite.rs`: transactional queries behind every store operation
//! - `legacy.rs`: import of databases written by the previous password manager

pub mod legacy;
pub mod models;
pub mod schema;
pub mod sqlite;

pub use legacy::LegacyImport;
pub use models::StoredAccount;
