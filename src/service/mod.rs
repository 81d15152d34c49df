//! Service layer: password hashing and the public credential store.

pub mod credential_store;
pub mod password;

pub use credential_store::CredentialStore;
