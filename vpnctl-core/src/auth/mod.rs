//! Credential storage
//!
//! The catalog API token lives in the system keyring. Unit tests and builds
//! with the `mock-keyring` feature get an in-memory store with the same API.

#[cfg(any(test, feature = "mock-keyring"))]
#[path = "keyring_mock.rs"]
pub mod keyring;

#[cfg(not(any(test, feature = "mock-keyring")))]
pub mod keyring;
