//! Keyring operations for secure credential storage
//!
//! Uses the system keyring (Secret Service on Linux) to keep the catalog
//! API token out of the config file.

use crate::error::{KeyringError, VpnctlError};
use crate::types::{CatalogToken, KEYRING_SERVICE_TOKEN};
use keyring::Entry;

fn entry(account: &str) -> Result<Entry, VpnctlError> {
    Entry::new(KEYRING_SERVICE_TOKEN, account)
        .map_err(|_| VpnctlError::Keyring(KeyringError::ServiceUnavailable))
}

/// Store the API token for `account`
pub fn store_token(account: &str, token: &CatalogToken) -> Result<(), VpnctlError> {
    entry(account)?
        .set_password(token.expose())
        .map_err(|_| VpnctlError::Keyring(KeyringError::StoreFailed))?;

    Ok(())
}

/// Retrieve the API token for `account`
pub fn retrieve_token(account: &str) -> Result<CatalogToken, VpnctlError> {
    match entry(account)?.get_password() {
        Ok(token) => Ok(CatalogToken::new(token)),
        Err(keyring::Error::NoEntry) => Err(VpnctlError::Keyring(KeyringError::TokenNotFound)),
        Err(_) => Err(VpnctlError::Keyring(KeyringError::RetrieveFailed)),
    }
}

/// Check if a token exists for `account`
pub fn has_token(account: &str) -> Result<bool, VpnctlError> {
    match entry(account)?.get_password() {
        Ok(_) => Ok(true),
        Err(_) => Ok(false),
    }
}

/// Remove the token for `account`; a missing token is not an error
pub fn delete_token(account: &str) -> Result<(), VpnctlError> {
    match entry(account)?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(_) => Err(VpnctlError::Keyring(KeyringError::StoreFailed)),
    }
}
