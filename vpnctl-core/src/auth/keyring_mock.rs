//! Mock keyring implementation for testing
//!
//! Provides an in-memory keyring implementation that doesn't require
//! system keyring access. Used in CI environments and for testing.

use crate::error::{KeyringError, VpnctlError};
use crate::types::{CatalogToken, KEYRING_SERVICE_TOKEN};
use std::collections::HashMap;
use std::sync::Mutex;

lazy_static::lazy_static! {
    static ref MOCK_KEYRING: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());
}

/// Generate a key for the mock keyring
fn make_key(account: &str) -> String {
    format!("{}:{}", KEYRING_SERVICE_TOKEN, account)
}

/// Store the API token in the mock keyring
pub fn store_token(account: &str, token: &CatalogToken) -> Result<(), VpnctlError> {
    let mut keyring = MOCK_KEYRING
        .lock()
        .map_err(|_| VpnctlError::Keyring(KeyringError::StoreFailed))?;
    keyring.insert(make_key(account), token.expose().to_string());
    Ok(())
}

/// Retrieve the API token from the mock keyring
pub fn retrieve_token(account: &str) -> Result<CatalogToken, VpnctlError> {
    let keyring = MOCK_KEYRING
        .lock()
        .map_err(|_| VpnctlError::Keyring(KeyringError::RetrieveFailed))?;
    keyring
        .get(&make_key(account))
        .cloned()
        .map(CatalogToken::new)
        .ok_or(VpnctlError::Keyring(KeyringError::TokenNotFound))
}

/// Check if a token exists in the mock keyring
pub fn has_token(account: &str) -> Result<bool, VpnctlError> {
    let keyring = MOCK_KEYRING
        .lock()
        .map_err(|_| VpnctlError::Keyring(KeyringError::ServiceUnavailable))?;
    Ok(keyring.contains_key(&make_key(account)))
}

/// Delete a token from the mock keyring
pub fn delete_token(account: &str) -> Result<(), VpnctlError> {
    let mut keyring = MOCK_KEYRING
        .lock()
        .map_err(|_| VpnctlError::Keyring(KeyringError::StoreFailed))?;
    keyring.remove(&make_key(account));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_token_operations() {
        let account = "test_account_mock";
        let _ = delete_token(account);

        store_token(account, &CatalogToken::new("tok-123".to_string()))
            .expect("Failed to store token");
        assert!(has_token(account).expect("Failed to check token"));

        let retrieved = retrieve_token(account).expect("Failed to retrieve token");
        assert_eq!(retrieved.expose(), "tok-123");

        delete_token(account).expect("Failed to delete token");
        assert!(!has_token(account).expect("Failed to check token after delete"));
        assert!(matches!(
            retrieve_token(account),
            Err(VpnctlError::Keyring(KeyringError::TokenNotFound))
        ));
    }
}
