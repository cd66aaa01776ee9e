//! Login command implementation
//!
//! Stores the server catalog API token in the system keyring.

use super::{prompt_input, prompt_yes_no, TOKEN_ACCOUNT};
use vpnctl_core::{
    auth::keyring,
    error::{KeyringError, VpnctlError},
    types::CatalogToken,
};

/// Run the login command
pub fn run_login() -> Result<(), VpnctlError> {
    println!("🔐 vpnctl login");
    println!("==============");
    println!();
    println!("The API token is used to fetch the server list.");
    println!("It will be stored in your system keyring.");
    println!();

    if keyring::has_token(TOKEN_ACCOUNT)? {
        println!("⚠️  A token is already stored.");
        if !prompt_yes_no("Replace it?", false)? {
            println!("Login cancelled.");
            return Ok(());
        }
        println!();
    }

    let token = loop {
        let input = prompt_input("API token: ")?;
        if input.trim().is_empty() {
            println!("❌ Token cannot be empty. Please try again.");
            continue;
        }
        break CatalogToken::new(input.trim().to_string());
    };

    keyring::store_token(TOKEN_ACCOUNT, &token).map_err(|e| {
        if matches!(e, VpnctlError::Keyring(KeyringError::ServiceUnavailable)) {
            println!("❌ Keyring is not available or locked.");
            println!("Please ensure your system keyring is unlocked and available.");
        }
        e
    })?;

    println!("✅ Token stored.");
    println!();
    println!("You can now use:");
    println!("  vpnctl servers --refresh  - Fetch the server list");
    println!("  vpnctl connect            - Connect to the fastest server");

    Ok(())
}
