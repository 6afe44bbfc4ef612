//! OS credential store abstraction for the long-lived access token, stored
//! under the `com.ajizablg.ojm-drone/access-token` service identifier. The
//! concrete implementation delegates to `keyring`, which wraps macOS
//! Keychain / Windows Credential Manager itself.

use crate::error::BridgeError;

const SERVICE: &str = "com.ajizablg.ojm-drone/access-token";
const LABEL: &str = "OJM-Drone Access Token";

pub trait CredentialStore: Send + Sync {
    fn load_access_token(&self) -> Result<Option<String>, BridgeError>;
    fn save_access_token(&self, token: &str) -> Result<(), BridgeError>;
}

pub struct KeyringCredentialStore;

impl KeyringCredentialStore {
    fn entry(&self) -> Result<keyring::Entry, BridgeError> {
        keyring::Entry::new(SERVICE, LABEL).map_err(|e| BridgeError::ConfigurationFatal(e.to_string()))
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn load_access_token(&self) -> Result<Option<String>, BridgeError> {
        match self.entry()?.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(BridgeError::ConfigurationFatal(e.to_string())),
        }
    }

    fn save_access_token(&self, token: &str) -> Result<(), BridgeError> {
        self.entry()?.set_password(token).map_err(|e| BridgeError::ConfigurationFatal(e.to_string()))
    }
}

/// In-memory store used by tests and by platforms without a supported
/// keychain backend.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    token: std::sync::Mutex<Option<String>>,
}

impl CredentialStore for InMemoryCredentialStore {
    fn load_access_token(&self) -> Result<Option<String>, BridgeError> {
        Ok(self.token.lock().unwrap().clone())
    }

    fn save_access_token(&self, token: &str) -> Result<(), BridgeError> {
        *self.token.lock().unwrap() = Some(token.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_roundtrips() {
        let store = InMemoryCredentialStore::default();
        assert_eq!(store.load_access_token().unwrap(), None);
        store.save_access_token("abc123").unwrap();
        assert_eq!(store.load_access_token().unwrap().as_deref(), Some("abc123"));
    }
}
