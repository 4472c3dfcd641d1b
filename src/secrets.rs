//! Server secrets passed to the child through its environment.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use log::{info, warn};

use crate::error::SecretError;

pub const KEYRING_SERVICE: &str = "ddt-manager";
pub const SERVER_SECRET_KEYS: [&str; 3] = ["SECRET_KEY", "DB_PASSWORD", "EMAIL_HOST_PASSWORD"];

const GENERATED_KEY: &str = "SECRET_KEY";
const SECRET_KEY_LEN: usize = 50;
const SECRET_KEY_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*(-_=+)";

fn check_key(key: &str) -> Result<(), SecretError> {
    if SERVER_SECRET_KEYS.contains(&key) {
        Ok(())
    } else {
        Err(SecretError::Unsupported(key.to_string()))
    }
}

pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, SecretError>;
    fn set(&self, key: &str, value: &str) -> Result<(), SecretError>;
    fn delete(&self, key: &str) -> Result<(), SecretError>;
}

#[derive(Debug, Default)]
pub struct MemorySecretStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        match self.values.lock() {
            Ok(values) => values,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, key: &str) -> Result<Option<String>, SecretError> {
        check_key(key)?;
        Ok(self.values().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SecretError> {
        check_key(key)?;
        self.values().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), SecretError> {
        check_key(key)?;
        self.values().remove(key);
        Ok(())
    }
}

/// OS keychain backed store.
#[cfg(feature = "keychain")]
#[derive(Debug, Clone)]
pub struct KeyringSecretStore {
    service: String,
}

#[cfg(feature = "keychain")]
impl KeyringSecretStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry, SecretError> {
        check_key(key)?;
        keyring::Entry::new(&self.service, key)
            .map_err(|e| SecretError::Backend(format!("Keyring init failed: {e}")))
    }
}

#[cfg(feature = "keychain")]
impl Default for KeyringSecretStore {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE)
    }
}

#[cfg(feature = "keychain")]
impl SecretStore for KeyringSecretStore {
    fn get(&self, key: &str) -> Result<Option<String>, SecretError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(SecretError::Backend(format!(
                "Failed to read keyring secret: {err}"
            ))),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SecretError> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| SecretError::Backend(format!("Failed to write keyring secret: {e}")))
    }

    fn delete(&self, key: &str) -> Result<(), SecretError> {
        match self.entry(key)?.delete_credential() {
            Ok(_) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(SecretError::Backend(format!(
                "Failed to delete keyring secret: {err}"
            ))),
        }
    }
}

/// Random key in the same alphabet the web framework uses for its own keys.
pub fn generate_secret_key() -> Result<String, SecretError> {
    // Largest multiple of the alphabet size that fits in a byte.
    let limit = (256 / SECRET_KEY_CHARS.len() * SECRET_KEY_CHARS.len()) as u8;
    let mut out = String::with_capacity(SECRET_KEY_LEN);
    let mut buf = [0u8; 64];
    while out.len() < SECRET_KEY_LEN {
        getrandom::getrandom(&mut buf).map_err(|e| SecretError::Random(e.to_string()))?;
        for byte in buf {
            if byte < limit && out.len() < SECRET_KEY_LEN {
                out.push(SECRET_KEY_CHARS[byte as usize % SECRET_KEY_CHARS.len()] as char);
            }
        }
    }
    Ok(out)
}

/// Reads every server secret from `store`. A missing `SECRET_KEY` is generated
/// and written back so it stays stable across launches.
pub fn collect_server_secrets(store: &dyn SecretStore) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for key in SERVER_SECRET_KEYS {
        match store.get(key) {
            Ok(Some(value)) if !value.trim().is_empty() => {
                env.insert(key.to_string(), value.trim().to_string());
            }
            Ok(_) => {}
            Err(err) => warn!("cannot read secret {key}: {err}"),
        }
    }

    if !env.contains_key(GENERATED_KEY) {
        match generate_secret_key() {
            Ok(value) => {
                if let Err(err) = store.set(GENERATED_KEY, &value) {
                    warn!("generated {GENERATED_KEY} could not be stored: {err}");
                }
                env.insert(GENERATED_KEY.to_string(), value);
            }
            Err(err) => warn!("cannot generate {GENERATED_KEY}: {err}"),
        }
    }
    info!("injecting {} secrets into server env", env.len());
    env
}
