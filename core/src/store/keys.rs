// Authorized RFID keys
//
// Set membership over the storage backend: one `key_list:<key>` entry per
// key. Keys are normalised to lower-case hex before every operation.

use crate::store::backend::StorageBackend;
use crate::GatewayError;
use std::sync::Arc;

const KEY_PREFIX: &str = "key_list:";

/// Lower-case and validate a card key
pub fn normalize_key(raw: &str) -> Result<String, GatewayError> {
    let key = raw.trim().to_lowercase();
    if key.is_empty() {
        return Err(GatewayError::InvalidInput("empty key".to_string()));
    }
    if !key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(GatewayError::InvalidInput(format!("key {:?} is not hex", raw)));
    }
    Ok(key)
}

#[derive(Clone)]
pub struct KeyStore {
    backend: Arc<dyn StorageBackend>,
}

impl KeyStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn storage_key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }

    /// Returns the normalised key that was stored
    pub fn add_key(&self, raw: &str) -> Result<String, GatewayError> {
        let key = normalize_key(raw)?;
        self.backend
            .put(Self::storage_key(&key).as_bytes(), b"1")
            .map_err(GatewayError::Storage)?;
        Ok(key)
    }

    /// Returns false if the key was not present
    pub fn remove_key(&self, raw: &str) -> Result<bool, GatewayError> {
        let key = normalize_key(raw)?;
        let storage_key = Self::storage_key(&key);
        let present = self
            .backend
            .get(storage_key.as_bytes())
            .map_err(GatewayError::Storage)?
            .is_some();
        if present {
            self.backend
                .remove(storage_key.as_bytes())
                .map_err(GatewayError::Storage)?;
        }
        Ok(present)
    }

    pub fn exists(&self, raw: &str) -> Result<bool, GatewayError> {
        let Ok(key) = normalize_key(raw) else {
            return Ok(false);
        };
        Ok(self
            .backend
            .get(Self::storage_key(&key).as_bytes())
            .map_err(GatewayError::Storage)?
            .is_some())
    }

    /// All keys, sorted
    pub fn get_keys(&self) -> Result<Vec<String>, GatewayError> {
        let entries = self
            .backend
            .scan_prefix(KEY_PREFIX.as_bytes())
            .map_err(GatewayError::Storage)?;
        Ok(entries
            .into_iter()
            .map(|(key, _)| String::from_utf8_lossy(&key[KEY_PREFIX.len()..]).into_owned())
            .collect())
    }
}
