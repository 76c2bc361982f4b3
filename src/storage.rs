//! Persistent storage for the versioned wallet blob.
//!
//! Provides a `Storage` trait and a sled-backed implementation. The blob is
//! kept as JSON so that migrations can read schemas this build no longer
//! has types for.

use serde_json::Value;

use crate::state::VersionedState;

/// Key of the single versioned blob inside the `state` tree.
const STATE_KEY: &[u8] = b"versioned";

/// Errors from storage operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage backend not supported")]
    Unsupported,
}

/// Trait for persistent storage backends.
pub trait Storage: Send + Sync {
    /// Read the raw stored blob, `None` when nothing was ever written.
    fn get(&self) -> Result<Option<Value>, StorageError>;

    /// Replace the stored blob.
    fn set(&self, state: &VersionedState) -> Result<(), StorageError>;

    /// Whether writes can succeed at all on this backend.
    fn is_supported(&self) -> bool {
        true
    }

    fn flush(&self) -> Result<(), StorageError>;
}

/// Sled-backed storage implementation.
pub struct SledStorage {
    /// Owns the sled handle the `state` tree lives in.
    db: sled::Db,
    state: sled::Tree,
}

impl SledStorage {
    /// Open or create a sled database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    /// Open a temporary in-memory sled database (for testing).
    pub fn open_temporary() -> Result<Self, StorageError> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(|e| StorageError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let state = db
            .open_tree("state")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(SledStorage { db, state })
    }
}

impl Storage for SledStorage {
    fn get(&self) -> Result<Option<Value>, StorageError> {
        match self
            .state
            .get(STATE_KEY)
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn set(&self, state: &VersionedState) -> Result<(), StorageError> {
        let bytes =
            serde_json::to_vec(state).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.state
            .insert(STATE_KEY, bytes)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Meta;
    use serde_json::json;

    fn temp_storage() -> SledStorage {
        SledStorage::open_temporary().unwrap()
    }

    #[test]
    fn empty_storage_returns_none() {
        let storage = temp_storage();
        assert!(storage.get().unwrap().is_none());
        assert!(storage.is_supported());
    }

    #[test]
    fn set_then_get() {
        let storage = temp_storage();
        let state = VersionedState {
            meta: Meta { version: 3 },
            data: json!({ "network": "1256" }),
        };
        storage.set(&state).unwrap();
        let raw = storage.get().unwrap().unwrap();
        assert_eq!(raw["meta"]["version"], 3);
        assert_eq!(raw["data"]["network"], "1256");
    }

    #[test]
    fn set_overwrites_previous_blob() {
        let storage = temp_storage();
        for version in [1, 2, 3] {
            storage
                .set(&VersionedState {
                    meta: Meta { version },
                    data: json!({}),
                })
                .unwrap();
        }
        assert_eq!(storage.get().unwrap().unwrap()["meta"]["version"], 3);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = SledStorage::open(dir.path()).unwrap();
            storage
                .set(&VersionedState {
                    meta: Meta { version: 3 },
                    data: json!({ "selectedAddress": "0xabc" }),
                })
                .unwrap();
            storage.flush().unwrap();
        }
        let storage = SledStorage::open(dir.path()).unwrap();
        let raw = storage.get().unwrap().unwrap();
        assert_eq!(raw["data"]["selectedAddress"], "0xabc");
    }

    #[test]
    fn corrupt_blob_is_a_serialization_error() {
        let storage = temp_storage();
        storage.state.insert(STATE_KEY, b"not json".to_vec()).unwrap();
        assert!(matches!(
            storage.get(),
            Err(StorageError::Serialization(_))
        ));
    }
}
