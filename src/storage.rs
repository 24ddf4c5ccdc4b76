//! Key/value persistence used for the pending queue, the failure archive and
//! the session token.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::RwLock;

use crate::StorageError;

/// Key holding the JSON array of pending mutating requests.
pub const PENDING_REQUESTS_KEY: &str = "pendingRequests";
/// Key holding the JSON array of archived failures.
pub const FAILED_REQUESTS_KEY: &str = "failedRequests";
/// Key holding the session credential token.
pub const TOKEN_KEY: &str = "jwtToken";

/// Opaque string key/value store.
///
/// The handler calls these methods synchronously from its async tasks while
/// holding the queue lock, once per queue mutation. Implementations must not
/// block on the async runtime and should finish quickly; a backend that talks
/// to a remote service needs its own write-behind buffer.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

impl<S: Storage + ?Sized> Storage for Arc<S> {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        (**self).remove(key)
    }
}

/// In-process storage. Contents are lost when the value is dropped.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries.write().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// Directory-backed storage: one `<key>.json` file per key.
///
/// Writes go through a temporary file followed by a rename so a crash never
/// leaves a half-written value behind.
///
/// I/O is blocking and runs on the calling tokio worker thread. Each write is
/// one small file, which is fine on a local disk; avoid network filesystems.
#[derive(Clone, Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Opens (and creates if missing) the storage directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StorageError::InvalidKey(key.to_owned()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path_for(key)?) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FileStorage, MemoryStorage, Storage};
    use crate::StorageError;

    fn exercise(storage: &dyn Storage) {
        assert_eq!(storage.get("pendingRequests").expect("get"), None);
        storage.set("pendingRequests", "[1]").expect("set");
        storage.set("pendingRequests", "[2]").expect("overwrite");
        assert_eq!(
            storage.get("pendingRequests").expect("get").as_deref(),
            Some("[2]")
        );
        storage.remove("pendingRequests").expect("remove");
        storage.remove("pendingRequests").expect("remove is idempotent");
        assert_eq!(storage.get("pendingRequests").expect("get"), None);
    }

    #[test]
    fn memory_storage_round_trip() {
        exercise(&MemoryStorage::new());
    }

    #[test]
    fn file_storage_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        exercise(&FileStorage::open(dir.path()).expect("open"));
    }

    #[test]
    fn file_storage_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        FileStorage::open(dir.path())
            .expect("open")
            .set("jwtToken", "abc")
            .expect("set");

        let reopened = FileStorage::open(dir.path()).expect("reopen");
        assert_eq!(reopened.get("jwtToken").expect("get").as_deref(), Some("abc"));
    }

    #[test]
    fn file_storage_rejects_path_like_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileStorage::open(dir.path()).expect("open");
        assert!(matches!(
            storage.set("../escape", "x"),
            Err(StorageError::InvalidKey(_))
        ));
    }
}
