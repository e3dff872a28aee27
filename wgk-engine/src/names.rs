//! Persistent friendly ↔ native interface name mapping
//!
//! On platforms where the OS picks interface names (macOS `utun`), the name a
//! user asked for has to be remembered next to the one the kernel handed out.
//! Entries are stored under `forward/<friendly>` and `reverse/<native>` in a
//! [`KeyStore`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use wgk_tun::SystemCommands;

use crate::error::{Error, Result};

/// Small string key/value store
pub trait KeyStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value, returning the previous one
    fn put(&self, key: &str, value: &str) -> Result<Option<String>>;

    /// Remove a value, returning the previous one
    fn remove(&self, key: &str) -> Result<Option<String>>;
}

/// Store kept only in memory
#[derive(Default)]
pub struct MemoryKeyStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().insert(key.to_string(), value.to_string()))
    }

    fn remove(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().remove(key))
    }
}

/// JSON document read and written through the privileged executor
///
/// Every operation re-reads the file so that several processes see each
/// other's changes; there is no cross-process lock.
pub struct FileKeyStore {
    commands: SystemCommands,
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileKeyStore {
    pub fn new(commands: SystemCommands, path: impl Into<PathBuf>) -> Self {
        Self {
            commands: commands.privileged(),
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read(&self) -> Result<BTreeMap<String, String>> {
        match self.commands.read_file(&self.path)? {
            Some(text) if !text.trim().is_empty() => serde_json::from_str(&text).map_err(|e| {
                Error::ConfigurationInvalid(format!(
                    "corrupt name store {}: {}",
                    self.path.display(),
                    e
                ))
            }),
            _ => Ok(BTreeMap::new()),
        }
    }

    fn write(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let text = serde_json::to_string_pretty(entries).map_err(|e| {
            Error::ConfigurationInvalid(format!("cannot encode name store: {}", e))
        })?;
        self.commands.write_file(&self.path, &text, Some(0o600))?;
        Ok(())
    }

    fn update<F>(&self, f: F) -> Result<Option<String>>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> Option<String>,
    {
        let _guard = self.lock.lock();
        let mut entries = self.read()?;
        let before = entries.clone();
        let previous = f(&mut entries);
        if entries != before {
            self.write(&entries)?;
        }
        Ok(previous)
    }
}

impl KeyStore for FileKeyStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock();
        Ok(self.read()?.remove(key))
    }

    fn put(&self, key: &str, value: &str) -> Result<Option<String>> {
        self.update(|e| e.insert(key.to_string(), value.to_string()))
    }

    fn remove(&self, key: &str) -> Result<Option<String>> {
        self.update(|e| e.remove(key))
    }
}

fn forward_key(friendly: &str) -> String {
    format!("forward/{}", friendly)
}

fn reverse_key(native: &str) -> String {
    format!("reverse/{}", native)
}

/// Bidirectional name mapping on top of a [`KeyStore`]
#[derive(Clone)]
pub struct NameMapping {
    store: Arc<dyn KeyStore>,
}

impl NameMapping {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self { store }
    }

    /// Mapping kept in memory only
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKeyStore::new()))
    }

    /// Native name recorded for a friendly name
    pub fn native_of(&self, friendly: &str) -> Result<Option<String>> {
        self.store.get(&forward_key(friendly))
    }

    /// Friendly name recorded for a native name
    ///
    /// A reverse entry is only trusted when the forward entry agrees.
    pub fn friendly_of(&self, native: &str) -> Result<Option<String>> {
        let Some(friendly) = self.store.get(&reverse_key(native))? else {
            return Ok(None);
        };
        match self.native_of(&friendly)? {
            Some(n) if n == native => Ok(Some(friendly)),
            _ => {
                log::debug!("Ignoring stale reverse mapping {} -> {}", native, friendly);
                Ok(None)
            }
        }
    }

    /// Record `friendly` ↔ `native`
    ///
    /// Writes the forward entry, then the reverse one. If the reverse write
    /// fails the forward entry is removed again and the error returned.
    pub fn commit(&self, friendly: &str, native: &str) -> Result<()> {
        self.store.put(&forward_key(friendly), native)?;
        if let Err(e) = self.store.put(&reverse_key(native), friendly) {
            if let Err(undo) = self.store.remove(&forward_key(friendly)) {
                log::warn!("Failed to undo name mapping for {}: {}", friendly, undo);
            }
            return Err(e);
        }
        log::debug!("Mapped {} -> {}", friendly, native);
        Ok(())
    }

    /// Forget the mapping of `friendly`; missing entries are fine
    pub fn unmap(&self, friendly: &str) -> Result<()> {
        if let Some(native) = self.store.remove(&forward_key(friendly))? {
            self.store.remove(&reverse_key(&native))?;
            log::debug!("Unmapped {} -> {}", friendly, native);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgk_tun::testing::ScriptedExecutor;

    /// Store whose writes to keys with a given prefix fail
    struct FailingStore {
        inner: MemoryKeyStore,
        fail_prefix: &'static str,
    }

    impl KeyStore for FailingStore {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key)
        }

        fn put(&self, key: &str, value: &str) -> Result<Option<String>> {
            if key.starts_with(self.fail_prefix) {
                return Err(Error::Elevation("store unavailable".into()));
            }
            self.inner.put(key, value)
        }

        fn remove(&self, key: &str) -> Result<Option<String>> {
            self.inner.remove(key)
        }
    }

    #[test]
    fn test_commit_and_lookup() {
        let names = NameMapping::in_memory();
        names.commit("office", "utun4").unwrap();
        assert_eq!(names.native_of("office").unwrap().as_deref(), Some("utun4"));
        assert_eq!(names.friendly_of("utun4").unwrap().as_deref(), Some("office"));
        assert_eq!(names.friendly_of("utun5").unwrap(), None);
    }

    #[test]
    fn test_unmap_is_idempotent() {
        let store = Arc::new(MemoryKeyStore::new());
        let names = NameMapping::new(store.clone());
        names.commit("office", "utun4").unwrap();
        names.unmap("office").unwrap();
        names.unmap("office").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_reverse_failure_removes_forward() {
        let store = Arc::new(FailingStore {
            inner: MemoryKeyStore::new(),
            fail_prefix: "reverse/",
        });
        let names = NameMapping::new(store.clone());
        assert!(names.commit("office", "utun4").is_err());
        assert_eq!(names.native_of("office").unwrap(), None);
        assert!(store.inner.is_empty());
    }

    #[test]
    fn test_stale_reverse_entry_not_trusted() {
        let store = Arc::new(MemoryKeyStore::new());
        store.put("reverse/utun4", "office").unwrap();
        store.put("forward/office", "utun7").unwrap();
        let names = NameMapping::new(store);
        assert_eq!(names.friendly_of("utun4").unwrap(), None);
    }

    #[test]
    fn test_file_store_persists_json() {
        let exec = Arc::new(ScriptedExecutor::new());
        let path = PathBuf::from("/var/lib/wgkeeper/names.json");
        let store = FileKeyStore::new(SystemCommands::new(exec.clone()), path.clone());

        assert_eq!(store.put("forward/office", "utun4").unwrap(), None);
        assert_eq!(
            store.put("forward/office", "utun5").unwrap().as_deref(),
            Some("utun4")
        );
        let saved: BTreeMap<String, String> =
            serde_json::from_str(&exec.file(&path).unwrap()).unwrap();
        assert_eq!(saved.get("forward/office").map(String::as_str), Some("utun5"));

        assert_eq!(store.remove("forward/office").unwrap().as_deref(), Some("utun5"));
        assert_eq!(store.get("forward/office").unwrap(), None);
    }

    #[test]
    fn test_file_store_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.json");
        let names = NameMapping::new(Arc::new(FileKeyStore::new(SystemCommands::local(), &path)));
        names.commit("home", "wg3").unwrap();

        let reopened = NameMapping::new(Arc::new(FileKeyStore::new(SystemCommands::local(), &path)));
        assert_eq!(reopened.native_of("home").unwrap().as_deref(), Some("wg3"));
    }
}
