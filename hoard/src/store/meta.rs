//! Per-path metadata storage.
//!
//! Each target keeps one small string map per cached URL path, persisted as a
//! JSON file named by the URL-safe base64 of the path. A hot in-memory slot
//! per path carries the map, its own RW lock and the last-update timestamp;
//! the store-wide lock makes the GC sweep the only writer that may evict
//! slots.

use crate::util::clock::{Clock, SystemClock};
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use data_encoding::BASE64URL;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

struct Slot {
    data: HashMap<String, String>,
    update: DateTime<Utc>,
}

/// Map from URL child paths to small string records, one JSON file per path.
pub struct MetaStore {
    root: PathBuf,
    slots: DashMap<String, Arc<RwLock<Slot>>>,
    /// Held shared by every normal operation and exclusively by the GC sweep,
    /// so eviction never races a reader or writer of a slot.
    gc_lock: RwLock<()>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl MetaStore {
    /// Opens (and creates, if necessary) a meta store at `root`.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        Self::new_with_clock(root, Arc::new(SystemClock))
    }

    #[cfg(test)]
    pub(crate) fn with_clock(
        root: impl Into<PathBuf>,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> io::Result<Self> {
        Self::new_with_clock(root, clock)
    }

    fn new_with_clock(
        root: impl Into<PathBuf>,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(MetaStore {
            root,
            slots: DashMap::new(),
            gc_lock: RwLock::new(()),
            clock,
        })
    }

    fn file_path(&self, path: &str) -> PathBuf {
        self.root.join(BASE64URL.encode(path.as_bytes()))
    }

    /// Loads the slot for `path`, reading the backing file on first access.
    ///
    /// With `create` set, a missing entry is materialized in memory (the file
    /// appears once a durable [MetaStore::put] runs); without it, `Ok(None)`
    /// is returned.
    fn load_slot(&self, path: &str, create: bool) -> io::Result<Option<Arc<RwLock<Slot>>>> {
        if let Some(slot) = self.slots.get(path) {
            return Ok(Some(slot.value().clone()));
        }
        match self.slots.entry(path.to_owned()) {
            Entry::Occupied(entry) => Ok(Some(entry.get().clone())),
            Entry::Vacant(entry) => {
                let file_path = self.file_path(path);
                let slot = match fs::read(&file_path) {
                    Ok(bytes) => {
                        let data = serde_json::from_slice(&bytes).map_err(|err| {
                            io::Error::new(ErrorKind::InvalidData, format!("{err}"))
                        })?;
                        let update = match fs::metadata(&file_path) {
                            Ok(stat) => stat
                                .modified()
                                .map(DateTime::from)
                                .unwrap_or_else(|_| self.clock.now()),
                            Err(_) => self.clock.now(),
                        };
                        Slot { data, update }
                    }
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        if !create {
                            return Ok(None);
                        }
                        Slot {
                            data: HashMap::new(),
                            update: self.clock.now(),
                        }
                    }
                    Err(err) => return Err(err),
                };
                let slot = Arc::new(RwLock::new(slot));
                entry.insert(slot.clone());
                Ok(Some(slot))
            }
        }
    }

    /// Returns a copy of the whole record for `path`.
    pub fn get_meta(&self, path: &str) -> io::Result<HashMap<String, String>> {
        let _gc = self.gc_lock.read().unwrap();
        let slot = self.load_slot(path, false)?.ok_or(ErrorKind::NotFound)?;
        let slot = slot.read().unwrap();
        Ok(slot.data.clone())
    }

    /// Returns the value stored under `key` for `path`, if any.
    pub fn get(&self, path: &str, key: &str) -> io::Result<Option<String>> {
        let _gc = self.gc_lock.read().unwrap();
        let slot = self.load_slot(path, false)?.ok_or(ErrorKind::NotFound)?;
        let slot = slot.read().unwrap();
        Ok(slot.data.get(key).cloned())
    }

    /// Returns when the record for `path` was last updated, from the hot slot
    /// if present, from the file's modification time otherwise.
    pub fn get_last_update(&self, path: &str) -> io::Result<DateTime<Utc>> {
        let _gc = self.gc_lock.read().unwrap();
        let slot = self.load_slot(path, false)?.ok_or(ErrorKind::NotFound)?;
        let slot = slot.read().unwrap();
        Ok(slot.update)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.slots.contains_key(path) || self.file_path(path).is_file()
    }

    /// Merges `patch` into the record for `path` and stamps it as updated
    /// now. An empty patch is a pure "touch".
    ///
    /// With `durable` set the record is written through to its file; the
    /// write is skipped if the sweep evicted the slot in the meantime.
    pub fn put(&self, path: &str, patch: &[(&str, &str)], durable: bool) -> io::Result<()> {
        let _gc = self.gc_lock.read().unwrap();
        let slot = self
            .load_slot(path, true)?
            .expect("load_slot with create always yields a slot");
        let mut slot = slot.write().unwrap();
        for (key, value) in patch {
            slot.data.insert((*key).to_owned(), (*value).to_owned());
        }
        slot.update = self.clock.now();
        if durable && self.slots.contains_key(path) {
            let data = serde_json::to_vec(&slot.data)?;
            fs::write(self.file_path(path), data)?;
        }
        Ok(())
    }

    /// Sweeps records whose age exceeds their TTL and returns the removed
    /// records keyed by path, so the caller can drop dependent blob pointers.
    ///
    /// `ttl_of` maps a path to its TTL; `None` exempts the path. The sweep
    /// runs in two phases: the directory walk happens without the store-wide
    /// write lock, only the removal of the collected candidates stops the
    /// world, and each candidate's age is re-checked against its hot slot
    /// first since the file modification time may lag behind.
    pub fn gc(
        &self,
        ttl_of: impl Fn(&str) -> Option<TimeDelta>,
    ) -> io::Result<HashMap<String, HashMap<String, String>>> {
        let begin = self.clock.now();
        let mut candidates = Vec::new();
        for entry in self.root.read_dir()? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Ok(path) = BASE64URL
                .decode(name.as_bytes())
                .map_err(|_| ())
                .and_then(|raw| String::from_utf8(raw).map_err(|_| ()))
            else {
                debug!(file = %name, "skipping meta file with undecodable name");
                continue;
            };
            let Some(ttl) = ttl_of(&path) else {
                continue;
            };
            let update = match self.slots.get(&path) {
                Some(slot) => slot.read().unwrap().update,
                None => match entry.metadata().and_then(|stat| stat.modified()) {
                    Ok(modified) => DateTime::from(modified),
                    Err(err) => {
                        warn!(path = %path, error = %err, "cannot stat meta file, skipping");
                        continue;
                    }
                },
            };
            if begin - update > ttl {
                candidates.push((path, ttl));
            }
        }

        let mut removed = HashMap::new();
        if candidates.is_empty() {
            return Ok(removed);
        }
        let _gc = self.gc_lock.write().unwrap();
        for (path, ttl) in candidates {
            let data = match self.load_slot(&path, false) {
                Ok(Some(slot)) => {
                    let slot = slot.read().unwrap();
                    if self.clock.now() - slot.update <= ttl {
                        // Touched since phase one; keep it.
                        continue;
                    }
                    Some(slot.data.clone())
                }
                Ok(None) => None,
                Err(err) => {
                    warn!(path = %path, error = %err, "unreadable meta record, evicting");
                    None
                }
            };
            match fs::remove_file(self.file_path(&path)) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path, error = %err, "failed to remove meta file");
                    continue;
                }
            }
            self.slots.remove(&path);
            if let Some(data) = data {
                removed.insert(path, data);
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    struct MetaFixture {
        meta: MetaStore,
        _tempdir: TempDir,
    }

    impl MetaFixture {
        fn new() -> Self {
            let tempdir = tempdir().unwrap();
            MetaFixture {
                meta: MetaStore::open(tempdir.path()).unwrap(),
                _tempdir: tempdir,
            }
        }
    }

    #[test]
    fn test_get_on_missing_path_returns_not_found() {
        let fixture = MetaFixture::new();
        assert_eq!(
            fixture.meta.get("missing", "key").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert!(!fixture.meta.exists("missing"));
    }

    #[test]
    fn test_put_and_get_roundtrip() {
        let fixture = MetaFixture::new();
        fixture
            .meta
            .put("any", &[("key", "value")], false)
            .unwrap();
        assert_eq!(
            fixture.meta.get("any", "key").unwrap(),
            Some("value".to_string())
        );
        assert_eq!(fixture.meta.get("any", "other").unwrap(), None);
        assert!(fixture.meta.exists("any"));
    }

    #[test]
    fn test_durable_put_writes_base64_named_file() {
        let fixture = MetaFixture::new();
        fixture.meta.put("any", &[("key", "value")], true).unwrap();
        let file = fixture
            .meta
            .root
            .join(BASE64URL.encode("any".as_bytes()));
        assert!(file.is_file());

        let parsed: HashMap<String, String> =
            serde_json::from_slice(&fs::read(file).unwrap()).unwrap();
        assert_eq!(parsed.get("key").map(String::as_str), Some("value"));
    }

    #[test]
    fn test_non_durable_put_stays_in_memory() {
        let fixture = MetaFixture::new();
        fixture
            .meta
            .put("any", &[("key", "value")], false)
            .unwrap();
        assert_eq!(fixture.meta.root.read_dir().unwrap().count(), 0);
    }

    #[test]
    fn test_patch_merges_into_existing_record() {
        let fixture = MetaFixture::new();
        fixture
            .meta
            .put("any", &[("a", "1"), ("b", "2")], true)
            .unwrap();
        fixture.meta.put("any", &[("b", "3")], true).unwrap();
        let record = fixture.meta.get_meta("any").unwrap();
        assert_eq!(record.get("a").map(String::as_str), Some("1"));
        assert_eq!(record.get("b").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_record_survives_slot_eviction() {
        let fixture = MetaFixture::new();
        fixture.meta.put("any", &[("key", "value")], true).unwrap();
        fixture.meta.slots.clear();
        assert_eq!(
            fixture.meta.get("any", "key").unwrap(),
            Some("value".to_string())
        );
    }

    #[test]
    fn test_touch_refreshes_last_update() {
        let fixture = MetaFixture::new();
        fixture.meta.put("any", &[("key", "value")], true).unwrap();
        let first = fixture.meta.get_last_update("any").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        fixture.meta.put("any", &[], false).unwrap();
        let second = fixture.meta.get_last_update("any").unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_gc_removes_expired_records_and_returns_their_data() {
        let fixture = MetaFixture::new();
        fixture.meta.put("any", &[("key", "value")], true).unwrap();

        let removed = fixture.meta.gc(|_| Some(TimeDelta::zero())).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(
            removed.get("any").and_then(|data| data.get("key")),
            Some(&"value".to_string())
        );
        assert!(!fixture.meta.exists("any"));
        assert_eq!(fixture.meta.root.read_dir().unwrap().count(), 0);
    }

    #[test]
    fn test_gc_spares_records_within_ttl() {
        let fixture = MetaFixture::new();
        fixture.meta.put("any", &[("key", "value")], true).unwrap();
        let removed = fixture.meta.gc(|_| Some(TimeDelta::hours(1))).unwrap();
        assert!(removed.is_empty());
        assert!(fixture.meta.exists("any"));
    }

    #[test]
    fn test_gc_exempts_paths_without_ttl() {
        let fixture = MetaFixture::new();
        fixture.meta.put("keep", &[("key", "value")], true).unwrap();
        fixture.meta.put("drop", &[("key", "value")], true).unwrap();
        let removed = fixture
            .meta
            .gc(|path| {
                if path == "drop" {
                    Some(TimeDelta::zero())
                } else {
                    None
                }
            })
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert!(removed.contains_key("drop"));
        assert!(fixture.meta.exists("keep"));
    }

    #[test]
    fn test_gc_uses_file_mtime_when_slot_is_cold() {
        let fixture = MetaFixture::new();
        fixture.meta.put("any", &[("key", "value")], true).unwrap();
        fixture.meta.slots.clear();
        let removed = fixture.meta.gc(|_| Some(TimeDelta::zero())).unwrap();
        assert_eq!(removed.len(), 1);
    }
}
