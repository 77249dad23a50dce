//! On-disk content-addressed storage engine: a two-tier (fast in-memory +
//! full on-disk) cache with LRU eviction by byte budget and by item count,
//! snapshot persistence, and auto-save debouncing.

use std::collections::{HashMap, HashSet};
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{CacheServerError, CacheServerResult};
use crate::fingerprint::Fingerprint;
use crate::logging;
use crate::value::{CachedItemValue, Description};

const SNAPSHOT_FILE_NAME: &str = "cache.dat";
const SNAPSHOT_SIGNATURE: [u8; 5] = *b"cache";
const SNAPSHOT_VERSION: u32 = 1;

/// One stored artifact plus the access-order token used for LRU eviction.
/// `access_timestamp` is not a wall-clock time -- it's a monotonically
/// increasing counter token, restored verbatim on load so ordering survives
/// a restart.
#[derive(Debug, Clone)]
pub struct ServerCacheEntry {
    pub value: CachedItemValue,
    pub access_timestamp: u64,
}

#[derive(Serialize, Deserialize)]
struct SnapshotHeader {
    signature: [u8; 5],
    version: u32,
    items_count: u64,
}

#[derive(Serialize, Deserialize)]
struct SnapshotItem {
    key: Fingerprint,
    access_id: u64,
    blob_names: Vec<String>,
    description: Description,
    size: u64,
}

#[derive(Serialize, Deserialize)]
struct SnapshotBody {
    items: Vec<SnapshotItem>,
}

type StorageSizeCallback = Box<dyn FnMut(u64, u64) + Send>;

/// Two-tier content-addressed cache rooted at a folder on disk.
///
/// The *full* cache (`full`) is authoritative: every key that exists anywhere
/// in the store has an entry here, though its blob bytes may be unfetched.
/// The *fast* cache (`fast`) is a bounded set of keys guaranteed to alias a
/// fetched full-cache entry -- it never outlives the full cache entry it
/// points at (I2: `fast ⊆ full`).
pub struct CacheDb {
    folder: PathBuf,
    max_storage_size: u64,
    max_items_in_memory: usize,
    auto_save_timeout_ms: u64,
    occupied_size: u64,
    next_access_id: u64,
    last_save_time_ms: u64,
    full: HashMap<Fingerprint, ServerCacheEntry>,
    fast: HashSet<Fingerprint>,
    db_state_changed: AtomicBool,
    clock: Arc<dyn Clock>,
    on_storage_size_changed: Option<StorageSizeCallback>,
}

impl CacheDb {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            folder: PathBuf::new(),
            max_storage_size: 0,
            max_items_in_memory: 0,
            auto_save_timeout_ms: 0,
            occupied_size: 0,
            next_access_id: 0,
            last_save_time_ms: 0,
            full: HashMap::new(),
            fast: HashSet::new(),
            db_state_changed: AtomicBool::new(false),
            clock,
            on_storage_size_changed: None,
        }
    }

    pub fn set_storage_size_changed_callback(&mut self, callback: StorageSizeCallback) {
        self.on_storage_size_changed = Some(callback);
    }

    pub fn path(&self) -> &PathBuf {
        &self.folder
    }

    pub fn storage_size(&self) -> u64 {
        self.max_storage_size
    }

    pub fn occupied_size(&self) -> u64 {
        self.occupied_size
    }

    /// Remaining budget. The source asserts `storage > occupied` strictly;
    /// this returns 0 rather than panicking when the cache is exactly full.
    pub fn available_size(&self) -> u64 {
        self.max_storage_size.saturating_sub(self.occupied_size)
    }

    pub fn item_count(&self) -> usize {
        self.full.len()
    }

    pub fn fast_cache_len(&self) -> usize {
        self.fast.len()
    }

    fn entry_dir(&self, key: &Fingerprint) -> PathBuf {
        self.folder.join(key.entry_path())
    }

    /// Apply new settings, flushing/reloading on a folder change, evicting
    /// down to a shrunk byte or item budget, and persisting synchronously if
    /// the full cache was mutated in the process.
    pub fn update_settings(
        &mut self,
        folder: PathBuf,
        max_storage_size: u64,
        max_items_in_memory: usize,
        auto_save_timeout_ms: u64,
    ) -> CacheServerResult<()> {
        let folder_changed = folder != self.folder;
        let old_occupied = self.occupied_size;
        let old_max = self.max_storage_size;

        if folder_changed {
            self.flush_and_unload()?;
            self.folder = folder;
            self.load()?;
        }

        self.max_storage_size = max_storage_size;
        self.auto_save_timeout_ms = auto_save_timeout_ms;

        let mut full_cache_mutated = folder_changed;
        if self.occupied_size > self.max_storage_size {
            self.reduce_full_cache_to_size(self.max_storage_size);
            full_cache_mutated = true;
        }

        // If the new budget is larger, this is just reserved headroom: no
        // eviction. Shrinking removes the coldest `old - new` fast entries.
        if max_items_in_memory < self.max_items_in_memory {
            let remove_count = self.max_items_in_memory - max_items_in_memory;
            self.reduce_fast_cache_by_count(remove_count);
        }
        self.max_items_in_memory = max_items_in_memory;

        if old_occupied != self.occupied_size || old_max != self.max_storage_size {
            self.notify_size_changed();
        }

        if full_cache_mutated {
            self.save()?;
        }

        Ok(())
    }

    /// Fetch an entry, touching its LRU timestamp. Materializes from disk
    /// into the fast cache on a full-cache hit; evicts the entry entirely if
    /// its on-disk blobs are unreadable.
    pub fn get(&mut self, key: &Fingerprint) -> Option<&ServerCacheEntry> {
        if self.fast.contains(key) {
            self.db_state_changed.store(true, Ordering::Relaxed);
            self.touch(*key);
            return self.full.get(key);
        }

        if !self.full.contains_key(key) {
            return None;
        }

        let needs_fetch = !self.full.get(key).unwrap().value.is_fetched();
        if needs_fetch {
            let dir = self.entry_dir(key);
            let fetched = self
                .full
                .get_mut(key)
                .unwrap()
                .value
                .materialize_from(&dir)
                .is_ok();
            if !fetched {
                tracing::error!("cache entry {} unreadable on disk, evicting", key);
                self.remove_key_unconditionally(key);
                return None;
            }
        }

        self.db_state_changed.store(true, Ordering::Relaxed);
        self.touch(*key);
        self.insert_into_fast_cache(*key);
        self.full.get(key)
    }

    /// Insert or overwrite a value. A value larger than the storage budget is
    /// silently dropped (resource-policy rejection, not an error).
    pub fn insert(&mut self, key: Fingerprint, value: CachedItemValue) -> CacheServerResult<()> {
        if value.size() > self.max_storage_size {
            tracing::warn!(
                "dropping insert of {} ({} bytes exceeds {} byte budget)",
                key,
                value.size(),
                self.max_storage_size
            );
            return Ok(());
        }

        if self.full.contains_key(&key) {
            self.remove_key_unconditionally(&key);
        }

        let dir = self.entry_dir(&key);
        value.write_blobs_to(&dir)?;

        self.next_access_id += 1;
        let access_timestamp = self.next_access_id;
        self.occupied_size += value.size();
        self.full.insert(
            key,
            ServerCacheEntry {
                value,
                access_timestamp,
            },
        );
        self.insert_into_fast_cache(key);

        if self.occupied_size > self.max_storage_size {
            self.reduce_full_cache_to_size(self.max_storage_size);
        }

        self.db_state_changed.store(true, Ordering::Relaxed);
        self.notify_size_changed();
        Ok(())
    }

    /// Idempotent removal. Returns whether anything was actually removed.
    pub fn remove(&mut self, key: &Fingerprint) -> bool {
        let removed = self.remove_key_unconditionally(key);
        if removed {
            self.notify_size_changed();
        }
        removed
    }

    pub fn clear_storage(&mut self) {
        self.reduce_full_cache_to_size(0);
        self.notify_size_changed();
    }

    fn touch(&mut self, key: Fingerprint) {
        self.next_access_id += 1;
        let next = self.next_access_id;
        if let Some(entry) = self.full.get_mut(&key) {
            entry.access_timestamp = next;
        }
    }

    fn insert_into_fast_cache(&mut self, key: Fingerprint) {
        self.fast.insert(key);
        while self.fast.len() > self.max_items_in_memory {
            self.evict_one_from_fast_cache();
        }
    }

    fn evict_one_from_fast_cache(&mut self) {
        if let Some(key) = self.lru_key_in_fast() {
            self.fast.remove(&key);
            if let Some(entry) = self.full.get_mut(&key) {
                entry.value.unfetch();
            }
        }
    }

    fn reduce_fast_cache_by_count(&mut self, count: usize) {
        for _ in 0..count {
            if self.fast.is_empty() {
                break;
            }
            self.evict_one_from_fast_cache();
        }
    }

    fn reduce_full_cache_to_size(&mut self, target: u64) {
        while self.occupied_size > target {
            match self.lru_key_in_full() {
                Some(key) => {
                    self.remove_key_unconditionally(&key);
                }
                None => break,
            }
        }
    }

    fn lru_key_in_full(&self) -> Option<Fingerprint> {
        self.full
            .iter()
            .min_by_key(|(_, entry)| entry.access_timestamp)
            .map(|(key, _)| *key)
    }

    fn lru_key_in_fast(&self) -> Option<Fingerprint> {
        self.fast
            .iter()
            .filter_map(|key| self.full.get(key).map(|entry| (*key, entry.access_timestamp)))
            .min_by_key(|(_, ts)| *ts)
            .map(|(key, _)| key)
    }

    fn remove_key_unconditionally(&mut self, key: &Fingerprint) -> bool {
        self.fast.remove(key);
        match self.full.remove(key) {
            Some(entry) => {
                self.occupied_size = self.occupied_size.saturating_sub(entry.value.size());
                let dir = self.entry_dir(key);
                if dir.exists() {
                    if let Err(e) = std::fs::remove_dir_all(&dir) {
                        tracing::error!("failed to remove cache entry directory {:?}: {}", dir, e);
                    }
                }
                self.db_state_changed.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn notify_size_changed(&mut self) {
        let occupied = self.occupied_size;
        let max = self.max_storage_size;
        if let Some(callback) = self.on_storage_size_changed.as_mut() {
            callback(occupied, max);
        }
    }

    fn flush_and_unload(&mut self) -> CacheServerResult<()> {
        if !self.folder.as_os_str().is_empty() {
            self.save()?;
        }
        self.unload();
        Ok(())
    }

    fn unload(&mut self) {
        self.full.clear();
        self.fast.clear();
        self.occupied_size = 0;
    }

    /// Write the snapshot: a header followed by metadata-only archives for
    /// every full-cache entry. I/O failure is logged, never escalated -- the
    /// in-memory state remains authoritative.
    pub fn save(&mut self) -> CacheServerResult<()> {
        if self.folder.as_os_str().is_empty() {
            return Ok(());
        }
        if let Err(e) = std::fs::create_dir_all(&self.folder) {
            tracing::error!("failed to create cache folder {:?}: {}", self.folder, e);
            return Ok(());
        }

        let path = self.folder.join(SNAPSHOT_FILE_NAME);
        let result: CacheServerResult<()> = (|| {
            let file = std::fs::File::create(&path)?;
            let mut writer = BufWriter::new(file);
            let items: Vec<SnapshotItem> = self
                .full
                .iter()
                .map(|(key, entry)| SnapshotItem {
                    key: *key,
                    access_id: entry.access_timestamp,
                    blob_names: entry.value.blob_names().to_vec(),
                    description: entry.value.description().clone(),
                    size: entry.value.size(),
                })
                .collect();
            let header = SnapshotHeader {
                signature: SNAPSHOT_SIGNATURE,
                version: SNAPSHOT_VERSION,
                items_count: items.len() as u64,
            };
            bincode::serialize_into(&mut writer, &header)?;
            bincode::serialize_into(&mut writer, &SnapshotBody { items })?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.last_save_time_ms = self.clock.now_millis();
                self.db_state_changed.store(false, Ordering::Relaxed);
                logging::log_cache_event("save", &format!("{} items to {:?}", self.full.len(), path));
            }
            Err(e) => {
                tracing::error!("failed to save cache snapshot {:?}: {}", path, e);
            }
        }
        Ok(())
    }

    /// Load a snapshot into an empty cache. A missing file leaves the cache
    /// empty (first run). A bad signature or unsupported version is a fatal
    /// refusal: the cache stays empty and the failure is logged, never
    /// escalated.
    pub fn load(&mut self) -> CacheServerResult<()> {
        debug_assert!(
            self.full.is_empty() && self.fast.is_empty(),
            "CacheDb::load called on a non-empty cache"
        );
        if self.folder.as_os_str().is_empty() {
            return Ok(());
        }

        let path = self.folder.join(SNAPSHOT_FILE_NAME);
        if !path.exists() {
            return Ok(());
        }

        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!("failed to open cache snapshot {:?}: {}", path, e);
                return Ok(());
            }
        };
        let mut reader = BufReader::new(file);

        let header: SnapshotHeader = match bincode::deserialize_from(&mut reader) {
            Ok(h) => h,
            Err(e) => {
                tracing::error!("failed to read cache snapshot header: {}", e);
                return Ok(());
            }
        };
        if header.signature != SNAPSHOT_SIGNATURE {
            tracing::error!("cache snapshot {:?} has a bad signature; refusing to load", path);
            return Ok(());
        }
        if header.version != SNAPSHOT_VERSION {
            tracing::error!(
                "cache snapshot {:?} has version {} (expected {}); refusing to load",
                path,
                header.version,
                SNAPSHOT_VERSION
            );
            return Ok(());
        }

        let body: SnapshotBody = match bincode::deserialize_from(&mut reader) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("failed to read cache snapshot body: {}", e);
                return Ok(());
            }
        };

        let mut occupied = 0u64;
        let mut max_access_id = self.next_access_id;
        for item in body.items {
            let value = CachedItemValue::new_unfetched(item.blob_names, item.description, item.size);
            occupied += item.size;
            max_access_id = max_access_id.max(item.access_id);
            self.full.insert(
                item.key,
                ServerCacheEntry {
                    value,
                    access_timestamp: item.access_id,
                },
            );
        }
        self.occupied_size = occupied;
        self.next_access_id = max_access_id;
        logging::log_cache_event("load", &format!("{} items from {:?}", self.full.len(), path));
        self.notify_size_changed();
        Ok(())
    }

    /// Cooperative auto-save: runs `Save` if the cache has changed since the
    /// last save and the debounce window has elapsed.
    pub fn update(&mut self) -> CacheServerResult<()> {
        if self.auto_save_timeout_ms == 0 || !self.db_state_changed.load(Ordering::Relaxed) {
            return Ok(());
        }
        let now = self.clock.now_millis();
        if now.saturating_sub(self.last_save_time_ms) > self.auto_save_timeout_ms {
            self.save()?;
        }
        Ok(())
    }
}

impl From<CacheServerError> for std::io::Error {
    fn from(e: CacheServerError) -> Self {
        std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::value::BlobRecord;

    fn new_db() -> (CacheDb, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let mut db = CacheDb::new(clock);
        db.update_settings(dir.path().to_path_buf(), 1024 * 1024, 4, 0)
            .unwrap();
        (db, dir)
    }

    fn value_of_size(name: &str, n: usize) -> CachedItemValue {
        CachedItemValue::new(
            vec![BlobRecord {
                name: name.into(),
                data: vec![0xAB; n],
            }],
            Description::default(),
        )
        .unwrap()
    }

    #[test]
    fn round_trip_insert_get() {
        let (mut db, _dir) = new_db();
        let key = Fingerprint::of(b"A");
        let value = value_of_size("payload", 1024);
        let size = value.size();
        db.insert(key, value).unwrap();

        let got = db.get(&key).unwrap();
        assert_eq!(got.value.blobs().unwrap()[0].data, vec![0xAB; 1024]);
        assert_eq!(db.occupied_size(), size);
    }

    #[test]
    fn lru_byte_eviction_keeps_most_recently_touched() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let mut db = CacheDb::new(clock);
        db.update_settings(dir.path().to_path_buf(), 300, 100, 0).unwrap();

        let k1 = Fingerprint::of(b"K1");
        let k2 = Fingerprint::of(b"K2");
        let k3 = Fingerprint::of(b"K3");
        let k4 = Fingerprint::of(b"K4");

        db.insert(k1, value_of_size("p", 100)).unwrap();
        db.insert(k2, value_of_size("p", 100)).unwrap();
        db.insert(k3, value_of_size("p", 100)).unwrap();
        db.get(&k1); // touches k1 after k3
        db.insert(k4, value_of_size("p", 100)).unwrap();

        assert!(db.get(&k1).is_some());
        assert!(db.get(&k2).is_none(), "k2 should have been evicted as coldest");
        assert!(db.get(&k3).is_some());
        assert!(db.get(&k4).is_some());
        assert_eq!(db.occupied_size(), 300);
    }

    #[test]
    fn fast_cache_count_eviction_keeps_most_recent_n() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let mut db = CacheDb::new(clock);
        db.update_settings(dir.path().to_path_buf(), 1024 * 1024, 2, 0).unwrap();

        let k1 = Fingerprint::of(b"K1");
        let k2 = Fingerprint::of(b"K2");
        let k3 = Fingerprint::of(b"K3");
        db.insert(k1, value_of_size("p", 10)).unwrap();
        db.insert(k2, value_of_size("p", 10)).unwrap();
        db.insert(k3, value_of_size("p", 10)).unwrap();

        assert_eq!(db.fast_cache_len(), 2);
        // k1 still resident in the full cache, just not in the fast tier.
        assert_eq!(db.item_count(), 3);
        assert!(db.get(&k1).is_some());
    }

    #[test]
    fn snapshot_save_then_load_restores_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let mut db = CacheDb::new(clock.clone());
        db.update_settings(dir.path().to_path_buf(), 1024 * 1024, 4, 0).unwrap();

        let key = Fingerprint::of(b"A");
        db.insert(key, value_of_size("payload", 64)).unwrap();
        let access_before = db.get(&key).unwrap().access_timestamp;
        db.save().unwrap();
        drop(db);

        let mut reloaded = CacheDb::new(clock);
        reloaded.update_settings(dir.path().to_path_buf(), 1024 * 1024, 4, 0).unwrap();
        let entry = reloaded.get(&key).unwrap();
        assert_eq!(entry.access_timestamp, access_before);
        assert_eq!(entry.value.blobs().unwrap()[0].data, vec![0xAB; 64]);
    }

    #[test]
    fn insert_larger_than_budget_is_a_no_op() {
        let (mut db, _dir) = new_db();
        let key = Fingerprint::of(b"huge");
        db.insert(key, value_of_size("p", 2 * 1024 * 1024)).unwrap();
        assert_eq!(db.occupied_size(), 0);
        assert!(db.get(&key).is_none());
    }

    #[test]
    fn zero_budget_makes_every_insert_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let mut db = CacheDb::new(clock);
        db.update_settings(dir.path().to_path_buf(), 0, 4, 0).unwrap();

        db.insert(Fingerprint::of(b"x"), value_of_size("p", 1)).unwrap();
        assert_eq!(db.occupied_size(), 0);
    }

    #[test]
    fn remove_is_idempotent() {
        let (mut db, _dir) = new_db();
        let key = Fingerprint::of(b"A");
        db.insert(key, value_of_size("p", 10)).unwrap();
        assert!(db.remove(&key));
        assert!(!db.remove(&key));
        assert!(db.get(&key).is_none());
    }

    #[test]
    fn loading_wrong_version_leaves_cache_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SNAPSHOT_FILE_NAME);
        {
            let file = std::fs::File::create(&path).unwrap();
            let mut writer = BufWriter::new(file);
            let header = SnapshotHeader {
                signature: SNAPSHOT_SIGNATURE,
                version: 99,
                items_count: 0,
            };
            bincode::serialize_into(&mut writer, &header).unwrap();
            bincode::serialize_into(&mut writer, &SnapshotBody { items: vec![] }).unwrap();
        }

        let clock = Arc::new(ManualClock::new(0));
        let mut db = CacheDb::new(clock);
        db.update_settings(dir.path().to_path_buf(), 1024, 4, 0).unwrap();
        assert_eq!(db.item_count(), 0);
    }

    #[test]
    fn last_writer_wins_on_reinsert() {
        let (mut db, _dir) = new_db();
        let key = Fingerprint::of(b"A");
        db.insert(key, value_of_size("p", 10)).unwrap();
        db.insert(key, value_of_size("p", 20)).unwrap();
        assert_eq!(db.get(&key).unwrap().value.blobs().unwrap()[0].data.len(), 20);
        assert_eq!(db.occupied_size(), db.get(&key).unwrap().value.size());
    }
}
