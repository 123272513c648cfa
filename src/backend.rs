//! Optional persistent backends and the caching layer in front of them.
//!
//! A backend sees only opaque serialized items plus their versions; version
//! monotonicity across concurrent writers is the backend's concern (compare
//! the stored version inside whatever transaction primitive it has). The
//! [CachingStore] adds a TTL cache so hot reads avoid the backend entirely.

use crate::models::AllData;
use crate::store::{DataKind, DataStore, StoreError, StoreItem};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::warn;

/// One serialized flag, segment or tombstone as a backend stores it.
#[derive(Clone, Debug, PartialEq)]
pub struct SerializedItem {
    pub version: u64,
    pub json: String,
}

impl SerializedItem {
    fn from_item(item: &StoreItem) -> Self {
        SerializedItem {
            version: item.version(),
            json: item.to_json().to_string(),
        }
    }

    /// Deserialize, tolerating garbage: a payload that does not parse is
    /// reported as `None` so one bad row cannot poison unrelated flags.
    fn parse(&self, kind: DataKind, key: &str) -> Option<StoreItem> {
        let json = match serde_json::from_str(&self.json) {
            Ok(json) => json,
            Err(error) => {
                warn!(%key, %error, "discarding invalid serialized item");
                return None;
            }
        };
        match StoreItem::from_json(kind, json) {
            Ok(item) => Some(item),
            Err(error) => {
                warn!(%key, %error, "discarding schema-invalid item");
                None
            }
        }
    }
}

/// Contract for a persistent key-value backend (e.g. Redis).
///
/// `upsert` must only commit when the incoming version is higher than the
/// stored one, using optimistic concurrency against other writers; losing
/// such a race returns `Ok(false)` and is not an error.
pub trait PersistentStore: Send + Sync {
    fn init(
        &self,
        data: Vec<(DataKind, Vec<(String, SerializedItem)>)>,
    ) -> Result<(), StoreError>;

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<SerializedItem>, StoreError>;

    fn all(&self, kind: DataKind) -> Result<Vec<(String, SerializedItem)>, StoreError>;

    /// Returns whether the write took effect.
    fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: SerializedItem,
    ) -> Result<bool, StoreError>;

    fn initialized(&self) -> Result<bool, StoreError>;
}

impl<T: PersistentStore + ?Sized> PersistentStore for Box<T> {
    fn init(
        &self,
        data: Vec<(DataKind, Vec<(String, SerializedItem)>)>,
    ) -> Result<(), StoreError> {
        self.as_ref().init(data)
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<SerializedItem>, StoreError> {
        self.as_ref().get(kind, key)
    }

    fn all(&self, kind: DataKind) -> Result<Vec<(String, SerializedItem)>, StoreError> {
        self.as_ref().all(kind)
    }

    fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: SerializedItem,
    ) -> Result<bool, StoreError> {
        self.as_ref().upsert(kind, key, item)
    }

    fn initialized(&self) -> Result<bool, StoreError> {
        self.as_ref().initialized()
    }
}

#[derive(Clone, Debug)]
struct CacheEntry<T> {
    value: T,
    at: Instant,
}

impl<T> CacheEntry<T> {
    fn new(value: T) -> Self {
        CacheEntry {
            value,
            at: Instant::now(),
        }
    }

    fn fresh(&self, ttl: Duration) -> bool {
        self.at.elapsed() < ttl
    }
}

#[derive(Default)]
struct Cache {
    items: HashMap<(DataKind, String), CacheEntry<Option<StoreItem>>>,
    all: HashMap<DataKind, CacheEntry<HashMap<String, StoreItem>>>,
    /// Cached result of the backend's `initialized()` probe. Reading it
    /// takes the shared lock; writing or discarding it requires the
    /// exclusive lock, always.
    init_checked: Option<CacheEntry<bool>>,
    /// Latched true once initialization has been observed; never re-probed.
    initialized: bool,
}

/// A [DataStore] backed by a [PersistentStore], with a TTL cache in front.
///
/// Reads are served from cache while fresh and re-fetched once stale.
/// Writes go to the backend first; only a committed write updates the item
/// cache, and any cached all-kind snapshot is dropped either way.
pub struct CachingStore<B> {
    backend: B,
    cache: RwLock<Cache>,
    ttl: Duration,
}

impl<B: PersistentStore> CachingStore<B> {
    pub fn new(backend: B, ttl: Duration) -> Self {
        Self {
            backend,
            cache: RwLock::new(Cache::default()),
            ttl,
        }
    }

    fn read_cache(&self) -> std::sync::RwLockReadGuard<'_, Cache> {
        match self.cache.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_cache(&self) -> std::sync::RwLockWriteGuard<'_, Cache> {
        match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn fetch_item(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>, StoreError> {
        let serialized = self.backend.get(kind, key)?;
        let item = serialized.and_then(|s| s.parse(kind, key));
        let mut cache = self.write_cache();
        cache
            .items
            .insert((kind, key.to_string()), CacheEntry::new(item.clone()));
        Ok(item)
    }

    fn fetch_all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>, StoreError> {
        let mut items = HashMap::new();
        for (key, serialized) in self.backend.all(kind)? {
            // schema-invalid rows are skipped, not fatal
            if let Some(item) = serialized.parse(kind, &key) {
                if !item.is_deleted() {
                    items.insert(key, item);
                }
            }
        }
        let mut cache = self.write_cache();
        cache.all.insert(kind, CacheEntry::new(items.clone()));
        Ok(items)
    }
}

impl<B: PersistentStore> DataStore for CachingStore<B> {
    fn init(&self, data: AllData) -> Result<(), StoreError> {
        let AllData { flags, segments } = data;
        let serialize = |items: HashMap<String, StoreItem>| {
            items
                .iter()
                .map(|(key, item)| (key.clone(), SerializedItem::from_item(item)))
                .collect::<Vec<_>>()
        };

        let flags: HashMap<String, StoreItem> = flags
            .into_iter()
            .map(|(key, flag)| (key, StoreItem::from(flag)))
            .collect();
        let segments: HashMap<String, StoreItem> = segments
            .into_iter()
            .map(|(key, segment)| (key, StoreItem::from(segment)))
            .collect();

        self.backend.init(vec![
            (DataKind::Flag, serialize(flags.clone())),
            (DataKind::Segment, serialize(segments.clone())),
        ])?;

        let mut cache = self.write_cache();
        cache.items.clear();
        cache.all.clear();
        cache.all.insert(DataKind::Flag, CacheEntry::new(flags));
        cache
            .all
            .insert(DataKind::Segment, CacheEntry::new(segments));
        cache.init_checked = Some(CacheEntry::new(true));
        cache.initialized = true;
        Ok(())
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>, StoreError> {
        {
            let cache = self.read_cache();
            if let Some(entry) = cache.items.get(&(kind, key.to_string())) {
                if entry.fresh(self.ttl) {
                    return Ok(entry
                        .value
                        .clone()
                        .filter(|item| !item.is_deleted()));
                }
            }
        }
        Ok(self.fetch_item(kind, key)?.filter(|item| !item.is_deleted()))
    }

    fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>, StoreError> {
        {
            let cache = self.read_cache();
            if let Some(entry) = cache.all.get(&kind) {
                if entry.fresh(self.ttl) {
                    return Ok(entry.value.clone());
                }
            }
        }
        self.fetch_all(kind)
    }

    fn upsert(&self, kind: DataKind, item: StoreItem) -> Result<(), StoreError> {
        let key = item.key().to_string();
        let committed = self
            .backend
            .upsert(kind, &key, SerializedItem::from_item(&item))?;

        let mut cache = self.write_cache();
        if committed {
            cache
                .items
                .insert((kind, key), CacheEntry::new(Some(item)));
        } else {
            // another writer holds a newer version; forget what we had so
            // the next read observes theirs
            cache.items.remove(&(kind, key));
        }
        cache.all.remove(&kind);
        Ok(())
    }

    fn initialized(&self) -> bool {
        {
            let cache = self.read_cache();
            if cache.initialized {
                return true;
            }
            if let Some(entry) = &cache.init_checked {
                if entry.fresh(self.ttl) {
                    return entry.value;
                }
            }
        }

        let probed = match self.backend.initialized() {
            Ok(probed) => probed,
            Err(error) => {
                warn!(%error, "backend initialized probe failed");
                false
            }
        };

        // the sentinel is only ever replaced under the exclusive lock
        let mut cache = self.write_cache();
        cache.init_checked = Some(CacheEntry::new(probed));
        if probed {
            cache.initialized = true;
        }
        probed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FlagBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory [PersistentStore] that counts calls and can inject rows.
    #[derive(Default)]
    struct FakeBackend {
        rows: Mutex<HashMap<(DataKind, String), SerializedItem>>,
        initialized: Mutex<bool>,
        gets: AtomicUsize,
        init_probes: AtomicUsize,
    }

    impl FakeBackend {
        fn put_raw(&self, kind: DataKind, key: &str, version: u64, json: &str) {
            self.rows.lock().unwrap().insert(
                (kind, key.to_string()),
                SerializedItem {
                    version,
                    json: json.to_string(),
                },
            );
        }
    }

    impl PersistentStore for FakeBackend {
        fn init(
            &self,
            data: Vec<(DataKind, Vec<(String, SerializedItem)>)>,
        ) -> Result<(), StoreError> {
            let mut rows = self.rows.lock().unwrap();
            rows.clear();
            for (kind, items) in data {
                for (key, item) in items {
                    rows.insert((kind, key), item);
                }
            }
            *self.initialized.lock().unwrap() = true;
            Ok(())
        }

        fn get(
            &self,
            kind: DataKind,
            key: &str,
        ) -> Result<Option<SerializedItem>, StoreError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .rows
                .lock()
                .unwrap()
                .get(&(kind, key.to_string()))
                .cloned())
        }

        fn all(&self, kind: DataKind) -> Result<Vec<(String, SerializedItem)>, StoreError> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|((k, _), _)| *k == kind)
                .map(|((_, key), item)| (key.clone(), item.clone()))
                .collect())
        }

        fn upsert(
            &self,
            kind: DataKind,
            key: &str,
            item: SerializedItem,
        ) -> Result<bool, StoreError> {
            let mut rows = self.rows.lock().unwrap();
            let slot = (kind, key.to_string());
            if let Some(existing) = rows.get(&slot) {
                if existing.version >= item.version {
                    return Ok(false);
                }
            }
            rows.insert(slot, item);
            Ok(true)
        }

        fn initialized(&self) -> Result<bool, StoreError> {
            self.init_probes.fetch_add(1, Ordering::SeqCst);
            Ok(*self.initialized.lock().unwrap())
        }
    }

    fn flag_item(key: &str, version: u64) -> StoreItem {
        FlagBuilder::default()
            .with_key(key)
            .with_version(version)
            .into_item()
    }

    #[test]
    fn write_through_and_read_back() {
        let store = CachingStore::new(FakeBackend::default(), Duration::from_secs(30));
        store.init(AllData::default()).expect("init");

        store.upsert(DataKind::Flag, flag_item("a", 3)).expect("upsert");
        let item = store.get(DataKind::Flag, "a").expect("get").expect("item");
        assert_eq!(item.version(), 3);
        // served from the write-through cache, no backend read
        assert_eq!(store.backend.gets.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stale_entries_are_refetched() {
        let store = CachingStore::new(FakeBackend::default(), Duration::from_millis(0));
        store.init(AllData::default()).expect("init");
        store.upsert(DataKind::Flag, flag_item("a", 1)).expect("upsert");

        store.get(DataKind::Flag, "a").expect("get");
        store.get(DataKind::Flag, "a").expect("get");
        // ttl of zero means every read goes to the backend
        assert_eq!(store.backend.gets.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn losing_a_version_race_is_success_without_change() {
        let store = CachingStore::new(FakeBackend::default(), Duration::from_secs(30));
        store.init(AllData::default()).expect("init");

        store.upsert(DataKind::Flag, flag_item("a", 5)).expect("upsert");
        // a slower writer with an older version loses quietly
        store.upsert(DataKind::Flag, flag_item("a", 3)).expect("upsert");

        let item = store.get(DataKind::Flag, "a").expect("get").expect("item");
        assert_eq!(item.version(), 5);
    }

    #[test]
    fn invalid_serialized_item_reads_as_not_found() {
        let store = CachingStore::new(FakeBackend::default(), Duration::from_secs(30));
        store.init(AllData::default()).expect("init");
        store
            .backend
            .put_raw(DataKind::Flag, "junk", 1, "{not json");

        assert!(store.get(DataKind::Flag, "junk").expect("get").is_none());
    }

    #[test]
    fn invalid_serialized_item_is_skipped_by_all() {
        let store = CachingStore::new(FakeBackend::default(), Duration::from_secs(30));
        store.init(AllData::default()).expect("init");
        store.upsert(DataKind::Flag, flag_item("good", 1)).expect("upsert");
        store
            .backend
            .put_raw(DataKind::Flag, "junk", 1, "{not json");

        let all = store.all(DataKind::Flag).expect("all");
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("good"));
    }

    #[test]
    fn all_cache_invalidated_by_writes() {
        let store = CachingStore::new(FakeBackend::default(), Duration::from_secs(30));
        store.init(AllData::default()).expect("init");

        store.upsert(DataKind::Flag, flag_item("a", 1)).expect("upsert");
        assert_eq!(store.all(DataKind::Flag).expect("all").len(), 1);
        store.upsert(DataKind::Flag, flag_item("b", 1)).expect("upsert");
        assert_eq!(store.all(DataKind::Flag).expect("all").len(), 2);
    }

    #[test]
    fn tombstones_hide_items_through_the_cache() {
        let store = CachingStore::new(FakeBackend::default(), Duration::from_secs(30));
        store.init(AllData::default()).expect("init");

        store.upsert(DataKind::Flag, flag_item("a", 1)).expect("upsert");
        store.remove(DataKind::Flag, "a", 2).expect("remove");
        assert!(store.get(DataKind::Flag, "a").expect("get").is_none());
        assert!(store.all(DataKind::Flag).expect("all").is_empty());

        // stale resurrection blocked by the backend's version check
        store.upsert(DataKind::Flag, flag_item("a", 1)).expect("upsert");
        assert!(store.get(DataKind::Flag, "a").expect("get").is_none());
    }

    #[test]
    fn initialized_probe_is_cached_and_latched() {
        let store = CachingStore::new(FakeBackend::default(), Duration::from_secs(30));
        assert!(!store.initialized());
        assert!(!store.initialized());
        // second query inside the ttl was served from the sentinel
        assert_eq!(store.backend.init_probes.load(Ordering::SeqCst), 1);

        // another process initializes the backend behind our back
        *store.backend.initialized.lock().unwrap() = true;
        // still cached false until the sentinel expires; force expiry by
        // rebuilding with a zero ttl
        let store = CachingStore::new(FakeBackend::default(), Duration::from_millis(0));
        *store.backend.initialized.lock().unwrap() = true;
        assert!(store.initialized());
        let probes = store.backend.init_probes.load(Ordering::SeqCst);
        assert!(store.initialized());
        // latched: no further probes once true was observed
        assert_eq!(store.backend.init_probes.load(Ordering::SeqCst), probes);
    }
}
