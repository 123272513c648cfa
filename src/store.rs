//! Versioned flag/segment storage.
//!
//! The store is keyed by (kind, key) and enforces higher-version-wins on
//! every mutation. Deletions leave a tombstone carrying the deletion version
//! so a stale upsert arriving later cannot resurrect the item. Readers get
//! cheap reference-counted handles that stay valid after any concurrent
//! writer replaces the item.

use crate::models::{AllData, FeatureFlag, Segment};
use arc_swap::ArcSwap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The two item categories a store holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataKind {
    Flag,
    Segment,
}

impl DataKind {
    /// Namespace used when persisting this kind in a backend.
    pub fn namespace(&self) -> &'static str {
        match self {
            DataKind::Flag => "features",
            DataKind::Segment => "segments",
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),

    #[error("item of the wrong kind for {0:?}")]
    WrongKind(DataKind),
}

/// A live item or a tombstone.
///
/// Handles returned from a store are clones of this enum; the payload is
/// behind an [Arc], so cloning is cheap and the underlying document stays
/// stable for as long as any handle is held.
#[derive(Clone, Debug)]
pub enum StoreItem {
    Flag(Arc<FeatureFlag>),
    Segment(Arc<Segment>),
    Tombstone { key: String, version: u64 },
}

impl StoreItem {
    pub fn key(&self) -> &str {
        match self {
            StoreItem::Flag(flag) => &flag.key,
            StoreItem::Segment(segment) => &segment.key,
            StoreItem::Tombstone { key, .. } => key,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            StoreItem::Flag(flag) => flag.version,
            StoreItem::Segment(segment) => segment.version,
            StoreItem::Tombstone { version, .. } => *version,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, StoreItem::Tombstone { .. })
    }

    /// Parse one serialized item of the given kind. A `deleted: true` marker
    /// produces a tombstone regardless of the remaining fields.
    pub fn from_json(kind: DataKind, json: Value) -> Result<Self, serde_json::Error> {
        let deleted = json
            .get("deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if deleted {
            let key = json
                .get("key")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let version = json.get("version").and_then(Value::as_u64).unwrap_or(0);
            return Ok(StoreItem::Tombstone { key, version });
        }
        match kind {
            DataKind::Flag => serde_json::from_value(json).map(|f| StoreItem::Flag(Arc::new(f))),
            DataKind::Segment => {
                serde_json::from_value(json).map(|s| StoreItem::Segment(Arc::new(s)))
            }
        }
    }

    /// Serialize for a backend. Tombstones serialize with `deleted: true`.
    pub fn to_json(&self) -> Value {
        match self {
            StoreItem::Flag(flag) => serde_json::to_value(flag.as_ref())
                .unwrap_or(Value::Null),
            StoreItem::Segment(segment) => serde_json::to_value(segment.as_ref())
                .unwrap_or(Value::Null),
            StoreItem::Tombstone { key, version } => serde_json::json!({
                "key": key,
                "version": version,
                "deleted": true,
            }),
        }
    }

    fn kind(&self) -> Option<DataKind> {
        match self {
            StoreItem::Flag(_) => Some(DataKind::Flag),
            StoreItem::Segment(_) => Some(DataKind::Segment),
            StoreItem::Tombstone { .. } => None,
        }
    }
}

impl From<FeatureFlag> for StoreItem {
    fn from(flag: FeatureFlag) -> Self {
        StoreItem::Flag(Arc::new(flag))
    }
}

impl From<Segment> for StoreItem {
    fn from(segment: Segment) -> Self {
        StoreItem::Segment(Arc::new(segment))
    }
}

/// Storage contract shared by the in-memory store and the caching store.
pub trait DataStore: Send + Sync {
    /// Replace all kinds atomically and mark the store initialized.
    fn init(&self, data: AllData) -> Result<(), StoreError>;

    /// Fetch one live item. Tombstoned or missing items are `None`.
    fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>, StoreError>;

    /// Snapshot of all live items of a kind.
    fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>, StoreError>;

    /// Store an item iff its version is newer than what is held. An older or
    /// equal version is success without change.
    fn upsert(&self, kind: DataKind, item: StoreItem) -> Result<(), StoreError>;

    /// Record a deletion at the given version.
    fn remove(&self, kind: DataKind, key: &str, version: u64) -> Result<(), StoreError> {
        self.upsert(
            kind,
            StoreItem::Tombstone {
                key: key.to_string(),
                version,
            },
        )
    }

    /// True once `init` has completed at least once.
    fn initialized(&self) -> bool;
}

impl<T: DataStore + ?Sized> DataStore for Box<T> {
    fn init(&self, data: AllData) -> Result<(), StoreError> {
        self.as_ref().init(data)
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>, StoreError> {
        self.as_ref().get(kind, key)
    }

    fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>, StoreError> {
        self.as_ref().all(kind)
    }

    fn upsert(&self, kind: DataKind, item: StoreItem) -> Result<(), StoreError> {
        self.as_ref().upsert(kind, item)
    }

    fn remove(&self, kind: DataKind, key: &str, version: u64) -> Result<(), StoreError> {
        self.as_ref().remove(kind, key, version)
    }

    fn initialized(&self) -> bool {
        self.as_ref().initialized()
    }
}

impl<T: DataStore> DataStore for Arc<T> {
    fn init(&self, data: AllData) -> Result<(), StoreError> {
        self.as_ref().init(data)
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>, StoreError> {
        self.as_ref().get(kind, key)
    }

    fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>, StoreError> {
        self.as_ref().all(kind)
    }

    fn upsert(&self, kind: DataKind, item: StoreItem) -> Result<(), StoreError> {
        self.as_ref().upsert(kind, item)
    }

    fn remove(&self, kind: DataKind, key: &str, version: u64) -> Result<(), StoreError> {
        self.as_ref().remove(kind, key, version)
    }

    fn initialized(&self) -> bool {
        self.as_ref().initialized()
    }
}

#[derive(Clone, Debug, Default)]
struct MemoryState {
    flags: HashMap<String, StoreItem>,
    segments: HashMap<String, StoreItem>,
    initialized: bool,
}

impl MemoryState {
    fn kind(&self, kind: DataKind) -> &HashMap<String, StoreItem> {
        match kind {
            DataKind::Flag => &self.flags,
            DataKind::Segment => &self.segments,
        }
    }

    fn kind_mut(&mut self, kind: DataKind) -> &mut HashMap<String, StoreItem> {
        match kind {
            DataKind::Flag => &mut self.flags,
            DataKind::Segment => &mut self.segments,
        }
    }
}

/// The default store: everything in memory.
///
/// Readers load a whole-state snapshot without taking a lock; writers
/// serialize on a mutex, copy, mutate and publish. A handle obtained from a
/// snapshot keeps its document alive however many writes follow.
pub struct MemoryStore {
    state: ArcSwap<MemoryState>,
    write_lock: Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            state: ArcSwap::new(Arc::new(MemoryState::default())),
            write_lock: Mutex::new(()),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate<F: FnOnce(&mut MemoryState)>(&self, mutation: F) {
        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = self.state.load().as_ref().clone();
        mutation(&mut next);
        self.state.store(Arc::new(next));
    }
}

impl DataStore for MemoryStore {
    fn init(&self, data: AllData) -> Result<(), StoreError> {
        let AllData { flags, segments } = data;
        self.mutate(|state| {
            state.flags = flags
                .into_iter()
                .map(|(key, flag)| (key, StoreItem::from(flag)))
                .collect();
            state.segments = segments
                .into_iter()
                .map(|(key, segment)| (key, StoreItem::from(segment)))
                .collect();
            state.initialized = true;
        });
        Ok(())
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>, StoreError> {
        Ok(self
            .state
            .load()
            .kind(kind)
            .get(key)
            .filter(|item| !item.is_deleted())
            .cloned())
    }

    fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>, StoreError> {
        Ok(self
            .state
            .load()
            .kind(kind)
            .iter()
            .filter(|(_, item)| !item.is_deleted())
            .map(|(key, item)| (key.clone(), item.clone()))
            .collect())
    }

    fn upsert(&self, kind: DataKind, item: StoreItem) -> Result<(), StoreError> {
        if let Some(item_kind) = item.kind() {
            if item_kind != kind {
                return Err(StoreError::WrongKind(kind));
            }
        }
        self.mutate(|state| {
            let items = state.kind_mut(kind);
            let stale = items
                .get(item.key())
                .map_or(false, |existing| existing.version() >= item.version());
            if !stale {
                items.insert(item.key().to_string(), item);
            }
        });
        Ok(())
    }

    fn initialized(&self) -> bool {
        self.state.load().initialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FlagBuilder;

    fn versioned(key: &str, version: u64) -> StoreItem {
        FlagBuilder::default()
            .with_key(key)
            .with_version(version)
            .into_item()
    }

    fn init_empty(store: &MemoryStore) {
        store.init(AllData::default()).expect("init");
    }

    #[test]
    fn init_marks_initialized() {
        let store = MemoryStore::new();
        assert!(!store.initialized());
        init_empty(&store);
        assert!(store.initialized());
    }

    #[test]
    fn higher_version_wins() {
        let store = MemoryStore::new();
        init_empty(&store);

        store.upsert(DataKind::Flag, versioned("x", 5)).expect("upsert");
        store.upsert(DataKind::Flag, versioned("x", 3)).expect("upsert");

        let item = store
            .get(DataKind::Flag, "x")
            .expect("get")
            .expect("item should exist");
        assert_eq!(item.version(), 5);
    }

    #[test]
    fn equal_version_does_not_replace() {
        let store = MemoryStore::new();
        init_empty(&store);

        store.upsert(DataKind::Flag, versioned("x", 5)).expect("upsert");
        store.upsert(DataKind::Flag, versioned("x", 5)).expect("upsert");
        let item = store.get(DataKind::Flag, "x").expect("get").expect("item");
        assert_eq!(item.version(), 5);
    }

    #[test]
    fn tombstone_hides_item_and_blocks_stale_resurrection() {
        let store = MemoryStore::new();
        init_empty(&store);

        store.upsert(DataKind::Flag, versioned("x", 5)).expect("upsert");
        store.remove(DataKind::Flag, "x", 10).expect("remove");
        assert!(store.get(DataKind::Flag, "x").expect("get").is_none());

        // stale write after the delete must not revive it
        store.upsert(DataKind::Flag, versioned("x", 7)).expect("upsert");
        assert!(store.get(DataKind::Flag, "x").expect("get").is_none());

        // a genuinely newer write does
        store.upsert(DataKind::Flag, versioned("x", 11)).expect("upsert");
        assert_eq!(
            store
                .get(DataKind::Flag, "x")
                .expect("get")
                .expect("item")
                .version(),
            11
        );
    }

    #[test]
    fn delete_of_unknown_key_is_recorded() {
        let store = MemoryStore::new();
        init_empty(&store);

        store.remove(DataKind::Flag, "abc", 123).expect("remove");
        assert!(store.get(DataKind::Flag, "abc").expect("get").is_none());
        store.upsert(DataKind::Flag, versioned("abc", 100)).expect("upsert");
        assert!(store.get(DataKind::Flag, "abc").expect("get").is_none());
    }

    #[test]
    fn all_excludes_tombstones() {
        let store = MemoryStore::new();
        init_empty(&store);

        store.upsert(DataKind::Flag, versioned("a", 1)).expect("upsert");
        store.upsert(DataKind::Flag, versioned("b", 1)).expect("upsert");
        store.remove(DataKind::Flag, "a", 2).expect("remove");

        let all = store.all(DataKind::Flag).expect("all");
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("b"));
    }

    #[test]
    fn kinds_are_disjoint() {
        let store = MemoryStore::new();
        init_empty(&store);

        store.upsert(DataKind::Flag, versioned("x", 1)).expect("upsert");
        assert!(store.get(DataKind::Segment, "x").expect("get").is_none());
        assert!(matches!(
            store.upsert(DataKind::Segment, versioned("x", 1)),
            Err(StoreError::WrongKind(DataKind::Segment))
        ));
    }

    #[test]
    fn concurrent_upserts_keep_the_highest_version() {
        let store = Arc::new(MemoryStore::new());
        store.init(AllData::default()).expect("init");

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for version in 1..=100 {
                        store
                            .upsert(DataKind::Flag, versioned("x", version))
                            .expect("upsert");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }

        let item = store.get(DataKind::Flag, "x").expect("get").expect("item");
        assert_eq!(item.version(), 100);
    }

    #[test]
    fn handle_survives_replacement() {
        let store = MemoryStore::new();
        init_empty(&store);

        store.upsert(DataKind::Flag, versioned("x", 1)).expect("upsert");
        let handle = store.get(DataKind::Flag, "x").expect("get").expect("item");
        store.upsert(DataKind::Flag, versioned("x", 2)).expect("upsert");
        // the old handle still reads the old document
        assert_eq!(handle.version(), 1);
    }

    #[test]
    fn init_replaces_everything() {
        let store = MemoryStore::new();
        init_empty(&store);
        store.upsert(DataKind::Flag, versioned("old", 9)).expect("upsert");

        let mut data = AllData::default();
        data.flags.insert(
            "new".to_string(),
            FlagBuilder::default().with_key("new").into_inner(),
        );
        store.init(data).expect("init");

        assert!(store.get(DataKind::Flag, "old").expect("get").is_none());
        assert!(store.get(DataKind::Flag, "new").expect("get").is_some());
    }
}
