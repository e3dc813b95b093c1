//! In-memory cluster state fed by the watch loops.
//!
//! Three collections are kept: service imports, endpoint records and
//! namespaces. Each is a [`Store`] behind its own lock, indexed by
//! `service.namespace` (or namespace name). Every effective change advances a
//! shared [`ModifiedClock`] that doubles as the SOA serial.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

use crate::error::DnsError;
use crate::metrics;
use crate::object::{EndpointRecord, NamespaceRecord, ServiceImportRecord};

/// Capability the resolver needs from a cluster state backend.
#[async_trait]
pub trait ClusterCache: Send + Sync {
    /// All cached service imports.
    fn service_list(&self) -> Vec<Arc<ServiceImportRecord>>;

    /// Service imports indexed under `service.namespace`.
    fn svc_index(&self, key: &str) -> Vec<Arc<ServiceImportRecord>>;

    /// All cached endpoint records.
    fn endpoints_list(&self) -> Vec<Arc<EndpointRecord>>;

    /// Endpoint records indexed under `service.namespace`.
    fn ep_index(&self, key: &str) -> Vec<Arc<EndpointRecord>>;

    /// Namespace by name, `None` if it is not exposed.
    fn namespace_by_name(&self, name: &str) -> Option<Arc<NamespaceRecord>>;

    /// True once every enabled collection finished its initial listing.
    fn has_synced(&self) -> bool;

    /// Unix timestamp of the most recent effective change.
    fn modified(&self) -> i64;

    /// Keep the cache up to date until [`ClusterCache::stop`] is called.
    async fn run(&self) -> Result<(), DnsError>;

    /// Stop [`ClusterCache::run`]. Only the first call succeeds.
    fn stop(&self) -> Result<(), DnsError>;

    /// Publish state gauges.
    fn emit_metrics(&self) {
        metrics::record_serial(self.modified() as u32);
    }
}

/// SOA serial derived from the cache modification clock.
#[derive(Clone)]
pub struct SerialTracker {
    cache: Arc<dyn ClusterCache>,
}

impl SerialTracker {
    /// Create a tracker over the given cache.
    pub fn new(cache: Arc<dyn ClusterCache>) -> Self {
        Self { cache }
    }

    /// Current serial: the modification clock truncated to 32 bits.
    pub fn serial(&self) -> u32 {
        self.cache.modified() as u32
    }
}

/// Monotonic change clock in unix seconds.
///
/// Each advance moves to `max(now, previous + 1)`, so two changes inside the
/// same second still yield distinct values.
#[derive(Debug, Default)]
pub struct ModifiedClock(AtomicI64);

impl ModifiedClock {
    /// Current value, zero before the first change.
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    /// Advance to the current wall clock time.
    pub fn bump(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        self.advance_to(now)
    }

    /// Advance to `max(now, previous + 1)` and return the new value.
    pub fn advance_to(&self, now: i64) -> i64 {
        let next = |prev: i64| now.max(prev.saturating_add(1));
        match self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| Some(next(prev)))
        {
            Ok(prev) | Err(prev) => next(prev),
        }
    }
}

/// Outcome of applying a watch event to a [`Store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// New object key.
    Added,
    /// Existing object replaced by one that resolves differently.
    Updated,
    /// Existing object replaced by an equivalent one.
    Unchanged,
    /// Same resource version as the stored object, ignored.
    Replayed,
    /// Object removed.
    Deleted,
    /// Delete for an object that was not stored.
    Absent,
}

impl Change {
    /// Whether the change advances the modification clock.
    pub fn is_effective(self) -> bool {
        matches!(self, Change::Added | Change::Updated | Change::Deleted)
    }
}

/// An object kept in a [`Store`].
pub trait CacheObject: Clone + Send + Sync + 'static {
    /// Collection name for logs and metrics.
    const COLLECTION: &'static str;

    /// Unique key of the object within its collection.
    fn object_key(&self) -> String;

    /// Key the object is found under by lookups.
    fn index_key(&self) -> String;

    /// Resource version of the source object.
    fn resource_version(&self) -> &str;

    /// Whether replacing `old` by `self` changes what queries resolve to.
    fn differs_from(&self, old: &Self) -> bool;

    /// The slot holding this collection inside a [`ClusterState`].
    fn slot(state: &ClusterState) -> &Slot<Self>;
}

impl CacheObject for ServiceImportRecord {
    const COLLECTION: &'static str = "service_imports";

    fn object_key(&self) -> String {
        ServiceImportRecord::object_key(self)
    }

    fn index_key(&self) -> String {
        self.index.clone()
    }

    fn resource_version(&self) -> &str {
        &self.resource_version
    }

    fn differs_from(&self, _old: &Self) -> bool {
        true
    }

    fn slot(state: &ClusterState) -> &Slot<Self> {
        &state.inner.services
    }
}

impl CacheObject for EndpointRecord {
    const COLLECTION: &'static str = "endpoints";

    fn object_key(&self) -> String {
        EndpointRecord::object_key(self)
    }

    fn index_key(&self) -> String {
        self.index.clone()
    }

    fn resource_version(&self) -> &str {
        &self.resource_version
    }

    fn differs_from(&self, old: &Self) -> bool {
        !self.equivalent(old)
    }

    fn slot(state: &ClusterState) -> &Slot<Self> {
        &state.inner.endpoints
    }
}

impl CacheObject for NamespaceRecord {
    const COLLECTION: &'static str = "namespaces";

    fn object_key(&self) -> String {
        self.name.clone()
    }

    fn index_key(&self) -> String {
        self.name.clone()
    }

    fn resource_version(&self) -> &str {
        &self.resource_version
    }

    // A namespace carries nothing but its name.
    fn differs_from(&self, _old: &Self) -> bool {
        false
    }

    fn slot(state: &ClusterState) -> &Slot<Self> {
        &state.inner.namespaces
    }
}

/// Objects of one collection plus a secondary index on [`CacheObject::index_key`].
///
/// Several objects may share an index key, they are all kept.
#[derive(Debug)]
pub struct Store<T> {
    objects: HashMap<String, Arc<T>>,
    index: HashMap<String, BTreeSet<String>>,
}

impl<T> Default for Store<T> {
    fn default() -> Self {
        Self {
            objects: HashMap::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: CacheObject> Store<T> {
    /// Insert or replace an object.
    pub fn apply(&mut self, obj: T) -> Change {
        let key = obj.object_key();

        let change = match self.objects.get(&key) {
            None => Change::Added,
            Some(old) => {
                if !obj.resource_version().is_empty()
                    && old.resource_version() == obj.resource_version()
                {
                    return Change::Replayed;
                }
                if obj.differs_from(old) {
                    Change::Updated
                } else {
                    Change::Unchanged
                }
            }
        };

        if let Some(old) = self.objects.get(&key) {
            let old_index = old.index_key();
            if old_index != obj.index_key() {
                self.unindex(&old_index, &key);
            }
        }

        self.index
            .entry(obj.index_key())
            .or_default()
            .insert(key.clone());
        self.objects.insert(key, Arc::new(obj));
        change
    }

    /// Remove the object with the same key as `obj`.
    pub fn delete(&mut self, obj: &T) -> Change {
        self.remove_key(&obj.object_key())
    }

    /// Swap the whole collection for `objs`, as after a relist.
    ///
    /// Returns the per-object changes: stored keys missing from `objs` are
    /// deleted, the rest go through [`Store::apply`].
    pub fn replace_all(&mut self, objs: Vec<T>) -> Vec<Change> {
        let incoming: BTreeSet<String> = objs.iter().map(|o| o.object_key()).collect();
        let stale: Vec<String> = self
            .objects
            .keys()
            .filter(|k| !incoming.contains(*k))
            .cloned()
            .collect();

        let mut changes: Vec<Change> = stale.iter().map(|k| self.remove_key(k)).collect();
        changes.extend(objs.into_iter().map(|obj| self.apply(obj)));
        changes
    }

    /// Object by its object key.
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.objects.get(key).cloned()
    }

    /// Objects stored under an index key.
    pub fn by_index(&self, key: &str) -> Vec<Arc<T>> {
        self.index
            .get(key)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| self.objects.get(k).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All objects.
    pub fn list(&self) -> Vec<Arc<T>> {
        self.objects.values().cloned().collect()
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True when the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn remove_key(&mut self, key: &str) -> Change {
        match self.objects.remove(key) {
            Some(old) => {
                self.unindex(&old.index_key(), key);
                Change::Deleted
            }
            None => Change::Absent,
        }
    }

    fn unindex(&mut self, index_key: &str, key: &str) {
        if let Some(keys) = self.index.get_mut(index_key) {
            keys.remove(key);
            if keys.is_empty() {
                self.index.remove(index_key);
            }
        }
    }
}

/// One collection: its store and its initial-sync flag.
#[derive(Debug)]
pub struct Slot<T> {
    store: RwLock<Store<T>>,
    synced: AtomicBool,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            store: RwLock::new(Store::default()),
            synced: AtomicBool::new(false),
        }
    }
}

/// Thread-safe cluster state shared by the watch loops and the resolver.
#[derive(Debug, Clone)]
pub struct ClusterState {
    inner: Arc<ClusterStateInner>,
}

#[derive(Debug)]
struct ClusterStateInner {
    services: Slot<ServiceImportRecord>,
    endpoints: Slot<EndpointRecord>,
    namespaces: Slot<NamespaceRecord>,

    /// False when EndpointSlices are not watched.
    endpoints_enabled: bool,

    modified: ModifiedClock,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ClusterState {
    /// Create an empty state. With `endpoints_enabled` false the endpoint
    /// collection never has to sync.
    pub fn new(endpoints_enabled: bool) -> Self {
        Self {
            inner: Arc::new(ClusterStateInner {
                services: Slot::default(),
                endpoints: Slot::default(),
                namespaces: Slot::default(),
                endpoints_enabled,
                modified: ModifiedClock::default(),
            }),
        }
    }

    /// Whether EndpointSlices are part of the state.
    pub fn endpoints_enabled(&self) -> bool {
        self.inner.endpoints_enabled
    }

    /// Insert or update an object, advancing the clock on effective changes.
    pub fn apply<T: CacheObject>(&self, obj: T) -> Change {
        let key = obj.object_key();
        let change = T::slot(self).store.write().apply(obj);
        self.record_change(T::COLLECTION, &key, change);
        change
    }

    /// Delete an object, advancing the clock if it was present.
    pub fn delete<T: CacheObject>(&self, obj: &T) -> Change {
        let key = obj.object_key();
        let change = T::slot(self).store.write().delete(obj);
        self.record_change(T::COLLECTION, &key, change);
        change
    }

    /// Replace a whole collection after a relist and mark it synced.
    ///
    /// The clock advances once if any object was added, updated or removed.
    /// Returns the number of effective changes.
    pub fn replace_all<T: CacheObject>(&self, objs: Vec<T>) -> usize {
        let slot = T::slot(self);
        let total = objs.len();
        let effective = {
            let mut store = slot.store.write();
            store
                .replace_all(objs)
                .into_iter()
                .filter(|c| c.is_effective())
                .count()
        };

        if effective > 0 {
            let modified = self.inner.modified.bump();
            metrics::record_state_change(T::COLLECTION);
            debug!(collection = T::COLLECTION, effective, modified, "relist changed state");
        }

        if !slot.synced.swap(true, Ordering::AcqRel) {
            debug!(
                collection = T::COLLECTION,
                objects = total,
                "initial sync complete"
            );
        }
        effective
    }

    /// Mark a collection as synced without touching its contents.
    pub fn mark_synced<T: CacheObject>(&self) {
        T::slot(self).synced.store(true, Ordering::Release);
    }

    /// Whether a collection finished its initial listing.
    pub fn is_synced<T: CacheObject>(&self) -> bool {
        T::slot(self).synced.load(Ordering::Acquire)
    }

    /// All service imports.
    pub fn services(&self) -> Vec<Arc<ServiceImportRecord>> {
        self.inner.services.store.read().list()
    }

    /// Service imports under `service.namespace`.
    pub fn services_by_index(&self, key: &str) -> Vec<Arc<ServiceImportRecord>> {
        self.inner.services.store.read().by_index(key)
    }

    /// All endpoint records.
    pub fn endpoints(&self) -> Vec<Arc<EndpointRecord>> {
        self.inner.endpoints.store.read().list()
    }

    /// Endpoint records under `service.namespace`.
    pub fn endpoints_by_index(&self, key: &str) -> Vec<Arc<EndpointRecord>> {
        self.inner.endpoints.store.read().by_index(key)
    }

    /// Namespace by name.
    pub fn namespace(&self, name: &str) -> Option<Arc<NamespaceRecord>> {
        self.inner.namespaces.store.read().get(name)
    }

    /// True once services, namespaces and (if enabled) endpoints synced.
    pub fn has_synced(&self) -> bool {
        self.is_synced::<ServiceImportRecord>()
            && self.is_synced::<NamespaceRecord>()
            && (!self.inner.endpoints_enabled || self.is_synced::<EndpointRecord>())
    }

    /// Unix timestamp of the most recent effective change.
    pub fn modified(&self) -> i64 {
        self.inner.modified.get()
    }

    /// Get count of service imports.
    pub fn services_count(&self) -> usize {
        self.inner.services.store.read().len()
    }

    /// Get count of endpoint records.
    pub fn endpoints_count(&self) -> usize {
        self.inner.endpoints.store.read().len()
    }

    /// Get count of namespaces.
    pub fn namespaces_count(&self) -> usize {
        self.inner.namespaces.store.read().len()
    }

    /// Emit current state metrics.
    pub fn emit_metrics(&self) {
        metrics::record_state_counts(
            self.services_count(),
            self.endpoints_count(),
            self.namespaces_count(),
        );
        metrics::record_ready_state(
            self.is_synced::<ServiceImportRecord>(),
            self.is_synced::<EndpointRecord>(),
            self.is_synced::<NamespaceRecord>(),
        );
        metrics::record_serial(self.modified() as u32);
    }

    fn record_change(&self, collection: &'static str, key: &str, change: Change) {
        if change.is_effective() {
            let modified = self.inner.modified.bump();
            metrics::record_state_change(collection);
            debug!(collection, key, ?change, modified, "state changed");
        } else {
            trace!(collection, key, ?change, "state unchanged");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcs::ServiceImportType;
    use crate::object::{EndpointAddress, EndpointSubset, PortRecord};

    fn make_service(name: &str, version: &str) -> ServiceImportRecord {
        let mut svc = ServiceImportRecord::new(name, "testns", ServiceImportType::ClusterSetIP);
        svc.cluster_ips = vec!["10.0.0.1".to_string()];
        svc.resource_version = version.to_string();
        svc
    }

    fn make_endpoints(name: &str, ip: &str, version: &str) -> EndpointRecord {
        let mut ep = EndpointRecord::new(
            name,
            "testns",
            "hdls1",
            "east",
            vec![EndpointSubset {
                addresses: vec![EndpointAddress::new(ip)],
                ports: vec![PortRecord::new("http", "TCP", 80)],
            }],
        );
        ep.resource_version = version.to_string();
        ep
    }

    #[test]
    fn test_clock_advances_within_same_second() {
        let clock = ModifiedClock::default();
        assert_eq!(clock.get(), 0);
        assert_eq!(clock.advance_to(100), 100);
        assert_eq!(clock.advance_to(100), 101);
        assert_eq!(clock.advance_to(50), 102);
        assert_eq!(clock.advance_to(200), 200);
        assert_eq!(clock.get(), 200);
    }

    #[test]
    fn test_store_keeps_records_sharing_a_key() {
        let mut store = Store::default();
        store.apply(make_endpoints("slice-a", "172.0.0.1", "1"));
        store.apply(make_endpoints("slice-b", "172.0.0.2", "1"));

        assert_eq!(store.len(), 2);
        assert_eq!(store.by_index("hdls1.testns").len(), 2);
        assert!(store.by_index("svc0.testns").is_empty());
    }

    #[test]
    fn test_store_moves_index_on_relabel() {
        let mut store = Store::default();
        store.apply(make_endpoints("slice-a", "172.0.0.1", "1"));

        let mut moved = make_endpoints("slice-a", "172.0.0.1", "2");
        moved.index = "other.testns".to_string();
        store.apply(moved);

        assert!(store.by_index("hdls1.testns").is_empty());
        assert_eq!(store.by_index("other.testns").len(), 1);
    }

    #[test]
    fn test_add_and_delete_advance_clock() {
        let state = ClusterState::new(true);
        assert_eq!(state.modified(), 0);

        assert_eq!(state.apply(make_service("svc1", "1")), Change::Added);
        let after_add = state.modified();
        assert!(after_add > 0);

        assert_eq!(state.delete(&make_service("svc1", "1")), Change::Deleted);
        assert!(state.modified() > after_add);

        let after_delete = state.modified();
        assert_eq!(state.delete(&make_service("svc1", "1")), Change::Absent);
        assert_eq!(state.modified(), after_delete);
    }

    #[test]
    fn test_service_update_always_advances_clock() {
        let state = ClusterState::new(true);
        state.apply(make_service("svc1", "1"));
        let before = state.modified();

        assert_eq!(state.apply(make_service("svc1", "2")), Change::Updated);
        assert!(state.modified() > before);
    }

    #[test]
    fn test_replayed_version_is_ignored() {
        let state = ClusterState::new(true);
        state.apply(make_service("svc1", "1"));
        let before = state.modified();

        assert_eq!(state.apply(make_service("svc1", "1")), Change::Replayed);
        assert_eq!(state.modified(), before);
    }

    #[test]
    fn test_equivalent_endpoint_update_keeps_clock() {
        let state = ClusterState::new(true);
        state.apply(make_endpoints("slice-a", "172.0.0.1", "1"));
        let before = state.modified();

        let same = make_endpoints("slice-a", "172.0.0.1", "2");
        assert_eq!(state.apply(same), Change::Unchanged);
        assert_eq!(state.modified(), before);

        // The stored record is still replaced.
        let stored = state.endpoints_by_index("hdls1.testns");
        assert_eq!(stored[0].resource_version, "2");

        assert_eq!(
            state.apply(make_endpoints("slice-a", "172.0.0.9", "3")),
            Change::Updated
        );
        assert!(state.modified() > before);
    }

    #[test]
    fn test_endpoint_hostname_update_advances_clock() {
        let state = ClusterState::new(true);
        state.apply(make_endpoints("slice-a", "172.0.0.1", "1"));
        let before = state.modified();

        let mut named = make_endpoints("slice-a", "172.0.0.1", "2");
        named.subsets[0].addresses[0].hostname = Some("ep1".to_string());
        assert_eq!(state.apply(named), Change::Updated);
        let after = state.modified();
        assert!(after > before);

        let mut renamed = make_endpoints("slice-a", "172.0.0.1", "3");
        renamed.subsets[0].addresses[0].hostname = Some("ep2".to_string());
        assert_eq!(state.apply(renamed), Change::Updated);
        assert!(state.modified() > after);
    }

    #[test]
    fn test_namespace_update_keeps_clock() {
        let state = ClusterState::new(true);
        let mut ns = NamespaceRecord::new("testns");
        ns.resource_version = "1".to_string();
        assert_eq!(state.apply(ns.clone()), Change::Added);
        let before = state.modified();

        ns.resource_version = "2".to_string();
        assert_eq!(state.apply(ns), Change::Unchanged);
        assert_eq!(state.modified(), before);
        assert!(state.namespace("testns").is_some());
        assert!(state.namespace("nsnoexist").is_none());
    }

    #[test]
    fn test_relist_swaps_collection() {
        let state = ClusterState::new(true);
        state.apply(make_service("svc1", "1"));
        state.apply(make_service("svc2", "1"));

        let effective = state.replace_all(vec![make_service("svc1", "1"), make_service("svc3", "1")]);

        // svc2 removed, svc3 added, svc1 replayed.
        assert_eq!(effective, 2);
        assert_eq!(state.services_count(), 2);
        assert!(state.services_by_index("svc2.testns").is_empty());
        assert_eq!(state.services_by_index("svc3.testns").len(), 1);
        assert!(state.is_synced::<ServiceImportRecord>());
    }

    #[test]
    fn test_unchanged_relist_keeps_clock() {
        let state = ClusterState::new(true);
        state.replace_all(vec![make_service("svc1", "1")]);
        let before = state.modified();

        assert_eq!(state.replace_all(vec![make_service("svc1", "1")]), 0);
        assert_eq!(state.modified(), before);
    }

    #[test]
    fn test_has_synced_requires_enabled_collections() {
        let state = ClusterState::new(true);
        assert!(!state.has_synced());

        state.replace_all::<ServiceImportRecord>(vec![]);
        state.replace_all::<NamespaceRecord>(vec![]);
        assert!(!state.has_synced());

        state.replace_all::<EndpointRecord>(vec![]);
        assert!(state.has_synced());

        let state = ClusterState::new(false);
        state.mark_synced::<ServiceImportRecord>();
        state.mark_synced::<NamespaceRecord>();
        assert!(state.has_synced());
    }

    #[test]
    fn test_serial_tracks_clock() {
        let state = ClusterState::new(true);
        let serial = SerialTracker::new(Arc::new(test_support::StaticCache::synced(state.clone())));
        assert_eq!(serial.serial(), 0);

        state.apply(make_service("svc1", "1"));
        assert_eq!(serial.serial(), state.modified() as u32);
        assert!(serial.serial() > 0);
    }
}
