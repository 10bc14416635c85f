use ahash::AHashMap as HashMap;
use ovs_agent_core::{
    endpoints_port_map, service_port_map, Endpoint, Endpoints, ResourceId, Service, ServiceInfo,
    ServicePortName,
};
use parking_lot::Mutex;
use std::{
    collections::hash_map::Entry,
    sync::atomic::{AtomicBool, Ordering},
};

/// Desired (or installed) Services keyed by Service port identity.
pub type ServiceMap = HashMap<ServicePortName, ServiceInfo>;

/// Desired endpoints per Service port, keyed by endpoint identity string.
pub type EndpointsMap = HashMap<ServicePortName, HashMap<String, Endpoint>>;

/// Endpoints that disappeared from the desired state since the last sync
/// and must have their flows uninstalled.
pub type StaleEndpoints = HashMap<ServicePortName, HashMap<String, Endpoint>>;

/// Accumulated change to a single object: the expansion it had at the last
/// sync and the expansion it has now. Intermediate revisions collapse.
#[derive(Debug)]
struct Change<T> {
    previous: T,
    current: T,
}

/// Accumulates Service add/update/delete notifications between syncs.
///
/// Entry points run on event-source tasks concurrently with each other; the
/// pending map is locked for every access and never across an await.
#[derive(Debug, Default)]
pub struct ServiceChangesTracker {
    pending: Mutex<HashMap<ResourceId, Change<ServiceMap>>>,
    synced: AtomicBool,
}

impl ServiceChangesTracker {
    /// Records a change. `None` old means an add; `None` new means a
    /// delete. Returns whether any change is now pending, which is the
    /// caller's cue to wake the sync runner.
    pub fn on_update(&self, old: Option<&Service>, new: Option<&Service>) -> bool {
        let mut pending = self.pending.lock();
        let Some(id) = new.or(old).map(|s| ResourceId::new(&s.namespace, &s.name)) else {
            return !pending.is_empty();
        };
        let current = new.map(service_port_map).unwrap_or_default();
        match pending.entry(id) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().current = current;
                if entry.get().previous == entry.get().current {
                    entry.remove();
                }
            }
            Entry::Vacant(entry) => {
                let previous = old.map(service_port_map).unwrap_or_default();
                if previous != current {
                    entry.insert(Change { previous, current });
                }
            }
        }
        !pending.is_empty()
    }

    /// Marks the initial list of Services as delivered.
    pub fn on_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    pub fn synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Applies all pending changes to the live desired-state map and clears
    /// them.
    pub fn update(&self, target: &mut ServiceMap) {
        let mut pending = self.pending.lock();
        for (_, change) in pending.drain() {
            for key in change.previous.keys() {
                target.remove(key);
            }
            for (key, info) in change.current {
                target.insert(key, info);
            }
        }
    }
}

/// Accumulates Endpoints add/update/delete notifications between syncs.
#[derive(Debug, Default)]
pub struct EndpointsChangesTracker {
    pending: Mutex<HashMap<ResourceId, Change<EndpointsMap>>>,
    synced: AtomicBool,
}

impl EndpointsChangesTracker {
    pub fn on_update(&self, old: Option<&Endpoints>, new: Option<&Endpoints>) -> bool {
        let mut pending = self.pending.lock();
        let Some(id) = new.or(old).map(|e| ResourceId::new(&e.namespace, &e.name)) else {
            return !pending.is_empty();
        };
        let current = new.map(endpoints_port_map).unwrap_or_default();
        match pending.entry(id) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().current = current;
                if entry.get().previous == entry.get().current {
                    entry.remove();
                }
            }
            Entry::Vacant(entry) => {
                let previous = old.map(endpoints_port_map).unwrap_or_default();
                if previous != current {
                    entry.insert(Change { previous, current });
                }
            }
        }
        !pending.is_empty()
    }

    pub fn on_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    pub fn synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Applies all pending changes to the live desired-state map, clears
    /// them, and reports the endpoints that disappeared so their flows can
    /// be uninstalled.
    pub fn update(&self, target: &mut EndpointsMap) -> StaleEndpoints {
        let mut stale = StaleEndpoints::new();
        let mut pending = self.pending.lock();
        for (_, change) in pending.drain() {
            for (svc_port_name, previous) in &change.previous {
                let current = change.current.get(svc_port_name);
                for (id, endpoint) in previous {
                    if current.map_or(true, |c| !c.contains_key(id)) {
                        stale
                            .entry(svc_port_name.clone())
                            .or_default()
                            .insert(id.clone(), endpoint.clone());
                    }
                }
            }
            for key in change.previous.keys() {
                target.remove(key);
            }
            for (key, endpoints) in change.current {
                target.insert(key, endpoints);
            }
        }
        stale
    }
}
