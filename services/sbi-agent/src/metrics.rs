//! Live statistics registry.
//!
//! The registry maps each running agent instance to the stats view it
//! published, and each view maps node ids to an accessor producing that
//! node's current statistics:
//!
//! ```text
//! StatsRegistry
//! └── "agent-0"            (InstanceStats, one per Agent::run call)
//!     ├── "alpha" → fn() -> serde_json::Value
//!     └── "beta"  → fn() -> serde_json::Value
//! ```
//!
//! Locks are held only while inserting, removing or cloning entries;
//! accessors are always invoked outside them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock};

use serde::Serialize;
use tracing::warn;

/// Zero-argument accessor returning a node's current statistics.
pub type StatsAccessor = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

/// Wrap a closure producing any serializable snapshot into a [`StatsAccessor`].
///
/// A snapshot that fails to serialize is reported as `null`.
pub fn accessor<T, F>(f: F) -> StatsAccessor
where
    T: Serialize,
    F: Fn() -> T + Send + Sync + 'static,
{
    Arc::new(move || match serde_json::to_value(f()) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Failed to serialize stats snapshot");
            serde_json::Value::Null
        }
    })
}

// =============================================================================
// Instance Stats
// =============================================================================

/// Stats view of one running agent instance: node id to accessor.
#[derive(Default)]
pub struct InstanceStats {
    nodes: RwLock<BTreeMap<String, StatsAccessor>>,
}

impl InstanceStats {
    /// Create an empty view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish (or replace) the accessor for a node.
    pub fn publish(&self, node_id: impl Into<String>, accessor: StatsAccessor) {
        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node_id.into(), accessor);
    }

    /// Node ids with a published accessor, sorted.
    pub fn node_ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Current statistics for one node.
    pub fn node(&self, node_id: &str) -> Option<serde_json::Value> {
        let accessor = self.read().get(node_id).cloned()?;
        Some(accessor())
    }

    /// Current statistics for every node, keyed by node id.
    pub fn snapshot(&self) -> serde_json::Value {
        let accessors: Vec<(String, StatsAccessor)> = self
            .read()
            .iter()
            .map(|(id, f)| (id.clone(), Arc::clone(f)))
            .collect();

        let nodes = accessors
            .into_iter()
            .map(|(id, f)| (id, f()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(nodes)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, StatsAccessor>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for InstanceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceStats")
            .field("nodes", &self.node_ids())
            .finish()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Registry of running agent instances and their stats views.
///
/// Use [`StatsRegistry::global`] for the process-wide registry, or
/// [`StatsRegistry::new`] for an isolated one.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    instances: Mutex<BTreeMap<String, Arc<InstanceStats>>>,
}

impl StatsRegistry {
    /// Create an isolated, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<StatsRegistry> {
        static GLOBAL: OnceLock<Arc<StatsRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(StatsRegistry::new())))
    }

    /// Insert the stats view of a running instance, replacing any previous
    /// view under the same key.
    pub fn register(&self, key: impl Into<String>, stats: Arc<InstanceStats>) {
        self.lock().insert(key.into(), stats);
    }

    /// Remove the stats view of an instance. Returns it if it was present.
    pub fn unregister(&self, key: &str) -> Option<Arc<InstanceStats>> {
        self.lock().remove(key)
    }

    /// Register `stats` under `key` until the returned guard is dropped.
    pub fn register_scoped(
        self: &Arc<Self>,
        key: impl Into<String>,
        stats: Arc<InstanceStats>,
    ) -> StatsRegistration {
        let key = key.into();
        self.register(key.clone(), stats);
        StatsRegistration {
            registry: Arc::clone(self),
            key,
        }
    }

    /// Returns true if an instance is registered under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// The stats view registered under `key`.
    pub fn get(&self, key: &str) -> Option<Arc<InstanceStats>> {
        self.lock().get(key).cloned()
    }

    /// Registered instance keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no instance is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// The full hierarchy as JSON: instance key → node id → snapshot.
    pub fn snapshot(&self) -> serde_json::Value {
        let instances: Vec<(String, Arc<InstanceStats>)> = self
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let map = instances
            .into_iter()
            .map(|(key, stats)| (key, stats.snapshot()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<InstanceStats>>> {
        self.instances.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Keeps an instance registered; unregisters it when dropped.
#[must_use = "the instance is unregistered as soon as the registration is dropped"]
#[derive(Debug)]
pub struct StatsRegistration {
    registry: Arc<StatsRegistry>,
    key: String,
}

impl StatsRegistration {
    /// Key the instance is registered under.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for StatsRegistration {
    fn drop(&mut self) {
        self.registry.unregister(&self.key);
    }
}
