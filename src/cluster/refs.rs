use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// Child load-balancing policy attached to a cluster key in the published
/// service config.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildPolicy {
    /// Regular xDS cluster, delegated to the CDS policy.
    Cds { cluster: String },
    /// Cluster-specifier plugin; the JSON is emitted verbatim.
    Plugin(serde_json::Value),
}

/// Hook invoked (outside the lock) whenever a release brings a cluster's
/// refcount to zero. The resolver installs it once to enqueue a
/// reconcile-and-republish task.
pub type IdleHook = Box<dyn Fn() + Send + Sync>;

struct ClusterEntry {
    refs: u64,
    policy: ChildPolicy,
}

/// Multiset of active cluster keys shared between the resolver worker and
/// every config selector.
///
/// Keys are the service-config child ids (`cluster:<name>` /
/// `cluster_specifier_plugin:<name>`). Entries whose refcount drops to zero
/// stay visible in [`snapshot`](Self::snapshot) until an explicit
/// [`publish`](Self::publish) boundary prunes them, so a cluster only leaves
/// the service config through a publication that carried it away.
///
/// The set is an independently-owned string-keyed table: selectors hold
/// opaque [`ClusterRef`] handles, never pointers back into the resolver.
pub struct ClusterRefSet {
    inner: Mutex<HashMap<Arc<str>, ClusterEntry>>,
    idle_hook: OnceLock<IdleHook>,
}

impl Default for ClusterRefSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterRefSet {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            idle_hook: OnceLock::new(),
        }
    }

    /// Install the idle hook. Later calls are ignored.
    pub fn set_idle_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        let _ = self.idle_hook.set(Box::new(hook));
    }

    /// Add one reference on `key`, creating the entry if needed. The entry's
    /// child policy is refreshed so re-acquired keys carry the latest one.
    pub fn acquire(self: &Arc<Self>, key: &str, policy: ChildPolicy) -> ClusterRef {
        let mut inner = self.inner.lock().unwrap();
        let stored: Arc<str> = inner
            .get_key_value(key)
            .map(|(stored, _)| stored.clone())
            .unwrap_or_else(|| Arc::from(key));
        let entry = inner.entry(stored.clone()).or_insert_with(|| ClusterEntry {
            refs: 0,
            policy: policy.clone(),
        });
        entry.refs += 1;
        entry.policy = policy;
        ClusterRef {
            set: self.clone(),
            key: stored,
        }
    }

    fn release(&self, key: &Arc<str>) {
        let hit_zero = {
            let mut inner = self.inner.lock().unwrap();
            match inner.get_mut(key) {
                Some(entry) => {
                    entry.refs = entry.refs.saturating_sub(1);
                    entry.refs == 0
                }
                None => false,
            }
        };
        if hit_zero {
            if let Some(hook) = self.idle_hook.get() {
                hook();
            }
        }
    }

    /// All live entries (including zero-ref entries not yet carried away by
    /// a publication), sorted by key.
    pub fn snapshot(&self) -> Vec<(Arc<str>, ChildPolicy)> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<(Arc<str>, ChildPolicy)> = inner
            .iter()
            .map(|(k, e)| (k.clone(), e.policy.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Publication boundary: prune entries whose refcount is zero. After
    /// this, [`snapshot`](Self::snapshot) returns only referenced clusters.
    pub fn publish(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|_, entry| entry.refs > 0);
    }

    /// Current refcount of `key` (0 when absent).
    pub fn ref_count(&self, key: &str) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.get(key).map(|e| e.refs).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

/// Opaque reference handle on one cluster key. Dropping it releases exactly
/// one reference; a release that reaches zero fires the set's idle hook.
pub struct ClusterRef {
    set: Arc<ClusterRefSet>,
    key: Arc<str>,
}

impl ClusterRef {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ClusterRef {
    fn drop(&mut self) {
        self.set.release(&self.key);
    }
}

impl std::fmt::Debug for ClusterRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRef").field("key", &self.key).finish()
    }
}
