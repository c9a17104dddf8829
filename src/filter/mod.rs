use crate::routing::RpcInfo;
use crate::xds::FilterDescriptor;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Hook fired when a stream leaves a filter. Hooks run in reverse entry
/// order (innermost filter first).
pub type DoneFn = Box<dyn FnOnce() + Send>;

/// One registered HTTP filter implementation.
///
/// `build` is invoked once per `select_config` call with the listener-level
/// base config and the override resolved for the matched virtual host /
/// route / cluster; the returned instance is then entered once for the RPC's
/// stream.
pub trait HttpFilterKind: Send + Sync {
    fn build(
        &self,
        base: &Value,
        override_config: Option<&Value>,
    ) -> Result<Box<dyn StreamFilter>, String>;
}

/// A built per-RPC filter instance.
pub trait StreamFilter: Send + Sync {
    /// Enter the stream. Returning a hook registers it to fire when the
    /// stream finishes; an error aborts the chain and fires the hooks of
    /// filters already entered.
    fn on_stream(&self, info: &RpcInfo) -> Result<Option<DoneFn>, String>;
}

#[derive(Debug)]
pub enum FilterError {
    /// No terminal router descriptor in the listener's filter list.
    NoRouter,
    /// A descriptor names a filter with no registered kind.
    UnknownFilter(String),
    /// A filter's builder (or stream entry) failed.
    Build { filter: String, message: String },
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::NoRouter => write!(f, "filter chain has no router filter"),
            FilterError::UnknownFilter(name) => write!(f, "no registered filter kind {:?}", name),
            FilterError::Build { filter, message } => {
                write!(f, "filter {:?} failed: {}", filter, message)
            }
        }
    }
}

impl std::error::Error for FilterError {}

/// Name-keyed registry of filter kinds, assembled once at resolver build.
#[derive(Default)]
pub struct FilterRegistry {
    kinds: HashMap<String, Arc<dyn HttpFilterKind>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, kind: Arc<dyn HttpFilterKind>) {
        self.kinds.insert(name.into(), kind);
    }

    fn get(&self, name: &str) -> Option<&Arc<dyn HttpFilterKind>> {
        self.kinds.get(name)
    }
}

struct FilterLink {
    name: String,
    base: Value,
    kind: Arc<dyn HttpFilterKind>,
}

/// The listener's filter list compiled against a registry. Built once per
/// config selector and shared across RPCs; per-RPC state lives in the
/// [`InterceptorChain`] produced by [`instantiate`](Self::instantiate).
pub struct FilterChain {
    links: Vec<FilterLink>,
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("len", &self.links.len())
            .finish()
    }
}

impl FilterChain {
    /// Compile the listener filter list. Iteration stops at (and excludes)
    /// the first terminal router descriptor; anything after it is
    /// discarded. A list with no router does not compile.
    pub fn compile(
        lds_filters: &[FilterDescriptor],
        registry: &FilterRegistry,
    ) -> Result<Self, FilterError> {
        let mut links = Vec::new();
        let mut saw_router = false;
        for descriptor in lds_filters {
            if descriptor.is_terminal_router {
                saw_router = true;
                break;
            }
            let kind = registry
                .get(&descriptor.name)
                .ok_or_else(|| FilterError::UnknownFilter(descriptor.name.clone()))?;
            links.push(FilterLink {
                name: descriptor.name.clone(),
                base: descriptor.config.clone(),
                kind: kind.clone(),
            });
        }
        if !saw_router {
            return Err(FilterError::NoRouter);
        }
        tracing::debug!("filters: compiled chain, len={}", links.len());
        Ok(Self { links })
    }

    /// Build the per-RPC interceptor chain. Each filter's effective override
    /// is `cluster ?? route ?? vhost`; its base config is always the
    /// listener-level one.
    pub fn instantiate(
        &self,
        vhost_overrides: &HashMap<String, Value>,
        route_overrides: &HashMap<String, Value>,
        cluster_overrides: &HashMap<String, Value>,
    ) -> Result<InterceptorChain, FilterError> {
        let mut filters = Vec::with_capacity(self.links.len());
        for link in &self.links {
            let override_config = cluster_overrides
                .get(&link.name)
                .or_else(|| route_overrides.get(&link.name))
                .or_else(|| vhost_overrides.get(&link.name));
            let filter =
                link.kind
                    .build(&link.base, override_config)
                    .map_err(|message| FilterError::Build {
                        filter: link.name.clone(),
                        message,
                    })?;
            filters.push((link.name.clone(), filter));
        }
        Ok(InterceptorChain { filters })
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// The per-RPC interceptor chain: one built instance per filter, entered in
/// declared order.
pub struct InterceptorChain {
    filters: Vec<(String, Box<dyn StreamFilter>)>,
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.filters.len())
            .finish()
    }
}

impl InterceptorChain {
    /// Enter all filters for a new stream. On failure inside filter `i`,
    /// the hooks of filters `0..i-1` fire in reverse order and `i`'s hook
    /// never does.
    pub fn new_stream(&self, info: &RpcInfo) -> Result<StreamGuard, FilterError> {
        let mut hooks: Vec<DoneFn> = Vec::with_capacity(self.filters.len());
        for (name, filter) in &self.filters {
            match filter.on_stream(info) {
                Ok(Some(done)) => hooks.push(done),
                Ok(None) => {}
                Err(message) => {
                    while let Some(done) = hooks.pop() {
                        done();
                    }
                    return Err(FilterError::Build {
                        filter: name.clone(),
                        message,
                    });
                }
            }
        }
        Ok(StreamGuard { hooks })
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

/// RAII guard for an entered stream. Done hooks fire in reverse entry order
/// on [`finish`](Self::finish) or drop.
pub struct StreamGuard {
    hooks: Vec<DoneFn>,
}

impl std::fmt::Debug for StreamGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamGuard")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl StreamGuard {
    pub fn finish(self) {}
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        while let Some(done) = self.hooks.pop() {
            done();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingFilterKind;
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recording_registry(log: &Arc<Mutex<Vec<String>>>, names: &[&str]) -> FilterRegistry {
        let mut registry = FilterRegistry::new();
        for name in names {
            registry.register(*name, Arc::new(RecordingFilterKind::new(log.clone())));
        }
        registry
    }

    fn descriptors(configs: &[(&str, &str)]) -> Vec<FilterDescriptor> {
        let mut list: Vec<FilterDescriptor> = configs
            .iter()
            .map(|(name, config)| FilterDescriptor::new(*name, "test.type", json!(config)))
            .collect();
        list.push(FilterDescriptor::router());
        list
    }

    #[test]
    fn test_compile_requires_router() {
        let registry = FilterRegistry::new();
        let err = FilterChain::compile(&[], &registry).unwrap_err();
        assert!(matches!(err, FilterError::NoRouter));
    }

    #[test]
    fn test_descriptors_after_router_discarded() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = recording_registry(&log, &["foo"]);
        let filters = vec![
            FilterDescriptor::new("foo", "test.type", json!("foo1")),
            FilterDescriptor::router(),
            // Unregistered, but irrelevant: it sits after the router.
            FilterDescriptor::new("ignored", "test.type", json!("x")),
        ];
        let chain = FilterChain::compile(&filters, &registry).unwrap();
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_unknown_filter_fails_compile() {
        let registry = FilterRegistry::new();
        let filters = descriptors(&[("mystery", "cfg")]);
        let err = FilterChain::compile(&filters, &registry).unwrap_err();
        assert!(matches!(err, FilterError::UnknownFilter(name) if name == "mystery"));
    }

    #[test]
    fn test_override_resolution_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = recording_registry(&log, &["foo", "bar", "baz"]);
        let chain = FilterChain::compile(
            &descriptors(&[("foo", "foo1"), ("bar", "bar1"), ("baz", "baz1")]),
            &registry,
        )
        .unwrap();

        let vhost = HashMap::from([
            ("foo".to_string(), json!("foo-vh")),
            ("bar".to_string(), json!("bar-vh")),
            ("baz".to_string(), json!("baz-vh")),
        ]);
        let route = HashMap::from([
            ("foo".to_string(), json!("foo-route")),
            ("bar".to_string(), json!("bar-route")),
        ]);
        let cluster = HashMap::from([("foo".to_string(), json!("foo-cluster"))]);

        chain.instantiate(&vhost, &route, &cluster).unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "build:foo1",
                "override:foo-cluster",
                "build:bar1",
                "override:bar-route",
                "build:baz1",
                "override:baz-vh",
            ]
        );
    }

    #[test]
    fn test_stream_done_hooks_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = recording_registry(&log, &["foo", "bar"]);
        let chain = FilterChain::compile(&descriptors(&[("foo", "foo1"), ("bar", "bar1")]), &registry)
            .unwrap();
        let interceptors = chain
            .instantiate(&HashMap::new(), &HashMap::new(), &HashMap::new())
            .unwrap();

        log.lock().unwrap().clear();
        let guard = interceptors.new_stream(&RpcInfo::new("/m")).unwrap();
        guard.finish();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["newstream:foo1", "newstream:bar1", "done:bar1", "done:foo1"]
        );
    }

    #[test]
    fn test_stream_failure_rolls_back_entered_filters() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = FilterRegistry::new();
        registry.register("ok", Arc::new(RecordingFilterKind::new(log.clone())));
        let mut failing = RecordingFilterKind::new(log.clone());
        failing.fail_stream = true;
        registry.register("boom", Arc::new(failing));

        let chain = FilterChain::compile(&descriptors(&[("ok", "ok1"), ("boom", "boom1")]), &registry)
            .unwrap();
        let interceptors = chain
            .instantiate(&HashMap::new(), &HashMap::new(), &HashMap::new())
            .unwrap();

        log.lock().unwrap().clear();
        let err = interceptors.new_stream(&RpcInfo::new("/m")).unwrap_err();
        assert!(matches!(err, FilterError::Build { filter, .. } if filter == "boom"));
        // The failing filter entered but its done hook must not fire; the
        // filter before it rolled back.
        assert_eq!(
            *log.lock().unwrap(),
            vec!["newstream:ok1", "newstream:boom1", "done:ok1"]
        );
    }

    #[test]
    fn test_builder_failure_surfaces_filter_name() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = FilterRegistry::new();
        let mut failing = RecordingFilterKind::new(log.clone());
        failing.fail_build = true;
        registry.register("boom", Arc::new(failing));

        let chain = FilterChain::compile(&descriptors(&[("boom", "boom1")]), &registry).unwrap();
        let err = chain
            .instantiate(&HashMap::new(), &HashMap::new(), &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, FilterError::Build { filter, .. } if filter == "boom"));
    }

    #[test]
    fn test_guard_drop_fires_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = recording_registry(&log, &["foo"]);
        let chain = FilterChain::compile(&descriptors(&[("foo", "foo1")]), &registry).unwrap();
        let interceptors = chain
            .instantiate(&HashMap::new(), &HashMap::new(), &HashMap::new())
            .unwrap();
        {
            let _guard = interceptors.new_stream(&RpcInfo::new("/m")).unwrap();
        }
        assert!(log.lock().unwrap().contains(&"done:foo1".to_string()));
    }
}
