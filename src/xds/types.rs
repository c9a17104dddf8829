use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Listener (LDS) resource as handed over by the xDS client.
///
/// Exactly one of `route_config_name` / `inline_route_config` is set: the
/// listener either references a RouteConfiguration by name (RDS) or carries
/// it inline.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListenerUpdate {
    pub route_config_name: Option<String>,
    pub inline_route_config: Option<RouteConfigUpdate>,
    /// Listener-level default for per-RPC deadlines. Routes may override or
    /// disable it (see [`Route::max_stream_duration`]).
    pub max_stream_duration: Option<Duration>,
    /// Ordered HTTP filter list. Must end with a terminal router filter;
    /// descriptors after the router are ignored.
    pub http_filters: Vec<FilterDescriptor>,
}

/// RouteConfiguration (RDS) resource: an ordered virtual-host tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RouteConfigUpdate {
    pub virtual_hosts: Vec<VirtualHost>,
}

/// Group of routes selected by the target authority.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VirtualHost {
    /// Domain patterns. Supports exact (`api.example.com`), wildcard suffix
    /// (`*.example.com`), wildcard prefix (`api.*`), and catch-all (`*`).
    pub domains: Vec<String>,
    pub routes: Vec<Route>,
    /// Per-virtual-host HTTP filter config overrides, keyed by filter name.
    pub filter_overrides: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub route_match: RouteMatch,
    pub action: RouteAction,
    /// Per-route HTTP filter config overrides, keyed by filter name.
    pub filter_overrides: HashMap<String, Value>,
    /// `Some(Duration::ZERO)` disables the listener-level default for this
    /// route; `None` inherits it.
    pub max_stream_duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch {
    pub path: PathMatch,
    pub case_sensitive: bool,
    /// Header matchers, AND semantics.
    pub headers: Vec<HeaderMatcher>,
    pub runtime_fraction: Option<RuntimeFraction>,
}

impl Default for RouteMatch {
    fn default() -> Self {
        Self {
            path: PathMatch::Prefix(String::new()),
            case_sensitive: true,
            headers: Vec::new(),
            runtime_fraction: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PathMatch {
    Exact(String),
    /// Empty prefix matches any path.
    Prefix(String),
    /// Full-string regex match.
    Regex(String),
}

/// Supports exact (default), prefix, regex, and presence-only match.
/// Multiple matchers on a route use AND semantics.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderMatcher {
    pub name: String,
    /// Ignored when `match_type` is `Present`.
    pub value: String,
    pub match_type: HeaderMatchType,
    pub invert: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderMatchType {
    #[default]
    Exact,
    Prefix,
    Regex,
    Present,
}

/// Route match gate: matches when `rand % denominator < numerator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeFraction {
    pub numerator: u64,
    pub denominator: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteAction {
    WeightedClusters {
        clusters: Vec<WeightedClusterEntry>,
        hash_policies: Vec<HashPolicy>,
    },
    /// Opaque cluster-specifier plugin; its child policy JSON is passed
    /// through to the service config verbatim.
    ClusterSpecifierPlugin { name: String, child_policy: Value },
    /// Actions this client cannot execute. The route never matches.
    Unsupported,
}

/// Weighted reference to a cluster for traffic splitting. A zero weight is
/// never drawn but still pins a reference on the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedClusterEntry {
    pub name: String,
    pub weight: u64,
    /// Per-cluster HTTP filter config overrides, keyed by filter name.
    pub filter_overrides: HashMap<String, Value>,
}

impl WeightedClusterEntry {
    pub fn new(name: impl Into<String>, weight: u64) -> Self {
        Self {
            name: name.into(),
            weight,
            filter_overrides: HashMap::new(),
        }
    }
}

/// Rule producing a 64-bit value for consistent-hash load balancing.
#[derive(Debug, Clone, PartialEq)]
pub struct HashPolicy {
    pub kind: HashPolicyKind,
    /// Evaluation stops after the first terminal policy that produced a
    /// value.
    pub terminal: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HashPolicyKind {
    /// Hash a request header value, optionally rewritten by
    /// `regex` / `regex_substitution` first. The `:path` pseudo-header falls
    /// back to the RPC method when absent from metadata.
    Header {
        header_name: String,
        regex: Option<String>,
        regex_substitution: Option<String>,
    },
    /// Use the channel's 64-bit id.
    ChannelId,
    /// Filter-state lookup; only the channel-id key produces a value.
    FilterState { key: String },
}

/// Filter-state key recognized by [`HashPolicyKind::FilterState`].
pub const CHANNEL_ID_FILTER_STATE_KEY: &str = "io.grpc.channel_id";

/// One entry of the listener's HTTP filter list.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterDescriptor {
    pub name: String,
    pub type_url: String,
    /// Opaque filter configuration, interpreted by the registered kind.
    pub config: Value,
    /// The router filter is terminal: descriptors after it are discarded.
    pub is_terminal_router: bool,
}

impl FilterDescriptor {
    pub fn new(name: impl Into<String>, type_url: impl Into<String>, config: Value) -> Self {
        Self {
            name: name.into(),
            type_url: type_url.into(),
            config,
            is_terminal_router: false,
        }
    }

    /// The terminal router descriptor ending every filter chain.
    pub fn router() -> Self {
        Self {
            name: "router".to_string(),
            type_url: "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router"
                .to_string(),
            config: Value::Null,
            is_terminal_router: true,
        }
    }
}
