use crate::routing::hash::CompiledHashPolicy;
use crate::routing::{EntropySource, RpcInfo};
use crate::xds::{
    HeaderMatchType, HeaderMatcher, PathMatch, RouteAction, RouteMatch, RuntimeFraction,
    VirtualHost,
};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// The compiled route tree for one RouteConfiguration.
///
/// Built once per config-selector construction and consumed lock-free from
/// the RPC path. Matching order:
/// 1. Virtual-host selection by authority, tiered:
///    exact > wildcard suffix (`*.x`) > wildcard prefix (`x.*`) > `*`;
///    ties within a tier go to the longest literal, then first-declared.
/// 2. First route (declared order) whose path, headers, and runtime
///    fraction all match.
pub(crate) struct RouteTable {
    virtual_hosts: Vec<CompiledVirtualHost>,
}

pub(crate) struct CompiledVirtualHost {
    domains: Vec<String>,
    pub(crate) routes: Vec<CompiledRoute>,
    pub(crate) filter_overrides: HashMap<String, Value>,
}

pub(crate) struct CompiledRoute {
    path: CompiledPathMatch,
    headers: Vec<CompiledHeaderMatcher>,
    runtime_fraction: Option<RuntimeFraction>,
    pub(crate) action: CompiledAction,
    pub(crate) filter_overrides: HashMap<String, Value>,
    pub(crate) max_stream_duration: Option<Duration>,
}

enum CompiledPathMatch {
    Exact { value: String, case_sensitive: bool },
    Prefix { value: String, case_sensitive: bool },
    Regex(Regex),
}

struct CompiledHeaderMatcher {
    /// Lowercased metadata key.
    name: String,
    kind: HeaderMatchKind,
    invert: bool,
}

enum HeaderMatchKind {
    Exact(String),
    Prefix(String),
    Regex(Regex),
    Present,
}

pub(crate) enum CompiledAction {
    WeightedClusters {
        entries: Vec<ClusterEntry>,
        /// Prefix sums over entry weights; a draw lands in the first slot
        /// whose prefix sum exceeds it, so zero-weight entries are skipped.
        prefix_sums: Vec<u64>,
        total_weight: u64,
        hash_policies: Vec<CompiledHashPolicy>,
    },
    Plugin {
        key: Arc<str>,
        child_policy: Value,
    },
}

pub(crate) struct ClusterEntry {
    /// Service-config child key, `cluster:<name>`.
    pub(crate) key: Arc<str>,
    pub(crate) cluster_name: String,
    pub(crate) weight: u64,
    pub(crate) filter_overrides: HashMap<String, Value>,
}

impl RouteTable {
    pub(crate) fn compile(virtual_hosts: &[VirtualHost]) -> Self {
        let mut compiled_vhosts = Vec::with_capacity(virtual_hosts.len());
        let mut route_count = 0;
        for vh in virtual_hosts {
            let mut routes = Vec::with_capacity(vh.routes.len());
            for route in &vh.routes {
                match compile_route(&route.route_match, &route.action) {
                    Some((path, headers, action)) => {
                        route_count += 1;
                        routes.push(CompiledRoute {
                            path,
                            headers,
                            runtime_fraction: route.route_match.runtime_fraction,
                            action,
                            filter_overrides: route.filter_overrides.clone(),
                            max_stream_duration: route.max_stream_duration,
                        });
                    }
                    None => {
                        tracing::debug!(
                            "routing: dropped route without usable match/action, domains={:?}",
                            vh.domains
                        );
                    }
                }
            }
            compiled_vhosts.push(CompiledVirtualHost {
                domains: vh.domains.clone(),
                routes,
                filter_overrides: vh.filter_overrides.clone(),
            });
        }
        tracing::info!(
            "routing: compiled route table, vhosts={}, routes={}",
            compiled_vhosts.len(),
            route_count
        );
        Self {
            virtual_hosts: compiled_vhosts,
        }
    }

    pub(crate) fn virtual_hosts(&self) -> &[CompiledVirtualHost] {
        &self.virtual_hosts
    }

    /// Pick the virtual host whose domains best match the authority.
    pub(crate) fn match_virtual_host(&self, authority: &str) -> Option<&CompiledVirtualHost> {
        let mut best: Option<(u8, usize, usize)> = None;
        for (idx, vh) in self.virtual_hosts.iter().enumerate() {
            for domain in &vh.domains {
                if let Some((tier, literal_len)) = domain_match(domain, authority) {
                    let better = match best {
                        None => true,
                        Some((bt, bl, _)) => tier > bt || (tier == bt && literal_len > bl),
                    };
                    if better {
                        best = Some((tier, literal_len, idx));
                    }
                }
            }
        }
        best.map(|(_, _, idx)| &self.virtual_hosts[idx])
    }
}

impl CompiledVirtualHost {
    /// First route in declared order that matches the RPC.
    pub(crate) fn match_route(
        &self,
        info: &RpcInfo,
        entropy: &dyn EntropySource,
    ) -> Option<&CompiledRoute> {
        self.routes.iter().find(|r| r.matches(info, entropy))
    }
}

impl CompiledRoute {
    fn matches(&self, info: &RpcInfo, entropy: &dyn EntropySource) -> bool {
        if !self.path_matches(&info.method) {
            return false;
        }
        if !self
            .headers
            .iter()
            .all(|m| m.matches(info.metadata(&m.name)))
        {
            return false;
        }
        if let Some(fraction) = self.runtime_fraction {
            if fraction.denominator == 0 {
                return false;
            }
            if entropy.next_u64() % fraction.denominator >= fraction.numerator {
                return false;
            }
        }
        // A weighted action whose total weight is zero cannot pick a
        // cluster; the route is treated as unmatched.
        match &self.action {
            CompiledAction::WeightedClusters { total_weight, .. } => *total_weight > 0,
            CompiledAction::Plugin { .. } => true,
        }
    }

    fn path_matches(&self, method: &str) -> bool {
        match &self.path {
            CompiledPathMatch::Exact {
                value,
                case_sensitive,
            } => {
                if *case_sensitive {
                    method == value
                } else {
                    method.eq_ignore_ascii_case(value)
                }
            }
            CompiledPathMatch::Prefix {
                value,
                case_sensitive,
            } => {
                if *case_sensitive {
                    method.starts_with(value.as_str())
                } else {
                    method
                        .get(..value.len())
                        .is_some_and(|head| head.eq_ignore_ascii_case(value))
                }
            }
            CompiledPathMatch::Regex(re) => re.is_match(method),
        }
    }
}

impl CompiledAction {
    /// Weighted pseudo-random draw over the entries. `None` for plugin
    /// actions or when nothing is drawable.
    pub(crate) fn pick(&self, entropy: &dyn EntropySource) -> Option<&ClusterEntry> {
        match self {
            CompiledAction::WeightedClusters {
                entries,
                prefix_sums,
                total_weight,
                ..
            } => {
                if *total_weight == 0 {
                    return None;
                }
                let target = entropy.next_u64() % total_weight;
                let idx = prefix_sums.partition_point(|&s| s <= target);
                entries.get(idx)
            }
            CompiledAction::Plugin { .. } => None,
        }
    }
}

impl CompiledHeaderMatcher {
    fn matches(&self, value: Option<&str>) -> bool {
        let matched = match (&self.kind, value) {
            (HeaderMatchKind::Present, value) => value.is_some(),
            (_, None) => false,
            (HeaderMatchKind::Exact(expected), Some(v)) => v == expected,
            (HeaderMatchKind::Prefix(prefix), Some(v)) => v.starts_with(prefix.as_str()),
            (HeaderMatchKind::Regex(re), Some(v)) => re.is_match(v),
        };
        matched != self.invert
    }
}

/// Compile one route's match and action. `None` drops the route: invalid
/// regexes (the control plane should have validated them) and unsupported
/// actions never match.
fn compile_route(
    route_match: &RouteMatch,
    action: &RouteAction,
) -> Option<(CompiledPathMatch, Vec<CompiledHeaderMatcher>, CompiledAction)> {
    let path = compile_path(&route_match.path, route_match.case_sensitive)?;

    let mut headers = Vec::with_capacity(route_match.headers.len());
    for matcher in &route_match.headers {
        headers.push(compile_header_matcher(matcher)?);
    }

    let action = match action {
        RouteAction::WeightedClusters {
            clusters,
            hash_policies,
        } => {
            let mut entries = Vec::with_capacity(clusters.len());
            let mut prefix_sums = Vec::with_capacity(clusters.len());
            let mut total: u64 = 0;
            for entry in clusters {
                total = total.saturating_add(entry.weight);
                prefix_sums.push(total);
                entries.push(ClusterEntry {
                    key: Arc::from(format!("cluster:{}", entry.name).as_str()),
                    cluster_name: entry.name.clone(),
                    weight: entry.weight,
                    filter_overrides: entry.filter_overrides.clone(),
                });
            }
            CompiledAction::WeightedClusters {
                entries,
                prefix_sums,
                total_weight: total,
                hash_policies: CompiledHashPolicy::compile(hash_policies),
            }
        }
        RouteAction::ClusterSpecifierPlugin { name, child_policy } => CompiledAction::Plugin {
            key: Arc::from(format!("cluster_specifier_plugin:{}", name).as_str()),
            child_policy: child_policy.clone(),
        },
        RouteAction::Unsupported => return None,
    };

    Some((path, headers, action))
}

fn compile_path(path: &PathMatch, case_sensitive: bool) -> Option<CompiledPathMatch> {
    match path {
        PathMatch::Exact(value) => Some(CompiledPathMatch::Exact {
            value: value.clone(),
            case_sensitive,
        }),
        PathMatch::Prefix(value) => Some(CompiledPathMatch::Prefix {
            value: value.clone(),
            case_sensitive,
        }),
        PathMatch::Regex(pattern) => match compile_full_match_regex(pattern, case_sensitive) {
            Ok(re) => Some(CompiledPathMatch::Regex(re)),
            Err(e) => {
                tracing::warn!("routing: invalid path regex {:?}: {}", pattern, e);
                None
            }
        },
    }
}

fn compile_header_matcher(matcher: &HeaderMatcher) -> Option<CompiledHeaderMatcher> {
    let kind = match matcher.match_type {
        HeaderMatchType::Exact => HeaderMatchKind::Exact(matcher.value.clone()),
        HeaderMatchType::Prefix => HeaderMatchKind::Prefix(matcher.value.clone()),
        HeaderMatchType::Present => HeaderMatchKind::Present,
        HeaderMatchType::Regex => match compile_full_match_regex(&matcher.value, true) {
            Ok(re) => HeaderMatchKind::Regex(re),
            Err(e) => {
                tracing::warn!(
                    "routing: invalid header regex {:?} on {:?}: {}",
                    matcher.value,
                    matcher.name,
                    e
                );
                return None;
            }
        },
    };
    Some(CompiledHeaderMatcher {
        name: matcher.name.to_ascii_lowercase(),
        kind,
        invert: matcher.invert,
    })
}

/// Anchor a pattern so it must cover the whole input.
fn compile_full_match_regex(pattern: &str, case_sensitive: bool) -> Result<Regex, regex::Error> {
    let anchored = if case_sensitive {
        format!("^(?:{})$", pattern)
    } else {
        format!("(?i)^(?:{})$", pattern)
    };
    Regex::new(&anchored)
}

/// Match one domain pattern against the authority. Returns
/// `(tier, literal length)`; higher tiers win, longer literals break ties.
fn domain_match(domain: &str, authority: &str) -> Option<(u8, usize)> {
    if domain == "*" {
        return Some((0, 0));
    }
    if let Some(suffix) = domain.strip_prefix('*') {
        if suffix.contains('*') {
            return None;
        }
        let matched = authority.len() >= suffix.len()
            && authority[authority.len() - suffix.len()..].eq_ignore_ascii_case(suffix);
        return matched.then_some((2, suffix.len()));
    }
    if let Some(prefix) = domain.strip_suffix('*') {
        if prefix.contains('*') {
            return None;
        }
        let matched = authority.len() >= prefix.len()
            && authority[..prefix.len()].eq_ignore_ascii_case(prefix);
        return matched.then_some((1, prefix.len()));
    }
    if domain.contains('*') {
        return None;
    }
    domain
        .eq_ignore_ascii_case(authority)
        .then_some((3, domain.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::hash::SequenceEntropy;
    use crate::xds::{Route, WeightedClusterEntry};

    fn make_route(uri_kind: PathMatch, clusters: Vec<WeightedClusterEntry>) -> Route {
        Route {
            route_match: RouteMatch {
                path: uri_kind,
                ..RouteMatch::default()
            },
            action: RouteAction::WeightedClusters {
                clusters,
                hash_policies: vec![],
            },
            filter_overrides: HashMap::new(),
            max_stream_duration: None,
        }
    }

    fn make_vhost(domains: Vec<&str>, routes: Vec<Route>) -> VirtualHost {
        VirtualHost {
            domains: domains.into_iter().map(String::from).collect(),
            routes,
            filter_overrides: HashMap::new(),
        }
    }

    fn catch_all(cluster: &str) -> Route {
        make_route(
            PathMatch::Prefix(String::new()),
            vec![WeightedClusterEntry::new(cluster, 1)],
        )
    }

    fn first_cluster(table: &RouteTable, authority: &str, info: &RpcInfo) -> Option<String> {
        let entropy = SequenceEntropy::new(vec![0]);
        let vh = table.match_virtual_host(authority)?;
        let route = vh.match_route(info, &entropy)?;
        route
            .action
            .pick(&entropy)
            .map(|e| e.cluster_name.clone())
    }

    #[test]
    fn test_domain_tier_precedence() {
        let table = RouteTable::compile(&[
            make_vhost(vec!["*"], vec![catch_all("any")]),
            make_vhost(vec!["api.*"], vec![catch_all("prefix")]),
            make_vhost(vec!["*.example.com"], vec![catch_all("suffix")]),
            make_vhost(vec!["api.example.com"], vec![catch_all("exact")]),
        ]);
        let info = RpcInfo::new("/svc/m");

        assert_eq!(
            first_cluster(&table, "api.example.com", &info).unwrap(),
            "exact"
        );
        assert_eq!(
            first_cluster(&table, "cdn.example.com", &info).unwrap(),
            "suffix"
        );
        assert_eq!(first_cluster(&table, "api.other.io", &info).unwrap(), "prefix");
        assert_eq!(first_cluster(&table, "unrelated.io", &info).unwrap(), "any");
    }

    #[test]
    fn test_domain_longest_literal_wins_within_tier() {
        let table = RouteTable::compile(&[
            make_vhost(vec!["*.example.com"], vec![catch_all("short")]),
            make_vhost(vec!["*.api.example.com"], vec![catch_all("long")]),
        ]);
        let info = RpcInfo::new("/svc/m");
        assert_eq!(
            first_cluster(&table, "v1.api.example.com", &info).unwrap(),
            "long"
        );
    }

    #[test]
    fn test_domain_tie_goes_to_first_declared() {
        let table = RouteTable::compile(&[
            make_vhost(vec!["svc.example.com"], vec![catch_all("first")]),
            make_vhost(vec!["svc.example.com"], vec![catch_all("second")]),
        ]);
        let info = RpcInfo::new("/svc/m");
        assert_eq!(
            first_cluster(&table, "svc.example.com", &info).unwrap(),
            "first"
        );
    }

    #[test]
    fn test_no_matching_virtual_host() {
        let table = RouteTable::compile(&[make_vhost(
            vec!["svc.example.com"],
            vec![catch_all("c")],
        )]);
        assert!(table.match_virtual_host("other.example.com").is_none());
    }

    #[test]
    fn test_first_matching_route_wins() {
        let table = RouteTable::compile(&[make_vhost(
            vec!["*"],
            vec![
                make_route(
                    PathMatch::Exact("/svc/special".into()),
                    vec![WeightedClusterEntry::new("special", 1)],
                ),
                catch_all("fallback"),
            ],
        )]);
        let entropy = SequenceEntropy::new(vec![0]);
        let vh = table.match_virtual_host("any").unwrap();

        let route = vh
            .match_route(&RpcInfo::new("/svc/special"), &entropy)
            .unwrap();
        assert_eq!(
            route.action.pick(&entropy).unwrap().cluster_name,
            "special"
        );

        let route = vh.match_route(&RpcInfo::new("/svc/other"), &entropy).unwrap();
        assert_eq!(
            route.action.pick(&entropy).unwrap().cluster_name,
            "fallback"
        );
    }

    #[test]
    fn test_empty_prefix_matches_everything() {
        let table = RouteTable::compile(&[make_vhost(vec!["*"], vec![catch_all("c")])]);
        let entropy = SequenceEntropy::new(vec![0]);
        let vh = table.match_virtual_host("x").unwrap();
        assert!(vh.match_route(&RpcInfo::new("/a/b"), &entropy).is_some());
        assert!(vh.match_route(&RpcInfo::new(""), &entropy).is_some());
    }

    #[test]
    fn test_case_insensitive_path_match() {
        let mut route = make_route(
            PathMatch::Prefix("/Svc/".into()),
            vec![WeightedClusterEntry::new("c", 1)],
        );
        route.route_match.case_sensitive = false;
        let table = RouteTable::compile(&[make_vhost(vec!["*"], vec![route])]);
        let entropy = SequenceEntropy::new(vec![0]);
        let vh = table.match_virtual_host("x").unwrap();
        assert!(vh.match_route(&RpcInfo::new("/svc/m"), &entropy).is_some());
        assert!(vh.match_route(&RpcInfo::new("/SVC/m"), &entropy).is_some());
        assert!(vh.match_route(&RpcInfo::new("/other"), &entropy).is_none());
    }

    #[test]
    fn test_regex_path_is_full_match() {
        let route = make_route(
            PathMatch::Regex("/svc/m[0-9]+".into()),
            vec![WeightedClusterEntry::new("c", 1)],
        );
        let table = RouteTable::compile(&[make_vhost(vec!["*"], vec![route])]);
        let entropy = SequenceEntropy::new(vec![0]);
        let vh = table.match_virtual_host("x").unwrap();
        assert!(vh.match_route(&RpcInfo::new("/svc/m42"), &entropy).is_some());
        // Substring matches are not enough.
        assert!(vh
            .match_route(&RpcInfo::new("/svc/m42/extra"), &entropy)
            .is_none());
    }

    #[test]
    fn test_invalid_regex_drops_route() {
        let table = RouteTable::compile(&[make_vhost(
            vec!["*"],
            vec![
                make_route(
                    PathMatch::Regex("(unclosed".into()),
                    vec![WeightedClusterEntry::new("bad", 1)],
                ),
                catch_all("good"),
            ],
        )]);
        let info = RpcInfo::new("/anything");
        assert_eq!(first_cluster(&table, "x", &info).unwrap(), "good");
    }

    #[test]
    fn test_header_matchers_and_semantics() {
        let mut route = catch_all("matched");
        route.route_match.headers = vec![
            HeaderMatcher {
                name: "x-env".into(),
                value: "prod".into(),
                match_type: HeaderMatchType::Exact,
                invert: false,
            },
            HeaderMatcher {
                name: "x-tenant".into(),
                value: "corp-".into(),
                match_type: HeaderMatchType::Prefix,
                invert: false,
            },
        ];
        let table = RouteTable::compile(&[make_vhost(vec!["*"], vec![route])]);
        let entropy = SequenceEntropy::new(vec![0]);
        let vh = table.match_virtual_host("x").unwrap();

        let info = RpcInfo::new("/m")
            .with_metadata("x-env", "prod")
            .with_metadata("x-tenant", "corp-acme");
        assert!(vh.match_route(&info, &entropy).is_some());

        let info = RpcInfo::new("/m").with_metadata("x-env", "prod");
        assert!(vh.match_route(&info, &entropy).is_none());
    }

    #[test]
    fn test_header_present_and_invert() {
        let mut route = catch_all("external");
        route.route_match.headers = vec![HeaderMatcher {
            name: "x-internal".into(),
            value: String::new(),
            match_type: HeaderMatchType::Present,
            invert: true,
        }];
        let table = RouteTable::compile(&[make_vhost(vec!["*"], vec![route])]);
        let entropy = SequenceEntropy::new(vec![0]);
        let vh = table.match_virtual_host("x").unwrap();

        assert!(vh.match_route(&RpcInfo::new("/m"), &entropy).is_some());
        let info = RpcInfo::new("/m").with_metadata("x-internal", "1");
        assert!(vh.match_route(&info, &entropy).is_none());
    }

    #[test]
    fn test_runtime_fraction_gate() {
        let mut route = catch_all("gated");
        route.route_match.runtime_fraction = Some(RuntimeFraction {
            numerator: 25,
            denominator: 100,
        });
        let table = RouteTable::compile(&[make_vhost(vec!["*"], vec![route])]);
        let vh = table.match_virtual_host("x").unwrap();
        let info = RpcInfo::new("/m");

        // Draws 0..24 pass the gate, 25.. do not.
        let entropy = SequenceEntropy::new(vec![24]);
        assert!(vh.match_route(&info, &entropy).is_some());
        let entropy = SequenceEntropy::new(vec![25]);
        assert!(vh.match_route(&info, &entropy).is_none());
    }

    #[test]
    fn test_weighted_pick_exact_distribution() {
        let route = make_route(
            PathMatch::Prefix(String::new()),
            vec![
                WeightedClusterEntry::new("cluster_1", 75),
                WeightedClusterEntry::new("cluster_2", 25),
            ],
        );
        let table = RouteTable::compile(&[make_vhost(vec!["*"], vec![route])]);
        let vh = table.match_virtual_host("x").unwrap();
        let entropy = SequenceEntropy::new((0..100).collect());

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..100 {
            let picked = vh.routes[0].action.pick(&entropy).unwrap();
            *counts.entry(picked.cluster_name.clone()).or_insert(0) += 1;
        }
        assert_eq!(counts["cluster_1"], 75);
        assert_eq!(counts["cluster_2"], 25);
    }

    #[test]
    fn test_zero_weight_entry_never_picked() {
        let route = make_route(
            PathMatch::Prefix(String::new()),
            vec![
                WeightedClusterEntry::new("never", 0),
                WeightedClusterEntry::new("always", 10),
            ],
        );
        let table = RouteTable::compile(&[make_vhost(vec!["*"], vec![route])]);
        let vh = table.match_virtual_host("x").unwrap();
        let entropy = SequenceEntropy::new((0..10).collect());
        for _ in 0..10 {
            assert_eq!(
                vh.routes[0].action.pick(&entropy).unwrap().cluster_name,
                "always"
            );
        }
    }

    #[test]
    fn test_zero_total_weight_route_unmatched() {
        let table = RouteTable::compile(&[make_vhost(
            vec!["*"],
            vec![
                make_route(
                    PathMatch::Prefix(String::new()),
                    vec![WeightedClusterEntry::new("zero", 0)],
                ),
                catch_all("fallback"),
            ],
        )]);
        let info = RpcInfo::new("/m");
        assert_eq!(first_cluster(&table, "x", &info).unwrap(), "fallback");
    }

    #[test]
    fn test_unsupported_action_never_matches() {
        let unsupported = Route {
            route_match: RouteMatch::default(),
            action: RouteAction::Unsupported,
            filter_overrides: HashMap::new(),
            max_stream_duration: None,
        };
        let table = RouteTable::compile(&[make_vhost(
            vec!["*"],
            vec![unsupported, catch_all("fallback")],
        )]);
        let info = RpcInfo::new("/m");
        assert_eq!(first_cluster(&table, "x", &info).unwrap(), "fallback");
    }
}
