use crate::cluster::{ChildPolicy, ClusterRef, ClusterRefSet};
use crate::error::SelectError;
use crate::filter::{FilterChain, FilterError, FilterRegistry, InterceptorChain};
use crate::routing::{request_hash, CompiledAction, EntropySource, RouteTable, RpcInfo};
use crate::xds::{ListenerUpdate, RouteConfigUpdate};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Everything a selector build needs from the resolver.
pub(crate) struct SelectorContext {
    pub(crate) refs: Arc<ClusterRefSet>,
    pub(crate) registry: Arc<FilterRegistry>,
    pub(crate) entropy: Arc<dyn EntropySource>,
    /// Target authority used for virtual-host selection.
    pub(crate) authority: String,
    pub(crate) channel_id: u64,
    pub(crate) ring_hash_enabled: bool,
}

/// Immutable per-RPC decision object bound to one published service config.
///
/// A selector is built from one accepted listener + route-config pair. It
/// pins a construction reference on every cluster its routes name; those
/// refs are released by the resolver when the selector is replaced. Per-RPC
/// references taken in [`select_config`](Self::select_config) outlive the
/// selector until the RPC commits.
pub struct ConfigSelector {
    state: SelectorState,
    construction_refs: Mutex<Vec<ClusterRef>>,
}

enum SelectorState {
    Active(Box<ActiveSelector>),
    /// Every selection fails with the stored error.
    Failing(SelectError),
}

struct ActiveSelector {
    table: RouteTable,
    chain: FilterChain,
    authority: String,
    refs: Arc<ClusterRefSet>,
    entropy: Arc<dyn EntropySource>,
    channel_id: u64,
    ring_hash_enabled: bool,
    default_max_stream_duration: Option<Duration>,
}

impl ConfigSelector {
    pub(crate) fn new(
        listener: &ListenerUpdate,
        route_config: &RouteConfigUpdate,
        ctx: &SelectorContext,
    ) -> Self {
        let table = RouteTable::compile(&route_config.virtual_hosts);

        // One construction ref per distinct cluster key across all routes.
        let mut distinct: BTreeMap<Arc<str>, ChildPolicy> = BTreeMap::new();
        for vhost in table.virtual_hosts() {
            for route in &vhost.routes {
                match &route.action {
                    CompiledAction::WeightedClusters { entries, .. } => {
                        for entry in entries {
                            distinct.entry(entry.key.clone()).or_insert_with(|| {
                                ChildPolicy::Cds {
                                    cluster: entry.cluster_name.clone(),
                                }
                            });
                        }
                    }
                    CompiledAction::Plugin { key, child_policy } => {
                        distinct
                            .entry(key.clone())
                            .or_insert_with(|| ChildPolicy::Plugin(child_policy.clone()));
                    }
                }
            }
        }
        let construction_refs: Vec<ClusterRef> = distinct
            .into_iter()
            .map(|(key, policy)| ctx.refs.acquire(&key, policy))
            .collect();

        let state = match FilterChain::compile(&listener.http_filters, &ctx.registry) {
            Ok(chain) => SelectorState::Active(Box::new(ActiveSelector {
                table,
                chain,
                authority: ctx.authority.clone(),
                refs: ctx.refs.clone(),
                entropy: ctx.entropy.clone(),
                channel_id: ctx.channel_id,
                ring_hash_enabled: ctx.ring_hash_enabled,
                default_max_stream_duration: listener.max_stream_duration,
            })),
            Err(e) => {
                tracing::warn!("resolver: filter chain rejected, error={}", e);
                SelectorState::Failing(match e {
                    FilterError::NoRouter => SelectError::NoRouter,
                    FilterError::UnknownFilter(name) => SelectError::UnknownFilter(name),
                    FilterError::Build { .. } => SelectError::FilterBuild(e.to_string()),
                })
            }
        };

        Self {
            state,
            construction_refs: Mutex::new(construction_refs),
        }
    }

    /// Selector that fails every RPC with `error` and holds no refs. Used
    /// after the watched resource is removed from the control plane.
    pub(crate) fn failing(error: SelectError) -> Self {
        Self {
            state: SelectorState::Failing(error),
            construction_refs: Mutex::new(Vec::new()),
        }
    }

    /// Decide routing for one RPC.
    pub fn select_config(&self, info: &RpcInfo) -> Result<RouteSelection, SelectError> {
        let active = match &self.state {
            SelectorState::Failing(error) => return Err(error.clone()),
            SelectorState::Active(active) => active,
        };

        let vhost = active
            .table
            .match_virtual_host(&active.authority)
            .ok_or(SelectError::NoMatch)?;
        let route = vhost
            .match_route(info, active.entropy.as_ref())
            .ok_or(SelectError::NoMatch)?;

        let empty_overrides = HashMap::new();
        let (picked_cluster, rpc_refs, hash, cluster_overrides) = match &route.action {
            CompiledAction::WeightedClusters {
                entries,
                hash_policies,
                ..
            } => {
                let picked = route
                    .action
                    .pick(active.entropy.as_ref())
                    .ok_or(SelectError::NoMatch)?;
                // Every entry of the weighted set keeps a ref until the RPC
                // commits, so overrides referencing unchosen clusters stay
                // valid across config swaps.
                let refs: Vec<ClusterRef> = entries
                    .iter()
                    .map(|entry| {
                        active.refs.acquire(
                            &entry.key,
                            ChildPolicy::Cds {
                                cluster: entry.cluster_name.clone(),
                            },
                        )
                    })
                    .collect();
                let hash = active.ring_hash_enabled.then(|| {
                    request_hash(
                        hash_policies,
                        info,
                        active.channel_id,
                        active.entropy.as_ref(),
                    )
                });
                (picked.key.clone(), refs, hash, &picked.filter_overrides)
            }
            CompiledAction::Plugin { key, child_policy } => {
                let refs = vec![active
                    .refs
                    .acquire(key, ChildPolicy::Plugin(child_policy.clone()))];
                (key.clone(), refs, None, &empty_overrides)
            }
        };

        let interceptor = active
            .chain
            .instantiate(
                &vhost.filter_overrides,
                &route.filter_overrides,
                cluster_overrides,
            )
            .map_err(|e| SelectError::FilterBuild(e.to_string()))?;

        let method_timeout = match route.max_stream_duration {
            // An explicit zero disables the listener-level default.
            Some(d) if d.is_zero() => None,
            Some(d) => Some(d),
            None => active.default_max_stream_duration,
        };

        Ok(RouteSelection {
            picked_cluster,
            request_hash: hash,
            interceptor,
            method_timeout,
            committed: AtomicBool::new(false),
            rpc_refs: Mutex::new(rpc_refs),
        })
    }

    /// Drop the refs taken at construction. Called by the resolver exactly
    /// when this selector is replaced or torn down; per-RPC refs are
    /// untouched.
    pub(crate) fn release_construction_refs(&self) {
        let refs = std::mem::take(&mut *self.construction_refs.lock().unwrap());
        drop(refs);
    }

    #[cfg(test)]
    pub(crate) fn is_failing(&self) -> bool {
        matches!(self.state, SelectorState::Failing(_))
    }
}

/// The routing decision handed to the channel for one RPC.
pub struct RouteSelection {
    picked_cluster: Arc<str>,
    request_hash: Option<u64>,
    interceptor: InterceptorChain,
    method_timeout: Option<Duration>,
    committed: AtomicBool,
    rpc_refs: Mutex<Vec<ClusterRef>>,
}

impl std::fmt::Debug for RouteSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteSelection")
            .field("picked_cluster", &self.picked_cluster)
            .field("request_hash", &self.request_hash)
            .field("method_timeout", &self.method_timeout)
            .field("committed", &self.committed.load(Ordering::Relaxed))
            .finish()
    }
}

impl RouteSelection {
    /// Service-config child key the RPC is routed to (`cluster:<name>`).
    pub fn picked_cluster(&self) -> &str {
        &self.picked_cluster
    }

    /// 64-bit request hash for consistent-hash balancing, when enabled.
    pub fn request_hash(&self) -> Option<u64> {
        self.request_hash
    }

    pub fn interceptor(&self) -> &InterceptorChain {
        &self.interceptor
    }

    pub fn method_timeout(&self) -> Option<Duration> {
        self.method_timeout
    }

    /// Release the refs taken for this RPC. Idempotent; also runs on drop,
    /// so an abandoned selection cannot pin clusters forever.
    pub fn commit(&self) {
        if !self.committed.swap(true, Ordering::AcqRel) {
            self.rpc_refs.lock().unwrap().clear();
        }
    }
}

impl Drop for RouteSelection {
    fn drop(&mut self) {
        self.commit();
    }
}
