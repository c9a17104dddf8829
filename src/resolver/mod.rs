mod core;


use crate::cluster::ClusterRefSet;
use crate::config::{BootstrapConfig, FeatureGates};
use crate::error::{ResolverError, SelectError, XdsError};
use crate::filter::FilterRegistry;
use crate::routing::{EntropySource, RpcInfo, ThreadRngEntropy};
use crate::selector::{ConfigSelector, RouteSelection};
use crate::xds::{ListenerUpdate, RouteConfigUpdate, XdsClient};
use arc_swap::ArcSwapOption;
use self::core::{ResolverEvent, ResolverWorker};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Parsed `xds://[authority]/endpoint` dial target. Anything past the
/// endpoint is reserved and rejected at parse time by keeping it in the
/// endpoint string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: String,
    pub authority: String,
    pub endpoint: String,
}

impl Target {
    pub fn parse(target: &str) -> Result<Self, ResolverError> {
        let (scheme, rest) = target
            .split_once("://")
            .ok_or_else(|| ResolverError::InvalidTarget(format!("missing scheme in {:?}", target)))?;
        let (authority, endpoint) = match rest.split_once('/') {
            Some((authority, endpoint)) => (authority, endpoint),
            // No path component: the remainder is only an authority.
            None => (rest, ""),
        };
        if endpoint.is_empty() {
            return Err(ResolverError::InvalidTarget(format!(
                "empty endpoint in {:?}",
                target
            )));
        }
        Ok(Self {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            endpoint: endpoint.to_string(),
        })
    }
}

/// State published to the channel: the service-config JSON for the
/// load-balancing tree plus the per-RPC config selector bound to it.
#[derive(Clone)]
pub struct ResolverState {
    pub service_config: String,
    pub selector: Arc<ConfigSelector>,
}

/// Channel-facing surface the resolver publishes through.
pub trait ChannelSink: Send + Sync {
    fn update_state(&self, state: ResolverState);
    /// Transient control-plane errors. The previously published state stays
    /// valid.
    fn report_error(&self, error: XdsError);
}

/// Per-channel options passed to [`XdsResolverBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct ResolverOptions {
    /// Overrides the authority used for virtual-host matching; defaults to
    /// the target endpoint.
    pub authority_override: Option<String>,
    /// The channel wants xDS-provided transport security; requires a
    /// certificate provider in the bootstrap.
    pub use_xds_credentials: bool,
}

/// Builds [`XdsResolver`] instances for `xds://` targets.
pub struct XdsResolverBuilder {
    bootstrap: BootstrapConfig,
    xds_client: Option<Arc<dyn XdsClient>>,
    registry: Arc<FilterRegistry>,
    gates: FeatureGates,
    entropy: Arc<dyn EntropySource>,
    channel_id: u64,
}

impl XdsResolverBuilder {
    pub fn new(bootstrap: BootstrapConfig) -> Self {
        Self {
            bootstrap,
            xds_client: None,
            registry: Arc::new(FilterRegistry::new()),
            gates: FeatureGates::from_env(),
            entropy: Arc::new(ThreadRngEntropy),
            channel_id: rand::thread_rng().gen(),
        }
    }

    pub fn xds_client(mut self, client: Arc<dyn XdsClient>) -> Self {
        self.xds_client = Some(client);
        self
    }

    pub fn filter_registry(mut self, registry: FilterRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn feature_gates(mut self, gates: FeatureGates) -> Self {
        self.gates = gates;
        self
    }

    pub fn entropy(mut self, entropy: Arc<dyn EntropySource>) -> Self {
        self.entropy = entropy;
        self
    }

    pub fn channel_id(mut self, channel_id: u64) -> Self {
        self.channel_id = channel_id;
        self
    }

    /// Build a resolver for `target` and start its listener watch.
    ///
    /// Fails synchronously when no xDS client is configured, the target is
    /// not an `xds://` target, the target authority is not declared in the
    /// bootstrap, or xDS credentials are requested without a
    /// certificate-provider config. Must run inside a Tokio runtime: the
    /// worker draining the resolver's event queue is spawned here.
    pub fn build(
        &self,
        target: &Target,
        channel: Arc<dyn ChannelSink>,
        options: ResolverOptions,
    ) -> Result<XdsResolver, ResolverError> {
        let xds = self
            .xds_client
            .clone()
            .ok_or(ResolverError::NoXdsClient)?;
        if target.scheme != "xds" {
            return Err(ResolverError::InvalidTarget(format!(
                "unsupported scheme {:?}",
                target.scheme
            )));
        }
        if options.use_xds_credentials && self.bootstrap.certificate_providers.is_empty() {
            return Err(ResolverError::MissingCertProvider);
        }
        let listener_name = self.listener_resource_name(target)?;
        let authority = options
            .authority_override
            .clone()
            .unwrap_or_else(|| target.endpoint.clone());

        let closed = Arc::new(AtomicBool::new(false));
        let refs = Arc::new(ClusterRefSet::new());
        let selector_slot = Arc::new(ArcSwapOption::<ConfigSelector>::empty());
        let (events, queue) = mpsc::unbounded_channel();

        {
            // A release reaching zero re-derives the published config, but
            // never after close.
            let events = events.clone();
            let closed = closed.clone();
            refs.set_idle_hook(move || {
                if !closed.load(Ordering::Acquire) {
                    let _ = events.send(ResolverEvent::ReconcileRefs);
                }
            });
        }

        let worker = ResolverWorker::new(
            listener_name.clone(),
            xds.clone(),
            channel,
            refs,
            selector_slot.clone(),
            self.registry.clone(),
            self.entropy.clone(),
            authority,
            self.channel_id,
            self.gates.ring_hash,
            closed.clone(),
        );
        tokio::spawn(worker.run(queue));

        tracing::info!(
            "resolver: built, endpoint={}, listener={}",
            target.endpoint,
            listener_name
        );
        xds.watch_listener(&listener_name);

        Ok(XdsResolver {
            inner: Arc::new(ResolverShared {
                closed,
                events,
                selector: selector_slot,
                listener_name,
            }),
        })
    }

    /// Derive the LDS resource name from the bootstrap's template. A
    /// non-empty target authority must be declared in the bootstrap; with
    /// federation enabled its own template applies.
    fn listener_resource_name(&self, target: &Target) -> Result<String, ResolverError> {
        let template = if target.authority.is_empty() {
            self.bootstrap.client_listener_resource_name_template.clone()
        } else {
            let authority = self
                .bootstrap
                .authorities
                .get(&target.authority)
                .ok_or_else(|| ResolverError::UnknownAuthority(target.authority.clone()))?;
            if self.gates.federation {
                authority
                    .client_listener_resource_name_template
                    .clone()
                    .unwrap_or_else(|| {
                        format!(
                            "xdstp://{}/envoy.config.listener.v3.Listener/%s",
                            target.authority
                        )
                    })
            } else {
                self.bootstrap.client_listener_resource_name_template.clone()
            }
        };
        Ok(template.replace("%s", &target.endpoint))
    }
}

struct ResolverShared {
    closed: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ResolverEvent>,
    selector: Arc<ArcSwapOption<ConfigSelector>>,
    listener_name: String,
}

/// Handle owned by the channel. Cloneable; the xDS client feeds resource
/// updates back through [`on_listener_update`](Self::on_listener_update) /
/// [`on_route_config_update`](Self::on_route_config_update).
///
/// Every inbound callback checks the closed flag first: after
/// [`close`](Self::close) they are silent no-ops and nothing further
/// reaches the channel.
#[derive(Clone)]
pub struct XdsResolver {
    inner: Arc<ResolverShared>,
}

impl std::fmt::Debug for XdsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XdsResolver")
            .field("listener_resource_name", &self.inner.listener_name)
            .finish()
    }
}

impl XdsResolver {
    /// The LDS resource name this resolver watches.
    pub fn listener_resource_name(&self) -> &str {
        &self.inner.listener_name
    }

    /// Decide routing for one RPC on the caller's thread. Reads the current
    /// selector pointer; the event queue is not involved.
    pub fn select_config(&self, info: &RpcInfo) -> Result<RouteSelection, SelectError> {
        match self.inner.selector.load_full() {
            Some(selector) => selector.select_config(info),
            None => Err(SelectError::NotReady),
        }
    }

    pub fn on_listener_update(&self, update: Result<ListenerUpdate, XdsError>) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = self.inner.events.send(ResolverEvent::ListenerUpdate(update));
    }

    pub fn on_route_config_update(
        &self,
        resource_name: impl Into<String>,
        update: Result<RouteConfigUpdate, XdsError>,
    ) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = self.inner.events.send(ResolverEvent::RouteConfigUpdate {
            resource_name: resource_name.into(),
            result: update,
        });
    }

    /// Tear down: cancel watches, release refs, silence all later
    /// callbacks. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.events.send(ResolverEvent::Close);
    }

    /// Wait until every event enqueued so far has been processed.
    #[cfg(test)]
    pub(crate) async fn flush(&self) {
        let (done, waiter) = tokio::sync::oneshot::channel();
        if self.inner.events.send(ResolverEvent::Flush(done)).is_ok() {
            let _ = waiter.await;
        }
    }
}

#[cfg(test)]
mod target_tests {
    use super::*;

    #[test]
    fn test_parse_plain_target() {
        let target = Target::parse("xds:///my-service").unwrap();
        assert_eq!(target.scheme, "xds");
        assert_eq!(target.authority, "");
        assert_eq!(target.endpoint, "my-service");
    }

    #[test]
    fn test_parse_with_authority() {
        let target = Target::parse("xds://traffic-director/my-service").unwrap();
        assert_eq!(target.authority, "traffic-director");
        assert_eq!(target.endpoint, "my-service");
    }

    #[test]
    fn test_parse_rejects_missing_scheme() {
        assert!(matches!(
            Target::parse("my-service"),
            Err(ResolverError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_parse_rejects_empty_endpoint() {
        assert!(matches!(
            Target::parse("xds://authority"),
            Err(ResolverError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_build_requires_xds_client() {
        let builder = XdsResolverBuilder::new(BootstrapConfig::default());
        let target = Target::parse("xds:///svc").unwrap();
        let err = builder
            .build(&target, Arc::new(NullSink), ResolverOptions::default())
            .unwrap_err();
        assert!(matches!(err, ResolverError::NoXdsClient));
    }

    struct NullSink;
    impl ChannelSink for NullSink {
        fn update_state(&self, _state: ResolverState) {}
        fn report_error(&self, _error: XdsError) {}
    }

    struct NullXds;
    impl XdsClient for NullXds {
        fn watch_listener(&self, _resource_name: &str) {}
        fn cancel_listener_watch(&self, _resource_name: &str) {}
        fn watch_route_config(&self, _resource_name: &str) {}
        fn cancel_route_config_watch(&self, _resource_name: &str) {}
    }

    #[test]
    fn test_build_rejects_undeclared_authority() {
        let builder =
            XdsResolverBuilder::new(BootstrapConfig::default()).xds_client(Arc::new(NullXds));
        let target = Target::parse("xds://unknown-authority/svc").unwrap();
        let err = builder
            .build(&target, Arc::new(NullSink), ResolverOptions::default())
            .unwrap_err();
        assert!(matches!(err, ResolverError::UnknownAuthority(a) if a == "unknown-authority"));
    }

    #[test]
    fn test_build_rejects_xds_creds_without_cert_provider() {
        let builder =
            XdsResolverBuilder::new(BootstrapConfig::default()).xds_client(Arc::new(NullXds));
        let target = Target::parse("xds:///svc").unwrap();
        let options = ResolverOptions {
            use_xds_credentials: true,
            ..ResolverOptions::default()
        };
        let err = builder
            .build(&target, Arc::new(NullSink), options)
            .unwrap_err();
        assert!(matches!(err, ResolverError::MissingCertProvider));
    }

    #[test]
    fn test_build_rejects_non_xds_scheme() {
        let builder =
            XdsResolverBuilder::new(BootstrapConfig::default()).xds_client(Arc::new(NullXds));
        let target = Target {
            scheme: "dns".to_string(),
            authority: String::new(),
            endpoint: "svc".to_string(),
        };
        let err = builder
            .build(&target, Arc::new(NullSink), ResolverOptions::default())
            .unwrap_err();
        assert!(matches!(err, ResolverError::InvalidTarget(_)));
    }
}
