use crate::cluster::{build_service_config, ClusterRefSet};
use crate::error::{SelectError, XdsError};
use crate::filter::FilterRegistry;
use crate::resolver::{ChannelSink, ResolverState};
use crate::routing::EntropySource;
use crate::selector::{ConfigSelector, SelectorContext};
use crate::xds::{ListenerUpdate, RouteConfigUpdate, XdsClient};
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
#[cfg(test)]
use tokio::sync::oneshot;

/// Control events drained in FIFO order by the worker task. The queue is
/// the single serializing executor: it totally orders selector builds and
/// publications against every inbound callback.
pub(crate) enum ResolverEvent {
    ListenerUpdate(Result<ListenerUpdate, XdsError>),
    RouteConfigUpdate {
        resource_name: String,
        result: Result<RouteConfigUpdate, XdsError>,
    },
    /// A cluster refcount reached zero; re-derive the published config.
    ReconcileRefs,
    /// Barrier: answered once every earlier event has been processed.
    #[cfg(test)]
    Flush(oneshot::Sender<()>),
    Close,
}

struct ActiveConfig {
    listener: ListenerUpdate,
    route_config: RouteConfigUpdate,
    selector: Arc<ConfigSelector>,
}

/// Owns the LDS→RDS watch state machine. Lives on a spawned task; all state
/// here is single-owner, no locks.
pub(crate) struct ResolverWorker {
    listener_name: String,
    xds: Arc<dyn XdsClient>,
    channel: Arc<dyn ChannelSink>,
    refs: Arc<ClusterRefSet>,
    selector_slot: Arc<ArcSwapOption<ConfigSelector>>,
    registry: Arc<FilterRegistry>,
    entropy: Arc<dyn EntropySource>,
    authority: String,
    channel_id: u64,
    ring_hash_enabled: bool,
    closed: Arc<AtomicBool>,

    current_listener: Option<ListenerUpdate>,
    rds_name: Option<String>,
    active: Option<ActiveConfig>,
    /// The watched resource was removed; a failing selector is installed
    /// and only in-flight RPCs keep clusters alive.
    removed: bool,
    last_published: Option<String>,
}

#[allow(clippy::too_many_arguments)]
impl ResolverWorker {
    pub(crate) fn new(
        listener_name: String,
        xds: Arc<dyn XdsClient>,
        channel: Arc<dyn ChannelSink>,
        refs: Arc<ClusterRefSet>,
        selector_slot: Arc<ArcSwapOption<ConfigSelector>>,
        registry: Arc<FilterRegistry>,
        entropy: Arc<dyn EntropySource>,
        authority: String,
        channel_id: u64,
        ring_hash_enabled: bool,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            listener_name,
            xds,
            channel,
            refs,
            selector_slot,
            registry,
            entropy,
            authority,
            channel_id,
            ring_hash_enabled,
            closed,
            current_listener: None,
            rds_name: None,
            active: None,
            removed: false,
            last_published: None,
        }
    }

    pub(crate) async fn run(mut self, mut events: mpsc::UnboundedReceiver<ResolverEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ResolverEvent::Close => {
                    self.shutdown();
                    break;
                }
                #[cfg(test)]
                ResolverEvent::Flush(done) => {
                    let _ = done.send(());
                }
                // Events enqueued before close() flipped the flag are
                // drained here without effect.
                _ if self.closed.load(Ordering::Acquire) => {}
                ResolverEvent::ListenerUpdate(result) => self.handle_listener_update(result),
                ResolverEvent::RouteConfigUpdate {
                    resource_name,
                    result,
                } => self.handle_route_config_update(resource_name, result),
                ResolverEvent::ReconcileRefs => self.handle_reconcile(),
            }
        }
    }

    fn handle_listener_update(&mut self, result: Result<ListenerUpdate, XdsError>) {
        metrics::counter!("resolver_updates_total", "kind" => "listener").increment(1);
        let update = match result {
            Ok(update) => update,
            Err(e) if e.is_resource_not_found() => {
                self.handle_listener_removed(e);
                return;
            }
            Err(e) => {
                tracing::warn!("resolver: listener watch error, error={}", e);
                self.channel.report_error(e);
                return;
            }
        };
        tracing::info!(
            "resolver: listener update, route_config_name={:?}, filters={}",
            update.route_config_name,
            update.http_filters.len()
        );

        if let Some(inline) = update.inline_route_config.clone() {
            if let Some(old) = self.rds_name.take() {
                self.xds.cancel_route_config_watch(&old);
            }
            self.current_listener = Some(update.clone());
            self.apply_route_config(update, inline);
            return;
        }

        let Some(name) = update.route_config_name.clone() else {
            let error =
                XdsError::ControlPlane("listener update names no route configuration".to_string());
            tracing::warn!("resolver: {}", error);
            self.channel.report_error(error);
            return;
        };

        if self.rds_name.as_deref() == Some(name.as_str()) {
            // Same RDS resource. When nothing the selector consumes changed,
            // the update is a pure no-op: no rebuild, no publication.
            if let Some(active) = &self.active {
                if active.listener.http_filters == update.http_filters
                    && active.listener.max_stream_duration == update.max_stream_duration
                {
                    tracing::debug!("resolver: no-op listener update, suppressed");
                    self.current_listener = Some(update);
                    return;
                }
                let route_config = active.route_config.clone();
                self.current_listener = Some(update.clone());
                self.apply_route_config(update, route_config);
                return;
            }
            self.current_listener = Some(update);
            return;
        }

        // Route-config name changed (or first listener update): swing the
        // RDS watch. The previous selector keeps serving, refs included,
        // until the new route configuration arrives.
        if let Some(old) = self.rds_name.take() {
            self.xds.cancel_route_config_watch(&old);
        }
        self.current_listener = Some(update);
        self.rds_name = Some(name.clone());
        self.xds.watch_route_config(&name);
    }

    fn handle_route_config_update(
        &mut self,
        resource_name: String,
        result: Result<RouteConfigUpdate, XdsError>,
    ) {
        metrics::counter!("resolver_updates_total", "kind" => "route_config").increment(1);
        if self.rds_name.as_deref() != Some(resource_name.as_str()) {
            // A watch cancelled on this side can still deliver; late
            // callbacks for a resource we no longer follow are dropped.
            tracing::debug!(
                "resolver: update for stale route config {:?}, ignored",
                resource_name
            );
            return;
        }
        let route_config = match result {
            Ok(rc) => rc,
            Err(e) if e.is_resource_not_found() => {
                self.handle_route_config_removed(e);
                return;
            }
            Err(e) => {
                tracing::warn!("resolver: route config watch error, error={}", e);
                self.channel.report_error(e);
                return;
            }
        };
        let Some(listener) = self.current_listener.clone() else {
            return;
        };
        self.apply_route_config(listener, route_config);
    }

    /// Build, install, and publish a selector for `(listener, route_config)`.
    fn apply_route_config(&mut self, listener: ListenerUpdate, route_config: RouteConfigUpdate) {
        if !self.removed {
            if let Some(active) = &self.active {
                if active.route_config == route_config && active.listener == listener {
                    tracing::debug!("resolver: identical route configuration, suppressed");
                    return;
                }
            }
        }

        let ctx = self.selector_context();
        let selector = Arc::new(ConfigSelector::new(&listener, &route_config, &ctx));
        let previous = self.active.replace(ActiveConfig {
            listener,
            route_config,
            selector: selector.clone(),
        });
        self.selector_slot.store(Some(selector.clone()));
        self.removed = false;
        self.publish_current(selector);

        // The replaced selector's construction refs go after the publish,
        // so clusters still serving in-flight RPCs stayed in it.
        if let Some(previous) = previous {
            previous.selector.release_construction_refs();
        }
    }

    fn handle_listener_removed(&mut self, error: XdsError) {
        tracing::warn!("resolver: listener removed from control plane, error={}", error);
        if let Some(old) = self.rds_name.take() {
            self.xds.cancel_route_config_watch(&old);
        }
        self.current_listener = None;
        self.retire_to_failing();
    }

    fn handle_route_config_removed(&mut self, error: XdsError) {
        tracing::warn!(
            "resolver: route configuration removed from control plane, error={}",
            error
        );
        self.retire_to_failing();
    }

    /// Retire the active selector and fail new RPCs, keeping in-flight
    /// RPCs' clusters in the published config until they commit.
    fn retire_to_failing(&mut self) {
        if let Some(previous) = self.active.take() {
            previous.selector.release_construction_refs();
        }
        let failing = Arc::new(ConfigSelector::failing(SelectError::ResourceRemoved));
        self.selector_slot.store(Some(failing.clone()));
        self.removed = true;
        self.publish_current(failing);
    }

    fn handle_reconcile(&mut self) {
        if self.last_published.is_none() {
            return;
        }
        let Some(selector) = self.selector_slot.load_full() else {
            return;
        };
        self.refs.publish();
        let config = build_service_config(&self.refs.snapshot());
        if self.last_published.as_deref() == Some(config.as_str()) {
            return;
        }
        self.publish_current(selector);
    }

    fn publish_current(&mut self, selector: Arc<ConfigSelector>) {
        self.refs.publish();
        let snapshot = self.refs.snapshot();
        let config = build_service_config(&snapshot);
        metrics::counter!("resolver_publications_total").increment(1);
        metrics::gauge!("resolver_active_clusters").set(snapshot.len() as f64);
        tracing::info!(
            "resolver: published service config, clusters={}",
            snapshot.len()
        );
        self.last_published = Some(config.clone());
        self.channel.update_state(ResolverState {
            service_config: config,
            selector,
        });
    }

    fn shutdown(&mut self) {
        tracing::info!("resolver: closing, listener={}", self.listener_name);
        self.xds.cancel_listener_watch(&self.listener_name);
        if let Some(rds) = self.rds_name.take() {
            self.xds.cancel_route_config_watch(&rds);
        }
        if let Some(active) = self.active.take() {
            active.selector.release_construction_refs();
        }
        self.selector_slot.store(None);
    }

    fn selector_context(&self) -> SelectorContext {
        SelectorContext {
            refs: self.refs.clone(),
            registry: self.registry.clone(),
            entropy: self.entropy.clone(),
            authority: self.authority.clone(),
            channel_id: self.channel_id,
            ring_hash_enabled: self.ring_hash_enabled,
        }
    }
}
