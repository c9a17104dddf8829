pub mod types;

pub use types::*;

/// Watch-registration surface of the external xDS client.
///
/// The resolver starts one listener watch at build time and follows the
/// listener's reference with at most one route-config watch. Updates and
/// errors flow back through the resolver's callback surface
/// ([`crate::resolver::XdsResolver::on_listener_update`] /
/// [`crate::resolver::XdsResolver::on_route_config_update`]); this trait only
/// carries the subscription bookkeeping.
pub trait XdsClient: Send + Sync {
    fn watch_listener(&self, resource_name: &str);
    fn cancel_listener_watch(&self, resource_name: &str);
    fn watch_route_config(&self, resource_name: &str);
    fn cancel_route_config_watch(&self, resource_name: &str);
}
