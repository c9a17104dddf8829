//! xDS-based name resolution for gRPC-style channels.
//!
//! The resolver turns an `xds:///service` dial target into a dynamically
//! updated routing configuration: it follows a Listener (LDS) watch to a
//! RouteConfiguration (RDS) watch on an injected xDS client, compiles each
//! accepted configuration into an immutable per-RPC [`ConfigSelector`], and
//! publishes the matching cluster-manager service config to the channel.
//! Clusters referenced by in-flight RPCs are reference-counted so no
//! publication ever drops a cluster an uncommitted RPC still needs.

pub mod cluster;
pub mod config;
pub mod error;
pub mod filter;
pub mod resolver;
pub mod routing;
pub mod selector;
pub mod xds;

pub use cluster::{build_service_config, ChildPolicy, ClusterRefSet, EMPTY_SERVICE_CONFIG};
pub use config::{BootstrapConfig, FeatureGates};
pub use error::{ResolverError, SelectError, StatusCode, XdsError};
pub use filter::{FilterChain, FilterRegistry, HttpFilterKind, InterceptorChain, StreamFilter};
pub use resolver::{
    ChannelSink, ResolverOptions, ResolverState, Target, XdsResolver, XdsResolverBuilder,
};
pub use routing::{xxh64, EntropySource, RpcInfo, ThreadRngEntropy};
pub use selector::{ConfigSelector, RouteSelection};
pub use xds::{
    FilterDescriptor, HashPolicy, HashPolicyKind, HeaderMatchType, HeaderMatcher, ListenerUpdate,
    PathMatch, Route, RouteAction, RouteConfigUpdate, RouteMatch, RuntimeFraction, VirtualHost,
    WeightedClusterEntry, XdsClient,
};
