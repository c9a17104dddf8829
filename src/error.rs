use std::fmt;

/// Errors surfaced synchronously from `XdsResolverBuilder::build`.
#[derive(Debug)]
pub enum ResolverError {
    /// No xDS client was configured on the builder.
    NoXdsClient,
    /// The dial target could not be parsed or is unsupported.
    InvalidTarget(String),
    /// The target names an authority the bootstrap does not declare.
    UnknownAuthority(String),
    /// xDS credentials were requested but the bootstrap carries no
    /// certificate-provider configuration.
    MissingCertProvider,
    /// The bootstrap configuration is malformed.
    Bootstrap(String),
}

impl fmt::Display for ResolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolverError::NoXdsClient => write!(f, "no xDS client configured"),
            ResolverError::InvalidTarget(msg) => write!(f, "invalid target: {}", msg),
            ResolverError::UnknownAuthority(a) => {
                write!(f, "authority {:?} not declared in bootstrap", a)
            }
            ResolverError::MissingCertProvider => {
                write!(f, "xDS credentials require a certificate provider in bootstrap")
            }
            ResolverError::Bootstrap(msg) => write!(f, "bootstrap error: {}", msg),
        }
    }
}

impl std::error::Error for ResolverError {}

/// Errors delivered by the xDS client alongside a watched resource.
///
/// `ResourceNotFound` is the only kind that retires the active config
/// selector; everything else is reported to the channel and the current
/// configuration keeps serving.
#[derive(Debug, Clone)]
pub enum XdsError {
    /// The watched resource does not exist on the control plane (or was
    /// deleted from it).
    ResourceNotFound(String),
    /// Transient control-plane failure (transport error, NACK, ...).
    ControlPlane(String),
}

impl XdsError {
    pub fn is_resource_not_found(&self) -> bool {
        matches!(self, XdsError::ResourceNotFound(_))
    }
}

impl fmt::Display for XdsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XdsError::ResourceNotFound(name) => write!(f, "resource {:?} does not exist", name),
            XdsError::ControlPlane(msg) => write!(f, "control plane error: {}", msg),
        }
    }
}

impl std::error::Error for XdsError {}

/// gRPC-style status code attached to a per-RPC selection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Unavailable,
    Internal,
}

/// Per-RPC selection failures. These never mutate resolver state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    /// No configuration has been received yet.
    NotReady,
    /// The listener's filter list carried no terminal router filter.
    NoRouter,
    /// The listener names an HTTP filter no registered kind can build.
    UnknownFilter(String),
    /// No virtual host or route matched the RPC.
    NoMatch,
    /// The listener or route configuration was removed from the control
    /// plane; only in-flight RPCs keep their clusters alive.
    ResourceRemoved,
    /// An HTTP filter's builder failed for this RPC.
    FilterBuild(String),
}

impl SelectError {
    /// All selection failures map to `Unavailable`: the RPC may be retried
    /// once the control plane supplies a usable configuration.
    pub fn code(&self) -> StatusCode {
        StatusCode::Unavailable
    }
}

impl fmt::Display for SelectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectError::NotReady => write!(f, "resolver has not received a configuration"),
            SelectError::NoRouter => write!(f, "no router filter in the HTTP filter chain"),
            SelectError::UnknownFilter(name) => write!(f, "unknown HTTP filter {:?}", name),
            SelectError::NoMatch => write!(f, "no matching virtual host / route"),
            SelectError::ResourceRemoved => write!(f, "resource removed"),
            SelectError::FilterBuild(msg) => write!(f, "filter build failed: {}", msg),
        }
    }
}

impl std::error::Error for SelectError {}
