pub mod refs;
pub mod service_config;

pub use refs::{ChildPolicy, ClusterRef, ClusterRefSet};
pub use service_config::{build_service_config, EMPTY_SERVICE_CONFIG};
