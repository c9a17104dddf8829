mod hash;
mod matcher;

pub use hash::{xxh64, EntropySource, ThreadRngEntropy};

pub(crate) use hash::request_hash;
pub(crate) use matcher::{CompiledAction, RouteTable};

#[cfg(test)]
pub(crate) use hash::SequenceEntropy;

use std::collections::HashMap;

/// The RPC being routed: method path plus request metadata.
///
/// Metadata keys are stored lowercased, matching gRPC metadata semantics;
/// pseudo-headers such as `:path` are permitted.
#[derive(Debug, Clone, Default)]
pub struct RpcInfo {
    pub method: String,
    metadata: HashMap<String, String>,
}

impl RpcInfo {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.metadata
            .insert(key.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }
}
