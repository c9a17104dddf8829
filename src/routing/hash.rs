use crate::routing::RpcInfo;
use crate::xds::{HashPolicy, HashPolicyKind, CHANNEL_ID_FILTER_STATE_KEY};
use rand::Rng;
use regex::Regex;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Injectable 64-bit random source shared by the weighted-cluster draw, the
/// runtime-fraction gate, and the hash fallback, so tests can install a
/// deterministic generator and assert exact distributions.
pub trait EntropySource: Send + Sync {
    fn next_u64(&self) -> u64;
}

/// Default entropy source backed by the thread-local RNG.
pub struct ThreadRngEntropy;

impl EntropySource for ThreadRngEntropy {
    fn next_u64(&self) -> u64 {
        rand::thread_rng().gen()
    }
}

/// xxh64 with seed 0 — the hash applied to hash-policy values.
pub fn xxh64(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

pub(crate) struct CompiledHashPolicy {
    kind: CompiledHashPolicyKind,
    terminal: bool,
}

enum CompiledHashPolicyKind {
    Header {
        /// Lowercased metadata key.
        name: String,
        rewrite: Option<(Regex, String)>,
    },
    ChannelId,
    FilterState {
        key: String,
    },
}

impl CompiledHashPolicy {
    /// Compile the declared policies. A policy with an invalid rewrite regex
    /// is dropped (the control plane should have validated it).
    pub(crate) fn compile(policies: &[HashPolicy]) -> Vec<CompiledHashPolicy> {
        let mut compiled = Vec::with_capacity(policies.len());
        for policy in policies {
            let kind = match &policy.kind {
                HashPolicyKind::Header {
                    header_name,
                    regex,
                    regex_substitution,
                } => {
                    let rewrite = match (regex, regex_substitution) {
                        (Some(pattern), Some(substitution)) => match Regex::new(pattern) {
                            Ok(re) => Some((re, substitution.clone())),
                            Err(e) => {
                                tracing::warn!(
                                    "routing: invalid hash rewrite regex {:?}: {}",
                                    pattern,
                                    e
                                );
                                continue;
                            }
                        },
                        _ => None,
                    };
                    CompiledHashPolicyKind::Header {
                        name: header_name.to_ascii_lowercase(),
                        rewrite,
                    }
                }
                HashPolicyKind::ChannelId => CompiledHashPolicyKind::ChannelId,
                HashPolicyKind::FilterState { key } => CompiledHashPolicyKind::FilterState {
                    key: key.clone(),
                },
            };
            compiled.push(CompiledHashPolicy {
                kind,
                terminal: policy.terminal,
            });
        }
        compiled
    }

    fn evaluate(&self, info: &RpcInfo, channel_id: u64) -> Option<u64> {
        match &self.kind {
            CompiledHashPolicyKind::Header { name, rewrite } => {
                let value = info.metadata(name).or_else(|| {
                    // :path is synthesized from the method when absent.
                    (name == ":path").then_some(info.method.as_str())
                })?;
                let value = match rewrite {
                    Some((re, substitution)) => re.replace_all(value, substitution.as_str()),
                    None => value.into(),
                };
                Some(xxh64(value.as_bytes()))
            }
            CompiledHashPolicyKind::ChannelId => Some(channel_id),
            CompiledHashPolicyKind::FilterState { key } => {
                (key == CHANNEL_ID_FILTER_STATE_KEY).then_some(channel_id)
            }
        }
    }
}

/// Fold the policies into the request hash: `H := H*31 + h` over every
/// policy that produced a value, stopping after the first terminal one that
/// did. When none contributed, a fresh random value is drawn so the
/// consistent-hash balancer still spreads load.
pub(crate) fn request_hash(
    policies: &[CompiledHashPolicy],
    info: &RpcInfo,
    channel_id: u64,
    entropy: &dyn EntropySource,
) -> u64 {
    let mut hash: u64 = 0;
    let mut contributed = false;
    for policy in policies {
        if let Some(value) = policy.evaluate(info, channel_id) {
            hash = hash.wrapping_mul(31).wrapping_add(value);
            contributed = true;
            if policy.terminal {
                break;
            }
        }
    }
    if contributed {
        hash
    } else {
        entropy.next_u64()
    }
}

/// Deterministic entropy for tests: yields the configured values in order,
/// cycling.
#[cfg(test)]
pub(crate) struct SequenceEntropy {
    values: Vec<u64>,
    next: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl SequenceEntropy {
    pub(crate) fn new(values: Vec<u64>) -> Self {
        assert!(!values.is_empty());
        Self {
            values,
            next: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

#[cfg(test)]
impl EntropySource for SequenceEntropy {
    fn next_u64(&self) -> u64 {
        let idx = self
            .next
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.values[idx % self.values.len()]
    }
}
