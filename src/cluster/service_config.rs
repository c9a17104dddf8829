use super::refs::ChildPolicy;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The empty published state.
pub const EMPTY_SERVICE_CONFIG: &str = "{}";

#[derive(Serialize)]
struct ServiceConfig<'a> {
    #[serde(rename = "loadBalancingConfig")]
    load_balancing_config: [LbPolicy<'a>; 1],
}

#[derive(Serialize)]
struct LbPolicy<'a> {
    #[serde(rename = "xds_cluster_manager_experimental")]
    cluster_manager: ClusterManager<'a>,
}

#[derive(Serialize)]
struct ClusterManager<'a> {
    children: BTreeMap<&'a str, Child>,
}

#[derive(Serialize)]
struct Child {
    #[serde(rename = "childPolicy")]
    child_policy: Value,
}

/// Serialize a cluster snapshot into the service-config JSON consumed by the
/// cluster-manager load balancer.
///
/// The children map is keyed by the snapshot keys in sorted order, so equal
/// cluster sets produce byte-identical documents. An empty snapshot yields
/// the literal `{}`.
pub fn build_service_config(children: &[(Arc<str>, ChildPolicy)]) -> String {
    if children.is_empty() {
        return EMPTY_SERVICE_CONFIG.to_string();
    }

    let children: BTreeMap<&str, Child> = children
        .iter()
        .map(|(key, policy)| {
            let child_policy = match policy {
                ChildPolicy::Cds { cluster } => {
                    json!([{ "cds_experimental": { "cluster": cluster } }])
                }
                ChildPolicy::Plugin(policy) => policy.clone(),
            };
            (&**key, Child { child_policy })
        })
        .collect();

    let config = ServiceConfig {
        load_balancing_config: [LbPolicy {
            cluster_manager: ClusterManager { children },
        }],
    };
    serde_json::to_string(&config).expect("service config serialization is infallible")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cds(name: &str) -> (Arc<str>, ChildPolicy) {
        (
            Arc::from(format!("cluster:{}", name).as_str()),
            ChildPolicy::Cds {
                cluster: name.to_string(),
            },
        )
    }

    #[test]
    fn test_empty_set_is_empty_object() {
        assert_eq!(build_service_config(&[]), "{}");
    }

    #[test]
    fn test_single_cluster_shape() {
        let config = build_service_config(&[cds("test-cluster-1")]);
        assert_eq!(
            config,
            r#"{"loadBalancingConfig":[{"xds_cluster_manager_experimental":{"children":{"cluster:test-cluster-1":{"childPolicy":[{"cds_experimental":{"cluster":"test-cluster-1"}}]}}}}]}"#
        );
    }

    #[test]
    fn test_equal_sets_byte_identical() {
        let a = build_service_config(&[cds("a"), cds("b")]);
        let b = build_service_config(&[cds("a"), cds("b")]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_plugin_child_policy_passthrough() {
        let plugin: (Arc<str>, ChildPolicy) = (
            Arc::from("cluster_specifier_plugin:rls"),
            ChildPolicy::Plugin(json!([{ "rls_experimental": { "lookupService": "rls.example" } }])),
        );
        let config = build_service_config(&[plugin]);
        assert!(config.contains(r#""cluster_specifier_plugin:rls""#));
        assert!(config.contains(r#""rls_experimental""#));
    }

    #[test]
    fn test_children_sorted_by_key() {
        let config = build_service_config(&[cds("a"), cds("z"), cds("m")]);
        let a = config.find("cluster:a").unwrap();
        let m = config.find("cluster:m").unwrap();
        let z = config.find("cluster:z").unwrap();
        assert!(a < m && m < z);
    }
}
