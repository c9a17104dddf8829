use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Deserialize a `T` that implements `Default` — treats JSON `null` the same
/// as a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Bootstrap configuration describing how to reach the xDS control plane
/// and how to derive resource names for this client.
///
/// The resolver itself never dials the control plane; the bootstrap is
/// consulted for authority declarations, listener-name templates, and
/// certificate providers at build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub xds_servers: Vec<XdsServerConfig>,

    /// Template for LDS resource names; `%s` is replaced by the target
    /// endpoint.
    #[serde(default = "default_listener_template")]
    pub client_listener_resource_name_template: String,

    /// Authorities usable in `xds://authority/...` targets.
    #[serde(default)]
    pub authorities: HashMap<String, AuthorityConfig>,

    /// Certificate providers required when a channel asks for xDS-provided
    /// transport security.
    #[serde(default)]
    pub certificate_providers: HashMap<String, CertificateProviderConfig>,

    #[serde(default)]
    pub node: NodeConfig,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            xds_servers: Vec::new(),
            client_listener_resource_name_template: default_listener_template(),
            authorities: HashMap::new(),
            certificate_providers: HashMap::new(),
            node: NodeConfig::default(),
        }
    }
}

fn default_listener_template() -> String {
    "%s".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XdsServerConfig {
    pub server_uri: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub channel_creds: Vec<ChannelCredsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelCredsConfig {
    #[serde(rename = "type")]
    pub creds_type: String,

    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorityConfig {
    /// Per-authority LDS name template; must start with `xdstp://` and
    /// contain `%s`. Falls back to the canonical
    /// `xdstp://<authority>/envoy.config.listener.v3.Listener/%s`.
    #[serde(default)]
    pub client_listener_resource_name_template: Option<String>,

    /// Control-plane servers for this authority; empty means the top-level
    /// servers apply.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub xds_servers: Vec<XdsServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateProviderConfig {
    pub plugin_name: String,

    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub cluster: String,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}
