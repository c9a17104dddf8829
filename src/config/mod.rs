pub mod types;


pub use types::*;

use anyhow::Result;
use std::path::Path;

impl BootstrapConfig {
    /// Load the bootstrap from the file named by `XDS_RESOLVER_BOOTSTRAP`,
    /// falling back to `default_path` when the variable is unset or empty.
    pub fn load_from_env(default_path: &Path) -> Result<Self> {
        match std::env::var("XDS_RESOLVER_BOOTSTRAP") {
            Ok(p) if !p.is_empty() => Self::load(Path::new(&p)),
            _ => Self::load(default_path),
        }
    }

    /// Load the bootstrap from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — the resolver can still be driven by an injected xDS
    /// client with zero configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: BootstrapConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported bootstrap format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("bootstrap file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "bootstrap file not found at {}, using defaults",
                path.display()
            );
            BootstrapConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!(
            "loaded bootstrap configuration, servers={}, authorities={}",
            config.xds_servers.len(),
            config.authorities.len()
        );
        Ok(config)
    }

    /// Environment overrides for control-plane connection settings.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("XDS_RESOLVER_SERVER_URI") {
            match self.xds_servers.first_mut() {
                Some(server) => server.server_uri = v,
                None => self.xds_servers.push(XdsServerConfig {
                    server_uri: v,
                    channel_creds: Vec::new(),
                }),
            }
        }
        if let Ok(v) = std::env::var("XDS_RESOLVER_LISTENER_TEMPLATE") {
            self.client_listener_resource_name_template = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        for server in &self.xds_servers {
            if server.server_uri.is_empty() {
                anyhow::bail!("xds server_uri cannot be empty");
            }
        }
        if !self.client_listener_resource_name_template.contains("%s") {
            anyhow::bail!(
                "client_listener_resource_name_template must contain %s, got {:?}",
                self.client_listener_resource_name_template
            );
        }
        for (name, authority) in &self.authorities {
            if let Some(template) = &authority.client_listener_resource_name_template {
                if !template.starts_with("xdstp://") || !template.contains("%s") {
                    anyhow::bail!(
                        "authority {:?} template must be an xdstp:// URI containing %s",
                        name
                    );
                }
            }
        }
        Ok(())
    }
}

/// Process-wide feature gates, read once per built resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureGates {
    /// Authority-prefixed listener names (`xdstp://`).
    pub federation: bool,
    /// Hash-policy evaluation for the ring-hash balancer.
    pub ring_hash: bool,
}

impl FeatureGates {
    pub fn from_env() -> Self {
        Self {
            federation: env_flag("XDS_RESOLVER_FEDERATION"),
            ring_hash: env_flag("XDS_RESOLVER_RING_HASH"),
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(std::env::var(name), Ok(v) if v == "true" || v == "1")
}
