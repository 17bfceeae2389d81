//! Settings collaborator.
//!
//! The host never owns user-facing configuration; it consumes it through
//! this narrow interface.

/// Proxy endpoint configuration, e.g. `http://127.0.0.1:7890`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub url: String,
}

impl ProxyConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// Read-only view of the host settings the plugin pipeline depends on.
pub trait Settings: Send + Sync {
    /// Whether the user has turned the proxy on.
    fn proxy_enabled(&self) -> bool;

    /// The configured proxy endpoint, if any.
    fn proxy(&self) -> Option<ProxyConfig>;

    /// Desired bulk-load parallelism (chunk size); values below 1 are
    /// treated as 1.
    fn parallelism(&self) -> usize;
}

/// Fixed settings, used in tests and by embedders without live settings.
#[derive(Debug, Clone)]
pub struct StaticSettings {
    pub enable_proxy: bool,
    pub proxy: Option<ProxyConfig>,
    pub parallelism: usize,
}

impl Default for StaticSettings {
    fn default() -> Self {
        Self {
            enable_proxy: false,
            proxy: None,
            parallelism: 4,
        }
    }
}

impl Settings for StaticSettings {
    fn proxy_enabled(&self) -> bool {
        self.enable_proxy
    }

    fn proxy(&self) -> Option<ProxyConfig> {
        self.proxy.clone()
    }

    fn parallelism(&self) -> usize {
        self.parallelism
    }
}
