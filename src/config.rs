//! Platform configuration with builder pattern

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default directory holding the setup scripts on pool VMs
pub const DEFAULT_SCRIPT_DIR: &str = "/etc/mobiledgex";

/// Bounded polling schedule for the rendezvous handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            max_attempts,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Upper bound on how long a caller can wait
    pub fn bound(&self) -> Duration {
        self.interval() * self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Pool owner key this platform operates on
    pub pool_key: String,
    /// Internal name of the load balancer shared by groups without their own
    pub shared_root_lb_name: String,
    /// Directory of the setup scripts on the VMs
    pub script_dir: String,
    /// Interface passed to the Kubernetes install scripts
    pub network_interface: String,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub ssh_identity_file: Option<String>,
    pub ssh_connect_timeout_secs: u64,
    pub retry: RetryPolicy,
    /// Install Kubernetes workers of one batch concurrently
    pub parallel_node_setup: bool,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            pool_key: String::new(),
            shared_root_lb_name: String::new(),
            script_dir: DEFAULT_SCRIPT_DIR.to_string(),
            network_interface: "ens3".to_string(),
            ssh_user: "ubuntu".to_string(),
            ssh_port: 22,
            ssh_identity_file: None,
            ssh_connect_timeout_secs: 10,
            retry: RetryPolicy::default(),
            parallel_node_setup: false,
        }
    }
}

impl PlatformConfig {
    pub fn builder() -> PlatformConfigBuilder {
        PlatformConfigBuilder::default()
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: PlatformConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.pool_key.is_empty() {
            return Err(crate::Error::Config("pool_key cannot be empty".into()));
        }
        if self.script_dir.is_empty() {
            return Err(crate::Error::Config("script_dir cannot be empty".into()));
        }
        if self.network_interface.is_empty() {
            return Err(crate::Error::Config("network_interface cannot be empty".into()));
        }
        if self.ssh_port == 0 {
            return Err(crate::Error::Config("ssh_port must be non-zero".into()));
        }
        if self.ssh_connect_timeout_secs == 0 {
            return Err(crate::Error::Config("ssh_connect_timeout_secs must be non-zero".into()));
        }
        if self.retry.max_attempts < 1 {
            return Err(crate::Error::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn script(&self, name: &str) -> String {
        format!("{}/{}", self.script_dir.trim_end_matches('/'), name)
    }
}

#[derive(Default)]
pub struct PlatformConfigBuilder {
    config: PlatformConfig,
}

impl PlatformConfigBuilder {
    pub fn pool_key(mut self, key: impl Into<String>) -> Self {
        self.config.pool_key = key.into();
        self
    }

    pub fn shared_root_lb_name(mut self, name: impl Into<String>) -> Self {
        self.config.shared_root_lb_name = name.into();
        self
    }

    pub fn script_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.script_dir = dir.into();
        self
    }

    pub fn network_interface(mut self, iface: impl Into<String>) -> Self {
        self.config.network_interface = iface.into();
        self
    }

    pub fn ssh_user(mut self, user: impl Into<String>) -> Self {
        self.config.ssh_user = user.into();
        self
    }

    pub fn ssh_identity_file(mut self, path: impl Into<String>) -> Self {
        self.config.ssh_identity_file = Some(path.into());
        self
    }

    pub fn ssh_connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.ssh_connect_timeout_secs = secs;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn parallel_node_setup(mut self, enabled: bool) -> Self {
        self.config.parallel_node_setup = enabled;
        self
    }

    pub fn build(self) -> PlatformConfig {
        self.config
    }

    pub fn build_validated(self) -> crate::Result<PlatformConfig> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }
}
