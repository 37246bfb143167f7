//! SSH sessions over the `openssh` crate
//!
//! Provisioning is synchronous, so each call blocks on a runtime owned by
//! the connector. Hops are separate sessions routed through the chain of
//! jump hosts that led to them.

use std::sync::Arc;
use std::time::Duration;

use openssh::{KnownHosts, Session, SessionBuilder};
use tokio::runtime::Runtime;

use super::{SshClient, SshConnector};
use crate::config::PlatformConfig;
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct Settings {
    user: String,
    port: u16,
    identity_file: Option<String>,
    connect_timeout: Duration,
}

impl Settings {
    /// `ssh://` destination for a host, as jump host chains expect it
    fn destination(&self, host: &str, port: u16) -> String {
        format!("ssh://{}@{}:{}", self.user, host, port)
    }

    fn builder(&self, jumps: &[String], port: u16) -> SessionBuilder {
        let mut builder = SessionBuilder::default();
        builder
            .known_hosts_check(KnownHosts::Accept)
            .connect_timeout(self.connect_timeout)
            .user(self.user.clone())
            .port(port);
        if let Some(identity) = &self.identity_file {
            builder.keyfile(identity);
        }
        if !jumps.is_empty() {
            builder.jump_hosts(jumps);
        }
        builder
    }
}

/// Connector opening `openssh` sessions, chaining hops as jump hosts
#[derive(Clone)]
pub struct OpenSshConnector {
    settings: Arc<Settings>,
    runtime: Arc<Runtime>,
}

impl OpenSshConnector {
    pub fn new(user: impl Into<String>, port: u16) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        Ok(Self {
            settings: Arc::new(Settings {
                user: user.into(),
                port,
                identity_file: None,
                connect_timeout: Duration::from_secs(10),
            }),
            runtime: Arc::new(runtime),
        })
    }

    pub fn from_config(config: &PlatformConfig) -> Result<Self> {
        let mut connector = Self::new(&config.ssh_user, config.ssh_port)?
            .connect_timeout_secs(config.ssh_connect_timeout_secs);
        if let Some(identity) = &config.ssh_identity_file {
            connector = connector.identity_file(identity);
        }
        Ok(connector)
    }

    pub fn identity_file(mut self, path: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.settings).identity_file = Some(path.into());
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        Arc::make_mut(&mut self.settings).connect_timeout = Duration::from_secs(secs);
        self
    }

    fn open(&self, jumps: Vec<String>, host: &str, port: u16) -> Result<OpenSshClient> {
        let builder = self.settings.builder(&jumps, port);
        let session = self
            .runtime
            .block_on(builder.connect(host))
            .map_err(|e| Error::Ssh(format!("connection to {}:{} failed: {}", host, port, e)))?;
        tracing::debug!(host = %host, port, hops = jumps.len(), "SSH session established");

        Ok(OpenSshClient {
            connector: self.clone(),
            session,
            jumps,
            host: host.to_string(),
            port,
        })
    }
}

impl SshConnector for OpenSshConnector {
    fn connect(&self, addr: &str) -> Result<Box<dyn SshClient>> {
        Ok(Box::new(self.open(Vec::new(), addr, self.settings.port)?))
    }
}

struct OpenSshClient {
    connector: OpenSshConnector,
    session: Session,
    /// Jump hosts in connection order
    jumps: Vec<String>,
    host: String,
    port: u16,
}

impl OpenSshClient {
    /// Jump chain for a host reached through this session
    fn hop_chain(&self) -> Vec<String> {
        let mut jumps = self.jumps.clone();
        jumps.push(self.connector.settings.destination(&self.host, self.port));
        jumps
    }
}

impl SshClient for OpenSshClient {
    fn output(&self, cmd: &str) -> Result<String> {
        let output = self
            .connector
            .runtime
            .block_on(self.session.raw_command(cmd).output())
            .map_err(|e| Error::Ssh(format!("failed to run command on {}: {}", self.host, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(Error::Ssh(format!(
                "Exit code: {:?}, stderr: {}, stdout: {}",
                output.status.code(),
                stderr.trim(),
                stdout.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn add_hop(&self, host: &str, port: u16) -> Result<Box<dyn SshClient>> {
        Ok(Box::new(self.connector.open(self.hop_chain(), host, port)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination() {
        let connector = OpenSshConnector::new("ubuntu", 22).unwrap();
        assert_eq!(
            connector.settings.destination("10.0.0.1", 2222),
            "ssh://ubuntu@10.0.0.1:2222"
        );
    }

    #[test]
    fn test_from_config() {
        let config = PlatformConfig::builder()
            .pool_key("site-a")
            .ssh_user("root")
            .ssh_identity_file("/keys/pool")
            .build();
        let connector = OpenSshConnector::from_config(&config).unwrap();
        assert_eq!(connector.settings.user, "root");
        assert_eq!(connector.settings.port, 22);
        assert_eq!(connector.settings.identity_file.as_deref(), Some("/keys/pool"));
        assert_eq!(connector.settings.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_connect_timeout_override() {
        let connector = OpenSshConnector::new("ubuntu", 22)
            .unwrap()
            .connect_timeout_secs(3);
        assert_eq!(connector.settings.connect_timeout, Duration::from_secs(3));
    }
}
