//! Per-VM orchestration parameters supplied by the caller

use serde::{Deserialize, Serialize};

use super::vm::VmSpec;

/// What a VM is used for inside its group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmRole {
    /// Load balancer, doubles as the group's jump host
    RootLb,
    /// Kubernetes control plane
    Master,
    /// Kubernetes worker
    Node,
    /// Docker host, no Kubernetes install
    DockerNode,
}

impl std::fmt::Display for VmRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmRole::RootLb => write!(f, "rootlb"),
            VmRole::Master => write!(f, "k8s-master"),
            VmRole::Node => write!(f, "k8s-node"),
            VmRole::DockerNode => write!(f, "docker-node"),
        }
    }
}

/// Config-management (chef) registration for one VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChefParams {
    pub server_path: String,
    pub node_name: String,
    /// PEM client key written to the VM before bootstrap
    pub client_key: String,
}

/// Everything needed to claim and set up one VM of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmParams {
    /// Consumer-facing name; becomes the VM's internal name and hostname
    pub name: String,
    pub role: VmRole,
    #[serde(default)]
    pub external_network: bool,
    #[serde(default)]
    pub chef: Option<ChefParams>,
    #[serde(default)]
    pub access_key: Option<String>,
}

impl VmParams {
    pub fn new(name: impl Into<String>, role: VmRole) -> Self {
        Self {
            name: name.into(),
            role,
            external_network: false,
            chef: None,
            access_key: None,
        }
    }

    pub fn external(mut self, required: bool) -> Self {
        self.external_network = required;
        self
    }

    pub fn chef(mut self, params: ChefParams) -> Self {
        self.chef = Some(params);
        self
    }

    pub fn access_key(mut self, key: impl Into<String>) -> Self {
        self.access_key = Some(key.into());
        self
    }

    /// Every pool VM must sit on the internal network; external is opt-in
    pub fn spec(&self) -> VmSpec {
        VmSpec::new(&self.name)
            .external(self.external_network)
            .internal(true)
    }
}
