//! VM Pool model

use serde::{Deserialize, Serialize};

use super::vm::{Vm, VmSpec, VmState};

/// The fixed set of machines owned by one site
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmPool {
    /// Owner identifier (site/cloudlet name)
    pub key: String,
    /// Pool members, in pool order
    #[serde(default)]
    pub vms: Vec<Vm>,
}

impl VmPool {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            vms: Vec::new(),
        }
    }

    pub fn with_vm(mut self, vm: Vm) -> Self {
        self.vms.push(vm);
        self
    }

    /// VMs currently owned by a group, in pool order
    pub fn group_vms<'a>(&'a self, group_name: &'a str) -> impl Iterator<Item = &'a Vm> + 'a {
        self.vms.iter().filter(move |vm| vm.group_name == group_name)
    }

    /// Look up a leased VM by the name its consumer gave it
    pub fn find_by_internal_name(&self, internal_name: &str) -> Option<&Vm> {
        self.vms.iter().find(|vm| vm.internal_name == internal_name)
    }

    pub fn status(&self) -> PoolStatus {
        let count = |state: VmState| self.vms.iter().filter(|vm| vm.state == state).count();
        PoolStatus {
            key: self.key.clone(),
            total: self.vms.len(),
            free: count(VmState::Free),
            in_progress: count(VmState::InProgress),
            in_use: count(VmState::InUse),
        }
    }
}

/// Pool status summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub key: String,
    pub total: usize,
    pub free: usize,
    pub in_progress: usize,
    pub in_use: usize,
}

/// Requested or completed action on a rendezvous envelope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmAction {
    #[default]
    None,
    Allocate,
    Release,
    Done,
}

impl std::fmt::Display for VmAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmAction::None => write!(f, "NONE"),
            VmAction::Allocate => write!(f, "ALLOCATE"),
            VmAction::Release => write!(f, "RELEASE"),
            VmAction::Done => write!(f, "DONE"),
        }
    }
}

/// Request/response envelope exchanged with a remote pool agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmPoolInfo {
    /// Pool owner
    pub key: String,
    /// Correlates a response with the request that produced it
    #[serde(default)]
    pub request_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub vm_specs: Vec<VmSpec>,
    #[serde(default)]
    pub action: VmAction,
    /// Claimed or released VMs, filled in by the agent
    #[serde(default)]
    pub vms: Vec<Vm>,
    #[serde(default)]
    pub error: String,
}

impl VmPoolInfo {
    pub fn request(
        key: impl Into<String>,
        group_name: impl Into<String>,
        action: VmAction,
        vm_specs: Vec<VmSpec>,
    ) -> Self {
        Self {
            key: key.into(),
            request_id: Some(uuid::Uuid::new_v4()),
            group_name: group_name.into(),
            vm_specs,
            action,
            vms: Vec::new(),
            error: String::new(),
        }
    }
}
