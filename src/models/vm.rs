//! VM model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lease state of a pool VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmState {
    /// Not owned by any group
    Free,
    /// Claimed or being released, owned by an in-flight operation
    InProgress,
    /// Leased and provisioned
    InUse,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Free => write!(f, "FREE"),
            VmState::InProgress => write!(f, "IN_PROGRESS"),
            VmState::InUse => write!(f, "IN_USE"),
        }
    }
}

/// Network facts about the machine. Empty strings mean "not reachable on that network".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInfo {
    #[serde(default)]
    pub external_ip: String,
    #[serde(default)]
    pub internal_ip: String,
}

impl NetInfo {
    pub fn new(external_ip: impl Into<String>, internal_ip: impl Into<String>) -> Self {
        Self {
            external_ip: external_ip.into(),
            internal_ip: internal_ip.into(),
        }
    }

    pub fn has_external(&self) -> bool {
        !self.external_ip.is_empty()
    }

    pub fn has_internal(&self) -> bool {
        !self.internal_ip.is_empty()
    }
}

/// A member of the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vm {
    /// Stable pool identity
    pub name: String,
    /// Name given by the consumer while leased
    #[serde(default)]
    pub internal_name: String,
    /// Owning workload group
    #[serde(default)]
    pub group_name: String,
    pub state: VmState,
    pub net_info: NetInfo,
    pub updated_at: DateTime<Utc>,
}

impl Vm {
    pub fn new(name: impl Into<String>, net_info: NetInfo) -> Self {
        Self {
            name: name.into(),
            internal_name: String::new(),
            group_name: String::new(),
            state: VmState::Free,
            net_info,
            updated_at: Utc::now(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.state == VmState::Free
    }

    /// Refresh `updated_at`, never moving it backwards
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + Duration::nanoseconds(1)
        };
    }

    /// Return the VM to the pool as if it had never been claimed
    pub fn reset(&mut self) {
        self.state = VmState::Free;
        self.group_name.clear();
        self.internal_name.clear();
        self.touch();
    }

    /// Name to address this VM by: the leased name if any, else the pool name
    pub fn display_name(&self) -> &str {
        if self.internal_name.is_empty() {
            &self.name
        } else {
            &self.internal_name
        }
    }
}

/// An abstract request for one VM
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub internal_name: String,
    #[serde(default)]
    pub external_network: bool,
    #[serde(default)]
    pub internal_network: bool,
}

impl VmSpec {
    pub fn new(internal_name: impl Into<String>) -> Self {
        Self {
            internal_name: internal_name.into(),
            ..Default::default()
        }
    }

    pub fn external(mut self, required: bool) -> Self {
        self.external_network = required;
        self
    }

    pub fn internal(mut self, required: bool) -> Self {
        self.internal_network = required;
        self
    }
}
