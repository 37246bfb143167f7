//! Server detail view of a leased VM

use serde::{Deserialize, Serialize};

use super::vm::Vm;

/// Network names reported in server details
pub const EXTERNAL_NETWORK: &str = "external";
pub const INTERNAL_NETWORK: &str = "internal";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIp {
    pub network: String,
    pub external_addr: String,
    pub internal_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDetail {
    pub name: String,
    pub addresses: Vec<ServerIp>,
}

impl ServerDetail {
    /// Build the detail for a leased VM. A VM without an external IP is
    /// reached on its internal address on both networks.
    pub fn from_vm(vm: &Vm) -> Self {
        let internal = vm.net_info.internal_ip.clone();
        let external = if vm.net_info.has_external() {
            vm.net_info.external_ip.clone()
        } else {
            internal.clone()
        };
        let addresses = [EXTERNAL_NETWORK, INTERNAL_NETWORK]
            .iter()
            .map(|network| ServerIp {
                network: network.to_string(),
                external_addr: external.clone(),
                internal_addr: internal.clone(),
            })
            .collect();
        Self {
            name: vm.internal_name.clone(),
            addresses,
        }
    }

    pub fn external_addr(&self) -> Option<&str> {
        self.addresses
            .first()
            .map(|a| a.external_addr.as_str())
            .filter(|a| !a.is_empty())
    }

    pub fn internal_addr(&self) -> Option<&str> {
        self.addresses
            .first()
            .map(|a| a.internal_addr.as_str())
            .filter(|a| !a.is_empty())
    }
}
