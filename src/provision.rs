//! Remote setup and teardown of leased machines
//!
//! Every command goes through a jump host: the group's root load balancer
//! on creation, any of the group's externally reachable VMs (or the shared
//! load balancer) on deletion. Machines are prepared one at a time in
//! claimed order, then the Kubernetes master is installed before any worker.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::PlatformConfig;
use crate::models::{ServerDetail, Vm, VmParams, VmPool, VmRole};
use crate::ssh::{self, SshClient, SshConnector};
use crate::{Error, Result};

const ACCESS_KEY_DIR: &str = "/root/accesskey";
const MAX_HOSTNAME_LEN: usize = 63;

/// Address details of the leased VM named `name`
pub fn server_detail(pool: &VmPool, name: &str) -> Result<ServerDetail> {
    pool.find_by_internal_name(name)
        .filter(|vm| !vm.is_free())
        .map(ServerDetail::from_vm)
        .ok_or_else(|| Error::ServerNotFound(name.to_string()))
}

/// Hostname for a VM name: the first DNS label, lower-cased, restricted to
/// `[a-z0-9-]`.
pub fn sanitize_hostname(name: &str) -> String {
    let label = name.split('.').next().unwrap_or_default();
    let mapped: String = label
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let truncated: String = mapped.trim_matches('-').chars().take(MAX_HOSTNAME_LEN).collect();
    truncated.trim_end_matches('-').to_string()
}

/// A client reached for one VM, either the jump host itself or a hop
/// through it
enum Session<'a> {
    Jump(&'a dyn SshClient),
    Hop(Box<dyn SshClient>),
}

impl Session<'_> {
    fn client(&self) -> &dyn SshClient {
        match self {
            Session::Jump(client) => *client,
            Session::Hop(client) => client.as_ref(),
        }
    }
}

/// Runs the remote scripts that turn a claimed VM into a group member
/// and back
pub struct Provisioner {
    config: PlatformConfig,
    connector: Arc<dyn SshConnector>,
}

impl Provisioner {
    pub fn new(config: PlatformConfig, connector: Arc<dyn SshConnector>) -> Self {
        Self { config, connector }
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    /// Prepare a freshly claimed batch.
    ///
    /// `params` covers the whole group, so a master outside this batch can
    /// still be found for new workers. `pool` is the current pool view used
    /// for server-detail lookups.
    pub fn setup_vms(
        &self,
        pool: &VmPool,
        vms: &[Vm],
        params: &[VmParams],
        root_lb_name: &str,
    ) -> Result<()> {
        if vms.is_empty() {
            return Ok(());
        }
        let by_name: HashMap<&str, &VmParams> = params.iter().map(|p| (p.name.as_str(), p)).collect();

        let jump_addr = self.setup_jump_addr(pool, vms, root_lb_name)?;
        let jump = self.connector.connect(&jump_addr).map_err(|e| {
            Error::Provisioning(format!("can't get rootlb ssh client for {}: {}", jump_addr, e))
        })?;
        tracing::info!(rootlb = %root_lb_name, addr = %jump_addr, vms = vms.len(), "Setting up VMs");

        let mut prepared = Vec::with_capacity(vms.len());
        for vm in vms {
            let vm_params = by_name.get(vm.internal_name.as_str()).copied().ok_or_else(|| {
                Error::Provisioning(format!("missing role for vm {}", vm.internal_name))
            })?;
            let session = self.session(jump.as_ref(), &jump_addr, vm)?;
            self.prepare_vm(session.client(), vm, vm_params)?;
            prepared.push((vm, vm_params.role, session));
        }

        let master_addr = match prepared.iter().find(|(_, role, _)| *role == VmRole::Master) {
            Some((vm, _, session)) => {
                let addr = vm.net_info.internal_ip.as_str();
                if addr.is_empty() {
                    return Err(Error::MissingNetworkInfo(format!(
                        "master vm {} has no internal IP",
                        vm.internal_name
                    )));
                }
                self.install_master(session.client(), vm, addr)?;
                Some(addr.to_string())
            }
            None => None,
        };

        let nodes: Vec<(&Vm, &dyn SshClient)> = prepared
            .iter()
            .filter(|(_, role, _)| *role == VmRole::Node)
            .map(|(vm, _, session)| (*vm, session.client()))
            .collect();
        if nodes.is_empty() {
            return Ok(());
        }

        let master_addr = match master_addr {
            Some(addr) => addr,
            None => match params.iter().find(|p| p.role == VmRole::Master) {
                Some(master) => server_detail(pool, &master.name)?
                    .internal_addr()
                    .map(str::to_string)
                    .ok_or_else(|| {
                        Error::MissingNetworkInfo(format!("unable to find master IP for {}", master.name))
                    })?,
                None => {
                    tracing::warn!(nodes = nodes.len(), "No master in group, skipping worker setup");
                    return Ok(());
                }
            },
        };

        self.install_nodes(&nodes, &master_addr)
    }

    /// Clean released VMs so they can go back to the pool.
    ///
    /// `group_vms` are all VMs of the group, used to pick the jump host.
    /// An unreachable jump host skips the teardown; the cleanup script runs
    /// again on the next claim. A VM unreachable through the jump host fails
    /// the teardown.
    pub fn teardown_vms(&self, pool: &VmPool, vms: &[Vm], group_vms: &[Vm]) -> Result<()> {
        if vms.is_empty() {
            return Ok(());
        }

        let jump_addr = vms
            .iter()
            .chain(group_vms)
            .find(|vm| vm.net_info.has_external())
            .map(|vm| vm.net_info.external_ip.clone())
            .or_else(|| {
                server_detail(pool, &self.config.shared_root_lb_name)
                    .ok()
                    .and_then(|sd| sd.external_addr().map(str::to_string))
            });
        let Some(jump_addr) = jump_addr else {
            tracing::warn!(vms = vms.len(), "No jump host for teardown, skipping cleanup");
            return Ok(());
        };
        let jump = match self.connector.connect(&jump_addr) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(addr = %jump_addr, error = %e, "Can't reach jump host, skipping cleanup");
                return Ok(());
            }
        };

        for vm in vms {
            let session = self.session(jump.as_ref(), &jump_addr, vm).inspect_err(|e| {
                tracing::error!(vm = %vm.display_name(), addr = %jump_addr, error = %e, "Can't reach VM for cleanup");
            })?;
            let client = session.client();
            self.cleanup(client, vm)?;
            if let Err(e) = self.set_hostname(client, &vm.name) {
                tracing::warn!(vm = %vm.name, error = %e, "Failed to reset hostname");
            }
            tracing::info!(vm = %vm.name, "Cleaned up VM");
        }
        Ok(())
    }

    /// Check that every VM answers over each network it has.
    pub fn verify_vms(&self, pool: &VmPool, vms: &[Vm]) -> Result<()> {
        let access_addr = pool
            .vms
            .iter()
            .find(|vm| vm.net_info.has_external())
            .map(|vm| vm.net_info.external_ip.clone())
            .ok_or_else(|| {
                Error::MissingNetworkInfo("at least one VM should have access to external network".into())
            })?;
        let access = self
            .connector
            .connect(&access_addr)
            .map_err(|e| Error::Provisioning(format!("can't get ssh client for {}: {}", access_addr, e)))?;

        for vm in vms {
            if vm.net_info.has_external() {
                let client = self
                    .connector
                    .connect(&vm.net_info.external_ip)
                    .map_err(|e| Error::ssh_step("connect over external network", &vm.name, e))?;
                client
                    .output("echo test")
                    .map_err(|e| Error::ssh_step("verify external network", &vm.name, e))?;
            }
            if vm.net_info.has_internal() {
                let client = access
                    .add_hop(&vm.net_info.internal_ip, self.config.ssh_port)
                    .map_err(|e| Error::ssh_step("connect over internal network", &vm.name, e))?;
                client
                    .output("echo test")
                    .map_err(|e| Error::ssh_step("verify internal network", &vm.name, e))?;
            }
            tracing::debug!(vm = %vm.name, "VM verified");
        }
        Ok(())
    }

    fn setup_jump_addr(&self, pool: &VmPool, vms: &[Vm], root_lb_name: &str) -> Result<String> {
        if !self.config.shared_root_lb_name.is_empty() && root_lb_name == self.config.shared_root_lb_name {
            let detail = server_detail(pool, root_lb_name)?;
            return detail
                .external_addr()
                .map(str::to_string)
                .ok_or_else(|| Error::MissingNetworkInfo(format!("no external address for shared rootlb {}", root_lb_name)));
        }

        // A dedicated root LB outside the batch is already leased to the group
        let addr = match vms.iter().find(|vm| vm.internal_name == root_lb_name) {
            Some(vm) => vm.net_info.external_ip.clone(),
            None => server_detail(pool, root_lb_name)
                .ok()
                .and_then(|sd| sd.external_addr().map(str::to_string))
                .unwrap_or_default(),
        };
        if addr.is_empty() {
            return Err(Error::MissingNetworkInfo(format!(
                "unable to find rootlb external IP for {}",
                root_lb_name
            )));
        }
        Ok(addr)
    }

    fn session<'a>(&self, jump: &'a dyn SshClient, jump_addr: &str, vm: &Vm) -> Result<Session<'a>> {
        if vm.net_info.external_ip == jump_addr {
            return Ok(Session::Jump(jump));
        }
        if !vm.net_info.has_internal() {
            return Err(Error::MissingNetworkInfo(format!(
                "vm {} has no internal IP",
                vm.display_name()
            )));
        }
        let client = jump
            .add_hop(&vm.net_info.internal_ip, self.config.ssh_port)
            .map_err(|e| Error::ssh_step("connect", vm.display_name(), e))?;
        Ok(Session::Hop(client))
    }

    fn prepare_vm(&self, client: &dyn SshClient, vm: &Vm, params: &VmParams) -> Result<()> {
        let name = vm.internal_name.as_str();
        tracing::info!(vm = %name, pool_vm = %vm.name, role = %params.role, "Preparing VM");

        self.cleanup(client, vm)?;

        if let Err(e) = self.set_hostname(client, name) {
            tracing::warn!(vm = %name, error = %e, "Failed to set hostname");
        }

        if let Some(key) = &params.access_key {
            let path = format!("{}/accesskey.pem", ACCESS_KEY_DIR);
            ssh::create_dir(client, ACCESS_KEY_DIR)
                .and_then(|_| ssh::write_file(client, &path, key))
                .and_then(|_| client.output(&format!("sudo chmod 600 {}", path)).map(|_| ()))
                .map_err(|e| Error::ssh_step("copy access key", name, e))?;
        }

        if let Some(chef) = &params.chef {
            let key_path = format!("/home/{}/client.pem", self.config.ssh_user);
            ssh::write_file(client, &key_path, &chef.client_key)
                .map_err(|e| Error::ssh_step("copy chef client key", name, e))?;
            let cmd = format!(
                "sudo bash {} -s {} -n {}",
                self.config.script("setup-chef.sh"),
                ssh::shell_quote(&chef.server_path),
                ssh::shell_quote(&chef.node_name)
            );
            client
                .output(&cmd)
                .map_err(|e| Error::ssh_step("set up chef", name, e))?;
        }
        Ok(())
    }

    fn cleanup(&self, client: &dyn SshClient, vm: &Vm) -> Result<()> {
        let cmd = format!("sudo bash {}", self.config.script("cleanup-vm.sh"));
        client
            .output(&cmd)
            .map_err(|e| Error::ssh_step("clean up", &vm.name, e))?;
        Ok(())
    }

    fn set_hostname(&self, client: &dyn SshClient, name: &str) -> Result<()> {
        let hostname = sanitize_hostname(name);
        client.output(&format!("sudo hostnamectl set-hostname {}", hostname))?;
        client.output(&format!(
            r#"sudo sed -i "/localhost/! s/127.0.0.1 \+.\+/127.0.0.1 {}/" /etc/hosts"#,
            hostname
        ))?;
        Ok(())
    }

    fn install_master(&self, client: &dyn SshClient, vm: &Vm, addr: &str) -> Result<()> {
        tracing::info!(vm = %vm.internal_name, addr = %addr, "Setting up kubernetes master");
        let cmd = format!(
            r#"sudo sh -x {} "{}" "{}" "{}""#,
            self.config.script("install-k8s-master.sh"),
            self.config.network_interface,
            addr,
            addr
        );
        client
            .output(&cmd)
            .map_err(|e| Error::ssh_step("set up kubernetes master", &vm.internal_name, e))?;
        Ok(())
    }

    fn install_node(&self, client: &dyn SshClient, vm: &Vm, master_addr: &str) -> Result<()> {
        tracing::info!(vm = %vm.internal_name, master = %master_addr, "Setting up kubernetes worker");
        let cmd = format!(
            r#"sudo sh -x {} "{}" "{}" "{}""#,
            self.config.script("install-k8s-node.sh"),
            self.config.network_interface,
            master_addr,
            master_addr
        );
        client
            .output(&cmd)
            .map_err(|e| Error::ssh_step("set up kubernetes worker", &vm.internal_name, e))?;
        Ok(())
    }

    fn install_nodes(&self, nodes: &[(&Vm, &dyn SshClient)], master_addr: &str) -> Result<()> {
        if !self.config.parallel_node_setup || nodes.len() < 2 {
            for (vm, client) in nodes {
                self.install_node(*client, vm, master_addr)?;
            }
            return Ok(());
        }

        std::thread::scope(|scope| {
            let handles: Vec<_> = nodes
                .iter()
                .map(|(vm, client)| scope.spawn(move || self.install_node(*client, vm, master_addr)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(Error::Provisioning("worker setup thread panicked".into())))
                })
                .collect::<Result<Vec<()>>>()
                .map(|_| ())
        })
    }
}
