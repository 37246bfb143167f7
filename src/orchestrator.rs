//! Orchestrator for VM groups on a pool
//!
//! Each operation claims VMs through the backend, runs the remote setup or
//! teardown without holding any pool lock, then settles the claim. A failed
//! setup or teardown settles with the compensating state and the original
//! error is returned.

use crate::backend::PoolBackend;
use crate::models::{PoolStatus, ServerDetail, Vm, VmAction, VmParams, VmRole, VmSpec};
use crate::pool::Outcome;
use crate::provision::{self, Provisioner};
use crate::scheduler;
use crate::Result;

/// Manages VM groups on one pool
pub struct Orchestrator<B: PoolBackend> {
    backend: B,
    provisioner: Provisioner,
}

impl<B: PoolBackend> Orchestrator<B> {
    pub fn new(backend: B, provisioner: Provisioner) -> Self {
        Self { backend, provisioner }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Claim and set up one VM per entry in `params`.
    ///
    /// Returns the VMs now in use by the group.
    pub fn create_vms(&self, group_name: &str, params: &[VmParams]) -> Result<Vec<Vm>> {
        let specs: Vec<VmSpec> = params.iter().map(VmParams::spec).collect();
        self.allocate(group_name, params, &specs)
    }

    /// Tear down and return every VM of the group
    pub fn delete_vms(&self, group_name: &str) -> Result<Vec<Vm>> {
        self.release(group_name, &[])
    }

    /// Bring the group to the VM set described by `params`.
    ///
    /// Names not yet in the group are allocated; otherwise names no longer
    /// present are released. One call never does both.
    pub fn update_vms(&self, group_name: &str, params: &[VmParams]) -> Result<Vec<Vm>> {
        let pool = self.backend.snapshot()?;
        let plan = scheduler::plan_update(group_name, &pool, params);
        match plan.action {
            VmAction::Allocate => self.allocate(group_name, params, &plan.specs),
            VmAction::Release => self.release(group_name, &plan.specs),
            _ => {
                tracing::info!(group = %group_name, "Group already up to date");
                Ok(Vec::new())
            }
        }
    }

    /// Check SSH reachability of `vms` over each network they have
    pub fn verify_vms(&self, vms: &[Vm]) -> Result<()> {
        let pool = self.backend.snapshot()?;
        self.provisioner.verify_vms(&pool, vms)
    }

    pub fn server_detail(&self, name: &str) -> Result<ServerDetail> {
        provision::server_detail(&self.backend.snapshot()?, name)
    }

    pub fn status(&self) -> Result<PoolStatus> {
        Ok(self.backend.snapshot()?.status())
    }

    fn allocate(&self, group_name: &str, params: &[VmParams], specs: &[VmSpec]) -> Result<Vec<Vm>> {
        let vms = self.backend.reserve(VmAction::Allocate, group_name, specs)?;
        if vms.is_empty() {
            return Ok(vms);
        }
        tracing::info!(group = %group_name, count = vms.len(), "Allocated VMs from pool");

        let root_lb_name = self.root_lb_name(params);
        let result = self
            .backend
            .snapshot()
            .and_then(|pool| self.provisioner.setup_vms(&pool, &vms, params, &root_lb_name));
        self.settle(group_name, vms, VmAction::Allocate, result)
    }

    fn release(&self, group_name: &str, specs: &[VmSpec]) -> Result<Vec<Vm>> {
        let vms = self.backend.reserve(VmAction::Release, group_name, specs)?;
        if vms.is_empty() {
            tracing::debug!(group = %group_name, "No VMs to release");
            return Ok(vms);
        }
        tracing::info!(group = %group_name, count = vms.len(), "Releasing VMs to pool");

        let result = self.backend.snapshot().and_then(|pool| {
            let group_vms: Vec<Vm> = pool.group_vms(group_name).cloned().collect();
            self.provisioner.teardown_vms(&pool, &vms, &group_vms)
        });
        self.settle(group_name, vms, VmAction::Release, result)
    }

    /// Commit the batch according to how its setup or teardown went
    fn settle(&self, group_name: &str, mut vms: Vec<Vm>, action: VmAction, result: Result<()>) -> Result<Vec<Vm>> {
        let Some(outcome) = Outcome::for_action(action, result.is_ok()) else {
            return result.map(|_| vms);
        };

        match result {
            Ok(()) => {
                self.backend.settle(group_name, &vms, outcome)?;
                for vm in &mut vms {
                    vm.state = outcome.target_state();
                }
                Ok(vms)
            }
            Err(e) => {
                tracing::error!(group = %group_name, %action, error = %e, "VM setup failed, reverting claim");
                if let Err(commit_err) = self.backend.settle(group_name, &vms, outcome) {
                    tracing::error!(group = %group_name, ?outcome, error = %commit_err, "Failed to commit VM state");
                }
                Err(e)
            }
        }
    }

    /// Internal name of the VM that fronts the group
    fn root_lb_name(&self, params: &[VmParams]) -> String {
        params
            .iter()
            .find(|p| p.role == VmRole::RootLb)
            .or_else(|| params.iter().find(|p| p.external_network))
            .map(|p| p.name.clone())
            .unwrap_or_else(|| self.provisioner.config().shared_root_lb_name.clone())
    }
}
