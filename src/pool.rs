//! Locked pool cache and the state committer
//!
//! A [`SharedPool`] owns one pool record and the lock that serializes every
//! admission decision and commit on it. The lock is never held while
//! machines are being provisioned.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::{PoolStatus, Vm, VmAction, VmPool, VmSpec, VmState};
use crate::scheduler;
use crate::store::PoolStore;
use crate::{Error, Result};

/// Final result of the operation that claimed a batch of VMs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Provisioning succeeded
    Allocated,
    /// Provisioning failed, return the VMs to the pool
    AllocationFailed,
    /// Teardown succeeded
    Released,
    /// Teardown failed, the VMs are still in use
    ReleaseFailed,
}

impl Outcome {
    pub fn target_state(self) -> VmState {
        match self {
            Outcome::Allocated | Outcome::ReleaseFailed => VmState::InUse,
            Outcome::AllocationFailed | Outcome::Released => VmState::Free,
        }
    }

    /// Outcome for an action that finished with or without an error
    pub fn for_action(action: VmAction, succeeded: bool) -> Option<Self> {
        match (action, succeeded) {
            (VmAction::Allocate, true) => Some(Outcome::Allocated),
            (VmAction::Allocate, false) => Some(Outcome::AllocationFailed),
            (VmAction::Release, true) => Some(Outcome::Released),
            (VmAction::Release, false) => Some(Outcome::ReleaseFailed),
            _ => None,
        }
    }
}

/// Apply an outcome to the named VMs of the pool. Returns how many were updated.
pub fn commit_state(pool: &mut VmPool, vms: &[Vm], outcome: Outcome) -> usize {
    let names: HashSet<&str> = vms.iter().map(|vm| vm.name.as_str()).collect();
    let target = outcome.target_state();
    let mut updated = 0;

    for vm in pool.vms.iter_mut().filter(|vm| names.contains(vm.name.as_str())) {
        if target == VmState::Free {
            vm.reset();
        } else {
            vm.state = target;
            vm.touch();
        }
        updated += 1;
    }

    if updated < names.len() {
        tracing::warn!(pool = %pool.key, expected = names.len(), updated, "Some committed VMs are no longer in the pool");
    }
    updated
}

/// One pool record guarded by its own lock and published to a store
pub struct SharedPool {
    pool: Mutex<VmPool>,
    store: Arc<dyn PoolStore>,
}

impl SharedPool {
    pub fn new(pool: VmPool, store: Arc<dyn PoolStore>) -> Self {
        Self {
            pool: Mutex::new(pool),
            store,
        }
    }

    /// Load the pool for `key` from the store
    pub fn load(store: Arc<dyn PoolStore>, key: &str) -> Result<Self> {
        let pool = store
            .get(key)?
            .ok_or_else(|| Error::PoolNotFound(key.to_string()))?;
        Ok(Self::new(pool, store))
    }

    pub fn key(&self) -> String {
        self.pool.lock().key.clone()
    }

    /// Copy of the current pool
    pub fn snapshot(&self) -> VmPool {
        self.pool.lock().clone()
    }

    pub fn status(&self) -> PoolStatus {
        self.pool.lock().status()
    }

    /// Run the allocator or releaser under the lock and publish the result.
    ///
    /// If publishing fails the in-memory pool is restored, so the claim
    /// either happened everywhere or nowhere.
    pub fn claim(&self, action: VmAction, group_name: &str, specs: &[VmSpec]) -> Result<Vec<Vm>> {
        let mut pool = self.pool.lock();
        let before = pool.clone();

        let marked = match action {
            VmAction::Allocate => scheduler::mark_for_allocation(group_name, &mut pool, specs)?,
            VmAction::Release => scheduler::mark_for_release(group_name, &mut pool, specs)?,
            other => {
                return Err(Error::Config(format!("cannot claim VMs for action {}", other)));
            }
        };

        if !marked.is_empty() {
            if let Err(e) = self.store.update(&pool) {
                tracing::error!(pool = %pool.key, group = %group_name, error = %e, "Failed to publish claimed VMs");
                *pool = before;
                return Err(e);
            }
        }
        Ok(marked)
    }

    /// Record the final state of a claimed batch and publish it.
    ///
    /// Like [`claim`](Self::claim), a failed publish leaves the in-memory
    /// pool as it was.
    pub fn commit(&self, vms: &[Vm], outcome: Outcome) -> Result<()> {
        if vms.is_empty() {
            return Ok(());
        }
        let mut pool = self.pool.lock();
        let before = pool.clone();
        let updated = commit_state(&mut pool, vms, outcome);

        if let Err(e) = self.store.update(&pool) {
            tracing::error!(pool = %pool.key, ?outcome, error = %e, "Failed to publish committed VMs");
            *pool = before;
            return Err(e);
        }
        tracing::info!(pool = %pool.key, ?outcome, state = %outcome.target_state(), updated, "Committed VM state");
        Ok(())
    }
}
