//! Where admission decisions are made
//!
//! The orchestrator drives the same create/delete flow against either a pool
//! it owns directly ([`LocalBackend`]) or one owned by a remote agent
//! ([`crate::rendezvous::RendezvousBackend`]).

use std::sync::Arc;

use crate::models::{Vm, VmAction, VmPool, VmSpec};
use crate::pool::{Outcome, SharedPool};
use crate::Result;

pub trait PoolBackend: Send + Sync {
    /// Pool owner key
    fn key(&self) -> String;

    /// Current view of the pool
    fn snapshot(&self) -> Result<VmPool>;

    /// Select the VMs for `action`. What the returned VMs' state is depends
    /// on the backend; they are reserved for the caller either way.
    fn reserve(&self, action: VmAction, group_name: &str, specs: &[VmSpec]) -> Result<Vec<Vm>>;

    /// Record how the operation on a reserved batch ended
    fn settle(&self, group_name: &str, vms: &[Vm], outcome: Outcome) -> Result<()>;
}

/// Backend over a pool cache owned by this process
pub struct LocalBackend {
    pool: Arc<SharedPool>,
}

impl LocalBackend {
    pub fn new(pool: Arc<SharedPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<SharedPool> {
        &self.pool
    }
}

impl PoolBackend for LocalBackend {
    fn key(&self) -> String {
        self.pool.key()
    }

    fn snapshot(&self) -> Result<VmPool> {
        Ok(self.pool.snapshot())
    }

    fn reserve(&self, action: VmAction, group_name: &str, specs: &[VmSpec]) -> Result<Vec<Vm>> {
        self.pool.claim(action, group_name, specs)
    }

    fn settle(&self, _group_name: &str, vms: &[Vm], outcome: Outcome) -> Result<()> {
        self.pool.commit(vms, outcome)
    }
}
