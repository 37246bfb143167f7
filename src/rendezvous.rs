//! Request/response exchange with a remote pool owner
//!
//! The requester publishes a [`VmPoolInfo`] and polls the same record until
//! the owner's [`PoolAgent`] marks it `DONE`. The agent runs the same
//! allocator and releaser as the local backend and commits the final state
//! itself.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::PoolBackend;
use crate::config::RetryPolicy;
use crate::models::{Vm, VmAction, VmPool, VmPoolInfo, VmSpec};
use crate::pool::{Outcome, SharedPool};
use crate::scheduler;
use crate::store::{InfoStore, PoolStore};
use crate::{Error, Result};

/// Source of delays between polls
pub trait Clock: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Blocks the calling thread
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Backend for a pool owned by a remote agent
pub struct RendezvousBackend {
    key: String,
    infos: Arc<dyn InfoStore>,
    pools: Arc<dyn PoolStore>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl RendezvousBackend {
    /// `pools` is this side's replicated view of the pool record
    pub fn new(key: impl Into<String>, infos: Arc<dyn InfoStore>, pools: Arc<dyn PoolStore>) -> Self {
        Self {
            key: key.into(),
            infos,
            pools,
            retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Publish a request and wait for the agent to answer it
    pub fn exchange(&self, group_name: &str, action: VmAction, specs: Vec<VmSpec>) -> Result<VmPoolInfo> {
        let request = VmPoolInfo::request(&self.key, group_name, action, specs);
        tracing::info!(
            pool = %self.key,
            group = %group_name,
            %action,
            request_id = ?request.request_id,
            "Sending VM pool request"
        );
        self.infos.update_info(&request)?;

        let mut last = VmAction::None;
        for attempt in 1..=self.retry.max_attempts {
            if let Some(info) = self.infos.get_info(&self.key)? {
                last = info.action;
                if info.action == VmAction::Done && info.request_id == request.request_id {
                    if !info.error.is_empty() {
                        tracing::warn!(pool = %self.key, group = %group_name, error = %info.error, "VM pool request failed");
                        return Err(Error::Remote(info.error));
                    }
                    tracing::info!(pool = %self.key, group = %group_name, vms = info.vms.len(), attempt, "VM pool request done");
                    return Ok(info);
                }
            }
            self.clock.sleep(self.retry.interval());
        }

        tracing::error!(
            pool = %self.key,
            group = %group_name,
            %last,
            waited = ?self.retry.bound(),
            "Timed out waiting for VM pool agent"
        );
        Err(Error::Timeout {
            desired: VmAction::Done,
            last,
        })
    }

    fn release_by_name(&self, group_name: &str, vms: &[Vm]) -> Result<Vec<Vm>> {
        let specs = vms.iter().map(|vm| VmSpec::new(&vm.internal_name)).collect();
        Ok(self.exchange(group_name, VmAction::Release, specs)?.vms)
    }
}

impl PoolBackend for RendezvousBackend {
    fn key(&self) -> String {
        self.key.clone()
    }

    fn snapshot(&self) -> Result<VmPool> {
        self.pools
            .get(&self.key)?
            .ok_or_else(|| Error::PoolNotFound(self.key.clone()))
    }

    fn reserve(&self, action: VmAction, group_name: &str, specs: &[VmSpec]) -> Result<Vec<Vm>> {
        match action {
            // The agent commits IN_USE on its side
            VmAction::Allocate => Ok(self.exchange(group_name, action, specs.to_vec())?.vms),
            // The release is only sent once teardown succeeded; until then
            // run the releaser against a copy to pick the VMs
            VmAction::Release => {
                let mut view = self.snapshot()?;
                scheduler::mark_for_release(group_name, &mut view, specs)
            }
            other => Err(Error::Config(format!("cannot reserve VMs for action {}", other))),
        }
    }

    fn settle(&self, group_name: &str, vms: &[Vm], outcome: Outcome) -> Result<()> {
        if vms.is_empty() {
            return Ok(());
        }
        match outcome {
            Outcome::Allocated | Outcome::ReleaseFailed => Ok(()),
            Outcome::AllocationFailed | Outcome::Released => {
                let released = self.release_by_name(group_name, vms)?;
                tracing::info!(pool = %self.key, group = %group_name, ?outcome, released = released.len(), "Released VMs on pool agent");
                Ok(())
            }
        }
    }
}

/// Owner side of the exchange: answers pending requests for one pool
pub struct PoolAgent {
    pool: Arc<SharedPool>,
    infos: Arc<dyn InfoStore>,
}

impl PoolAgent {
    pub fn new(pool: Arc<SharedPool>, infos: Arc<dyn InfoStore>) -> Self {
        Self { pool, infos }
    }

    /// Handle the pending request, if any. Returns whether one was handled.
    pub fn process(&self) -> Result<bool> {
        let key = self.pool.key();
        let Some(mut info) = self.infos.get_info(&key)? else {
            return Ok(false);
        };
        let action = info.action;
        if !matches!(action, VmAction::Allocate | VmAction::Release) {
            return Ok(false);
        }
        tracing::info!(pool = %key, group = %info.group_name, %action, "Handling VM pool request");

        let result = self
            .pool
            .claim(action, &info.group_name, &info.vm_specs)
            .and_then(|vms| self.finish(action, vms));

        match result {
            Ok(vms) => {
                let committed = self.pool.snapshot();
                info.vms = vms
                    .iter()
                    .filter_map(|vm| committed.vms.iter().find(|v| v.name == vm.name).cloned())
                    .collect();
                info.error.clear();
            }
            Err(e) => {
                tracing::warn!(pool = %key, group = %info.group_name, %action, error = %e, "VM pool request failed");
                info.vms.clear();
                info.error = e.to_string();
            }
        }
        info.action = VmAction::Done;
        self.infos.update_info(&info)?;
        Ok(true)
    }

    /// Commit a claimed batch. If that fails the batch is settled as a
    /// failed action, so no VM stays `IN_PROGRESS` without a requester.
    fn finish(&self, action: VmAction, vms: Vec<Vm>) -> Result<Vec<Vm>> {
        let (Some(done), Some(undone)) = (Outcome::for_action(action, true), Outcome::for_action(action, false))
        else {
            return Ok(vms);
        };
        if let Err(e) = self.pool.commit(&vms, done) {
            if let Err(rollback) = self.pool.commit(&vms, undone) {
                tracing::error!(pool = %self.pool.key(), %action, error = %rollback, "Failed to roll back claimed VMs");
            }
            return Err(e);
        }
        Ok(vms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NetInfo, VmState};
    use crate::store::MemoryStore;
    use parking_lot::Mutex;

    /// Runs a hook instead of sleeping and counts the calls
    struct HookClock<F: Fn() + Send + Sync> {
        hook: F,
        sleeps: Mutex<u32>,
    }

    impl<F: Fn() + Send + Sync> Clock for HookClock<F> {
        fn sleep(&self, _duration: Duration) {
            *self.sleeps.lock() += 1;
            (self.hook)();
        }
    }

    fn test_pool() -> VmPool {
        VmPool::new("site-a")
            .with_vm(Vm::new("vm1", NetInfo::new("10.0.0.1", "192.168.1.1")))
            .with_vm(Vm::new("vm2", NetInfo::new("", "192.168.1.2")))
    }

    /// Fails the `fail_at`-th pool update, counting from one
    struct FlakyStore {
        inner: MemoryStore,
        updates: Mutex<u32>,
        fail_at: u32,
    }

    impl PoolStore for FlakyStore {
        fn get(&self, key: &str) -> Result<Option<VmPool>> {
            self.inner.get(key)
        }

        fn update(&self, pool: &VmPool) -> Result<()> {
            let mut updates = self.updates.lock();
            *updates += 1;
            if *updates == self.fail_at {
                return Err(Error::Store("disk full".into()));
            }
            self.inner.update(pool)
        }
    }

    fn setup() -> (MemoryStore, Arc<PoolAgent>) {
        let store = MemoryStore::new().with_pool(test_pool());
        let shared = Arc::new(SharedPool::load(Arc::new(store.clone()), "site-a").unwrap());
        let agent = Arc::new(PoolAgent::new(shared, Arc::new(store.clone())));
        (store, agent)
    }

    fn backend(store: &MemoryStore, clock: Arc<dyn Clock>) -> RendezvousBackend {
        RendezvousBackend::new("site-a", Arc::new(store.clone()), Arc::new(store.clone()))
            .with_retry(RetryPolicy::new(Duration::from_millis(1), 10))
            .with_clock(clock)
    }

    fn agent_clock(agent: &Arc<PoolAgent>) -> Arc<HookClock<impl Fn() + Send + Sync>> {
        let agent = agent.clone();
        Arc::new(HookClock {
            hook: move || {
                agent.process().unwrap();
            },
            sleeps: Mutex::new(0),
        })
    }

    #[test]
    fn test_allocate_through_agent() {
        let (store, agent) = setup();
        let clock = agent_clock(&agent);
        let backend = backend(&store, clock.clone());

        let vms = backend
            .reserve(VmAction::Allocate, "g1", &[VmSpec::new("lb.g1").external(true)])
            .unwrap();
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].name, "vm1");
        assert_eq!(vms[0].state, VmState::InUse);
        assert_eq!(*clock.sleeps.lock(), 1);

        let pool = backend.snapshot().unwrap();
        assert_eq!(pool.vms[0].state, VmState::InUse);
        assert_eq!(pool.vms[0].group_name, "g1");
    }

    #[test]
    fn test_remote_error_propagates() {
        let (store, agent) = setup();
        let backend = backend(&store, agent_clock(&agent));

        let specs = vec![
            VmSpec::new("a").internal(true),
            VmSpec::new("b").internal(true),
            VmSpec::new("c").internal(true),
        ];
        let err = backend.reserve(VmAction::Allocate, "g1", &specs).unwrap_err();
        match err {
            Error::Remote(msg) => assert!(msg.contains("required VMs = 3, free VMs available = 2")),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(backend.snapshot().unwrap().status().free, 2);
    }

    #[test]
    fn test_timeout_after_max_attempts() {
        let store = MemoryStore::new().with_pool(test_pool());
        let clock = Arc::new(HookClock {
            hook: || {},
            sleeps: Mutex::new(0),
        });
        let backend = backend(&store, clock.clone());

        let err = backend
            .exchange("g1", VmAction::Allocate, vec![VmSpec::new("n1")])
            .unwrap_err();
        match err {
            Error::Timeout { desired, last } => {
                assert_eq!(desired, VmAction::Done);
                assert_eq!(last, VmAction::Allocate);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(*clock.sleeps.lock(), 10);
    }

    #[test]
    fn test_release_waits_for_settle() {
        let (store, agent) = setup();
        let backend = backend(&store, agent_clock(&agent));
        let vms = backend
            .reserve(VmAction::Allocate, "g1", &[VmSpec::new("n1").internal(true)])
            .unwrap();
        backend.settle("g1", &vms, Outcome::Allocated).unwrap();

        let reserved = backend.reserve(VmAction::Release, "g1", &[]).unwrap();
        assert_eq!(reserved.len(), 1);
        assert_eq!(backend.snapshot().unwrap().status().in_use, 1);

        backend.settle("g1", &reserved, Outcome::ReleaseFailed).unwrap();
        assert_eq!(backend.snapshot().unwrap().status().in_use, 1);

        backend.settle("g1", &reserved, Outcome::Released).unwrap();
        let pool = backend.snapshot().unwrap();
        assert_eq!(pool.status().free, 2);
        assert!(pool.vms.iter().all(|vm| vm.group_name.is_empty()));
    }

    #[test]
    fn test_failed_allocation_is_released() {
        let (store, agent) = setup();
        let backend = backend(&store, agent_clock(&agent));
        let vms = backend
            .reserve(VmAction::Allocate, "g1", &[VmSpec::new("n1").internal(true)])
            .unwrap();

        backend.settle("g1", &vms, Outcome::AllocationFailed).unwrap();
        assert_eq!(backend.snapshot().unwrap().status().free, 2);
    }

    #[test]
    fn test_agent_ignores_settled_requests() {
        let (store, agent) = setup();
        assert!(!agent.process().unwrap());

        let mut info = VmPoolInfo::request("site-a", "g1", VmAction::Allocate, vec![VmSpec::new("n1")]);
        info.action = VmAction::Done;
        store.update_info(&info).unwrap();
        assert!(!agent.process().unwrap());
        assert_eq!(store.get("site-a").unwrap().unwrap().status().free, 2);
    }

    #[test]
    fn test_agent_reports_busy_release() {
        let mut pool = test_pool();
        pool.vms[1].state = VmState::InProgress;
        pool.vms[1].group_name = "g1".into();
        let store = MemoryStore::new().with_pool(pool);
        let shared = Arc::new(SharedPool::load(Arc::new(store.clone()), "site-a").unwrap());
        let agent = PoolAgent::new(shared, Arc::new(store.clone()));

        store
            .update_info(&VmPoolInfo::request("site-a", "g1", VmAction::Release, vec![]))
            .unwrap();
        assert!(agent.process().unwrap());

        let info = store.get_info("site-a").unwrap().unwrap();
        assert_eq!(info.action, VmAction::Done);
        assert_eq!(info.error, "Unable to release VM vm2 as it is busy");
        assert!(info.vms.is_empty());
    }

    #[test]
    fn test_agent_rolls_back_failed_commit() {
        let store = MemoryStore::new().with_pool(test_pool());
        let flaky = FlakyStore {
            inner: store.clone(),
            updates: Mutex::new(0),
            fail_at: 2,
        };
        let shared = Arc::new(SharedPool::new(test_pool(), Arc::new(flaky)));
        let agent = PoolAgent::new(shared.clone(), Arc::new(store.clone()));

        store
            .update_info(&VmPoolInfo::request(
                "site-a",
                "g1",
                VmAction::Allocate,
                vec![VmSpec::new("n1").internal(true)],
            ))
            .unwrap();
        assert!(agent.process().unwrap());

        let info = store.get_info("site-a").unwrap().unwrap();
        assert_eq!(info.action, VmAction::Done);
        assert!(info.error.contains("disk full"));
        assert!(info.vms.is_empty());

        for pool in [shared.snapshot(), store.get("site-a").unwrap().unwrap()] {
            let vm2 = &pool.vms[1];
            assert_eq!(vm2.state, VmState::Free);
            assert!(vm2.group_name.is_empty());
            assert_eq!(pool.status().in_progress, 0);
        }
    }
}
