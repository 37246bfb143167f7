//! Admission decisions for the pool
//!
//! Both functions decide first and mutate last: the pool is only touched once
//! every request in the batch has been matched, so a failed call leaves the
//! pool exactly as it was.

use std::collections::{HashMap, HashSet};

use crate::models::{Vm, VmAction, VmParams, VmPool, VmSpec, VmState};
use crate::{Error, Result};

/// Free VMs grouped by network reachability, each bucket in pool order
#[derive(Debug, Default)]
struct Buckets {
    dual: Vec<usize>,
    external_only: Vec<usize>,
    internal_only: Vec<usize>,
    free: usize,
}

impl Buckets {
    fn from_pool(pool: &VmPool) -> Self {
        let mut buckets = Buckets::default();
        for (idx, vm) in pool.vms.iter().enumerate() {
            if !vm.is_free() {
                continue;
            }
            buckets.free += 1;
            match (vm.net_info.has_external(), vm.net_info.has_internal()) {
                (true, true) => buckets.dual.push(idx),
                (true, false) => buckets.external_only.push(idx),
                (false, true) => buckets.internal_only.push(idx),
                (false, false) => {}
            }
        }
        buckets
    }

    /// Take the first VM able to serve the spec, preferring VMs without
    /// the network capability the spec doesn't need.
    fn take(&mut self, spec: &VmSpec) -> Result<usize> {
        let (preferred, wanted) = match (spec.external_network, spec.internal_network) {
            (true, true) => (None, "both external and internal"),
            (true, false) => (Some(&mut self.external_only), "external"),
            (false, _) => (Some(&mut self.internal_only), "internal"),
        };
        if let Some(bucket) = preferred {
            if !bucket.is_empty() {
                return Ok(bucket.remove(0));
            }
        }
        if !self.dual.is_empty() {
            return Ok(self.dual.remove(0));
        }
        Err(Error::InsufficientCapacity(format!(
            "Unable to find a free VM with {} network connectivity for {}",
            wanted, spec.internal_name
        )))
    }
}

/// Claim free VMs for `group_name`, one per spec, all or nothing.
///
/// Returns the claimed records (now `IN_PROGRESS`) in pool order.
pub fn mark_for_allocation(group_name: &str, pool: &mut VmPool, specs: &[VmSpec]) -> Result<Vec<Vm>> {
    tracing::debug!(pool = %pool.key, group = %group_name, specs = specs.len(), "Marking VMs for allocation");
    if specs.is_empty() {
        return Ok(Vec::new());
    }

    let mut buckets = Buckets::from_pool(pool);
    if buckets.free < specs.len() {
        return Err(Error::InsufficientCapacity(format!(
            "Failed to meet VM requirement, required VMs = {}, free VMs available = {}",
            specs.len(),
            buckets.free
        )));
    }

    let mut selected: HashMap<usize, &str> = HashMap::new();
    for spec in specs {
        let idx = buckets.take(spec)?;
        selected.insert(idx, spec.internal_name.as_str());
    }

    let mut marked = Vec::with_capacity(selected.len());
    for (idx, vm) in pool.vms.iter_mut().enumerate() {
        let Some(internal_name) = selected.get(&idx) else {
            continue;
        };
        vm.state = VmState::InProgress;
        vm.group_name = group_name.to_string();
        vm.internal_name = internal_name.to_string();
        vm.touch();
        marked.push(vm.clone());
    }

    tracing::info!(pool = %pool.key, group = %group_name, count = marked.len(), "VMs marked for allocation");
    Ok(marked)
}

/// Mark VMs of `group_name` for release. Empty `specs` selects the whole group.
///
/// Fails with [`Error::BusyResource`] if any VM of the group is mid-transition.
pub fn mark_for_release(group_name: &str, pool: &mut VmPool, specs: &[VmSpec]) -> Result<Vec<Vm>> {
    tracing::debug!(pool = %pool.key, group = %group_name, specs = specs.len(), "Marking VMs for release");
    let release_all = specs.is_empty();
    let names: HashSet<&str> = specs.iter().map(|s| s.internal_name.as_str()).collect();

    let mut selected = Vec::new();
    for (idx, vm) in pool.vms.iter().enumerate() {
        if group_name.is_empty() || vm.group_name != group_name {
            continue;
        }
        if vm.state == VmState::InProgress {
            return Err(Error::BusyResource {
                vm: vm.display_name().to_string(),
            });
        }
        if release_all || names.contains(vm.internal_name.as_str()) {
            selected.push(idx);
        }
    }

    let mut marked = Vec::with_capacity(selected.len());
    for idx in selected {
        let vm = &mut pool.vms[idx];
        vm.state = VmState::InProgress;
        vm.touch();
        marked.push(vm.clone());
    }

    tracing::info!(pool = %pool.key, group = %group_name, count = marked.len(), "VMs marked for release");
    Ok(marked)
}

/// One batch of work that brings a group to its desired membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePlan {
    /// `Allocate`, `Release`, or `None` when the group already matches
    pub action: VmAction,
    pub specs: Vec<VmSpec>,
}

/// Compare the group's current VMs with the desired set.
///
/// New names produce an allocation batch. Only when nothing is new are
/// vanished names released, so a plan never mixes the two.
pub fn plan_update(group_name: &str, pool: &VmPool, desired: &[VmParams]) -> UpdatePlan {
    let existing: Vec<&str> = pool
        .group_vms(group_name)
        .map(|vm| vm.internal_name.as_str())
        .collect();

    let to_add: Vec<VmSpec> = desired
        .iter()
        .filter(|p| !existing.contains(&p.name.as_str()))
        .map(VmParams::spec)
        .collect();
    if !to_add.is_empty() {
        return UpdatePlan {
            action: VmAction::Allocate,
            specs: to_add,
        };
    }

    let to_remove: Vec<VmSpec> = existing
        .iter()
        .filter(|name| !desired.iter().any(|p| p.name == **name))
        .map(|name| VmSpec::new(*name))
        .collect();
    if !to_remove.is_empty() {
        return UpdatePlan {
            action: VmAction::Release,
            specs: to_remove,
        };
    }

    UpdatePlan {
        action: VmAction::None,
        specs: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NetInfo, VmRole};

    fn test_pool() -> VmPool {
        VmPool::new("site-a")
            .with_vm(Vm::new("vm1", NetInfo::new("10.0.0.1", "192.168.1.1")))
            .with_vm(Vm::new("vm2", NetInfo::new("", "192.168.1.2")))
            .with_vm(Vm::new("vm3", NetInfo::new("10.0.0.3", "")))
            .with_vm(Vm::new("vm4", NetInfo::new("10.0.0.4", "192.168.1.4")))
    }

    fn set_state(pool: &mut VmPool, marked: &[Vm], state: VmState) {
        for vm in pool.vms.iter_mut() {
            if marked.iter().any(|m| m.name == vm.name) {
                vm.state = state;
            }
        }
    }

    #[test]
    fn test_allocate_prefers_single_network_buckets() {
        let mut pool = test_pool();
        let specs = vec![
            VmSpec::new("lb.g1").external(true),
            VmSpec::new("node.g1").internal(true),
        ];
        let marked = mark_for_allocation("g1", &mut pool, &specs).unwrap();

        let names: Vec<_> = marked.iter().map(|vm| vm.name.as_str()).collect();
        assert_eq!(names, vec!["vm2", "vm3"]);
        for vm in &marked {
            assert_eq!(vm.state, VmState::InProgress);
            assert_eq!(vm.group_name, "g1");
        }
        assert_eq!(pool.vms[2].internal_name, "lb.g1");
        assert_eq!(pool.vms[1].internal_name, "node.g1");
        assert!(pool.vms[0].is_free());
        assert!(pool.vms[3].is_free());
    }

    #[test]
    fn test_allocate_dual_takes_first_in_pool_order() {
        let mut pool = test_pool();
        let specs = vec![VmSpec::new("a").external(true).internal(true)];
        let marked = mark_for_allocation("g1", &mut pool, &specs).unwrap();
        assert_eq!(marked[0].name, "vm1");
        assert!(marked[0].net_info.has_external() && marked[0].net_info.has_internal());
    }

    #[test]
    fn test_allocate_falls_back_to_dual() {
        let mut pool = test_pool();
        let specs = vec![
            VmSpec::new("e1").external(true),
            VmSpec::new("e2").external(true),
            VmSpec::new("i1").internal(true),
            VmSpec::new("i2").internal(true),
        ];
        let marked = mark_for_allocation("g1", &mut pool, &specs).unwrap();
        assert_eq!(marked.len(), 4);
        assert_eq!(pool.vms[2].internal_name, "e1");
        assert_eq!(pool.vms[0].internal_name, "e2");
        assert_eq!(pool.vms[1].internal_name, "i1");
        assert_eq!(pool.vms[3].internal_name, "i2");
    }

    #[test]
    fn test_allocate_failure_leaves_pool_untouched() {
        let mut pool = test_pool();
        let before = pool.clone();
        let specs = vec![
            VmSpec::new("d1").external(true).internal(true),
            VmSpec::new("d2").external(true).internal(true),
            VmSpec::new("d3").external(true).internal(true),
        ];
        let err = mark_for_allocation("g1", &mut pool, &specs).unwrap_err();
        assert!(matches!(err, Error::InsufficientCapacity(_)));
        assert_eq!(pool, before);
    }

    #[test]
    fn test_allocate_more_specs_than_free_vms() {
        let mut pool = test_pool();
        let before = pool.clone();
        let specs: Vec<_> = (0..5).map(|i| VmSpec::new(format!("n{}", i))).collect();
        let err = mark_for_allocation("g1", &mut pool, &specs).unwrap_err();
        assert!(err.to_string().contains("free VMs available = 4"));
        assert_eq!(pool, before);
    }

    #[test]
    fn test_allocate_skips_vms_without_network() {
        let mut pool = VmPool::new("site-a").with_vm(Vm::new("bare", NetInfo::default()));
        let err = mark_for_allocation("g1", &mut pool, &[VmSpec::new("n1").internal(true)]).unwrap_err();
        assert!(matches!(err, Error::InsufficientCapacity(_)));
        assert!(pool.vms[0].is_free());
    }

    #[test]
    fn test_allocate_with_busy_capable_vms() {
        let mut pool = test_pool();
        let first = vec![
            VmSpec::new("lb.g1").external(true),
            VmSpec::new("node.g1").internal(true),
        ];
        let marked = mark_for_allocation("g1", &mut pool, &first).unwrap();
        set_state(&mut pool, &marked, VmState::InUse);

        // Claim the remaining dual VMs so no external-capable VM is free
        let other = vec![
            VmSpec::new("x").external(true).internal(true),
            VmSpec::new("y").external(true).internal(true),
        ];
        mark_for_allocation("g2", &mut pool, &other).unwrap();

        let before = pool.clone();
        let again = vec![
            VmSpec::new("lb2.g1").external(true),
            VmSpec::new("m.g1").external(true).internal(true),
        ];
        let err = mark_for_allocation("g1", &mut pool, &again).unwrap_err();
        assert!(matches!(err, Error::InsufficientCapacity(_)));
        assert_eq!(pool, before);
    }

    #[test]
    fn test_allocate_no_specs_is_noop() {
        let mut pool = test_pool();
        let before = pool.clone();
        let marked = mark_for_allocation("g2", &mut pool, &[]).unwrap();
        assert!(marked.is_empty());
        assert_eq!(pool, before);
    }

    #[test]
    fn test_release_by_name_then_busy() {
        let mut pool = test_pool();
        let specs = vec![VmSpec::new("x").internal(true), VmSpec::new("y").external(true)];
        let marked = mark_for_allocation("g1", &mut pool, &specs).unwrap();
        set_state(&mut pool, &marked, VmState::InUse);

        let released = mark_for_release("g1", &mut pool, &[VmSpec::new("x")]).unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].internal_name, "x");
        assert_eq!(released[0].state, VmState::InProgress);

        let before = pool.clone();
        let err = mark_for_release("g1", &mut pool, &[VmSpec::new("x")]).unwrap_err();
        assert!(matches!(err, Error::BusyResource { ref vm } if vm == "x"));
        assert_eq!(pool, before);
    }

    #[test]
    fn test_release_all_of_group() {
        let mut pool = test_pool();
        let g1 = vec![VmSpec::new("a").internal(true), VmSpec::new("b").external(true)];
        let marked = mark_for_allocation("g1", &mut pool, &g1).unwrap();
        set_state(&mut pool, &marked, VmState::InUse);
        let marked = mark_for_allocation("g2", &mut pool, &[VmSpec::new("c").internal(true)]).unwrap();
        set_state(&mut pool, &marked, VmState::InUse);

        let released = mark_for_release("g1", &mut pool, &[]).unwrap();
        assert_eq!(released.len(), 2);
        assert!(released.iter().all(|vm| vm.group_name == "g1"));
        assert_eq!(pool.group_vms("g2").next().unwrap().state, VmState::InUse);
    }

    #[test]
    fn test_release_unknown_group_is_empty() {
        let mut pool = test_pool();
        let released = mark_for_release("nobody", &mut pool, &[]).unwrap();
        assert!(released.is_empty());
    }

    #[test]
    fn test_plan_update() {
        let mut pool = test_pool();
        let specs = vec![VmSpec::new("m.c1").internal(true), VmSpec::new("n1.c1").internal(true)];
        let marked = mark_for_allocation("c1", &mut pool, &specs).unwrap();
        set_state(&mut pool, &marked, VmState::InUse);

        let grow = vec![
            VmParams::new("m.c1", VmRole::Master),
            VmParams::new("n1.c1", VmRole::Node),
            VmParams::new("n2.c1", VmRole::Node),
        ];
        let plan = plan_update("c1", &pool, &grow);
        assert_eq!(plan.action, VmAction::Allocate);
        assert_eq!(plan.specs, vec![VmSpec::new("n2.c1").internal(true)]);

        let shrink = vec![VmParams::new("m.c1", VmRole::Master)];
        let plan = plan_update("c1", &pool, &shrink);
        assert_eq!(plan.action, VmAction::Release);
        assert_eq!(plan.specs, vec![VmSpec::new("n1.c1")]);

        let same = vec![VmParams::new("m.c1", VmRole::Master), VmParams::new("n1.c1", VmRole::Node)];
        assert_eq!(plan_update("c1", &pool, &same).action, VmAction::None);
    }
}
