//! VM Pool Scheduler
//!
//! A Rust library for leasing a fixed pool of pre-existing machines to
//! workload groups (clusters, load balancers) and turning the leased
//! machines into group members over SSH.
//!
//! # Key Features
//!
//! - **All-or-nothing claims** - A batch of VMs is claimed whole or not at all
//! - **Network-aware placement** - Single-network requests spare dual-homed VMs
//! - **Two-phase state** - Claimed VMs stay `IN_PROGRESS` until setup settles
//! - **Remote pools** - The same flow against a pool owned by another process
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vm_pool::{
//!     FileStore, LocalBackend, OpenSshConnector, Orchestrator, PlatformConfig,
//!     Provisioner, SharedPool, VmParams, VmRole,
//! };
//!
//! let config = PlatformConfig::builder()
//!     .pool_key("site-a")
//!     .ssh_identity_file("/etc/vmpool/id_rsa")
//!     .build_validated()?;
//!
//! let store = Arc::new(FileStore::open("/var/lib/vmpool")?);
//! let pool = Arc::new(SharedPool::load(store, &config.pool_key)?);
//! let connector = Arc::new(OpenSshConnector::from_config(&config)?);
//! let orchestrator = Orchestrator::new(LocalBackend::new(pool), Provisioner::new(config, connector));
//!
//! let params = vec![
//!     VmParams::new("lb.cluster1", VmRole::RootLb).external(true),
//!     VmParams::new("master.cluster1", VmRole::Master),
//!     VmParams::new("node1.cluster1", VmRole::Node),
//! ];
//! orchestrator.create_vms("cluster1", &params)?;
//!
//! // Run workloads...
//!
//! orchestrator.delete_vms("cluster1")?;
//! # Ok::<(), vm_pool::Error>(())
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod pool;
pub mod provision;
pub mod rendezvous;
pub mod scheduler;
pub mod ssh;
pub mod store;

pub use backend::{LocalBackend, PoolBackend};
pub use config::{PlatformConfig, RetryPolicy};
pub use error::{Error, Result};
pub use models::{
    ChefParams, NetInfo, PoolStatus, ServerDetail, Vm, VmAction, VmParams, VmPool, VmPoolInfo,
    VmRole, VmSpec, VmState,
};
pub use orchestrator::Orchestrator;
pub use pool::{Outcome, SharedPool};
pub use provision::Provisioner;
pub use rendezvous::{Clock, PoolAgent, RendezvousBackend, SystemClock};
pub use ssh::{OpenSshConnector, SshClient, SshConnector};
pub use store::{FileStore, InfoStore, MemoryStore, PoolStore};
