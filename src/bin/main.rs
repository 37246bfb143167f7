//! vmpool CLI - lease pool machines to groups and provision them over SSH

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tabled::{Table, Tabled};
use vm_pool::{
    Error, FileStore, LocalBackend, NetInfo, OpenSshConnector, Orchestrator, PlatformConfig,
    PoolAgent, PoolBackend, PoolStore, Provisioner, RendezvousBackend, Result, SharedPool, Vm,
    VmParams, VmPool,
};

#[derive(Parser)]
#[command(name = "vmpool")]
#[command(about = "Lease a fixed pool of machines to workload groups")]
#[command(version)]
struct Cli {
    /// Directory holding pool and request records
    #[arg(long, global = true, default_value = ".vmpool")]
    data_dir: PathBuf,

    /// Platform config file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Pool key, overrides the config file
    #[arg(long, global = true)]
    pool: Option<String>,

    /// Send requests to a pool agent instead of committing directly
    #[arg(long, global = true)]
    remote: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a pool from a JSON file of VMs
    Init {
        /// Path to the pool file
        file: PathBuf,
    },
    /// Show pool counters
    Status,
    /// List pool VMs
    List {
        /// Only VMs of this group
        #[arg(short, long)]
        group: Option<String>,
    },
    /// Claim and set up VMs for a group
    Create {
        #[arg(short, long)]
        group: String,
        /// JSON file with the group's VM parameters
        #[arg(short, long)]
        params: PathBuf,
    },
    /// Reconcile a group with a new set of VM parameters
    Update {
        #[arg(short, long)]
        group: String,
        #[arg(short, long)]
        params: PathBuf,
    },
    /// Tear down a group and return its VMs
    Delete {
        #[arg(short, long)]
        group: String,
    },
    /// Check SSH access to pool VMs
    Verify {
        /// Only VMs of this group
        #[arg(short, long)]
        group: Option<String>,
    },
    /// Show addresses of a leased VM
    Show {
        /// Name the VM was leased under
        name: String,
    },
    /// Answer requests sent with --remote
    Agent {
        /// Handle at most one request, then exit
        #[arg(long)]
        once: bool,
    },
}

/// One machine in a pool file
#[derive(Deserialize)]
struct PoolEntry {
    name: String,
    #[serde(default)]
    external_ip: String,
    #[serde(default)]
    internal_ip: String,
}

#[derive(Tabled)]
struct VmRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Group")]
    group: String,
    #[tabled(rename = "Internal Name")]
    internal_name: String,
    #[tabled(rename = "External IP")]
    external_ip: String,
    #[tabled(rename = "Internal IP")]
    internal_ip: String,
}

impl From<&Vm> for VmRow {
    fn from(vm: &Vm) -> Self {
        let or_dash = |s: &str| if s.is_empty() { "-".to_string() } else { s.to_string() };
        Self {
            name: vm.name.clone(),
            state: vm.state.to_string(),
            group: or_dash(&vm.group_name),
            internal_name: or_dash(&vm.internal_name),
            external_ip: or_dash(&vm.net_info.external_ip),
            internal_ip: or_dash(&vm.net_info.internal_ip),
        }
    }
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Pool")]
    pool: String,
    #[tabled(rename = "Total")]
    total: usize,
    #[tabled(rename = "Free")]
    free: usize,
    #[tabled(rename = "In Progress")]
    in_progress: usize,
    #[tabled(rename = "In Use")]
    in_use: usize,
}

#[derive(Tabled)]
struct AddressRow {
    #[tabled(rename = "Network")]
    network: String,
    #[tabled(rename = "External")]
    external: String,
    #[tabled(rename = "Internal")]
    internal: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vm_pool=info".parse().map_err(|e| Error::Config(format!("{}", e)))?),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let store = Arc::new(FileStore::open(&cli.data_dir)?);

    match cli.command {
        Commands::Init { file } => cmd_init(store.as_ref(), &config, &file),
        Commands::Agent { once } => cmd_agent(store, &config, once),
        command => {
            let connector = Arc::new(OpenSshConnector::from_config(&config)?);
            let provisioner = Provisioner::new(config.clone(), connector);
            if cli.remote {
                let backend = RendezvousBackend::new(&config.pool_key, store.clone(), store)
                    .with_retry(config.retry);
                run(&Orchestrator::new(backend, provisioner), command)
            } else {
                let pool = Arc::new(SharedPool::load(store, &config.pool_key)?);
                run(&Orchestrator::new(LocalBackend::new(pool), provisioner), command)
            }
        }
    }
}

fn load_config(cli: &Cli) -> Result<PlatformConfig> {
    let mut config = match &cli.config {
        Some(path) => PlatformConfig::load(path)?,
        None => PlatformConfig::default(),
    };
    if let Some(pool) = &cli.pool {
        config.pool_key = pool.clone();
    }
    config.validate()?;
    Ok(config)
}

fn read_params(path: &Path) -> Result<Vec<VmParams>> {
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

fn print_vms(vms: &[Vm]) {
    if vms.is_empty() {
        println!("No VMs.");
        return;
    }
    let rows: Vec<VmRow> = vms.iter().map(VmRow::from).collect();
    println!("{}", Table::new(rows));
}

fn cmd_init(store: &FileStore, config: &PlatformConfig, file: &Path) -> Result<()> {
    let data = std::fs::read_to_string(file)?;
    let entries: Vec<PoolEntry> = serde_json::from_str(&data)?;
    if store.get(&config.pool_key)?.is_some() {
        return Err(Error::Config(format!("pool {} already exists", config.pool_key)));
    }

    let pool = entries.into_iter().fold(VmPool::new(&config.pool_key), |pool, entry| {
        pool.with_vm(Vm::new(entry.name, NetInfo::new(entry.external_ip, entry.internal_ip)))
    });
    store.update(&pool)?;
    println!("Pool registered: {} ({} VMs)", pool.key, pool.vms.len());
    Ok(())
}

fn cmd_agent(store: Arc<FileStore>, config: &PlatformConfig, once: bool) -> Result<()> {
    let pool = Arc::new(SharedPool::load(store.clone(), &config.pool_key)?);
    let agent = PoolAgent::new(pool, store);
    println!("Pool agent running for {}", config.pool_key);

    loop {
        let handled = agent.process()?;
        if once && handled {
            return Ok(());
        }
        std::thread::sleep(config.retry.interval());
    }
}

fn run<B: PoolBackend>(orch: &Orchestrator<B>, command: Commands) -> Result<()> {
    match command {
        Commands::Status => {
            let status = orch.status()?;
            println!(
                "{}",
                Table::new([StatusRow {
                    pool: status.key,
                    total: status.total,
                    free: status.free,
                    in_progress: status.in_progress,
                    in_use: status.in_use,
                }])
            );
        }
        Commands::List { group } => {
            let pool = orch.backend().snapshot()?;
            let vms: Vec<Vm> = match &group {
                Some(group) => pool.group_vms(group).cloned().collect(),
                None => pool.vms,
            };
            print_vms(&vms);
        }
        Commands::Create { group, params } => {
            let params = read_params(&params)?;
            println!("Creating {} VMs for group '{}'...", params.len(), group);
            let vms = orch.create_vms(&group, &params)?;
            print_vms(&vms);
        }
        Commands::Update { group, params } => {
            let params = read_params(&params)?;
            let vms = orch.update_vms(&group, &params)?;
            if vms.is_empty() {
                println!("Group '{}' is up to date.", group);
            } else {
                print_vms(&vms);
            }
        }
        Commands::Delete { group } => {
            let vms = orch.delete_vms(&group)?;
            println!("Released {} VMs from group '{}'.", vms.len(), group);
        }
        Commands::Verify { group } => {
            let pool = orch.backend().snapshot()?;
            let vms: Vec<Vm> = match &group {
                Some(group) => pool.group_vms(group).cloned().collect(),
                None => pool.vms,
            };
            orch.verify_vms(&vms)?;
            println!("Verified {} VMs.", vms.len());
        }
        Commands::Show { name } => {
            let detail = orch.server_detail(&name)?;
            let rows: Vec<AddressRow> = detail
                .addresses
                .iter()
                .map(|a| AddressRow {
                    network: a.network.clone(),
                    external: a.external_addr.clone(),
                    internal: a.internal_addr.clone(),
                })
                .collect();
            println!("{}", detail.name);
            println!("{}", Table::new(rows));
        }
        Commands::Init { .. } | Commands::Agent { .. } => {}
    }
    Ok(())
}
