use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use env_logger::Env;
use log::info;

use ippool::addr::IpSubnet;
use ippool::config;
use ippool::pool::{Pool, PoolStatus};
use ippool::store::{MemoryStore, NodeId, PoolStore, StoreTxn};

/// Buddy-tree IP address pool allocator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON state file holding the pool trees
    #[arg(short, long, default_value = "pool_state.json")]
    state: PathBuf,

    /// Override the hold-down grace period configured on the pools
    /// (e.g. "1day", "12h")
    #[arg(long)]
    hold_down_period: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a fresh state file from a YAML pool definition
    Init {
        /// Path to the pool definition YAML file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Allocate a subnet using buddy allocation
    Allocate {
        /// Pool to draw from (description or root subnet); may be
        /// omitted when the state holds a single pool
        #[arg(short, long)]
        pool: Option<String>,
        /// Requested prefix length (defaults to the pool's configured
        /// default)
        #[arg(long)]
        prefix_length: Option<u8>,
    },
    /// Reserve an exact subnet
    Reserve {
        /// The subnet to reserve, e.g. "10.0.0.64/27"
        subnet: String,
        /// Only check feasibility, do not allocate
        #[arg(long)]
        check: bool,
        #[arg(short, long)]
        pool: Option<String>,
    },
    /// Return an allocated subnet to its pool
    Free {
        /// The allocated subnet, e.g. "10.0.0.64/27"
        subnet: String,
        /// Skip the hold-down grace period
        #[arg(long)]
        no_hold_down: bool,
        #[arg(short, long)]
        pool: Option<String>,
    },
    /// Reclaim subnets whose hold-down period has expired
    Reclaim,
    /// Print the pool trees
    Show {
        /// Also verify the tree invariants
        #[arg(long)]
        check: bool,
    },
}

fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    let args = Args::parse();

    // Initialize logging with default filter level of "info"
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let hold_down_override = match args.hold_down_period.as_deref() {
        Some(text) => {
            let period = humantime_serde::re::humantime::parse_duration(text)
                .wrap_err_with(|| format!("invalid hold-down period '{}'", text))?;
            Some(
                chrono::Duration::from_std(period)
                    .map_err(|e| eyre!("hold-down period out of range: {}", e))?,
            )
        }
        None => None,
    };

    match args.command {
        Command::Init { config } => {
            let definitions = config::load_config(&config)?;
            let store = MemoryStore::new();
            for definition in &definitions.pools {
                Pool::create(
                    &store,
                    definition.subnet,
                    definition.root_config(definitions.hold_down_period),
                    definition.description.clone(),
                )?;
            }
            store.save_snapshot(&args.state)?;
            info!(
                "Initialized {} pools in {:?}",
                definitions.pools.len(),
                args.state
            );
        }
        Command::Allocate {
            pool,
            prefix_length,
        } => {
            let store = MemoryStore::load_snapshot(&args.state)?;
            let pool = with_override(open_pool(&store, pool.as_deref())?, hold_down_override);
            let block = pool.allocate_subnet(prefix_length, Utc::now())?;
            store.save_snapshot(&args.state)?;
            println!("{}", block.subnet);
        }
        Command::Reserve {
            subnet,
            check,
            pool,
        } => {
            let subnet: IpSubnet = subnet.parse()?;
            let store = MemoryStore::load_snapshot(&args.state)?;
            let pool = with_override(open_pool(&store, pool.as_deref())?, hold_down_override);
            if check {
                pool.check_subnet(subnet, Utc::now())?;
                info!("{} is available in pool '{}'", subnet, pool.name());
            } else {
                let block = pool.reserve_subnet(subnet, Utc::now())?;
                store.save_snapshot(&args.state)?;
                println!("{}", block.subnet);
            }
        }
        Command::Free {
            subnet,
            no_hold_down,
            pool,
        } => {
            let subnet: IpSubnet = subnet.parse()?;
            let store = MemoryStore::load_snapshot(&args.state)?;
            let pool = with_override(open_pool(&store, pool.as_deref())?, hold_down_override);
            let block = pool
                .find_block(subnet)?
                .ok_or_else(|| eyre!("no allocated block {} in pool '{}'", subnet, pool.name()))?;
            if block.status != PoolStatus::Full || !block.is_leaf() {
                return Err(eyre!("{} is not an allocated leaf subnet", subnet));
            }
            pool.free_subnet(block.id, !no_hold_down, Utc::now())?;
            store.save_snapshot(&args.state)?;
            info!("Freed {} back into pool '{}'", subnet, pool.name());
        }
        Command::Reclaim => {
            let store = MemoryStore::load_snapshot(&args.state)?;
            let roots = pool_roots(&store)?;
            // The hold-down scan covers every pool in the store; any
            // pool handle can drive it.
            let root = *roots
                .first()
                .ok_or_else(|| eyre!("state file holds no pools"))?;
            let pool = with_override(Pool::open(&store, root)?, hold_down_override);
            let reclaimed = pool.reclaim_held_down(Utc::now())?;
            store.save_snapshot(&args.state)?;
            info!("Reclaimed {} held-down blocks", reclaimed);
        }
        Command::Show { check } => {
            let store = MemoryStore::load_snapshot(&args.state)?;
            for root in pool_roots(&store)? {
                let pool = Pool::open(&store, root)?;
                println!("{}", pool.name());
                print!("{}", pool.dump_tree()?);
                if check {
                    pool.check_invariants()?;
                    info!("Invariants hold for pool '{}'", pool.name());
                }
            }
        }
    }

    Ok(())
}

/// Apply the command-line hold-down override, when one was given;
/// otherwise the pool keeps the period recorded on its root.
fn with_override(
    pool: Pool<'_, MemoryStore>,
    period: Option<chrono::Duration>,
) -> Pool<'_, MemoryStore> {
    match period {
        Some(period) => pool.with_hold_down_period(period),
        None => pool,
    }
}

fn pool_roots(store: &MemoryStore) -> Result<Vec<NodeId>> {
    let mut txn = store.begin()?;
    Ok(txn.roots()?)
}

/// Select a pool root by description or root subnet; with a single pool
/// in the store, no selector is needed.
fn open_pool<'a>(store: &'a MemoryStore, selector: Option<&str>) -> Result<Pool<'a, MemoryStore>> {
    let roots = pool_roots(store)?;
    match selector {
        None => {
            if roots.len() == 1 {
                return Ok(Pool::open(store, roots[0])?);
            }
            Err(eyre!(
                "state file holds {} pools; select one with --pool",
                roots.len()
            ))
        }
        Some(name) => {
            for root in roots {
                let pool = Pool::open(store, root)?;
                let block = pool.block(root)?;
                if block.description.as_deref() == Some(name)
                    || block.subnet.to_string() == name
                {
                    return Ok(pool);
                }
            }
            Err(eyre!("no pool named '{}' in the state file", name))
        }
    }
}
