//! # ippool - Buddy-tree IP address pool allocation
//!
//! This library manages pools of IPv4/IPv6 address space as buddy trees:
//! a fixed root prefix is split recursively into halves to satisfy
//! allocation requests, freed subnets pass through a hold-down grace
//! period, and adjacent free halves coalesce back together for reuse.
//!
//! ## Overview
//!
//! - **Buddy allocation**: best-fit carving of a requested prefix length,
//!   preferring the low half after each split.
//! - **Exact reservation**: carving out a caller-specified subnet, with
//!   speculative splits undone when the subnet cannot be provided.
//! - **Hold-down**: freed subnets are parked for a grace period before
//!   they become allocatable again.
//! - **Concurrency**: every mutating step re-reads its node under an
//!   exclusive row lock inside a transaction, so concurrent requests
//!   against the same tree serialize where their paths meet and commit
//!   atomically.
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - `addr`: family-tagged subnet arithmetic (containment, buddy splits)
//! - `pool`: the buddy tree, its mutations, and allocation bindings
//! - `store`: the transactional arena the tree is persisted in
//! - `config`: YAML pool definitions for the CLI
//! - `error`: the pool error taxonomy
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use ippool::pool::{Pool, RootConfig};
//! use ippool::store::MemoryStore;
//!
//! let store = MemoryStore::new();
//! let pool = Pool::create(
//!     &store,
//!     "10.0.0.0/16".parse()?,
//!     RootConfig {
//!         prefix_length_default: Some(27),
//!         ..RootConfig::default()
//!     },
//!     Some("backbone".to_string()),
//! )?;
//!
//! let block = pool.allocate_subnet(None, Utc::now())?;
//! println!("allocated {}", block.subnet);
//!
//! pool.free_subnet(block.id, true, Utc::now())?;
//! # Ok::<(), ippool::error::PoolError>(())
//! ```

pub mod addr;
pub mod config;
pub mod error;
pub mod pool;
pub mod store;

// Re-export commonly used types
pub use addr::{Family, IpSubnet};
pub use error::PoolError;
pub use pool::{AddressBlock, AllocationBinding, Pool, PoolStatus, RootConfig};
pub use store::{MemoryStore, NodeId, PoolStore, StoreTxn};
