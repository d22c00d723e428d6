//! Pool tree management module.
//!
//! This module implements the buddy-allocation tree over a pool store:
//! the address-block entity, the split/allocate/reserve mutations, the
//! coalescing and hold-down machinery, and the allocation-binding adapter
//! consumers use to claim and release subnets.

pub mod binding;
pub mod block;
pub(crate) mod reclaim;
pub(crate) mod tree;

// Re-export commonly used types
pub use binding::AllocationBinding;
pub use block::{AddressBlock, PoolStatus, RootConfig};

use chrono::{DateTime, Duration, Utc};
use log::info;

use crate::addr::{Family, IpSubnet};
use crate::error::PoolError;
use crate::store::{NodeId, PoolStore, StoreTxn};

use self::tree::ReserveOutcome;

/// Grace period before a freed subnet is handed back out.
pub fn default_hold_down_period() -> Duration {
    Duration::days(1)
}

/// Hold-down period recorded on a root's config, or the default.
fn hold_down_from_config(config: Option<&RootConfig>) -> Result<Duration, PoolError> {
    match config.and_then(|config| config.hold_down_period) {
        Some(period) => Duration::from_std(period).map_err(|e| {
            PoolError::InvalidRequest(format!("hold-down period out of range: {}", e))
        }),
        None => Ok(default_hold_down_period()),
    }
}

/// Handle to one pool tree inside a store.
///
/// Each operation runs in its own transaction: the traversal's splits and
/// status changes become visible atomically on success, and a hard error
/// rolls everything back.
pub struct Pool<'a, S: PoolStore> {
    store: &'a S,
    root: NodeId,
    root_subnet: IpSubnet,
    name: String,
    hold_down_period: Duration,
}

impl<'a, S: PoolStore> Pool<'a, S> {
    /// Administratively create a new pool root covering `subnet`.
    pub fn create(
        store: &'a S,
        subnet: IpSubnet,
        config: RootConfig,
        description: Option<String>,
    ) -> Result<Self, PoolError> {
        if let (Some(min), Some(max)) = (config.prefix_length_minimum, config.prefix_length_maximum)
        {
            if min > max {
                return Err(PoolError::InvalidRequest(format!(
                    "minimum prefix length /{} exceeds maximum /{}",
                    min, max
                )));
            }
        }
        let hold_down_period = hold_down_from_config(Some(&config))?;
        let mut txn = store.begin()?;
        let id = txn.allocate_id();
        let root = AddressBlock::new_root(id, subnet, config, description);
        let name = root.to_string();
        txn.insert(root)?;
        txn.commit()?;
        info!("created pool '{}'", name);
        Ok(Pool {
            store,
            root: id,
            root_subnet: subnet,
            name,
            hold_down_period,
        })
    }

    /// Open an existing pool by its root block id.
    pub fn open(store: &'a S, root: NodeId) -> Result<Self, PoolError> {
        let mut txn = store.begin()?;
        let block = txn.get(root)?;
        if !block.is_root() {
            return Err(PoolError::InvalidRequest(format!(
                "address block {} is not a pool root",
                block
            )));
        }
        Ok(Pool {
            store,
            root,
            root_subnet: block.subnet,
            name: block.to_string(),
            hold_down_period: hold_down_from_config(block.config.as_ref())?,
        })
    }

    /// Override the hold-down grace period.
    pub fn with_hold_down_period(mut self, period: Duration) -> Self {
        self.hold_down_period = period;
        self
    }

    /// Root block id of this pool.
    pub fn root_id(&self) -> NodeId {
        self.root
    }

    /// Address family of this pool.
    pub fn family(&self) -> Family {
        self.root_subnet.family()
    }

    /// Human-readable pool name (description or subnet).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read one address block without locking it.
    pub fn block(&self, id: NodeId) -> Result<AddressBlock, PoolError> {
        let mut txn = self.store.begin()?;
        txn.get(id)
    }

    /// Allocate a subnet of `prefix_length` (or the pool default) using
    /// buddy allocation. Expired hold-downs are reclaimed first.
    pub fn allocate_subnet(
        &self,
        prefix_length: Option<u8>,
        now: DateTime<Utc>,
    ) -> Result<AddressBlock, PoolError> {
        let mut txn = self.store.begin()?;
        let root = txn.lock(self.root)?;
        let config = root.config.clone().unwrap_or_default();

        let prefix_length = prefix_length
            .or(config.prefix_length_default)
            .ok_or_else(|| {
                PoolError::InvalidRequest(format!(
                    "no prefix length requested and pool '{}' has no default",
                    self.name
                ))
            })?;
        self.check_bounds(&config, prefix_length)?;

        reclaim::reclaim_expired(&mut txn, now - self.hold_down_period)?;

        match tree::allocate_buddy(&mut txn, self.root, prefix_length)? {
            Some(id) => {
                let block = txn.get(id)?;
                txn.commit()?;
                info!("allocated {} from pool '{}'", block.subnet, self.name);
                Ok(block)
            }
            None => {
                // Exhaustion is not an abort: splits performed along the
                // way and reclaimed hold-downs stay in place.
                txn.commit()?;
                Err(PoolError::Exhausted {
                    prefix_length,
                    pool: self.name.clone(),
                })
            }
        }
    }

    /// Reserve the exact subnet `subnet` from this pool.
    pub fn reserve_subnet(
        &self,
        subnet: IpSubnet,
        now: DateTime<Utc>,
    ) -> Result<AddressBlock, PoolError> {
        match self.reserve_inner(subnet, false, now)? {
            ReserveOutcome::Reserved(id) => {
                let block = self.block(id)?;
                info!("reserved {} from pool '{}'", block.subnet, self.name);
                Ok(block)
            }
            _ => Err(PoolError::SubnetUnavailable {
                subnet: subnet.to_string(),
                pool: self.name.clone(),
            }),
        }
    }

    /// Check whether the exact subnet `subnet` could be reserved, without
    /// mutating the tree.
    pub fn check_subnet(&self, subnet: IpSubnet, now: DateTime<Utc>) -> Result<(), PoolError> {
        match self.reserve_inner(subnet, true, now)? {
            ReserveOutcome::Unavailable => Err(PoolError::SubnetUnavailable {
                subnet: subnet.to_string(),
                pool: self.name.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn reserve_inner(
        &self,
        subnet: IpSubnet,
        check_only: bool,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome, PoolError> {
        if subnet.prefix_length() == 31 {
            return Err(PoolError::InvalidRequest(
                "/31 subnets cannot be allocated".to_string(),
            ));
        }
        let mut txn = self.store.begin()?;
        let root = txn.lock(self.root)?;
        let config = root.config.clone().unwrap_or_default();
        self.check_bounds(&config, subnet.prefix_length())?;

        reclaim::reclaim_expired(&mut txn, now - self.hold_down_period)?;

        let outcome = tree::reserve_in(&mut txn, self.root, subnet, check_only)?;
        // A failed reservation undoes its splits, so committing on every
        // path keeps only the hold-down reclaim side effects.
        txn.commit()?;
        Ok(outcome)
    }

    /// Release an allocated leaf back to the pool, into hold-down unless
    /// `hold_down` is false.
    pub fn free_subnet(
        &self,
        leaf: NodeId,
        hold_down: bool,
        now: DateTime<Utc>,
    ) -> Result<(), PoolError> {
        let mut txn = self.store.begin()?;
        reclaim::free_leaf(&mut txn, leaf, hold_down, now)?;
        txn.commit()?;
        Ok(())
    }

    /// Reclaim all blocks across the store whose hold-down period has
    /// expired as of `now`. Returns the number of blocks reclaimed.
    pub fn reclaim_held_down(&self, now: DateTime<Utc>) -> Result<usize, PoolError> {
        let mut txn = self.store.begin()?;
        let reclaimed = reclaim::reclaim_expired(&mut txn, now - self.hold_down_period)?;
        txn.commit()?;
        if reclaimed > 0 {
            info!("reclaimed {} held-down blocks", reclaimed);
        }
        Ok(reclaimed)
    }

    /// Find the block covering exactly `subnet`, if the tree currently
    /// has one. Read-only; tolerates concurrent structural changes by
    /// re-reading on each step.
    pub fn find_block(&self, subnet: IpSubnet) -> Result<Option<AddressBlock>, PoolError> {
        let mut txn = self.store.begin()?;
        let mut current = txn.get(self.root)?;
        loop {
            if !current.subnet.contains(&subnet) {
                return Ok(None);
            }
            if current.subnet == subnet {
                return Ok(Some(current));
            }
            let Some((left, right)) = current.children else {
                return Ok(None);
            };
            let left_child = txn.get(left)?;
            current = if left_child.subnet.contains(&subnet) {
                left_child
            } else {
                txn.get(right)?
            };
        }
    }

    /// Render the tree as an indented listing, one block per line.
    pub fn dump_tree(&self) -> Result<String, PoolError> {
        let mut txn = self.store.begin()?;
        let mut out = String::new();
        self.dump_node(&mut txn, self.root, 0, &mut out)?;
        Ok(out)
    }

    fn dump_node<T: StoreTxn>(
        &self,
        txn: &mut T,
        node: NodeId,
        depth: usize,
        out: &mut String,
    ) -> Result<(), PoolError> {
        let block = txn.get(node)?;
        out.push_str(&"  ".repeat(depth));
        out.push_str(&format!("{} ({})\n", block.subnet, block.status));
        if let Some((left, right)) = block.children {
            self.dump_node(txn, left, depth + 1, out)?;
            self.dump_node(txn, right, depth + 1, out)?;
        }
        Ok(())
    }

    /// Verify the tree-wide invariants: children partition their parent's
    /// range into the two buddy halves, parent and root backlinks are
    /// consistent, a non-leaf is full exactly when both children are, and
    /// hold-down state only appears on leaves with a timestamp.
    pub fn check_invariants(&self) -> Result<(), PoolError> {
        let mut txn = self.store.begin()?;
        self.check_node(&mut txn, self.root)?;
        Ok(())
    }

    fn check_node<T: StoreTxn>(&self, txn: &mut T, node: NodeId) -> Result<(), PoolError> {
        let block = txn.get(node)?;
        if block.top_level != self.root {
            return Err(PoolError::StructuralViolation(format!(
                "block {} has top_level {} instead of {}",
                block, block.top_level, self.root
            )));
        }
        if block.is_held_down() {
            if !block.is_leaf() {
                return Err(PoolError::StructuralViolation(format!(
                    "non-leaf block {} is held down",
                    block
                )));
            }
            if block.held_from.is_none() {
                return Err(PoolError::StructuralViolation(format!(
                    "held-down block {} has no hold-down timestamp",
                    block
                )));
            }
        }
        let Some((left, right)) = block.children else {
            return Ok(());
        };
        let (low, high) = block.subnet.split()?;
        let left_child = txn.get(left)?;
        let right_child = txn.get(right)?;
        if left_child.subnet != low || right_child.subnet != high {
            return Err(PoolError::StructuralViolation(format!(
                "children of {} are {} and {}, expected {} and {}",
                block, left_child.subnet, right_child.subnet, low, high
            )));
        }
        for child in [&left_child, &right_child] {
            if child.parent != Some(block.id) {
                return Err(PoolError::StructuralViolation(format!(
                    "block {} does not point back to its parent {}",
                    child, block
                )));
            }
        }
        let both_full = left_child.status == PoolStatus::Full
            && right_child.status == PoolStatus::Full;
        if (block.status == PoolStatus::Full) != both_full {
            return Err(PoolError::StructuralViolation(format!(
                "block {} is {} but its children are {} and {}",
                block, block.status, left_child.status, right_child.status
            )));
        }
        self.check_node(txn, left)?;
        self.check_node(txn, right)
    }

    fn check_bounds(&self, config: &RootConfig, prefix_length: u8) -> Result<(), PoolError> {
        if prefix_length == 31 {
            return Err(PoolError::InvalidRequest(
                "/31 subnets cannot be allocated".to_string(),
            ));
        }
        if let Some(minimum) = config.prefix_length_minimum {
            if prefix_length < minimum {
                return Err(PoolError::InvalidRequest(format!(
                    "prefix length /{} is coarser than the pool minimum /{}",
                    prefix_length, minimum
                )));
            }
        }
        if let Some(maximum) = config.prefix_length_maximum {
            if prefix_length > maximum {
                return Err(PoolError::InvalidRequest(format!(
                    "prefix length /{} is finer than the pool maximum /{}",
                    prefix_length, maximum
                )));
            }
        }
        Ok(())
    }
}
