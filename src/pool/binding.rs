//! Allocation bindings.
//!
//! A binding ties one consumer-facing request (family, prefix length,
//! target pool, optional exact-subnet hint) to at most one allocated leaf.
//! Satisfying and freeing a binding are idempotent at this layer: freeing
//! an unbound binding is a no-op, and a satisfied binding can hand its
//! allocation to an equivalent request without a free/reallocate cycle.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::addr::{Family, IpSubnet};
use crate::error::PoolError;
use crate::pool::Pool;
use crate::store::{NodeId, PoolStore};

/// A consumer's allocation request and, once satisfied, its claim on one
/// full leaf of the pool tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationBinding {
    /// Requested address family.
    pub family: Family,
    /// Requested subnet size.
    pub prefix_length: u8,
    /// Root block id of the pool to draw from.
    pub pool: NodeId,
    /// Caller-requested exact subnet address, if any.
    pub subnet_hint: Option<IpAddr>,
    allocation: Option<NodeId>,
}

impl AllocationBinding {
    pub fn new(
        family: Family,
        prefix_length: u8,
        pool: NodeId,
        subnet_hint: Option<IpAddr>,
    ) -> Self {
        AllocationBinding {
            family,
            prefix_length,
            pool,
            subnet_hint,
            allocation: None,
        }
    }

    /// The allocated leaf, if this binding has been satisfied.
    pub fn allocation(&self) -> Option<NodeId> {
        self.allocation
    }

    /// Attempt to satisfy this binding from `pool`. Expired hold-downs
    /// are reclaimed first; a subnet hint turns the request into an exact
    /// reservation.
    pub fn satisfy<S: PoolStore>(
        &mut self,
        pool: &Pool<'_, S>,
        now: DateTime<Utc>,
    ) -> Result<(), PoolError> {
        if pool.root_id() != self.pool {
            return Err(PoolError::InvalidRequest(format!(
                "binding targets pool root {} but was given '{}'",
                self.pool,
                pool.name()
            )));
        }
        if pool.family() != self.family {
            return Err(PoolError::InvalidRequest(format!(
                "binding requests {} but pool '{}' is {}",
                self.family,
                pool.name(),
                pool.family()
            )));
        }

        let block = match self.subnet_hint {
            Some(hint) => {
                let subnet = IpSubnet::new(hint, self.prefix_length)?;
                pool.reserve_subnet(subnet, now)?
            }
            None => pool.allocate_subnet(Some(self.prefix_length), now)?,
        };
        debug!("binding satisfied with {}", block);
        self.allocation = Some(block.id);
        Ok(())
    }

    /// Free this binding's allocation back into hold-down. A no-op when
    /// the binding is unbound.
    pub fn free<S: PoolStore>(
        &mut self,
        pool: &Pool<'_, S>,
        now: DateTime<Utc>,
    ) -> Result<(), PoolError> {
        let Some(allocation) = self.allocation else {
            return Ok(());
        };
        pool.free_subnet(allocation, true, now)?;
        self.allocation = None;
        Ok(())
    }

    /// Returns true if this binding holds an allocation that matches its
    /// request: same family, prefix length, hinted address, and pool root.
    pub fn is_satisfied<S: PoolStore>(&self, pool: &Pool<'_, S>) -> bool {
        let Some(allocation) = self.allocation else {
            return false;
        };
        let Ok(block) = pool.block(allocation) else {
            return false;
        };
        if block.family() != self.family {
            return false;
        }
        if block.subnet.prefix_length() != self.prefix_length {
            return false;
        }
        if let Some(hint) = self.subnet_hint {
            match IpSubnet::new(hint, self.prefix_length) {
                Ok(hinted) => {
                    if block.subnet != hinted {
                        return false;
                    }
                }
                Err(_) => return false,
            }
        }
        block.top_level == self.pool
    }

    /// Returns true if both bindings are satisfied and share the same
    /// allocated leaf.
    pub fn exactly_matches<S: PoolStore>(&self, other: &Self, pool: &Pool<'_, S>) -> bool {
        if !self.is_satisfied(pool) || !other.is_satisfied(pool) {
            return false;
        }
        self.allocation == other.allocation
    }

    /// Attempt to satisfy this binding by taking the allocation from an
    /// existing one, avoiding a free/reallocate cycle. Succeeds only when
    /// family, prefix length, pool, and subnet hint all match; both
    /// bindings are updated together or not at all.
    pub fn satisfy_from<S: PoolStore>(
        &mut self,
        other: &mut Self,
        pool: &Pool<'_, S>,
    ) -> Result<bool, PoolError> {
        if !other.is_satisfied(pool) {
            return Ok(false);
        }
        if other.family != self.family
            || other.prefix_length != self.prefix_length
            || other.pool != self.pool
            || other.subnet_hint != self.subnet_hint
        {
            return Ok(false);
        }

        self.allocation = other.allocation.take();
        info!(
            "transferred allocation of /{} in pool '{}' between bindings",
            self.prefix_length,
            pool.name()
        );
        Ok(true)
    }
}
