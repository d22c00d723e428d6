//! Buddy tree mutation: splitting, best-fit allocation, and exact
//! reservation.
//!
//! Both traversals follow the same locking discipline: lock the current
//! row on entry, lock each candidate child before examining it, and
//! recompute status roll-ups from fresh reads after a child operation
//! completes. Buddy allocation descends into the lower half after a split
//! and leaves the split in place if the descent fails; reservation descends
//! toward the half that contains the target and undoes a speculative split
//! when the target cannot be carved out or when only checking feasibility.

use log::debug;

use crate::addr::IpSubnet;
use crate::error::PoolError;
use crate::pool::block::{AddressBlock, PoolStatus};
use crate::store::{NodeId, StoreTxn};

/// Result of an exact-reservation attempt within one subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReserveOutcome {
    /// The target subnet cannot be carved out of this subtree.
    Unavailable,
    /// Feasibility check passed; nothing was mutated.
    Feasible,
    /// The target subnet was reserved as this block.
    Reserved(NodeId),
}

/// Split a free block into its two buddy halves.
///
/// Must be called with the block's row lock held; mutates `block` in
/// place (children set, status Partial) and stages the update.
pub(crate) fn split_buddy<T: StoreTxn>(
    txn: &mut T,
    block: &mut AddressBlock,
) -> Result<(NodeId, NodeId), PoolError> {
    let (low, high) = block.subnet.split()?;

    let left_id = txn.allocate_id();
    txn.insert(AddressBlock::new_child(left_id, low, block))?;
    let right_id = txn.allocate_id();
    txn.insert(AddressBlock::new_child(right_id, high, block))?;

    block.children = Some((left_id, right_id));
    block.status = PoolStatus::Partial;
    txn.update(block)?;

    debug!("split {} into {} and {}", block.subnet, low, high);
    Ok((left_id, right_id))
}

/// Allocate a free block of exactly `prefix_length` from the subtree
/// rooted at `node`, splitting free blocks as needed.
///
/// Returns `Ok(None)` when no such block exists within this subtree; the
/// tree keeps any splits performed along the way.
pub(crate) fn allocate_buddy<T: StoreTxn>(
    txn: &mut T,
    node: NodeId,
    prefix_length: u8,
) -> Result<Option<NodeId>, PoolError> {
    let mut block = txn.lock(node)?;

    if block.subnet.prefix_length() > prefix_length {
        // We have gone too far, allocation has failed
        return Ok(None);
    }

    if block.subnet.prefix_length() == prefix_length && block.status == PoolStatus::Free {
        // We have found a free block of the proper size, use it
        block.status = PoolStatus::Full;
        txn.update(&block)?;
        return Ok(Some(block.id));
    }

    if let Some((left, right)) = block.children {
        // Children are ordered by ascending address; lock each candidate
        // before examining it so concurrent allocations cannot pick the
        // same free child.
        for child_id in [left, right] {
            let child = txn.lock(child_id)?;
            if child.status == PoolStatus::Full {
                continue;
            }
            if let Some(found) = allocate_buddy(txn, child_id, prefix_length)? {
                roll_up_full(txn, node, left, right)?;
                return Ok(Some(found));
            }
        }
        return Ok(None);
    }

    if block.status != PoolStatus::Free {
        // Held-down or already-allocated leaves cannot be split
        return Ok(None);
    }

    // Split ourselves into two halves and traverse the left half
    let (left, _right) = split_buddy(txn, &mut block)?;
    allocate_buddy(txn, left, prefix_length)
}

/// Attempt to carve out exactly `target` from the subtree rooted at
/// `node`. With `check_only`, reports feasibility and leaves the tree
/// untouched.
pub(crate) fn reserve_in<T: StoreTxn>(
    txn: &mut T,
    node: NodeId,
    target: IpSubnet,
    check_only: bool,
) -> Result<ReserveOutcome, PoolError> {
    // /31 subnets are never allocatable; point-to-point addressing is
    // excluded by policy.
    if target.prefix_length() == 31 {
        return Ok(ReserveOutcome::Unavailable);
    }

    let mut block = txn.lock(node)?;

    if !block.subnet.contains(&target) {
        // We don't contain this network, so there is nothing to be done
        return Ok(ReserveOutcome::Unavailable);
    }

    if block.subnet == target && block.status == PoolStatus::Free {
        // We are the network, mark as full and save
        if check_only {
            return Ok(ReserveOutcome::Feasible);
        }
        block.status = PoolStatus::Full;
        txn.update(&block)?;
        return Ok(ReserveOutcome::Reserved(block.id));
    }

    if let Some((left, right)) = block.children {
        for child_id in [left, right] {
            let child = txn.lock(child_id)?;
            if child.status == PoolStatus::Full {
                continue;
            }
            match reserve_in(txn, child_id, target, check_only)? {
                ReserveOutcome::Unavailable => continue,
                outcome => {
                    if !check_only {
                        roll_up_full(txn, node, left, right)?;
                    }
                    return Ok(outcome);
                }
            }
        }
        return Ok(ReserveOutcome::Unavailable);
    }

    if block.status != PoolStatus::Free {
        return Ok(ReserveOutcome::Unavailable);
    }

    // Split speculatively and descend toward the half containing the
    // target.
    let (low_subnet, _) = block.subnet.split()?;
    let (left, right) = split_buddy(txn, &mut block)?;
    let next = if low_subnet.contains(&target) {
        left
    } else {
        right
    };
    let outcome = reserve_in(txn, next, target, check_only)?;

    if outcome == ReserveOutcome::Unavailable || check_only {
        // Nothing was allocated, or this was only a feasibility check:
        // remove the children again and become free.
        txn.delete(left)?;
        txn.delete(right)?;
        block.children = None;
        block.status = PoolStatus::Free;
        txn.update(&block)?;
        debug!("undid speculative split of {}", block.subnet);
    }

    Ok(outcome)
}

/// Mark `node` Full when both of its children are, recomputed under the
/// children's locks after a child mutation.
fn roll_up_full<T: StoreTxn>(
    txn: &mut T,
    node: NodeId,
    left: NodeId,
    right: NodeId,
) -> Result<(), PoolError> {
    let left_full = txn.lock(left)?.status == PoolStatus::Full;
    let right_full = txn.lock(right)?.status == PoolStatus::Full;
    if left_full && right_full {
        let mut block = txn.lock(node)?;
        block.status = PoolStatus::Full;
        txn.update(&block)?;
    }
    Ok(())
}
