//! Coalescing and hold-down reclaim.
//!
//! Freed blocks are either returned to the pool immediately or parked in
//! hold-down for a grace period first, so a just-released subnet is not
//! handed straight back out. Coalescing walks the ancestor chain, merging
//! sibling pairs that have both become free and propagating status changes
//! up to the root.

use chrono::{DateTime, Utc};
use log::debug;

use crate::error::PoolError;
use crate::pool::block::PoolStatus;
use crate::store::{NodeId, StoreTxn};

/// Walk upward from `node`, collapsing subtrees that no longer need to
/// stay split and propagating status changes to ancestors.
pub(crate) fn reclaim_chain<T: StoreTxn>(txn: &mut T, node: NodeId) -> Result<(), PoolError> {
    let mut block = txn.lock(node)?;

    if matches!(block.status, PoolStatus::Free | PoolStatus::HeldDown) {
        // Nothing to consolidate here; the interesting computation starts
        // at the parent.
        if let Some(parent) = block.parent {
            return reclaim_chain(txn, parent);
        }
        return Ok(());
    }

    let Some((left, right)) = block.children else {
        return Ok(());
    };
    let left_child = txn.lock(left)?;
    let right_child = txn.lock(right)?;

    let free_children = [&left_child, &right_child]
        .iter()
        .filter(|child| child.status == PoolStatus::Free)
        .count();

    if free_children == 2 {
        // When all children are free, we don't need them anymore.
        txn.delete(left)?;
        txn.delete(right)?;
        block.children = None;
        block.status = PoolStatus::Free;
        txn.update(&block)?;
        debug!("coalesced children back into {}", block.subnet);
    } else if free_children == 1 {
        block.status = PoolStatus::Partial;
        txn.update(&block)?;
    } else if [&left_child, &right_child].iter().any(|child| {
        matches!(child.status, PoolStatus::Partial | PoolStatus::HeldDown)
    }) {
        // If any of the children are partial or held-down, we are partial
        // as well.
        block.status = PoolStatus::Partial;
        txn.update(&block)?;
    } else {
        // Both children full; this block is correctly full already.
        return Ok(());
    }

    if let Some(parent) = block.parent {
        return reclaim_chain(txn, parent);
    }
    Ok(())
}

/// Release a full leaf back to the pool, either into hold-down (with
/// `held_from` set to `now`) or directly to free, then coalesce from it.
///
/// Freeing a non-full or non-leaf block is caller misuse and fails
/// without mutating anything.
pub(crate) fn free_leaf<T: StoreTxn>(
    txn: &mut T,
    leaf: NodeId,
    hold_down: bool,
    now: DateTime<Utc>,
) -> Result<(), PoolError> {
    let mut block = txn.lock(leaf)?;

    if block.status != PoolStatus::Full {
        return Err(PoolError::StructuralViolation(format!(
            "cannot free non-full address block {}",
            block
        )));
    }
    if !block.is_leaf() {
        return Err(PoolError::StructuralViolation(format!(
            "cannot free non-leaf address block {}",
            block
        )));
    }

    if hold_down {
        block.status = PoolStatus::HeldDown;
        block.held_from = Some(now);
        debug!("held down {}", block.subnet);
    } else {
        block.status = PoolStatus::Free;
        debug!("freed {}", block.subnet);
    }
    txn.update(&block)?;

    reclaim_chain(txn, leaf)
}

/// Return every held-down block whose hold-down started at or before
/// `cutoff` to the free state, coalescing from each. Returns the number
/// of blocks reclaimed.
pub(crate) fn reclaim_expired<T: StoreTxn>(
    txn: &mut T,
    cutoff: DateTime<Utc>,
) -> Result<usize, PoolError> {
    let expired = txn.held_down_before(cutoff)?;
    let mut reclaimed = 0;
    for id in expired {
        let mut block = txn.lock(id)?;
        // Re-check under the lock; another caller may have raced us.
        if block.status != PoolStatus::HeldDown
            || !block.held_from.is_some_and(|held| held <= cutoff)
        {
            continue;
        }
        block.status = PoolStatus::Free;
        block.held_from = None;
        txn.update(&block)?;
        debug!("hold-down expired for {}", block.subnet);
        reclaim_chain(txn, id)?;
        reclaimed += 1;
    }
    Ok(reclaimed)
}
