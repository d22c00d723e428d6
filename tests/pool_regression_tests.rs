//! End-to-end regression tests for the pool allocator: the buddy
//! allocation scenarios, reservation semantics, hold-down life cycle,
//! binding behavior, and concurrent allocation against one tree.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use chrono::{Duration, Utc};
use ippool::addr::{Family, IpSubnet};
use ippool::error::PoolError;
use ippool::pool::{default_hold_down_period, AllocationBinding, Pool, PoolStatus, RootConfig};
use ippool::store::{MemoryStore, PoolStore, StoreTxn};

fn subnet(s: &str) -> IpSubnet {
    s.parse().unwrap()
}

/// A /24 pool allowing /25 through /28 allocations with a /27 default,
/// mirroring a typical mesh-node deployment pool.
fn small_pool(store: &MemoryStore) -> Pool<'_, MemoryStore> {
    Pool::create(
        store,
        subnet("10.0.0.0/24"),
        RootConfig {
            prefix_length_default: Some(27),
            prefix_length_minimum: Some(25),
            prefix_length_maximum: Some(28),
            ..RootConfig::default()
        },
        Some("nodes".to_string()),
    )
    .unwrap()
}

fn tree_rows(store: &MemoryStore) -> Vec<(String, PoolStatus)> {
    let mut txn = store.begin().unwrap();
    let mut rows = Vec::new();
    let mut stack = txn.roots().unwrap();
    while let Some(id) = stack.pop() {
        let block = txn.get(id).unwrap();
        rows.push((block.subnet.to_string(), block.status));
        if let Some((left, right)) = block.children {
            stack.push(left);
            stack.push(right);
        }
    }
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    rows
}

#[test]
fn test_buddy_allocation_addresses_follow_split_order() {
    // Scenario: successive /27 allocations from a /24 pool walk the
    // low-address halves first.
    let store = MemoryStore::new();
    let pool = small_pool(&store);
    let now = Utc::now();

    let first = pool.allocate_subnet(Some(27), now).unwrap();
    assert_eq!(first.subnet.to_string(), "10.0.0.0/27");
    assert_eq!(
        pool.block(pool.root_id()).unwrap().status,
        PoolStatus::Partial
    );

    let second = pool.allocate_subnet(Some(27), now).unwrap();
    assert_eq!(second.subnet.to_string(), "10.0.0.32/27");

    let third = pool.allocate_subnet(Some(27), now).unwrap();
    assert_eq!(third.subnet.to_string(), "10.0.0.64/27");

    pool.check_invariants().unwrap();
}

#[test]
fn test_allocation_coarser_than_pool_fails() {
    let store = MemoryStore::new();
    let pool = Pool::create(
        &store,
        subnet("10.0.0.0/24"),
        RootConfig {
            prefix_length_default: None,
            prefix_length_minimum: Some(20),
            prefix_length_maximum: Some(28),
            ..RootConfig::default()
        },
        None,
    )
    .unwrap();

    // A /20 passes the configured bounds but is coarser than the pool
    // itself; the traversal overshoots immediately.
    let err = pool.allocate_subnet(Some(20), Utc::now()).unwrap_err();
    assert!(matches!(err, PoolError::Exhausted { .. }));
}

#[test]
fn test_check_only_reservation_leaves_tree_untouched() {
    let store = MemoryStore::new();
    let pool = small_pool(&store);

    let before = tree_rows(&store);
    pool.check_subnet(subnet("10.0.0.64/27"), Utc::now()).unwrap();
    assert_eq!(tree_rows(&store), before);
}

#[test]
fn test_failed_reservation_leaves_tree_untouched() {
    let store = MemoryStore::new();
    let pool = small_pool(&store);
    let now = Utc::now();

    pool.reserve_subnet(subnet("10.0.0.64/27"), now).unwrap();
    let before = tree_rows(&store);

    assert!(pool.reserve_subnet(subnet("10.0.0.64/27"), now).is_err());
    assert_eq!(tree_rows(&store), before);
    pool.check_invariants().unwrap();
}

#[test]
fn test_allocate_then_free_restores_tree_shape() {
    let store = MemoryStore::new();
    let pool = small_pool(&store);
    let now = Utc::now();

    let before = tree_rows(&store);
    let block = pool.allocate_subnet(Some(27), now).unwrap();
    pool.free_subnet(block.id, false, now).unwrap();
    assert_eq!(tree_rows(&store), before);
}

#[test]
fn test_slash_31_always_fails() {
    let store = MemoryStore::new();
    let pool = Pool::create(
        &store,
        subnet("10.0.0.0/24"),
        RootConfig {
            prefix_length_default: None,
            prefix_length_minimum: Some(24),
            prefix_length_maximum: Some(32),
            ..RootConfig::default()
        },
        None,
    )
    .unwrap();
    let now = Utc::now();

    assert!(matches!(
        pool.allocate_subnet(Some(31), now),
        Err(PoolError::InvalidRequest(_))
    ));
    assert!(matches!(
        pool.reserve_subnet(subnet("10.0.0.0/31"), now),
        Err(PoolError::InvalidRequest(_))
    ));
    assert!(matches!(
        pool.check_subnet(subnet("10.0.0.0/31"), now),
        Err(PoolError::InvalidRequest(_))
    ));
}

#[test]
fn test_hold_down_life_cycle() {
    let store = MemoryStore::new();
    let pool = small_pool(&store);
    let t0 = Utc::now();

    let block = pool.allocate_subnet(Some(27), t0).unwrap();
    pool.free_subnet(block.id, true, t0).unwrap();

    // Neither reservation nor allocation may reuse the held-down leaf.
    assert!(pool.reserve_subnet(subnet("10.0.0.0/27"), t0).is_err());
    let other = pool.allocate_subnet(Some(27), t0).unwrap();
    assert_ne!(other.subnet.to_string(), "10.0.0.0/27");

    // Once the hold-down period has elapsed, the leaf is free again.
    let later = t0 + default_hold_down_period() + Duration::seconds(1);
    assert!(pool.reclaim_held_down(later).unwrap() >= 1);
    let reclaimed = pool.reserve_subnet(subnet("10.0.0.0/27"), later).unwrap();
    assert_eq!(reclaimed.subnet.to_string(), "10.0.0.0/27");
    pool.check_invariants().unwrap();
}

#[test]
fn test_allocation_runs_hold_down_reclaim() {
    // Allocation entry points reclaim expired hold-downs before
    // traversing, so a fully held-down pool recovers by itself.
    let store = MemoryStore::new();
    let pool = Pool::create(
        &store,
        subnet("10.0.0.0/27"),
        RootConfig {
            prefix_length_default: Some(27),
            prefix_length_minimum: Some(27),
            prefix_length_maximum: Some(27),
            ..RootConfig::default()
        },
        None,
    )
    .unwrap();
    let t0 = Utc::now();

    let block = pool.allocate_subnet(None, t0).unwrap();
    pool.free_subnet(block.id, true, t0).unwrap();
    assert!(pool.allocate_subnet(None, t0).is_err());

    let later = t0 + default_hold_down_period() + Duration::seconds(1);
    let recovered = pool.allocate_subnet(None, later).unwrap();
    assert_eq!(recovered.subnet.to_string(), "10.0.0.0/27");
}

#[test]
fn test_reclaim_scans_every_pool_in_store() {
    let store = MemoryStore::new();
    let first = small_pool(&store);
    let second = Pool::create(
        &store,
        subnet("10.1.0.0/24"),
        RootConfig {
            prefix_length_default: Some(27),
            prefix_length_minimum: Some(25),
            prefix_length_maximum: Some(28),
            ..RootConfig::default()
        },
        Some("other".to_string()),
    )
    .unwrap();
    let t0 = Utc::now();

    let block = second.allocate_subnet(Some(27), t0).unwrap();
    second.free_subnet(block.id, true, t0).unwrap();

    // Driving the reclaim through one pool still covers the whole store.
    let later = t0 + default_hold_down_period() + Duration::seconds(1);
    assert_eq!(first.reclaim_held_down(later).unwrap(), 1);
    let root = second.block(second.root_id()).unwrap();
    assert!(root.is_leaf());
    assert_eq!(root.status, PoolStatus::Free);
}

#[test]
fn test_coalescing_after_freeing_siblings() {
    let store = MemoryStore::new();
    let pool = small_pool(&store);
    let now = Utc::now();

    let first = pool.allocate_subnet(Some(25), now).unwrap();
    let second = pool.allocate_subnet(Some(25), now).unwrap();
    assert_eq!(pool.block(pool.root_id()).unwrap().status, PoolStatus::Full);

    pool.free_subnet(first.id, false, now).unwrap();
    let root = pool.block(pool.root_id()).unwrap();
    assert_eq!(root.status, PoolStatus::Partial);

    pool.free_subnet(second.id, false, now).unwrap();
    let root = pool.block(pool.root_id()).unwrap();
    assert_eq!(root.status, PoolStatus::Free);
    assert!(root.is_leaf());

    // The parent's full original prefix length allocates directly.
    let whole = pool.allocate_subnet(Some(25), now).unwrap();
    let whole_again = pool.allocate_subnet(Some(25), now).unwrap();
    assert_eq!(whole.subnet.to_string(), "10.0.0.0/25");
    assert_eq!(whole_again.subnet.to_string(), "10.0.0.128/25");
}

#[test]
fn test_binding_round_trip_with_hint() {
    let store = MemoryStore::new();
    let pool = small_pool(&store);
    let now = Utc::now();

    let hint = "10.0.0.96".parse().unwrap();
    let mut binding = AllocationBinding::new(Family::Ipv4, 27, pool.root_id(), Some(hint));
    binding.satisfy(&pool, now).unwrap();
    assert!(binding.is_satisfied(&pool));

    let allocated = pool.block(binding.allocation().unwrap()).unwrap();
    assert_eq!(allocated.subnet.to_string(), "10.0.0.96/27");
    assert_eq!(allocated.top_level, pool.root_id());

    binding.free(&pool, now).unwrap();
    assert!(!binding.is_satisfied(&pool));
    // Freeing again stays a no-op.
    binding.free(&pool, now).unwrap();
    pool.check_invariants().unwrap();
}

#[test]
fn test_binding_transfer_preserves_leaf() {
    let store = MemoryStore::new();
    let pool = small_pool(&store);
    let now = Utc::now();

    let mut old = AllocationBinding::new(Family::Ipv4, 27, pool.root_id(), None);
    old.satisfy(&pool, now).unwrap();
    let leaf = old.allocation().unwrap();

    let mut replacement = AllocationBinding::new(Family::Ipv4, 27, pool.root_id(), None);
    assert!(replacement.satisfy_from(&mut old, &pool).unwrap());
    assert_eq!(replacement.allocation(), Some(leaf));
    assert!(!old.is_satisfied(&pool));

    // The leaf never went through free/reallocate: it is still full.
    assert_eq!(pool.block(leaf).unwrap().status, PoolStatus::Full);
}

#[test]
fn test_concurrent_allocations_get_distinct_subnets() {
    let store = Arc::new(MemoryStore::new());
    Pool::create(
        &*store,
        subnet("10.0.0.0/24"),
        RootConfig {
            prefix_length_default: Some(28),
            prefix_length_minimum: Some(25),
            prefix_length_maximum: Some(28),
            ..RootConfig::default()
        },
        Some("shared".to_string()),
    )
    .unwrap();

    let root = {
        let mut txn = store.begin().unwrap();
        txn.roots().unwrap()[0]
    };

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            let pool = Pool::open(&*store, root).unwrap();
            let mut allocated = Vec::new();
            for _ in 0..2 {
                allocated.push(
                    pool.allocate_subnet(Some(28), Utc::now())
                        .unwrap()
                        .subnet
                        .to_string(),
                );
            }
            allocated
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for subnet in handle.join().unwrap() {
            // Every allocation must be a distinct /28.
            assert!(seen.insert(subnet.clone()), "duplicate allocation {}", subnet);
        }
    }
    assert_eq!(seen.len(), 16);

    let pool = Pool::open(&*store, root).unwrap();
    pool.check_invariants().unwrap();
    // The /24 is fully carved into /28s now.
    assert!(matches!(
        pool.allocate_subnet(Some(28), Utc::now()),
        Err(PoolError::Exhausted { .. })
    ));
}

#[test]
fn test_snapshot_preserves_allocations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let now = Utc::now();

    let store = MemoryStore::new();
    let pool = small_pool(&store);
    let root = pool.root_id();
    let allocated = pool.allocate_subnet(Some(27), now).unwrap();
    store.save_snapshot(&path).unwrap();

    let restored = MemoryStore::load_snapshot(&path).unwrap();
    let pool = Pool::open(&restored, root).unwrap();
    pool.check_invariants().unwrap();

    // The allocation survives the round trip and the next one continues
    // from where the original store left off.
    assert_eq!(
        pool.block(allocated.id).unwrap().subnet.to_string(),
        "10.0.0.0/27"
    );
    let next = pool.allocate_subnet(Some(27), now).unwrap();
    assert_eq!(next.subnet.to_string(), "10.0.0.32/27");
}

#[test]
fn test_ipv6_pool_allocation() {
    let store = MemoryStore::new();
    let pool = Pool::create(
        &store,
        subnet("fd00::/48"),
        RootConfig {
            prefix_length_default: Some(64),
            prefix_length_minimum: Some(56),
            prefix_length_maximum: Some(64),
            ..RootConfig::default()
        },
        Some("site".to_string()),
    )
    .unwrap();
    let now = Utc::now();

    let first = pool.allocate_subnet(None, now).unwrap();
    assert_eq!(first.subnet.to_string(), "fd00::/64");
    let second = pool.allocate_subnet(None, now).unwrap();
    assert_eq!(second.subnet.to_string(), "fd00:0:0:1::/64");

    let reserved = pool.reserve_subnet(subnet("fd00:0:0:80::/57"), now).unwrap();
    assert_eq!(reserved.subnet.to_string(), "fd00:0:0:80::/57");
    pool.check_invariants().unwrap();
}
