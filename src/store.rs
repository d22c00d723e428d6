//! Persistence and transaction substrate for the pool tree.
//!
//! The tree is stored as an arena of rows addressed by stable identifiers.
//! Mutating operations never hold references into the tree; they pass node
//! ids and re-fetch each row under an exclusive lock before inspecting or
//! changing it. A transaction stages its writes and applies them atomically
//! on commit; dropping an uncommitted transaction rolls everything back and
//! releases its locks.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::PoolError;
use crate::pool::block::{AddressBlock, PoolStatus};

/// Stable identifier of an address block row.
pub type NodeId = u64;

/// A store capable of holding pool trees and running transactions over
/// them. This is the boundary the tree logic is written against.
pub trait PoolStore {
    type Txn<'a>: StoreTxn
    where
        Self: 'a;

    /// Open a new transaction.
    fn begin(&self) -> Result<Self::Txn<'_>, PoolError>;
}

/// One transaction over a pool store.
///
/// Every mutating tree operation follows the same discipline: `lock` the
/// row first (which returns a fresh read), decide, then `update` or
/// `delete`. Updates and deletes of unlocked rows are refused.
pub trait StoreTxn {
    /// Reserve a fresh row identifier.
    fn allocate_id(&mut self) -> NodeId;

    /// Stage a new row. The row becomes visible to other transactions
    /// only after commit.
    fn insert(&mut self, block: AddressBlock) -> Result<(), PoolError>;

    /// Read a row without locking it. Callers must not base mutating
    /// decisions on the result.
    fn get(&mut self, id: NodeId) -> Result<AddressBlock, PoolError>;

    /// Acquire an exclusive lock on a row for the remainder of this
    /// transaction and return a fresh read of it. Re-locking a row this
    /// transaction already holds is a no-op.
    fn lock(&mut self, id: NodeId) -> Result<AddressBlock, PoolError>;

    /// Stage an update to a locked row.
    fn update(&mut self, block: &AddressBlock) -> Result<(), PoolError>;

    /// Stage deletion of a locked row.
    fn delete(&mut self, id: NodeId) -> Result<(), PoolError>;

    /// Identifiers of all held-down rows whose hold-down started at or
    /// before `cutoff`, in ascending subnet order.
    fn held_down_before(&mut self, cutoff: DateTime<Utc>) -> Result<Vec<NodeId>, PoolError>;

    /// Identifiers of all tree roots in the store.
    fn roots(&mut self) -> Result<Vec<NodeId>, PoolError>;

    /// Apply all staged writes atomically and release the locks.
    fn commit(self) -> Result<(), PoolError>;
}

/// Serialized form of a [`MemoryStore`].
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    next_id: u64,
    rows: Vec<AddressBlock>,
}

struct Shared {
    rows: Mutex<HashMap<NodeId, AddressBlock>>,
    /// Row id -> owning transaction id.
    locks: Mutex<HashMap<NodeId, u64>>,
    lock_released: Condvar,
    next_id: AtomicU64,
    next_txn: AtomicU64,
}

/// In-memory pool store with per-row exclusive locks and atomic commit.
///
/// Lock acquisition blocks until the owning transaction finishes, up to a
/// timeout; on timeout the acquisition fails with a conflict error and the
/// caller decides whether to retry. The timeout also breaks deadlocks
/// between a downward allocation traversal and an upward coalescing walk.
pub struct MemoryStore {
    shared: Arc<Shared>,
    lock_timeout: Duration,
}

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            shared: Arc::new(Shared {
                rows: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                lock_released: Condvar::new(),
                next_id: AtomicU64::new(1),
                next_txn: AtomicU64::new(1),
            }),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Override the lock acquisition timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Write the committed rows to a JSON snapshot file.
    pub fn save_snapshot(&self, path: &Path) -> Result<(), PoolError> {
        let rows = lock_mutex(&self.shared.rows)?;
        let mut sorted: Vec<AddressBlock> = rows.values().cloned().collect();
        sorted.sort_by_key(|block| block.id);
        let snapshot = Snapshot {
            next_id: self.shared.next_id.load(Ordering::SeqCst),
            rows: sorted,
        };
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| PoolError::Snapshot(format!("failed to serialize state: {}", e)))?;
        std::fs::write(path, json).map_err(|e| {
            PoolError::Snapshot(format!("failed to write '{}': {}", path.display(), e))
        })?;
        debug!("saved {} address blocks to {:?}", rows.len(), path);
        Ok(())
    }

    /// Load a store from a JSON snapshot file.
    pub fn load_snapshot(path: &Path) -> Result<Self, PoolError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            PoolError::Snapshot(format!("failed to read '{}': {}", path.display(), e))
        })?;
        let snapshot: Snapshot = serde_json::from_str(&json)
            .map_err(|e| PoolError::Snapshot(format!("failed to parse '{}': {}", path.display(), e)))?;
        let store = MemoryStore::new();
        store
            .shared
            .next_id
            .store(snapshot.next_id, Ordering::SeqCst);
        {
            let mut rows = lock_mutex(&store.shared.rows)?;
            for block in snapshot.rows {
                rows.insert(block.id, block);
            }
            debug!("loaded {} address blocks from {:?}", rows.len(), path);
        }
        Ok(store)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolStore for MemoryStore {
    type Txn<'a> = MemoryTxn<'a>;

    fn begin(&self) -> Result<MemoryTxn<'_>, PoolError> {
        Ok(MemoryTxn {
            shared: &self.shared,
            txn_id: self.shared.next_txn.fetch_add(1, Ordering::SeqCst),
            staged: HashMap::new(),
            locked: HashSet::new(),
            lock_timeout: self.lock_timeout,
            committed: false,
        })
    }
}

/// A transaction over a [`MemoryStore`].
pub struct MemoryTxn<'a> {
    shared: &'a Shared,
    txn_id: u64,
    /// Staged writes: Some is an upsert, None a deletion.
    staged: HashMap<NodeId, Option<AddressBlock>>,
    locked: HashSet<NodeId>,
    lock_timeout: Duration,
    committed: bool,
}

impl MemoryTxn<'_> {
    fn release_locks(&mut self) {
        if self.locked.is_empty() {
            return;
        }
        if let Ok(mut locks) = self.shared.locks.lock() {
            for id in self.locked.drain() {
                if locks.get(&id) == Some(&self.txn_id) {
                    locks.remove(&id);
                }
            }
            self.shared.lock_released.notify_all();
        }
    }

    fn read(&self, id: NodeId) -> Result<AddressBlock, PoolError> {
        match self.staged.get(&id) {
            Some(Some(block)) => Ok(block.clone()),
            Some(None) => Err(PoolError::NotFound(id)),
            None => {
                let rows = lock_mutex(&self.shared.rows)?;
                rows.get(&id).cloned().ok_or(PoolError::NotFound(id))
            }
        }
    }

    /// All rows as seen by this transaction: committed state overlaid
    /// with staged writes.
    fn visible_rows(&self) -> Result<Vec<AddressBlock>, PoolError> {
        let rows = lock_mutex(&self.shared.rows)?;
        let mut visible: Vec<AddressBlock> = rows
            .values()
            .filter(|block| !self.staged.contains_key(&block.id))
            .cloned()
            .collect();
        visible.extend(self.staged.values().filter_map(|entry| entry.clone()));
        Ok(visible)
    }
}

impl StoreTxn for MemoryTxn<'_> {
    fn allocate_id(&mut self) -> NodeId {
        self.shared.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn insert(&mut self, block: AddressBlock) -> Result<(), PoolError> {
        // Rows inserted by this transaction are invisible to others until
        // commit, so they count as locked by us.
        self.locked.insert(block.id);
        let mut locks = lock_mutex(&self.shared.locks)?;
        locks.insert(block.id, self.txn_id);
        drop(locks);
        self.staged.insert(block.id, Some(block));
        Ok(())
    }

    fn get(&mut self, id: NodeId) -> Result<AddressBlock, PoolError> {
        self.read(id)
    }

    fn lock(&mut self, id: NodeId) -> Result<AddressBlock, PoolError> {
        if self.locked.contains(&id) {
            return self.read(id);
        }
        let deadline = Instant::now() + self.lock_timeout;
        let mut locks = lock_mutex(&self.shared.locks)?;
        loop {
            if !locks.contains_key(&id) {
                locks.insert(id, self.txn_id);
                drop(locks);
                self.locked.insert(id);
                return self.read(id);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::Conflict(format!(
                    "timed out waiting for lock on address block {}",
                    id
                )));
            }
            let (guard, _timeout) = self
                .shared
                .lock_released
                .wait_timeout(locks, deadline - now)
                .map_err(|_| poisoned())?;
            locks = guard;
        }
    }

    fn update(&mut self, block: &AddressBlock) -> Result<(), PoolError> {
        if !self.locked.contains(&block.id) {
            return Err(PoolError::Conflict(format!(
                "update of address block {} without holding its lock",
                block.id
            )));
        }
        self.staged.insert(block.id, Some(block.clone()));
        Ok(())
    }

    fn delete(&mut self, id: NodeId) -> Result<(), PoolError> {
        if !self.locked.contains(&id) {
            return Err(PoolError::Conflict(format!(
                "deletion of address block {} without holding its lock",
                id
            )));
        }
        self.staged.insert(id, None);
        Ok(())
    }

    fn held_down_before(&mut self, cutoff: DateTime<Utc>) -> Result<Vec<NodeId>, PoolError> {
        let mut expired: Vec<AddressBlock> = self
            .visible_rows()?
            .into_iter()
            .filter(|block| {
                block.status == PoolStatus::HeldDown
                    && block.held_from.is_some_and(|held| held <= cutoff)
            })
            .collect();
        expired.sort_by_key(|block| block.subnet);
        Ok(expired.into_iter().map(|block| block.id).collect())
    }

    fn roots(&mut self) -> Result<Vec<NodeId>, PoolError> {
        let mut roots: Vec<AddressBlock> = self
            .visible_rows()?
            .into_iter()
            .filter(|block| block.is_root())
            .collect();
        roots.sort_by_key(|block| block.id);
        Ok(roots.into_iter().map(|block| block.id).collect())
    }

    fn commit(mut self) -> Result<(), PoolError> {
        {
            let mut rows = lock_mutex(&self.shared.rows)?;
            for (id, entry) in self.staged.drain() {
                match entry {
                    Some(block) => {
                        rows.insert(id, block);
                    }
                    None => {
                        rows.remove(&id);
                    }
                }
            }
        }
        self.committed = true;
        self.release_locks();
        Ok(())
    }
}

impl Drop for MemoryTxn<'_> {
    fn drop(&mut self) {
        if !self.committed {
            // Roll back: staged writes are discarded with the transaction.
            self.staged.clear();
            self.release_locks();
        }
    }
}

fn lock_mutex<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, PoolError> {
    mutex.lock().map_err(|_| poisoned())
}

fn poisoned() -> PoolError {
    PoolError::Conflict("store mutex poisoned by a panicked transaction".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::block::RootConfig;
    use std::thread;

    fn block(id: NodeId, subnet: &str) -> AddressBlock {
        AddressBlock::new_root(id, subnet.parse().unwrap(), RootConfig::default(), None)
    }

    #[test]
    fn test_insert_commit_get() {
        let store = MemoryStore::new();
        let mut txn = store.begin().unwrap();
        let id = txn.allocate_id();
        txn.insert(block(id, "10.0.0.0/16")).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin().unwrap();
        let read = txn.get(id).unwrap();
        assert_eq!(read.subnet.to_string(), "10.0.0.0/16");
    }

    #[test]
    fn test_uncommitted_writes_are_invisible() {
        let store = MemoryStore::new();
        let mut txn = store.begin().unwrap();
        let id = txn.allocate_id();
        txn.insert(block(id, "10.0.0.0/16")).unwrap();
        drop(txn);

        let mut txn = store.begin().unwrap();
        assert!(matches!(txn.get(id), Err(PoolError::NotFound(_))));
    }

    #[test]
    fn test_rollback_restores_row() {
        let store = MemoryStore::new();
        let mut txn = store.begin().unwrap();
        let id = txn.allocate_id();
        txn.insert(block(id, "10.0.0.0/16")).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin().unwrap();
        let mut row = txn.lock(id).unwrap();
        row.status = PoolStatus::Full;
        txn.update(&row).unwrap();
        drop(txn);

        let mut txn = store.begin().unwrap();
        assert_eq!(txn.get(id).unwrap().status, PoolStatus::Free);
    }

    #[test]
    fn test_update_without_lock_is_refused() {
        let store = MemoryStore::new();
        let mut txn = store.begin().unwrap();
        let id = txn.allocate_id();
        txn.insert(block(id, "10.0.0.0/16")).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin().unwrap();
        let row = txn.get(id).unwrap();
        assert!(matches!(
            txn.update(&row),
            Err(PoolError::Conflict(_))
        ));
    }

    #[test]
    fn test_lock_conflict_times_out() {
        let store = Arc::new(MemoryStore::new().with_lock_timeout(Duration::from_millis(50)));
        let mut txn = store.begin().unwrap();
        let id = txn.allocate_id();
        txn.insert(block(id, "10.0.0.0/16")).unwrap();
        txn.commit().unwrap();

        let mut holder = store.begin().unwrap();
        holder.lock(id).unwrap();

        let contender_store = Arc::clone(&store);
        let result = thread::spawn(move || {
            let mut contender = contender_store.begin().unwrap();
            contender.lock(id).map(|_| ())
        })
        .join()
        .unwrap();
        assert!(matches!(result, Err(PoolError::Conflict(_))));

        drop(holder);
        let mut txn = store.begin().unwrap();
        assert!(txn.lock(id).is_ok());
    }

    #[test]
    fn test_lock_released_on_commit_unblocks_waiter() {
        let store = Arc::new(MemoryStore::new().with_lock_timeout(Duration::from_secs(5)));
        let mut txn = store.begin().unwrap();
        let id = txn.allocate_id();
        txn.insert(block(id, "10.0.0.0/16")).unwrap();
        txn.commit().unwrap();

        let mut holder = store.begin().unwrap();
        let mut row = holder.lock(id).unwrap();
        row.status = PoolStatus::Full;
        holder.update(&row).unwrap();

        let waiter_store = Arc::clone(&store);
        let waiter = thread::spawn(move || {
            let mut txn = waiter_store.begin().unwrap();
            txn.lock(id).unwrap().status
        });

        thread::sleep(Duration::from_millis(50));
        holder.commit().unwrap();

        // The waiter observes the committed status once the lock is free.
        assert_eq!(waiter.join().unwrap(), PoolStatus::Full);
    }

    #[test]
    fn test_held_down_query_filters_by_cutoff() {
        let store = MemoryStore::new();
        let mut txn = store.begin().unwrap();
        let old_id = txn.allocate_id();
        let mut old = block(old_id, "10.0.0.0/24");
        old.status = PoolStatus::HeldDown;
        old.held_from = Some(Utc::now() - chrono::Duration::days(2));
        txn.insert(old).unwrap();

        let fresh_id = txn.allocate_id();
        let mut fresh = block(fresh_id, "10.0.1.0/24");
        fresh.status = PoolStatus::HeldDown;
        fresh.held_from = Some(Utc::now());
        txn.insert(fresh).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin().unwrap();
        let cutoff = Utc::now() - chrono::Duration::days(1);
        assert_eq!(txn.held_down_before(cutoff).unwrap(), vec![old_id]);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = MemoryStore::new();
        let mut txn = store.begin().unwrap();
        let id = txn.allocate_id();
        txn.insert(block(id, "10.0.0.0/16")).unwrap();
        txn.commit().unwrap();
        store.save_snapshot(&path).unwrap();

        let restored = MemoryStore::load_snapshot(&path).unwrap();
        let mut txn = restored.begin().unwrap();
        assert_eq!(txn.get(id).unwrap().subnet.to_string(), "10.0.0.0/16");
        // Identifier allocation continues past the snapshot.
        assert!(txn.allocate_id() > id);
    }
}
