// Thin contract over the embedded engine. Every method is blocking and
// thread-safe; callers on an async runtime are expected to dispatch through
// `tokio::task::spawn_blocking` (the Coordinator and Ordered Replicator both
// do this). The engine itself is an implementation detail hidden behind
// this trait — `RedbAdapter` is the one concrete adapter we ship, wrapping
// `redb`, but nothing outside this crate should assume that.

use std::sync::Arc;

use kvstore_base::Result;

mod redb_adapter;
pub use redb_adapter::RedbAdapter;

/// `get`/`set`/`writeBatch`/`scanAndDelete` over the local key space.
/// Implementations must serialize concurrent access themselves; callers
/// never hold a lock across calls.
pub trait StorageAdapter: Send + Sync {
    /// Returns `Ok(None)` for a missing key — NotFound is not an error.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Atomic single-key write.
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Commits the whole batch atomically, or none of it.
    fn write_batch(&self, items: &[(Vec<u8>, Vec<u8>)]) -> Result<()>;

    /// Enumerates keys, collects those for which `predicate` is true, then
    /// deletes them. Large deletions are internally chunked into several
    /// transactions; a failure partway through leaves the already-committed
    /// chunks deleted (idempotent: re-running the scan will simply find
    /// fewer keys to drop).
    fn scan_and_delete(&self, predicate: &dyn Fn(&[u8]) -> bool) -> Result<()>;
}

/// Spawns the adapter's background maintenance task (every 5 minutes, while
/// there is work to do) on the given adapter. Adapters that need no
/// maintenance may implement this as a no-op task.
pub trait Maintainable: StorageAdapter {
    fn spawn_maintenance(self: Arc<Self>) -> tokio::task::JoinHandle<()>;
}
