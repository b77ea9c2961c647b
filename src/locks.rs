use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::fingerprint::Fingerprint;

/// Lazily-grown table of per-fingerprint mutual-exclusion tokens.
///
/// The outer mutex is held only across the hash-table access; lock
/// acquisition itself happens on the cloned entry, outside the table, so a
/// blocked acquirer suspends its task without pinning a worker or stalling
/// unrelated keys. Entries persist for the lifetime of the store.
#[derive(Default)]
pub(crate) struct LockTable {
    entries: Mutex<HashMap<Fingerprint, Arc<Mutex<()>>>>,
}

impl LockTable {
    /// Acquire the token for `fp`, creating it on first demand.
    ///
    /// The returned guard is reference-stable and released on drop; waiters
    /// are queued in FIFO order by the tokio mutex.
    pub(crate) async fn acquire(&self, fp: Fingerprint) -> OwnedMutexGuard<()> {
        let token = {
            let mut entries = self.entries.lock().await;
            Arc::clone(entries.entry(fp).or_default())
        };
        token.lock_owned().await
    }
}
