//! Timeout-bounded access to the shared key-value namespace.

use std::future::Future;
use std::time::Duration;

use conclave_raft::StoreResult;

use crate::coordinator::Coordinator;
use crate::error::{CoordError, CoordResult};

/// Key of the pending-work mailbox.
pub const WORK_KEY: &str = "work";

async fn bounded<T>(what: &str, limit: Duration, fut: impl Future<Output = StoreResult<T>>) -> CoordResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(CoordError::Timeout(format!("{what} after {limit:?}"))),
    }
}

impl Coordinator {
    /// Store `value` under `key`; returns the revision of the write.
    pub async fn put(&self, key: &str, value: &str) -> CoordResult<u64> {
        let live = self.live.read().await;
        let store = &live.as_ref().ok_or(CoordError::NotRunning)?.store;
        bounded("put", self.config.request_timeout(), store.put(key, value)).await
    }

    /// Value of `key`, or an empty string when absent.
    pub async fn get(&self, key: &str) -> CoordResult<String> {
        let live = self.live.read().await;
        let store = &live.as_ref().ok_or(CoordError::NotRunning)?.store;
        let value = bounded("get", self.config.get_timeout(), store.get(key)).await?;
        Ok(value.unwrap_or_default())
    }

    pub async fn delete(&self, key: &str) -> CoordResult<u64> {
        let live = self.live.read().await;
        let store = &live.as_ref().ok_or(CoordError::NotRunning)?.store;
        bounded("delete", self.config.request_timeout(), store.delete(key)).await
    }

    /// Discard history up to `revision`. Returns once it is gone from disk.
    pub async fn compact(&self, revision: u64) -> CoordResult<()> {
        let live = self.live.read().await;
        let store = &live.as_ref().ok_or(CoordError::NotRunning)?.store;
        bounded("compact", self.config.request_timeout(), store.compact(revision)).await
    }

    pub async fn get_work(&self) -> CoordResult<String> {
        self.get(WORK_KEY).await
    }

    pub async fn put_work(&self, work: &str) -> CoordResult<u64> {
        self.put(WORK_KEY, work).await
    }

    pub async fn delete_work(&self) -> CoordResult<u64> {
        self.delete(WORK_KEY).await
    }
}
