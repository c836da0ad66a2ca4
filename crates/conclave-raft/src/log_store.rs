//! Raft log storage backed by redb.
//!
//! Stores the vote, the committed log id and the log entries of one
//! member. Entries are JSON-serialized.

use std::fmt::Debug;
use std::ops::RangeBounds;
use std::sync::Arc;

use openraft::storage::{LogFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{Entry, ErrorSubject, ErrorVerb, LogId, StorageError, Vote};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::typ::TypeConfig;

/// Log entries: key = log index, value = JSON bytes.
const LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("raft_log");

/// Vote, committed and purge markers.
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("raft_meta");

const VOTE_KEY: &str = "vote";
const COMMITTED_KEY: &str = "committed";
const LAST_PURGED_KEY: &str = "last_purged";

pub(crate) fn read_err(e: impl std::fmt::Display) -> StorageError<u64> {
    StorageError::from_io_error(
        ErrorSubject::Store,
        ErrorVerb::Read,
        std::io::Error::other(e.to_string()),
    )
}

pub(crate) fn write_err(e: impl std::fmt::Display) -> StorageError<u64> {
    StorageError::from_io_error(
        ErrorSubject::Store,
        ErrorVerb::Write,
        std::io::Error::other(e.to_string()),
    )
}

/// Raft log storage backed by redb.
pub struct LogStore {
    db: Arc<Database>,
}

/// Read-only log reader handed to replication tasks.
pub struct LogReader {
    db: Arc<Database>,
}

impl LogStore {
    /// Open the log tables in the given database, creating them if needed.
    pub fn new(db: Arc<Database>) -> StoreResult<Self> {
        let txn = db.begin_write().map_err(StoreError::storage)?;
        txn.open_table(LOG_TABLE).map_err(StoreError::storage)?;
        txn.open_table(META_TABLE).map_err(StoreError::storage)?;
        txn.commit().map_err(StoreError::storage)?;

        Ok(Self { db })
    }

    /// Whether this member has never taken part in a cluster.
    ///
    /// A pristine store has no log entries, no purge marker and no vote.
    pub fn is_pristine(&self) -> StoreResult<bool> {
        let txn = self.db.begin_read().map_err(StoreError::storage)?;
        let log = txn.open_table(LOG_TABLE).map_err(StoreError::storage)?;
        if !log.is_empty().map_err(StoreError::storage)? {
            return Ok(false);
        }
        let meta = txn.open_table(META_TABLE).map_err(StoreError::storage)?;
        let voted = meta.get(VOTE_KEY).map_err(StoreError::storage)?.is_some();
        let purged = meta
            .get(LAST_PURGED_KEY)
            .map_err(StoreError::storage)?
            .is_some();
        Ok(!voted && !purged)
    }

    fn write_meta(&self, key: &str, data: &[u8]) -> Result<(), StorageError<u64>> {
        let txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut table = txn.open_table(META_TABLE).map_err(write_err)?;
            table.insert(key, data).map_err(write_err)?;
        }
        txn.commit().map_err(write_err)?;
        Ok(())
    }

    fn read_meta<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError<u64>> {
        let txn = self.db.begin_read().map_err(read_err)?;
        let table = txn.open_table(META_TABLE).map_err(read_err)?;
        match table.get(key).map_err(read_err)? {
            Some(val) => Ok(Some(serde_json::from_slice(val.value()).map_err(read_err)?)),
            None => Ok(None),
        }
    }

    /// Remove every entry whose index falls in `range`.
    fn remove_range(&self, range: impl RangeBounds<u64>) -> Result<usize, StorageError<u64>> {
        let txn = self.db.begin_write().map_err(write_err)?;
        let removed = {
            let mut table = txn.open_table(LOG_TABLE).map_err(write_err)?;
            let keys: Vec<u64> = table
                .range(range)
                .map_err(write_err)?
                .map(|item| item.map(|(k, _)| k.value()))
                .collect::<Result<_, _>>()
                .map_err(write_err)?;
            for key in &keys {
                table.remove(*key).map_err(write_err)?;
            }
            keys.len()
        };
        txn.commit().map_err(write_err)?;
        Ok(removed)
    }
}

impl RaftLogReader<TypeConfig> for LogReader {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + Send>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<u64>> {
        let txn = self.db.begin_read().map_err(read_err)?;
        let table = txn.open_table(LOG_TABLE).map_err(read_err)?;

        let mut entries = Vec::new();
        for item in table.range(range).map_err(read_err)? {
            let (_, val) = item.map_err(read_err)?;
            entries.push(serde_json::from_slice(val.value()).map_err(read_err)?);
        }
        Ok(entries)
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + Send>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<u64>> {
        let mut reader = LogReader {
            db: Arc::clone(&self.db),
        };
        reader.try_get_log_entries(range).await
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = LogReader;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<u64>> {
        let last = {
            let txn = self.db.begin_read().map_err(read_err)?;
            let table = txn.open_table(LOG_TABLE).map_err(read_err)?;
            match table.last().map_err(read_err)? {
                Some((_, val)) => {
                    let entry: Entry<TypeConfig> =
                        serde_json::from_slice(val.value()).map_err(read_err)?;
                    Some(entry.log_id)
                }
                None => None,
            }
        };

        let last_purged_log_id: Option<LogId<u64>> = self.read_meta(LAST_PURGED_KEY)?;

        // With every entry compacted away the purge marker is the last log id.
        Ok(LogState {
            last_purged_log_id,
            last_log_id: last.or(last_purged_log_id),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        LogReader {
            db: Arc::clone(&self.db),
        }
    }

    async fn save_vote(&mut self, vote: &Vote<u64>) -> Result<(), StorageError<u64>> {
        let data = serde_json::to_vec(vote).map_err(write_err)?;
        self.write_meta(VOTE_KEY, &data)?;
        debug!(%vote, "saved vote");
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<u64>>, StorageError<u64>> {
        self.read_meta(VOTE_KEY)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut table = txn.open_table(LOG_TABLE).map_err(write_err)?;
            for entry in entries {
                let data = serde_json::to_vec(&entry).map_err(write_err)?;
                table
                    .insert(entry.log_id.index, data.as_slice())
                    .map_err(write_err)?;
            }
        }
        txn.commit().map_err(write_err)?;

        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<u64>) -> Result<(), StorageError<u64>> {
        let removed = self.remove_range(log_id.index..)?;
        debug!(index = log_id.index, removed, "truncated log");
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<u64>) -> Result<(), StorageError<u64>> {
        let data = serde_json::to_vec(&log_id).map_err(write_err)?;
        self.write_meta(LAST_PURGED_KEY, &data)?;

        let removed = self.remove_range(..=log_id.index)?;
        debug!(index = log_id.index, removed, "purged log");
        Ok(())
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<u64>>,
    ) -> Result<(), StorageError<u64>> {
        if let Some(log_id) = committed {
            let data = serde_json::to_vec(&log_id).map_err(write_err)?;
            self.write_meta(COMMITTED_KEY, &data)?;
        }
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<u64>>, StorageError<u64>> {
        self.read_meta(COMMITTED_KEY)
    }
}
