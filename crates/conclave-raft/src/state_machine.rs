//! Raft state machine backed by redb.
//!
//! Applies committed entries to the shared key-value namespace and to
//! the table of published member attributes. Snapshots carry both.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine};
use openraft::{BasicNode, Entry, EntryPayload, LogId, Snapshot, SnapshotMeta, StorageError, StoredMembership};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::log_store::{read_err, write_err};
use crate::typ::{MemberAttrs, Request, Response, TypeConfig};

/// Shared key-value namespace.
const KV_TABLE: TableDefinition<&str, &str> = TableDefinition::new("sm_kv");

/// Published member attributes: key = member id, value = JSON [`MemberAttrs`].
const MEMBER_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("sm_members");

/// State machine metadata.
const SM_META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sm_meta");

const APPLIED_KEY: &str = "last_applied";
const MEMBERSHIP_KEY: &str = "membership";

/// Serialized body of a snapshot.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotBody {
    kv: BTreeMap<String, String>,
    members: BTreeMap<u64, MemberAttrs>,
}

/// Raft state machine backed by redb.
pub struct StateMachine {
    db: Arc<Database>,
}

/// Snapshot builder that reads the current state machine contents.
pub struct SmSnapshotBuilder {
    db: Arc<Database>,
}

/// Local, read-only view of the applied state.
///
/// Reads through this view see whatever this member has applied; callers
/// wanting linearizable reads must confirm leadership first.
#[derive(Clone)]
pub struct StateView {
    db: Arc<Database>,
}

impl StateMachine {
    /// Open the state machine tables in the given database.
    pub fn new(db: Arc<Database>) -> StoreResult<Self> {
        let txn = db.begin_write().map_err(StoreError::storage)?;
        txn.open_table(KV_TABLE).map_err(StoreError::storage)?;
        txn.open_table(MEMBER_TABLE).map_err(StoreError::storage)?;
        txn.open_table(SM_META_TABLE).map_err(StoreError::storage)?;
        txn.commit().map_err(StoreError::storage)?;

        Ok(Self { db })
    }

    /// A view over the same database, usable after the state machine
    /// has been handed to Raft.
    pub fn view(&self) -> StateView {
        StateView {
            db: Arc::clone(&self.db),
        }
    }

    fn read_meta<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError<u64>> {
        let txn = self.db.begin_read().map_err(read_err)?;
        let table = txn.open_table(SM_META_TABLE).map_err(read_err)?;
        match table.get(key).map_err(read_err)? {
            Some(val) => Ok(Some(serde_json::from_slice(val.value()).map_err(read_err)?)),
            None => Ok(None),
        }
    }

    /// Snapshots record the applied id as an `Option`, entries as a bare id.
    fn read_applied(&self) -> Result<Option<LogId<u64>>, StorageError<u64>> {
        Ok(self.read_meta::<Option<LogId<u64>>>(APPLIED_KEY)?.flatten())
    }
}

fn put_meta(txn: &WriteTransaction, key: &str, value: &impl Serialize) -> Result<(), StorageError<u64>> {
    let data = serde_json::to_vec(value).map_err(write_err)?;
    let mut table = txn.open_table(SM_META_TABLE).map_err(write_err)?;
    table.insert(key, data.as_slice()).map_err(write_err)?;
    Ok(())
}

fn apply_request(
    txn: &WriteTransaction,
    membership: &StoredMembership<u64, BasicNode>,
    req: &Request,
) -> Result<(), StorageError<u64>> {
    match req {
        Request::Put { key, value } => {
            let mut kv = txn.open_table(KV_TABLE).map_err(write_err)?;
            kv.insert(key.as_str(), value.as_str()).map_err(write_err)?;
        }
        Request::Delete { key } => {
            let mut kv = txn.open_table(KV_TABLE).map_err(write_err)?;
            kv.remove(key.as_str()).map_err(write_err)?;
        }
        Request::PublishMember {
            id,
            name,
            client_urls,
        } => {
            // A member removed before its announcement committed stays removed.
            if membership.membership().get_node(id).is_none() {
                debug!(member = %format!("{id:x}"), "ignoring attributes of non-member");
                return Ok(());
            }
            let attrs = MemberAttrs {
                name: name.clone(),
                client_urls: client_urls.clone(),
            };
            let data = serde_json::to_vec(&attrs).map_err(write_err)?;
            let mut members = txn.open_table(MEMBER_TABLE).map_err(write_err)?;
            members.insert(*id, data.as_slice()).map_err(write_err)?;
        }
    }
    Ok(())
}

/// Drop attributes of members that are no longer part of the configuration.
fn prune_members(
    txn: &WriteTransaction,
    membership: &StoredMembership<u64, BasicNode>,
) -> Result<(), StorageError<u64>> {
    let mut members = txn.open_table(MEMBER_TABLE).map_err(write_err)?;
    let stale: Vec<u64> = members
        .iter()
        .map_err(write_err)?
        .map(|item| item.map(|(k, _)| k.value()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(write_err)?
        .into_iter()
        .filter(|id| membership.membership().get_node(id).is_none())
        .collect();
    for id in stale {
        members.remove(id).map_err(write_err)?;
    }
    Ok(())
}

impl RaftStateMachine<TypeConfig> for StateMachine {
    type SnapshotBuilder = SmSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<u64>>, StoredMembership<u64, BasicNode>), StorageError<u64>> {
        let applied = self.read_applied()?;
        let membership = self.read_meta(MEMBERSHIP_KEY)?.unwrap_or_default();
        Ok((applied, membership))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<Response>, StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let mut membership: StoredMembership<u64, BasicNode> =
            self.read_meta(MEMBERSHIP_KEY)?.unwrap_or_default();
        let mut responses = Vec::new();
        let mut last = None;

        let txn = self.db.begin_write().map_err(write_err)?;
        for entry in entries {
            let log_id = entry.log_id;
            match entry.payload {
                EntryPayload::Blank => {}
                EntryPayload::Normal(req) => apply_request(&txn, &membership, &req)?,
                EntryPayload::Membership(m) => {
                    membership = StoredMembership::new(Some(log_id), m);
                    put_meta(&txn, MEMBERSHIP_KEY, &membership)?;
                    prune_members(&txn, &membership)?;
                }
            }
            responses.push(Response {
                revision: log_id.index,
            });
            last = Some(log_id);
        }
        if let Some(log_id) = last {
            put_meta(&txn, APPLIED_KEY, &log_id)?;
        }
        txn.commit().map_err(write_err)?;

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        SmSnapshotBuilder {
            db: Arc::clone(&self.db),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<u64>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<u64>> {
        let body: SnapshotBody =
            serde_json::from_slice(&snapshot.into_inner()).map_err(read_err)?;

        let txn = self.db.begin_write().map_err(write_err)?;
        txn.delete_table(KV_TABLE).map_err(write_err)?;
        txn.delete_table(MEMBER_TABLE).map_err(write_err)?;
        {
            let mut kv = txn.open_table(KV_TABLE).map_err(write_err)?;
            for (k, v) in &body.kv {
                kv.insert(k.as_str(), v.as_str()).map_err(write_err)?;
            }
            let mut members = txn.open_table(MEMBER_TABLE).map_err(write_err)?;
            for (id, attrs) in &body.members {
                let data = serde_json::to_vec(attrs).map_err(write_err)?;
                members.insert(*id, data.as_slice()).map_err(write_err)?;
            }
        }
        put_meta(&txn, APPLIED_KEY, &meta.last_log_id)?;
        put_meta(&txn, MEMBERSHIP_KEY, &meta.last_membership)?;
        txn.commit().map_err(write_err)?;

        info!(snapshot_id = %meta.snapshot_id, keys = body.kv.len(), "installed snapshot");
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<u64>> {
        if self.read_applied()?.is_none() {
            return Ok(None);
        }

        let mut builder = self.get_snapshot_builder().await;
        Ok(Some(builder.build_snapshot().await?))
    }
}

impl RaftSnapshotBuilder<TypeConfig> for SmSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<u64>> {
        let txn = self.db.begin_read().map_err(read_err)?;

        let mut body = SnapshotBody::default();
        let kv = txn.open_table(KV_TABLE).map_err(read_err)?;
        for item in kv.iter().map_err(read_err)? {
            let (k, v) = item.map_err(read_err)?;
            body.kv.insert(k.value().to_string(), v.value().to_string());
        }
        let members = txn.open_table(MEMBER_TABLE).map_err(read_err)?;
        for item in members.iter().map_err(read_err)? {
            let (k, v) = item.map_err(read_err)?;
            body.members
                .insert(k.value(), serde_json::from_slice(v.value()).map_err(read_err)?);
        }

        let meta_table = txn.open_table(SM_META_TABLE).map_err(read_err)?;
        let last_applied: Option<LogId<u64>> = match meta_table.get(APPLIED_KEY).map_err(read_err)? {
            Some(val) => serde_json::from_slice(val.value()).map_err(read_err)?,
            None => None,
        };
        let membership: StoredMembership<u64, BasicNode> =
            match meta_table.get(MEMBERSHIP_KEY).map_err(read_err)? {
                Some(val) => serde_json::from_slice(val.value()).map_err(read_err)?,
                None => StoredMembership::default(),
            };

        let data = serde_json::to_vec(&body).map_err(read_err)?;
        let snapshot_id = format!("snap-{}", last_applied.map_or(0, |l| l.index));
        debug!(%snapshot_id, bytes = data.len(), "built snapshot");

        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: last_applied,
                last_membership: membership,
                snapshot_id,
            },
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl StateView {
    /// Value stored under `key`, if any.
    pub fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let txn = self.db.begin_read().map_err(StoreError::storage)?;
        let table = txn.open_table(KV_TABLE).map_err(StoreError::storage)?;
        let value = table
            .get(key)
            .map_err(StoreError::storage)?
            .map(|v| v.value().to_string());
        Ok(value)
    }

    /// Every key-value pair, in key order.
    pub fn entries(&self) -> StoreResult<BTreeMap<String, String>> {
        let txn = self.db.begin_read().map_err(StoreError::storage)?;
        let table = txn.open_table(KV_TABLE).map_err(StoreError::storage)?;
        let mut out = BTreeMap::new();
        for item in table.iter().map_err(StoreError::storage)? {
            let (k, v) = item.map_err(StoreError::storage)?;
            out.insert(k.value().to_string(), v.value().to_string());
        }
        Ok(out)
    }

    /// Attributes every member has published so far.
    pub fn member_attrs(&self) -> StoreResult<BTreeMap<u64, MemberAttrs>> {
        let txn = self.db.begin_read().map_err(StoreError::storage)?;
        let table = txn.open_table(MEMBER_TABLE).map_err(StoreError::storage)?;
        let mut out = BTreeMap::new();
        for item in table.iter().map_err(StoreError::storage)? {
            let (k, v) = item.map_err(StoreError::storage)?;
            out.insert(k.value(), serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }
}
