//! Membership operations on a running coordinator.

use conclave_raft::{EmbeddedStore, Member};
use tracing::{error, info};

use crate::coordinator::Coordinator;
use crate::descriptor::ClusterDescriptor;
use crate::directory::{NodeEntry, by_name_in, find_in};
use crate::error::{CoordError, CoordResult};

impl Coordinator {
    /// Add the node `name` resolves to. Returns the refreshed cluster
    /// descriptor, or the current one if the node is already a member.
    pub async fn add(&self, name: &str) -> CoordResult<String> {
        let _gate = self.gate.lock().await;
        let live = self.live.read().await;
        let store = &live.as_ref().ok_or(CoordError::NotRunning)?.store;

        let current = descriptor_of(store)?;
        if let Ok(true) = self.member_exists(name, &current.to_string()) {
            return Ok(current.to_string());
        }

        let node = self
            .directory
            .find(name)
            .ok_or_else(|| CoordError::NotFound(name.to_string()))?;
        let peer_url = node.peer_url();
        match tokio::time::timeout(self.config.request_timeout(), store.add_member(&peer_url)).await {
            Ok(Ok(id)) => {
                info!(name = %node.name, member = %format!("{id:x}"), %peer_url, "a new member added");
            }
            Ok(Err(e)) => {
                error!(name = %node.name, %peer_url, error = %e, "failed to add a new member");
                return Err(e.into());
            }
            Err(_) => return Err(CoordError::Timeout(format!("adding member {}", node.name))),
        }
        Ok(descriptor_of(store)?.to_string())
    }

    /// Remove a member by name, or by hex member id. Returns the refreshed
    /// descriptor.
    pub async fn remove(&self, name: &str) -> CoordResult<String> {
        let _gate = self.gate.lock().await;
        let live = self.live.read().await;
        let store = &live.as_ref().ok_or(CoordError::NotRunning)?.store;

        let id = resolve_member(&store.members()?, name)?;
        match tokio::time::timeout(self.config.request_timeout(), store.remove_member(id)).await {
            Ok(res) => res?,
            Err(_) => return Err(CoordError::Timeout(format!("removing member {name}"))),
        }
        info!(name, member = %format!("{id:x}"), "member removed");
        Ok(descriptor_of(store)?.to_string())
    }

    /// Hand leadership to the member `name` (or hex id) names.
    pub async fn move_leader(&self, name: &str) -> CoordResult<()> {
        let _gate = self.gate.lock().await;
        let live = self.live.read().await;
        let store = &live.as_ref().ok_or(CoordError::NotRunning)?.store;

        let id = resolve_member(&store.members()?, name)?;
        let within = self.config.move_leader_timeout();
        match tokio::time::timeout(within, store.move_leader(id, within)).await {
            Ok(res) => res?,
            Err(_) => return Err(CoordError::Timeout(format!("moving leadership to {name}"))),
        }
        info!(to = name, member = %format!("{id:x}"), "leadership moved");
        Ok(())
    }

    /// Current membership as a descriptor string; empty when not running.
    pub async fn current_descriptor(&self) -> String {
        let live = self.live.read().await;
        match live.as_ref() {
            Some(l) => descriptor_of(&l.store).map(|d| d.to_string()).unwrap_or_default(),
            None => String::new(),
        }
    }

    /// Members of the running cluster.
    pub async fn members(&self) -> CoordResult<Vec<Member>> {
        let live = self.live.read().await;
        let store = &live.as_ref().ok_or(CoordError::NotRunning)?.store;
        Ok(store.members()?)
    }

    /// The leader's member id and its directory entry.
    ///
    /// With `already_locked` the caller holds the directory read lock and
    /// passes the guarded entries in `locked`; otherwise the lock is taken
    /// here. Returns `(0, None)` when not running or no leader is known.
    pub async fn leader(&self, locked: Option<&[NodeEntry]>) -> (u64, Option<NodeEntry>) {
        let live = self.live.read().await;
        let Some(store) = live.as_ref().map(|l| &l.store) else {
            return (0, None);
        };
        let Some(leader) = store.leader_id() else {
            return (0, None);
        };
        let Ok(members) = store.members() else {
            return (0, None);
        };
        let Some(member) = members.iter().find(|m| m.id == leader) else {
            return (0, None);
        };
        let node = match locked {
            Some(nodes) => by_name_in(nodes, &member.name),
            None => by_name_in(&self.directory.read(), &member.name),
        };
        (leader, node)
    }

    pub async fn is_leader(&self) -> bool {
        let live = self.live.read().await;
        live.as_ref().is_some_and(|l| l.store.is_leader())
    }

    /// Whether the node `name` resolves to appears in `cluster`.
    pub fn member_exists(&self, name: &str, cluster: &str) -> CoordResult<bool> {
        let node = find_in(&self.directory.read(), name)
            .ok_or_else(|| CoordError::NotFound(name.to_string()))?;
        let descriptor = ClusterDescriptor::parse(cluster)
            .map_err(|_| CoordError::NotFound(format!("{name} in {cluster:?}")))?;
        Ok(descriptor.contains_host_port(&node.peer_host_port()))
    }

    /// Fill this node's name into its unnamed slot of `cluster`.
    pub fn fix_cluster(&self, cluster: &str) -> CoordResult<String> {
        let me = self.local()?;
        let mut descriptor = ClusterDescriptor::parse(cluster)?;
        descriptor.fix(&me.name, &me.peer_host_port());
        Ok(descriptor.to_string())
    }
}

fn descriptor_of(store: &EmbeddedStore) -> CoordResult<ClusterDescriptor> {
    Ok(ClusterDescriptor::from_members(&store.members()?))
}

/// Member id by name, else `name` parsed as a hex id.
fn resolve_member(members: &[Member], name: &str) -> CoordResult<u64> {
    if let Some(m) = members.iter().find(|m| !name.is_empty() && m.name == name) {
        return Ok(m.id);
    }
    match u64::from_str_radix(name, 16) {
        Ok(id) if id != 0 => Ok(id),
        _ => Err(CoordError::NotFound(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: u64, name: &str) -> Member {
        Member {
            id,
            name: name.to_string(),
            peer_urls: vec![format!("http://10.0.0.{id}:8589")],
            client_urls: vec![],
            is_learner: false,
        }
    }

    #[test]
    fn resolves_name_before_hex() {
        let members = [member(0xab, "n1"), member(0xcd, "ab")];
        assert_eq!(resolve_member(&members, "n1").unwrap(), 0xab);
        // A member literally named like a hex id wins.
        assert_eq!(resolve_member(&members, "ab").unwrap(), 0xcd);
        assert_eq!(resolve_member(&members, "ff").unwrap(), 0xff);
    }

    #[test]
    fn unknown_non_hex_name_is_not_found() {
        let members = [member(1, "n1")];
        assert!(matches!(resolve_member(&members, "ghost"), Err(CoordError::NotFound(_))));
        assert!(matches!(resolve_member(&members, "0"), Err(CoordError::NotFound(_))));
        assert!(matches!(resolve_member(&members, ""), Err(CoordError::NotFound(_))));
    }
}
