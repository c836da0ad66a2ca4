//! Node directory: the static registry of every node that may take part
//! in the cluster.
//!
//! Each node listens on three consecutive ports starting at its base
//! port: the node service on `port`, the Raft peer listener on
//! `port + 1` and the (advertised only) client endpoint on `port + 2`.

use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};

/// One node known to the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub name: String,
    /// Stable identifier of the node, independent of the Raft member id.
    pub id: String,
    pub ip: String,
    /// Base port.
    pub port: u16,
}

impl NodeEntry {
    pub fn new(name: &str, id: &str, ip: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            id: id.to_string(),
            ip: ip.to_string(),
            port,
        }
    }

    /// URL of the node service (admission, relay, control).
    pub fn node_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }

    /// Advertised Raft peer URL.
    pub fn peer_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port + 1)
    }

    /// `ip:port` of the Raft peer listener.
    pub fn peer_host_port(&self) -> String {
        format!("{}:{}", self.ip, self.port + 1)
    }

    /// Listen URL of the Raft peer listener, all interfaces.
    pub fn listen_peer_url(&self) -> String {
        format!("http://0.0.0.0:{}", self.port + 1)
    }

    /// Advertised client URL, loopback only.
    pub fn client_url(&self) -> String {
        format!("http://localhost:{}", self.port + 2)
    }
}

/// Shared, lock-protected node directory.
#[derive(Debug, Default)]
pub struct NodeDirectory {
    nodes: RwLock<Vec<NodeEntry>>,
}

impl NodeDirectory {
    pub fn new(nodes: Vec<NodeEntry>) -> Self {
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    /// Replace the whole directory.
    pub fn replace(&self, nodes: Vec<NodeEntry>) {
        *self.nodes.write() = nodes;
    }

    /// Hold the read lock. Lookups made while the guard is alive must go
    /// through [`find_in`] on the guarded slice.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<NodeEntry>> {
        self.nodes.read()
    }

    pub fn find(&self, key: &str) -> Option<NodeEntry> {
        find_in(&self.read(), key)
    }

    pub fn by_name(&self, name: &str) -> Option<NodeEntry> {
        by_name_in(&self.read(), name)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Look `key` up by name, then by identifier, then by IP.
///
/// A key matching one node's name wins over a different node whose
/// identifier or IP happens to equal it.
pub fn find_in(nodes: &[NodeEntry], key: &str) -> Option<NodeEntry> {
    if key.is_empty() {
        return None;
    }
    by_name_in(nodes, key)
        .or_else(|| nodes.iter().find(|n| n.id == key).cloned())
        .or_else(|| nodes.iter().find(|n| n.ip == key).cloned())
}

pub fn by_name_in(nodes: &[NodeEntry], name: &str) -> Option<NodeEntry> {
    nodes.iter().find(|n| n.name == name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> NodeDirectory {
        NodeDirectory::new(vec![
            NodeEntry::new("n1", "enode-a", "10.0.0.1", 8588),
            NodeEntry::new("n2", "n1", "10.0.0.2", 8588),
            NodeEntry::new("n3", "enode-c", "n2", 8588),
        ])
    }

    #[test]
    fn ports_are_derived_from_base() {
        let n = NodeEntry::new("n1", "a", "10.0.0.1", 8588);
        assert_eq!(n.node_url(), "http://10.0.0.1:8588");
        assert_eq!(n.peer_url(), "http://10.0.0.1:8589");
        assert_eq!(n.listen_peer_url(), "http://0.0.0.0:8589");
        assert_eq!(n.client_url(), "http://localhost:8590");
    }

    #[test]
    fn name_takes_precedence_over_id_and_ip() {
        let dir = directory();
        assert_eq!(dir.find("n1").unwrap().ip, "10.0.0.1");
        assert_eq!(dir.find("n2").unwrap().ip, "10.0.0.2");
    }

    #[test]
    fn falls_back_to_id_then_ip() {
        let dir = directory();
        assert_eq!(dir.find("enode-c").unwrap().name, "n3");
        assert_eq!(dir.find("10.0.0.2").unwrap().name, "n2");
        assert!(dir.find("nope").is_none());
        assert!(dir.find("").is_none());
    }

    #[test]
    fn lookups_under_held_lock() {
        let dir = directory();
        let guard = dir.read();
        assert_eq!(find_in(&guard, "enode-a").unwrap().name, "n1");
        assert_eq!(by_name_in(&guard, "n3").unwrap().id, "enode-c");
    }
}
