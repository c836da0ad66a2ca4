//! The cluster descriptor: comma-separated `name=peerURL` pairs.
//!
//! A freshly added member has no name yet (`=http://10.0.0.2:8589`);
//! the joining node fills its own slot in with [`ClusterDescriptor::fix`].

use std::fmt;
use std::str::FromStr;

use conclave_raft::Member;

use crate::error::{CoordError, CoordResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorEntry {
    pub name: String,
    pub peer_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDescriptor {
    entries: Vec<DescriptorEntry>,
}

impl ClusterDescriptor {
    pub fn parse(s: &str) -> CoordResult<Self> {
        if s.trim().is_empty() {
            return Err(CoordError::InvalidDescriptor("empty descriptor".to_string()));
        }

        let mut entries: Vec<DescriptorEntry> = Vec::new();
        for item in s.split(',') {
            let mut parts = item.split('=');
            let (Some(name), Some(peer_url), None) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(CoordError::InvalidDescriptor(format!(
                    "entry {item:?} is not name=url"
                )));
            };
            if peer_url.is_empty() {
                return Err(CoordError::InvalidDescriptor(format!(
                    "entry {item:?} has no peer url"
                )));
            }
            if !name.is_empty() && entries.iter().any(|e| e.name == name) {
                return Err(CoordError::InvalidDescriptor(format!(
                    "member {name} listed twice"
                )));
            }
            entries.push(DescriptorEntry {
                name: name.to_string(),
                peer_url: peer_url.to_string(),
            });
        }
        Ok(Self { entries })
    }

    /// Descriptor of a live membership, sorted by name.
    pub fn from_members(members: &[Member]) -> Self {
        let mut entries: Vec<DescriptorEntry> = members
            .iter()
            .filter_map(|m| {
                m.peer_urls.first().map(|url| DescriptorEntry {
                    name: m.name.clone(),
                    peer_url: url.clone(),
                })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.peer_url.cmp(&b.peer_url)));
        Self { entries }
    }

    pub fn entries(&self) -> &[DescriptorEntry] {
        &self.entries
    }

    /// Name the unnamed entry whose peer URL points at `local_host_port`.
    ///
    /// Named entries are never touched, so applying this twice is the
    /// same as applying it once. Returns whether anything changed.
    pub fn fix(&mut self, local_name: &str, local_host_port: &str) -> bool {
        let Some(local) = normalize(local_host_port) else {
            return false;
        };
        let mut changed = false;
        for entry in self.entries.iter_mut().filter(|e| e.name.is_empty()) {
            if host_port(&entry.peer_url).as_deref() == Some(local.as_str()) {
                entry.name = local_name.to_string();
                changed = true;
            }
        }
        changed
    }

    /// Whether any entry's peer URL points at `host_port`.
    pub fn contains_host_port(&self, target: &str) -> bool {
        let Some(target) = normalize(target) else {
            return false;
        };
        self.entries
            .iter()
            .any(|e| host_port(&e.peer_url).as_deref() == Some(target.as_str()))
    }

    /// `(name, peer URL)` pairs for starting a store.
    pub fn initial_cluster(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), e.peer_url.clone()))
            .collect()
    }
}

impl FromStr for ClusterDescriptor {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ClusterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", e.name, e.peer_url)?;
        }
        Ok(())
    }
}

/// `host:port` of a URL, with the scheme's default port filled in.
pub fn host_port(url: &str) -> Option<String> {
    let url = url::Url::parse(url).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{host}:{port}"))
}

fn normalize(raw: &str) -> Option<String> {
    host_port(&format!("http://{raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: u64, name: &str, url: &str) -> Member {
        Member {
            id,
            name: name.to_string(),
            peer_urls: vec![url.to_string()],
            client_urls: vec![],
            is_learner: false,
        }
    }

    #[test]
    fn parse_then_encode_keeps_entries() {
        let text = "n1=http://10.0.0.1:8589,=http://10.0.0.2:8589,n3=http://10.0.0.3:8589";
        let d = ClusterDescriptor::parse(text).unwrap();
        assert_eq!(d.entries().len(), 3);
        assert_eq!(d.to_string(), text);
        assert_eq!(ClusterDescriptor::parse(&d.to_string()).unwrap(), d);
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in ["", "   ", "n1", "n1=a=b", "n1=", "n1=http://a:1,n1=http://b:1"] {
            assert!(
                matches!(ClusterDescriptor::parse(bad), Err(CoordError::InvalidDescriptor(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn fix_fills_local_slot() {
        let mut d = ClusterDescriptor::parse("=http://H:8589,other=http://X:9001").unwrap();
        assert!(d.fix("n1", "H:8589"));
        assert_eq!(d.to_string(), "n1=http://H:8589,other=http://X:9001");
    }

    #[test]
    fn fix_is_idempotent() {
        let mut d = ClusterDescriptor::parse("=http://10.0.0.1:8589,n2=http://10.0.0.2:8589").unwrap();
        d.fix("n1", "10.0.0.1:8589");
        let once = d.clone();
        assert!(!d.fix("n1", "10.0.0.1:8589"));
        assert_eq!(d, once);
    }

    #[test]
    fn fix_leaves_other_unnamed_entries() {
        let mut d = ClusterDescriptor::parse("=http://10.0.0.9:8589,n2=http://10.0.0.2:8589").unwrap();
        assert!(!d.fix("n1", "10.0.0.1:8589"));
        assert_eq!(d.entries()[0].name, "");
    }

    #[test]
    fn from_members_sorts_by_name() {
        let d = ClusterDescriptor::from_members(&[
            member(2, "n2", "http://10.0.0.2:8589"),
            member(3, "", "http://10.0.0.3:8589"),
            member(1, "n1", "http://10.0.0.1:8589"),
        ]);
        assert_eq!(
            d.to_string(),
            "=http://10.0.0.3:8589,n1=http://10.0.0.1:8589,n2=http://10.0.0.2:8589"
        );
    }

    #[test]
    fn host_port_matching() {
        let d = ClusterDescriptor::parse("n1=http://10.0.0.1:8589").unwrap();
        assert!(d.contains_host_port("10.0.0.1:8589"));
        assert!(!d.contains_host_port("10.0.0.1:8590"));
        assert_eq!(host_port("http://example.com").as_deref(), Some("example.com:80"));
    }
}
