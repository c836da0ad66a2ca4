//! Serializable snapshot of the cluster as seen by this node.

use serde::Serialize;

use crate::coordinator::Coordinator;
use crate::descriptor::ClusterDescriptor;
use crate::error::{CoordError, CoordResult};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub name: String,
    /// Member id, hex.
    pub id: String,
    pub client_urls: String,
    pub peer_urls: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberRef {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterInfo {
    pub cluster: String,
    pub members: Vec<MemberInfo>,
    #[serde(rename = "self", skip_serializing_if = "Option::is_none")]
    pub self_: Option<MemberRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader: Option<MemberRef>,
}

impl Coordinator {
    pub async fn info(&self) -> CoordResult<ClusterInfo> {
        let live = self.live.read().await;
        let store = &live.as_ref().ok_or(CoordError::NotRunning)?.store;

        let mut members = store.members()?;
        members.sort_by(|a, b| a.name.cmp(&b.name));
        let leader = store.leader_id();
        let member_ref = |id: u64| {
            members.iter().find(|m| m.id == id).map(|m| MemberRef {
                name: m.name.clone(),
                id: format!("{:x}", m.id),
            })
        };

        Ok(ClusterInfo {
            cluster: ClusterDescriptor::from_members(&members).to_string(),
            members: members
                .iter()
                .map(|m| MemberInfo {
                    name: m.name.clone(),
                    id: format!("{:x}", m.id),
                    client_urls: m.client_urls.join(","),
                    peer_urls: m.peer_urls.join(","),
                })
                .collect(),
            self_: member_ref(store.id()),
            leader: leader.and_then(member_ref),
        })
    }
}
