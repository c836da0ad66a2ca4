//! Join protocol.
//!
//! A node without a running store asks a member (over the node service)
//! to admit it. The member adds it to the membership and relays the
//! refreshed cluster descriptor back to the joiner's mailbox for that
//! attempt. The joiner names its own slot in the descriptor and starts
//! its store in join-existing mode, resuming any local state it has.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use conclave_raft::ClusterState;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, warn};

use crate::coordinator::Coordinator;
use crate::descriptor::ClusterDescriptor;
use crate::error::{CoordError, CoordResult};

const MAILBOX_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Idle,
    AwaitingPeerAck,
    AwaitingClusterPush,
    Joined,
    Failed,
}

/// A message relayed to a joining node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum RelayMessage {
    /// The authoritative cluster descriptor.
    Cluster(String),
    /// Anything else; ignored by the join wait.
    Other(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub attempt: u64,
    pub message: RelayMessage,
}

type Senders = Arc<Mutex<HashMap<u64, mpsc::Sender<RelayMessage>>>>;

/// Per-attempt mailboxes of one node.
#[derive(Default)]
pub struct Mailboxes {
    next: AtomicU64,
    senders: Senders,
}

impl Mailboxes {
    /// Open a mailbox for a new join attempt.
    pub fn register(&self) -> Mailbox {
        let attempt = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        self.senders.lock().insert(attempt, tx);
        Mailbox {
            attempt,
            rx,
            senders: Arc::clone(&self.senders),
        }
    }

    /// Hand a relayed message to its attempt's mailbox. Returns false when
    /// no such mailbox is open or it is full.
    pub fn deliver(&self, envelope: RelayEnvelope) -> bool {
        let sender = self.senders.lock().get(&envelope.attempt).cloned();
        match sender {
            Some(tx) => tx.try_send(envelope.message).is_ok(),
            None => {
                debug!(attempt = envelope.attempt, "relay for unknown join attempt dropped");
                false
            }
        }
    }

    pub fn open(&self) -> usize {
        self.senders.lock().len()
    }
}

/// Receiving end of one attempt's mailbox. Unregisters itself on drop.
pub struct Mailbox {
    attempt: u64,
    rx: mpsc::Receiver<RelayMessage>,
    senders: Senders,
}

impl Mailbox {
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub async fn recv(&mut self) -> Option<RelayMessage> {
        self.rx.recv().await
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.senders.lock().remove(&self.attempt);
        self.rx.close();
    }
}

impl Coordinator {
    /// Join the cluster through the member `name` resolves to.
    pub async fn join(&self, name: &str) -> CoordResult<()> {
        let _gate = self.gate.lock().await;
        self.join_locked(name).await
    }

    pub fn join_state(&self) -> JoinState {
        *self.join_state.lock()
    }

    fn set_join_state(&self, state: JoinState) {
        debug!(?state, "join state");
        *self.join_state.lock() = state;
    }

    pub(crate) async fn join_locked(&self, name: &str) -> CoordResult<()> {
        let res = self.try_join(name).await;
        match &res {
            Ok(()) => self.set_join_state(JoinState::Joined),
            Err(e) => {
                error!(target_node = name, error = %e, "join failed");
                self.set_join_state(JoinState::Failed);
            }
        }
        res
    }

    async fn try_join(&self, name: &str) -> CoordResult<()> {
        if self.is_running().await {
            return Err(CoordError::AlreadyRunning);
        }
        let me = self.local()?;
        let target = self
            .directory
            .find(name)
            .ok_or_else(|| CoordError::NotFound(name.to_string()))?;

        let mut mailbox = self.mailboxes.register();
        let deadline = Instant::now() + self.config.join_timeout();

        self.set_join_state(JoinState::AwaitingPeerAck);
        info!(target_node = %target.name, attempt = mailbox.attempt(), "requesting admission");
        self.peers
            .request_admission(&target, &me.id, mailbox.attempt())
            .await?;

        self.set_join_state(JoinState::AwaitingClusterPush);
        let cluster = loop {
            match timeout_at(deadline, mailbox.recv()).await {
                Ok(Some(RelayMessage::Cluster(cluster))) => break cluster,
                Ok(Some(RelayMessage::Other(other))) => {
                    debug!(message = %other, "ignoring non-descriptor relay");
                }
                Ok(None) => return Err(CoordError::Rpc("join mailbox closed".to_string())),
                Err(_) => {
                    return Err(CoordError::Timeout(format!(
                        "no cluster descriptor from {} within {:?}",
                        target.name,
                        self.config.join_timeout()
                    )));
                }
            }
        };
        drop(mailbox);

        let mut descriptor = ClusterDescriptor::parse(&cluster)?;
        descriptor.fix(&me.name, &me.peer_host_port());
        info!(cluster = %descriptor, "received cluster descriptor");

        // Member ids follow the peer URL, so a returning member keeps its
        // persisted vote and log; only a directory created here is removed.
        let resume = self.has_local_state();
        if resume {
            info!(dir = %self.config.data_dir.display(), "joining with existing local state");
        }
        let mut live = self.live.write().await;
        let config = self.store_config(&me, descriptor.initial_cluster(), ClusterState::Existing);
        if let Err(e) = self.launch(&mut live, config).await {
            if !resume {
                if let Err(cleanup) = self.remove_data_dir() {
                    warn!(error = %cleanup, "failed to clean up after unsuccessful join");
                }
            }
            return Err(e);
        }
        info!(via = %target.name, "joined cluster");
        Ok(())
    }

    /// Peer side of the join protocol: admit the node `joiner_id`
    /// resolves to and relay the refreshed descriptor to `attempt`.
    pub async fn handle_admission(&self, joiner_id: &str, attempt: u64) -> CoordResult<()> {
        let joiner = self
            .directory
            .find(joiner_id)
            .ok_or_else(|| CoordError::NotFound(joiner_id.to_string()))?;
        info!(joiner = %joiner.name, attempt, "admission requested");

        let cluster = self.add(&joiner.name).await?;

        let peers = Arc::clone(&self.peers);
        tokio::spawn(async move {
            let envelope = RelayEnvelope {
                attempt,
                message: RelayMessage::Cluster(cluster),
            };
            if let Err(e) = peers.relay(&joiner, envelope).await {
                warn!(joiner = %joiner.name, error = %e, "failed to relay cluster descriptor");
            }
        });
        Ok(())
    }

    /// Deliver a relayed message to this node's join mailboxes.
    pub fn deliver(&self, envelope: RelayEnvelope) -> bool {
        self.mailboxes.deliver(envelope)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{OnceLock, Weak};

    use async_trait::async_trait;
    use conclave_raft::LocalRouter;

    use super::*;
    use crate::config::ClusterConfig;
    use crate::directory::NodeEntry;
    use crate::peer::PeerClient;

    /// What the admitting peer answers with.
    enum Answer {
        Cluster(&'static str),
        Noise,
        Refuse,
    }

    struct ScriptedPeer {
        joiner: OnceLock<Weak<Coordinator>>,
        answer: Answer,
    }

    #[async_trait]
    impl PeerClient for ScriptedPeer {
        async fn request_admission(&self, _target: &NodeEntry, _joiner_id: &str, attempt: u64) -> CoordResult<()> {
            let message = match self.answer {
                Answer::Refuse => return Err(CoordError::Rpc("connection refused".to_string())),
                Answer::Noise => RelayMessage::Other(serde_json::json!({"ping": 1})),
                Answer::Cluster(cluster) => RelayMessage::Cluster(cluster.to_string()),
            };
            if let Some(joiner) = self.joiner.get().and_then(Weak::upgrade) {
                assert!(joiner.deliver(RelayEnvelope { attempt, message }));
            }
            Ok(())
        }

        async fn relay(&self, _target: &NodeEntry, _envelope: RelayEnvelope) -> CoordResult<()> {
            Ok(())
        }

        async fn is_peer_up(&self, _target: &NodeEntry) -> bool {
            true
        }
    }

    fn joiner(dir: &std::path::Path, answer: Answer) -> Arc<Coordinator> {
        let config = ClusterConfig {
            name: "n2".to_string(),
            data_dir: dir.join("n2"),
            join_timeout_ms: 300,
            heartbeat_ms: 50,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            nodes: vec![
                NodeEntry::new("n1", "id-1", "127.0.0.1", 7200),
                NodeEntry::new("n2", "id-2", "127.0.0.1", 7210),
            ],
            ..Default::default()
        };
        let peer = Arc::new(ScriptedPeer {
            joiner: OnceLock::new(),
            answer,
        });
        let coord = Arc::new(Coordinator::new(config, Arc::new(LocalRouter::new()), peer.clone()));
        let _ = peer.joiner.set(Arc::downgrade(&coord));
        coord
    }

    #[tokio::test]
    async fn failed_joins_close_their_mailbox() {
        let dir = tempfile::tempdir().unwrap();

        let c = joiner(dir.path(), Answer::Refuse);
        assert!(matches!(c.join("n1").await, Err(CoordError::Rpc(_))));
        assert_eq!(c.mailboxes.open(), 0);

        let c = joiner(dir.path(), Answer::Noise);
        assert!(matches!(c.join("n1").await, Err(CoordError::Timeout(_))));
        assert_eq!(c.mailboxes.open(), 0);
        assert_eq!(c.join_state(), JoinState::Failed);
    }

    #[tokio::test]
    async fn start_failure_closes_mailbox_and_removes_fresh_dir() {
        let dir = tempfile::tempdir().unwrap();
        // The relayed descriptor has no slot for the joiner.
        let c = joiner(dir.path(), Answer::Cluster("n1=http://127.0.0.1:7201"));
        assert!(c.join("n1").await.is_err());
        assert_eq!(c.mailboxes.open(), 0);
        assert!(!c.has_local_state());
        assert!(!c.is_running().await);
    }

    #[tokio::test]
    async fn start_failure_keeps_existing_state() {
        let dir = tempfile::tempdir().unwrap();
        let c = joiner(dir.path(), Answer::Cluster("n1=http://127.0.0.1:7201"));
        c.init(true).await.unwrap();
        c.stop().await.unwrap();

        assert!(c.join("n1").await.is_err());
        assert!(c.has_local_state());
    }

    #[tokio::test]
    async fn rejoin_resumes_local_state() {
        let dir = tempfile::tempdir().unwrap();
        let c = joiner(dir.path(), Answer::Cluster("=http://127.0.0.1:7211"));
        c.init(true).await.unwrap();
        c.put("k", "kept").await.unwrap();
        c.stop().await.unwrap();

        c.join("n1").await.unwrap();
        assert_eq!(c.join_state(), JoinState::Joined);
        assert_eq!(c.mailboxes.open(), 0);
        assert_eq!(c.get("k").await.unwrap(), "kept");
        c.stop().await.unwrap();
    }

    #[tokio::test]
    async fn delivers_to_registered_attempt() {
        let boxes = Mailboxes::default();
        let mut mailbox = boxes.register();
        let envelope = RelayEnvelope {
            attempt: mailbox.attempt(),
            message: RelayMessage::Cluster("n1=http://10.0.0.1:8589".into()),
        };
        assert!(boxes.deliver(envelope));
        assert_eq!(
            mailbox.recv().await,
            Some(RelayMessage::Cluster("n1=http://10.0.0.1:8589".into()))
        );
    }

    #[test]
    fn drop_unregisters_mailbox() {
        let boxes = Mailboxes::default();
        let mailbox = boxes.register();
        let attempt = mailbox.attempt();
        assert_eq!(boxes.open(), 1);
        drop(mailbox);
        assert_eq!(boxes.open(), 0);
        assert!(!boxes.deliver(RelayEnvelope {
            attempt,
            message: RelayMessage::Other(serde_json::json!({"x": 1})),
        }));
    }

    #[test]
    fn attempts_are_distinct() {
        let boxes = Mailboxes::default();
        let a = boxes.register();
        let b = boxes.register();
        assert_ne!(a.attempt(), b.attempt());
    }

    #[test]
    fn relay_message_json_shape() {
        let json = serde_json::to_string(&RelayMessage::Cluster("x=http://a:1".into())).unwrap();
        assert_eq!(json, r#"{"kind":"cluster","body":"x=http://a:1"}"#);
    }
}
