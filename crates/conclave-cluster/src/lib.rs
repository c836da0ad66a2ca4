//! conclave-cluster: membership and leadership coordination over the
//! embedded replicated store.
//!
//! # Architecture
//!
//! ```text
//! Coordinator (one per node)
//!   ├── gate: serializes init / start / join / add / remove / move-leader
//!   ├── live store (conclave-raft EmbeddedStore), at most one
//!   │   └── LeadershipMonitor → LeadershipFeed on each acquired leadership
//!   ├── NodeDirectory: static name / id / ip / port registry
//!   ├── join mailboxes, one per attempt
//!   └── PeerClient → peer NodeService
//!
//! NodeServer (gRPC, base port)
//!   ├── RequestAdmission() → add joiner, relay descriptor back
//!   ├── Relay() → deliver to a join mailbox
//!   ├── Ping() → name, running
//!   └── Control() → operator commands
//! ```

pub mod config;
pub mod coordinator;
pub mod descriptor;
pub mod directory;
pub mod error;
pub mod info;
pub mod join;
pub mod kv;
pub mod membership;
pub mod monitor;
pub mod peer;
pub mod proto;
pub mod server;

pub use config::ClusterConfig;
pub use coordinator::Coordinator;
pub use descriptor::ClusterDescriptor;
pub use directory::{NodeDirectory, NodeEntry};
pub use error::{CoordError, CoordResult};
pub use info::ClusterInfo;
pub use join::{JoinState, RelayEnvelope, RelayMessage};
pub use kv::WORK_KEY;
pub use monitor::{LeadershipFeed, LeadershipMonitor};
pub use peer::{GrpcPeers, LocalPeers, PeerClient};
pub use server::NodeServer;
