// openraft's StorageError is 224 bytes.
#![allow(clippy::result_large_err)]

//! Conclave replicated store, openraft + redb, embedded in every node.
//!
//! Each node runs one member of a Raft group. The group replicates a
//! small key-value namespace plus the attributes (name, client URLs)
//! every member publishes about itself.
//!
//! # Architecture
//!
//! - **`typ`**: Type configuration (`TypeConfig`, `Request`, `Response`)
//! - **`log_store`**: Raft log storage backed by redb
//! - **`state_machine`**: State machine that applies committed entries
//! - **`transport`**: Peer transport trait, receiving endpoint, in-process router
//! - **`network`**: openraft network adapter over a transport
//! - **`grpc`**: tonic implementation of the peer transport
//! - **`store`**: `EmbeddedStore`, the handle the coordination layer drives

pub mod error;
pub mod grpc;
pub mod log_store;
pub mod member_id;
pub mod network;
pub mod proto;
pub mod state_machine;
pub mod store;
pub mod transport;
pub mod typ;

pub use error::{StoreError, StoreResult};
pub use grpc::GrpcTransport;
pub use member_id::member_id;
pub use store::{ClusterState, EmbeddedStore, LeaderWatch, Member, StoreConfig};
pub use transport::{LocalRouter, Transport};
pub use typ::{ConclaveRaft, Request, Response, TypeConfig};
