//! Generates the peer RPC stubs without a `.proto` file.
//!
//! Every Raft RPC carries a JSON payload wrapped in the same
//! `RaftRequest`/`RaftResponse` envelope, so the service is declared
//! by hand and encoded with prost.

use tonic_build::manual::{Builder, Method, Service};

fn rpc(name: &str, route: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type("crate::proto::RaftRequest")
        .output_type("crate::proto::RaftResponse")
        .codec_path("tonic::codec::ProstCodec")
        .build()
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let service = Service::builder()
        .name("RaftService")
        .package("conclave.raft")
        .method(rpc("append_entries", "AppendEntries"))
        .method(rpc("vote", "Vote"))
        .method(rpc("install_snapshot", "InstallSnapshot"))
        .method(rpc("forward", "Forward"))
        .method(rpc("timeout_now", "TimeoutNow"))
        .build();

    Builder::new().compile(&[service]);
}
