//! Generates the node service stubs without a `.proto` file.

use tonic_build::manual::{Builder, Method, Service};

fn rpc(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::proto::{input}"))
        .output_type(format!("crate::proto::{output}"))
        .codec_path("tonic::codec::ProstCodec")
        .build()
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let service = Service::builder()
        .name("NodeService")
        .package("conclave.cluster")
        .method(rpc("request_admission", "RequestAdmission", "AdmissionRequest", "AdmissionResponse"))
        .method(rpc("relay", "Relay", "RelayRequest", "RelayResponse"))
        .method(rpc("ping", "Ping", "PingRequest", "PingResponse"))
        .method(rpc("control", "Control", "ControlRequest", "ControlResponse"))
        .build();

    Builder::new().compile(&[service]);
}
