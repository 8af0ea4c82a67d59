//! zsilo gRPC API
//!
//! This crate defines the gRPC protocol spoken between the zsilo daemon and
//! its clients (CSI driver, operator tooling). The protobuf definitions live
//! in `proto/zsilo/v1/zsilo.proto` and are code-generated via `tonic-build`.

// Include the generated code
pub mod zsilo {
    pub mod v1 {
        tonic::include_proto!("zsilo.v1");
    }
}
