//! gRPC API surface.

pub mod server;
