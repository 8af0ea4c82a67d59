// Code generation for gRPC protobuf definitions

use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the vendored protoc so the build does not depend on a system one.
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    let well_known_types = protoc_bin_vendored::include_path()?;

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[PathBuf::from("proto/zsilo/v1/zsilo.proto")],
            &[PathBuf::from("proto"), well_known_types],
        )?;
    Ok(())
}
