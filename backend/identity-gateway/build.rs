// Build script for identity-gateway
// Compiles auth_service.proto for the gRPC server and the HTTP front door's client
fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/omnauth/v1/auth_service.proto");

    // Use the vendored protoc unless the environment provides one
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    let out_dir = std::path::PathBuf::from(std::env::var("OUT_DIR")?);

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(out_dir.join("omnauth_descriptor.bin"))
        .compile_protos(&["proto/omnauth/v1/auth_service.proto"], &["proto"])?;

    Ok(())
}
