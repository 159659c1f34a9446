fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_path = std::env::var("PROTO_PATH").unwrap_or_else(|_| "../../proto".to_string());
    let proto_file = format!("{}/deviceplugin.proto", proto_path);

    // Fall back to the bundled protoc when the host has none installed
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&[&proto_file], &[&proto_path])?;

    println!("cargo:rerun-if-changed={}", proto_file);
    Ok(())
}
