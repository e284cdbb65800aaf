fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile the Logic 2 automation schema.
    // NOTE: type_attribute adds #[allow(missing_docs)] to all generated types
    // since protobuf-generated code cannot have doc comments at source
    println!("cargo:rerun-if-changed=proto/saleae.proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .type_attribute(".", "#[allow(missing_docs)]")
        .compile(&["proto/saleae.proto"], &["proto"])?;

    Ok(())
}
