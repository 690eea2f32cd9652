fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/dbplugin.proto");

    // The crate is both sides of the plugin boundary: the launcher uses the
    // client, plugin binaries built on `dbplugin::plugin::serve` use the server.
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/dbplugin.proto"], &["proto"])?;

    Ok(())
}
