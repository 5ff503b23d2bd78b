use std::env;

fn main() -> Result<(), anyhow::Error> {
    // Check if this is a docs.rs build
    let is_docs_rs = env::var_os("DOCS_RS").is_some();

    println!("cargo:rerun-if-changed=proto/ca.proto");

    if !is_docs_rs {
        let file_descriptors = protox::compile(["ca.proto"], ["proto"])?;
        tonic_prost_build::configure()
            .build_client(true)
            .build_server(true)
            .compile_fds(file_descriptors)?;
    } else {
        println!("cargo:warning=Skipping protobuf code generation on docs.rs.");
    }

    Ok(())
}
