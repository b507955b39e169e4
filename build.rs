fn main() {
    let protoc = protoc_bin_vendored::protoc_bin_path().expect("protoc not found");
    // SAFETY: build scripts are single-threaded.
    unsafe { std::env::set_var("PROTOC", protoc) };
    let includes = &["proto"];

    println!("cargo:rerun-if-changed=proto/sharddistributor.proto");

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(&["proto/sharddistributor.proto"], includes)
        .expect("failed to compile sharddistributor.proto");
}
