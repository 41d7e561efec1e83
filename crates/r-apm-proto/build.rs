//! ---
//! apm_section: "05-networking-external-interfaces"
//! apm_subsection: "module"
//! apm_type: "source"
//! apm_scope: "code"
//! apm_description: "Wire protocol definitions for the collector uplink."
//! apm_version: "v0.0.0-prealpha"
//! apm_owner: "tbd"
//! ---
fn main() {
    let protoc = protoc_bin_vendored::protoc_bin_path().expect("failed to locate protoc");
    std::env::set_var("PROTOC", protoc);

    println!("cargo:rerun-if-changed=proto/apm.proto");
    println!("cargo:rerun-if-changed=proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/apm.proto"], &["proto"])
        .expect("failed to compile gRPC definitions");
}
