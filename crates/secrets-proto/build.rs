use std::env;
use std::path::PathBuf;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR set by cargo"));
    let protos = [
        "proto/common.proto",
        "proto/registration.proto",
        "proto/plugin.proto",
    ];

    ttrpc_codegen::Codegen::new()
        .out_dir(&out_dir)
        .inputs(&protos)
        .include("proto")
        .rust_protobuf()
        .customize(ttrpc_codegen::Customize {
            async_all: true,
            ..Default::default()
        })
        .run()
        .expect("failed to generate ttrpc service stubs");

    for proto in &protos {
        println!("cargo:rerun-if-changed={proto}");
    }
}
