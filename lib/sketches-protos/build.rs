fn main() {
    // Always rerun if the build script itself changes.
    println!("cargo:rerun-if-changed=build.rs");

    println!("cargo:rerun-if-changed=proto/sketch.proto");

    let codegen_customize = protobuf_codegen::Customize::default()
        .generate_accessors(true)
        .gen_mod_rs(true)
        .lite_runtime(true);

    protobuf_codegen::Codegen::new()
        .pure()
        .includes(["proto"])
        .inputs(["proto/sketch.proto"])
        .cargo_out_dir("protos")
        .customize(codegen_customize)
        .run_from_script();
}
