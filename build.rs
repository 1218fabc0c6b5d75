// build.rs - Build script for accel_ctx
use std::env;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    if env::var_os("CARGO_FEATURE_CUDA").is_some() {
        println!("cargo:rerun-if-env-changed=CUDA_PATH");
        println!("cargo:rerun-if-env-changed=CUDA_ROOT");
    }

    setup_library_exports();
}

fn setup_library_exports() {
    // Exported C symbols must stay visible to the host framework loader
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os == "linux" {
        println!("cargo:rustc-cdylib-link-arg=-Wl,--export-dynamic");
        println!("cargo:rustc-cdylib-link-arg=-Wl,-soname,libaccel_ctx.so");
    } else if target_os == "macos" {
        println!("cargo:rustc-cdylib-link-arg=-Wl,-export_dynamic");
    }
}
