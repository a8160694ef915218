//! Assembles the architecture-specific context-switch stub.
//!
//! Only x86_64 Linux is supported; the runtime this crate backs is
//! explicitly Linux-only (see the workspace's `SPEC_FULL.md`).

fn main() {
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();

    if os != "linux" {
        panic!("weftio-fiber only supports Linux targets, got target-os={os}");
    }

    let asm_file = match arch.as_str() {
        "x86_64" => "src/arch/x86_64.s",
        other => panic!("weftio-fiber has no context-switch stub for target-arch={other}"),
    };

    println!("cargo:rerun-if-changed={asm_file}");
    cc::Build::new().file(asm_file).compile("weftio_fiber_asm");
}
