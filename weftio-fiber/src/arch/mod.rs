cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub(crate) use x86_64::*;
    } else {
        compile_error!("weftio-fiber has no context-switch implementation for this architecture");
    }
}
