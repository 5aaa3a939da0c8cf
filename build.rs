//! Puts the `memory.x` linker script on the linker search path for firmware
//! builds and re-runs when it changes. Host builds (tests) skip all of it.

use std::{env, fs::File, io::Write, path::PathBuf};

fn main() -> Result<(), Box<dyn core::error::Error>> {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=memory.x");

    // Only firmware (bare-metal ARM) builds link against memory.x.
    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("none") {
        let out = &PathBuf::from(
            env::var_os("OUT_DIR").expect("OUT_DIR environment variable is not set"),
        );
        File::create(out.join("memory.x"))?.write_all(include_bytes!("memory.x"))?;
        println!("cargo:rustc-link-search={}", out.display());
    }

    Ok(())
}
