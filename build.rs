use std::env;
use std::error::Error;
use std::fs;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn Error>> {
    println!("cargo:rerun-if-changed=memory.x");
    println!("cargo:rerun-if-changed=build.rs");

    // Host builds (unit tests) never link the firmware.
    if env::var("CARGO_CFG_TARGET_ARCH")? != "riscv32" {
        return Ok(());
    }

    // riscv-rt's link.x includes memory.x from the search path.
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    fs::copy("memory.x", out_dir.join("memory.x"))?;
    println!("cargo:rustc-link-search={}", out_dir.display());
    Ok(())
}
