//! Build script: locate the system libspeex when the `libspeex` feature is on.
//!
//! The FFI block links `speex` by name; this only adds the search path that
//! `pkg-config` reports and prints a readable hint when the library is missing.

use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=PKG_CONFIG_PATH");

    if cfg!(feature = "libspeex") {
        locate_speex();
    }
}

fn locate_speex() {
    let output = Command::new("pkg-config").args(["--libs-only-L", "speex"]).output();

    match output {
        Ok(out) if out.status.success() => {
            let flags = String::from_utf8_lossy(&out.stdout);
            for dir in flags.split_whitespace().filter_map(|flag| flag.strip_prefix("-L")) {
                println!("cargo:rustc-link-search=native={}", dir);
            }
        }
        Ok(_) => {
            println!("cargo::warning=pkg-config does not know about speex; relying on the default library path");
            println!("cargo::warning=Install it with: apt install libspeex-dev (Debian/Ubuntu) or brew install speex (macOS)");
        }
        Err(_) => {
            println!("cargo::warning=pkg-config not found; relying on the default library path for libspeex");
        }
    }
}
