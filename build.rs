// build.rs

use std::env;

fn main() {
    // Release pipelines may stamp a version that differs from Cargo.toml.
    let version = env::var("CONNKEEPER_VERSION")
        .unwrap_or_else(|_| env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "dev".to_string()));

    println!("cargo:rustc-env=CARGO_PKG_VERSION={version}");
    println!("cargo:rerun-if-env-changed=CONNKEEPER_VERSION");
}
