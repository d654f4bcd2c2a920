use anyhow::{bail, Context, Result};
use std::process::Command;

const EBPF_PACKAGE: &str = "scopeprobe-ebpf";
const EBPF_TARGET: &str = "bpfel-unknown-none";
const EBPF_TOOLCHAIN: &str = "nightly-2024-12-10";

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        Some("build-ebpf") => build_ebpf(args.iter().any(|a| a == "--debug")),
        Some(other) => bail!("unknown command: {other}"),
        None => {
            eprintln!("Usage: cargo xtask <command>");
            eprintln!("Commands:");
            eprintln!("  build-ebpf [--debug]    Build the scopeprobe kernel programs");
            std::process::exit(1);
        }
    }
}

fn build_ebpf(debug: bool) -> Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.args([
        "build",
        "--package",
        EBPF_PACKAGE,
        "--target",
        EBPF_TARGET,
        "-Z",
        "build-std=core",
    ]);
    if !debug {
        cmd.arg("--release");
    }

    let status = cmd
        .env("RUSTUP_TOOLCHAIN", EBPF_TOOLCHAIN)
        .status()
        .with_context(|| format!("failed to run cargo build for {EBPF_PACKAGE}"))?;

    if !status.success() {
        bail!("{EBPF_PACKAGE} build failed: {status}");
    }

    let profile = if debug { "debug" } else { "release" };
    println!("built target/{EBPF_TARGET}/{profile}/{EBPF_PACKAGE}");
    Ok(())
}
