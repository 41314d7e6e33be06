use anyhow::{Context, Result};
use clap::Parser;
use std::process::Command;

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Build the uprobe programs for the BPF target
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
        #[arg(long)]
        release: bool,
    },
    /// Build the probes, then the userspace tool embedding them
    Build {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::BuildEbpf { target, release } => build_ebpf(&target, release)?,
        Cmd::Build { target } => {
            build_ebpf(&target, true)?;
            build_userspace()?;
        }
    }

    Ok(())
}

fn build_ebpf(target: &str, _release: bool) -> Result<()> {
    // Debug builds pull in formatting code the BPF linker rejects; LTO in
    // release strips it, so the probes are always built in release.
    let mut cmd = Command::new("cargo");
    cmd.arg("+nightly")
        .arg("build")
        .arg("--package")
        .arg("latscope-ebpf")
        .arg("--target")
        .arg(target)
        .arg("-Z")
        .arg("build-std=core")
        .arg("--release");

    let status = cmd.status().context("Failed to build eBPF program")?;

    if !status.success() {
        anyhow::bail!("Failed to build eBPF program");
    }

    println!("✓ eBPF program built successfully");
    println!("  Target: {target}");
    println!("  Profile: release (always)");

    Ok(())
}

fn build_userspace() -> Result<()> {
    let status = Command::new("cargo")
        .args(["build", "--package", "latscope", "--release"])
        .status()
        .context("Failed to build latscope")?;

    if !status.success() {
        anyhow::bail!("Failed to build latscope");
    }

    println!("✓ latscope built: target/release/latscope");
    Ok(())
}
