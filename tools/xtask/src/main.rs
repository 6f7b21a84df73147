//! Workspace automation tasks.
//!
//! Run with: `cargo xtask <command>`

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::process::Command;

const CRATE_PREFIX: &str = "strata-";

#[derive(Parser)]
#[command(name = "xtask", about = "Strata workspace automation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all CI checks locally
    Ci,
    /// Validate workspace conventions
    Lint,
    /// Generate coverage report
    Coverage,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Ci => run_ci(),
        Commands::Lint => run_lint(),
        Commands::Coverage => run_coverage(),
    }
}

fn run_ci() -> Result<()> {
    println!("Running CI checks...\n");

    run_lint()?;
    run_cmd("cargo", &["fmt", "--check"])?;
    run_cmd("cargo", &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
    run_cmd("cargo", &["test", "--workspace"])?;
    run_cmd("cargo", &["doc", "--workspace", "--no-deps"])?;

    println!("\nAll CI checks passed!");
    Ok(())
}

fn run_lint() -> Result<()> {
    println!("Validating workspace conventions...\n");

    for entry in std::fs::read_dir("crates").context("Failed to list crates/")? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(CRATE_PREFIX) {
            anyhow::bail!("Crate '{name}' does not follow {CRATE_PREFIX}* naming");
        }
        check_manifest(&entry.path(), &name)?;
        check_lib_root(&entry.path(), &name)?;
    }

    println!("All conventions validated!");
    Ok(())
}

/// Every crate inherits the workspace lint table.
fn check_manifest(dir: &Path, name: &str) -> Result<()> {
    let manifest = std::fs::read_to_string(dir.join("Cargo.toml"))
        .with_context(|| format!("Crate '{name}' has no readable Cargo.toml"))?;
    if !manifest.contains("[lints]") || !manifest.contains("workspace = true") {
        anyhow::bail!("Crate '{name}' does not inherit workspace lints");
    }
    Ok(())
}

/// Library roots forbid unsafe code and require docs.
fn check_lib_root(dir: &Path, name: &str) -> Result<()> {
    let lib = dir.join("src").join("lib.rs");
    let Ok(source) = std::fs::read_to_string(&lib) else {
        return Ok(());
    };
    for attr in ["#![forbid(unsafe_code)]", "#![deny(missing_docs)]"] {
        if !source.contains(attr) {
            anyhow::bail!("Crate '{name}' lib.rs is missing {attr}");
        }
    }
    Ok(())
}

fn run_coverage() -> Result<()> {
    run_cmd("cargo", &["llvm-cov", "--workspace", "--html"])?;
    println!("\nCoverage report: target/llvm-cov/html/index.html");
    Ok(())
}

fn run_cmd(cmd: &str, args: &[&str]) -> Result<()> {
    println!("$ {} {}", cmd, args.join(" "));
    let status = Command::new(cmd)
        .args(args)
        .status()
        .with_context(|| format!("Failed to run: {} {}", cmd, args.join(" ")))?;

    if !status.success() {
        anyhow::bail!("Command failed: {} {}", cmd, args.join(" "));
    }
    Ok(())
}
